mod util;


use std::rc::Rc;

use galvanic_assert::{assert_that, matchers::*};

use ctf_stream::estimate::{Outcome, Recalculation};
use ctf_stream::logging;
use ctf_stream::metadata::MetaData;
use ctf_stream::paths::Artifact;
use ctf_stream::pipeline::{self, Pipeline};
use ctf_stream::quality::Enabled;
use ctf_stream::results;
use ctf_stream::runner::Runner;
use ctf_stream::sets::CtfModel;

use crate::util::project::Project;
use crate::util::runner::{arg, ScriptedRunner};


/// a closed stream of two micrographs, with mic_2's estimate failed
fn estimated() -> Project {

	let project = Project::new();
	project.add_micrographs(&["mic_1", "mic_2"]);
	project.close_micrographs();

	let runner = Rc::new(
		ScriptedRunner::new()
			.failing("mic_2")
	);
	let summary = Pipeline::new(project.config(), project.paths(), runner as Rc<dyn Runner>)
		.run(false)
		.unwrap();
	assert_that!(&summary.output_closed, eq(true));

	project
}


fn recalc() -> Recalculation {
	Recalculation {
		defocus_u: 12345.0,
		defocus_v: 12000.0,
		angle: 30.0,
		low_res: 0.05,
		high_res: 0.35
	}
}


fn ctf(project: &Project, name: &str) -> CtfModel {
	let micrographs = project.micrographs();
	let id = micrographs.get_by_name(name).unwrap().id;
	project.ctfs().get(id).cloned().unwrap()
}


#[test]
fn updates_the_record() {
	let _logging = logging::init_test();

	let project = estimated();
	let before = ctf(&project, "mic_1");
	let placeholder = ctf(&project, "mic_2");
	assert_that!(&before.defocus_u, eq(11000.0));

	let runner = Rc::new(ScriptedRunner::new());
	let outcome = pipeline::recalculate(&project.config(), project.paths(), runner.clone(), "mic_1", recalc())
		.unwrap();
	assert_that!(&outcome, eq(Outcome::Accepted { down_factor: 1.0 }));

	// the PSD gets fitted again around the corrected defoci
	let calls = runner.calls("estimate_from_psd");
	assert_that!(&calls.len(), eq(1));
	let args = &calls[0];
	let micrograph = project.micrographs().get_by_name("mic_1").cloned().unwrap();
	let psd = project.paths().artifact(&micrograph, Artifact::Psd).to_string_lossy().to_string();
	assert_that!(&arg(args, "--psd").unwrap().to_string(), eq(psd));
	assert_that!(&arg(args, "--defocusU").unwrap(), eq("12345"));
	assert_that!(&arg(args, "--defocusV").unwrap(), eq("12000"));
	assert_that!(&arg(args, "--azimuthal_angle").unwrap(), eq("30"));
	assert_that!(&arg(args, "--min_freq").unwrap(), eq("0.05"));
	assert_that!(&arg(args, "--max_freq").unwrap(), eq("0.35"));
	assert_that!(&arg(args, "--defocus_range").unwrap(), eq("5000"));
	assert_that!(&arg(args, "--ctfmodelSize").unwrap(), eq("256"));
	assert_that!(&arg(args, "--downSamplingPerformed").unwrap(), eq("1"));
	assert_that!(&runner.calls("sort_psds").len(), eq(1));

	// same set, one record changed
	let ctfs = project.ctfs();
	assert_that!(&ctfs.len(), eq(2));
	assert_that!(&ctfs.is_stream_closed(), eq(true));
	let after = ctf(&project, "mic_1");
	assert_that!(&after.defocus_u, eq(12345.0));
	assert_that!(&after.defocus_v, eq(12000.0));
	assert_that!(&after.defocus_angle, eq(30.0));
	assert_that!(&after.enabled, eq(Enabled::Accepted));
	assert_that!(&after.result_file, eq(before.result_file));
	assert_that!(&ctf(&project, "mic_2"), eq(placeholder));

	// the aggregate table has the new values too
	let table = MetaData::read(project.paths().aggregate()).unwrap();
	assert_that!(&table.len(), eq(2));
}


#[test]
fn rejected_recalculation() {
	let _logging = logging::init_test();

	let project = estimated();

	let runner = Rc::new(
		ScriptedRunner::new()
			.bad("mic_1", 1.0)
	);
	let outcome = pipeline::recalculate(&project.config(), project.paths(), runner, "mic_1", recalc())
		.unwrap();
	assert_that!(&outcome, eq(Outcome::Rejected { down_factor: 1.0 }));

	let after = ctf(&project, "mic_1");
	assert_that!(&after.enabled, eq(Enabled::Rejected));
	assert_that!(&after.defocus_u, eq(12345.0));

	// only accepted CTFs count toward the defocus range
	assert_that!(&project.ctfs().defocus_range(), eq(None));
}


#[test]
fn failed_recalculation_keeps_the_estimate() {
	let _logging = logging::init_test();

	let project = estimated();
	let micrograph = project.micrographs().get_by_name("mic_1").cloned().unwrap();
	let before = results::read_ctf_model(&project.paths(), &micrograph).unwrap();
	let ctfs_before = project.ctfs();

	let runner = Rc::new(
		ScriptedRunner::new()
			.failing("mic_1")
	);
	let result = pipeline::recalculate(&project.config(), project.paths(), runner.clone(), "mic_1", recalc());
	assert_that!(&result.is_err(), eq(true));
	assert_that!(&runner.calls("estimate_from_psd").len(), eq(1));

	// the earlier estimate is back, and the output never changed
	let after = results::read_ctf_model(&project.paths(), &micrograph).unwrap();
	assert_that!(&after, eq(before));
	assert_that!(&project.ctfs(), eq(ctfs_before));
}


#[test]
fn placeholder_has_nothing_to_recalculate() {
	let _logging = logging::init_test();

	let project = estimated();
	let ctfs_before = project.ctfs();

	let runner = Rc::new(ScriptedRunner::new());
	let result = pipeline::recalculate(&project.config(), project.paths(), runner.clone(), "mic_2", recalc());
	assert_that!(&result.is_err(), eq(true));
	assert_that!(&runner.calls("estimate_from_psd").len(), eq(0));
	assert_that!(&project.ctfs(), eq(ctfs_before));
}


#[test]
fn needs_a_published_micrograph() {
	let _logging = logging::init_test();

	let project = Project::new();
	project.add_micrographs(&["mic_1"]);

	let runner = Rc::new(ScriptedRunner::new());
	let result = pipeline::recalculate(&project.config(), project.paths(), runner.clone(), "mic_1", recalc());
	assert_that!(&result.is_err(), eq(true));
	let result = pipeline::recalculate(&project.config(), project.paths(), runner.clone(), "mic_9", recalc());
	assert_that!(&result.is_err(), eq(true));
	assert_that!(&runner.calls("estimate_from_psd").len(), eq(0));
}


#[test]
fn bad_corrections() {
	let _logging = logging::init_test();

	let project = estimated();

	let bad = [
		Recalculation { defocus_u: -1.0, ..recalc() },
		Recalculation { defocus_v: f64::NAN, ..recalc() },
		Recalculation { low_res: 0.4, high_res: 0.3, ..recalc() },
		Recalculation { high_res: 0.6, ..recalc() }
	];
	let runner = Rc::new(ScriptedRunner::new());
	for recalc in bad {
		let result = pipeline::recalculate(&project.config(), project.paths(), runner.clone(), "mic_1", recalc);
		assert_that!(&result.is_err(), eq(true));
	}
	assert_that!(&runner.calls("estimate_from_psd").len(), eq(0));
	assert_that!(&ctf(&project, "mic_1").defocus_u, eq(11000.0));
}
