mod util;


use galvanic_assert::{assert_that, matchers::*};

use ctf_stream::quality::Enabled;
use ctf_stream::sets::{CtfModel, CtfSet, DefocusRange, FileOutput, Micrograph, MicrographSet, OutputSink, StreamState};

use crate::util::project::{acquisition, Project};


#[test]
fn micrograph_ids() {

	let mut micrographs = MicrographSet::new(acquisition());
	micrographs.append("/data/a.mrc").unwrap();
	micrographs.append("/data/b.tif").unwrap();

	let ids = micrographs.iter()
		.map(|m| (m.id, m.name.as_str()))
		.collect::<Vec<_>>();
	assert_that!(&ids, eq(vec![(1, "a"), (2, "b")]));

	// names are unique
	assert_that!(&micrographs.append("/elsewhere/a.mrc").is_err(), eq(true));

	// nothing gets added after closing
	micrographs.close();
	assert_that!(&micrographs.append("/data/c.mrc").is_err(), eq(true));
	assert_that!(&micrographs.len(), eq(2));
}


#[test]
fn micrographs_file() {

	let project = Project::new();
	project.add_micrographs(&["mic_1", "mic_2"]);
	project.close_micrographs();

	let micrographs = project.micrographs();
	assert_that!(&micrographs.len(), eq(2));
	assert_that!(&micrographs.stream_state, eq(StreamState::Closed));
	assert_that!(&micrographs.acquisition, eq(acquisition()));
	assert_that!(&micrographs.get_by_name("mic_2").map(|m| m.id), eq(Some(2)));
}


fn ctf(id: u64, defocus: f64, enabled: Enabled) -> CtfModel {
	CtfModel {
		micrograph: Micrograph {
			id,
			name: format!("mic_{}", id),
			path: format!("/data/mic_{}.mrc", id).into()
		},
		defocus_u: defocus,
		defocus_v: defocus - 100.0,
		defocus_angle: 30.0,
		sampling_rate: 1.5,
		down_factor: 1.0,
		enabled,
		criteria: vec![("ctfCritCorr13".to_string(), 0.5)],
		result_file: format!("extra/{:06}_mic_{}/xmipp_ctf.ctfparam", id, id).into(),
		psd: "a.psd".into(),
		enhanced_psd: "b.xmp".into(),
		model_quadrant: "c.xmp".into(),
		model_halfplane: "d.xmp".into()
	}
}


#[test]
fn ctf_set() {

	let mut ctfs = CtfSet::new();
	assert_that!(&ctfs.defocus_range(), eq(None));

	ctfs.append(ctf(1, 12000.0, Enabled::Accepted)).unwrap();
	ctfs.append(ctf(2, 30000.0, Enabled::Rejected)).unwrap();
	ctfs.append(ctf(3, 15000.0, Enabled::Accepted)).unwrap();

	// one CTF per micrograph
	assert_that!(&ctfs.append(ctf(1, 1.0, Enabled::Accepted)).is_err(), eq(true));
	assert_that!(&ctfs.len(), eq(3));

	// only accepted CTFs count toward the defocus range
	assert_that!(&ctfs.defocus_range(), eq(Some(DefocusRange { min: 11900.0, max: 15000.0 })));

	ctfs.update(ctf(2, 20000.0, Enabled::Accepted)).unwrap();
	assert_that!(&ctfs.defocus_range(), eq(Some(DefocusRange { min: 11900.0, max: 20000.0 })));
	assert_that!(&ctfs.update(ctf(4, 1.0, Enabled::Accepted)).is_err(), eq(true));

	ctfs.close();
	assert_that!(&ctfs.append(ctf(4, 1.0, Enabled::Accepted)).is_err(), eq(true));
}


#[test]
fn ctf_set_file() {

	let project = Project::new();
	let output = FileOutput::new(project.paths().output_set());

	// no file, no CTFs
	assert_that!(&output.exists(), eq(false));
	assert_that!(&output.load().unwrap(), eq(CtfSet::new()));

	let mut ctfs = CtfSet::new();
	ctfs.append(ctf(1, 12000.0, Enabled::Accepted)).unwrap();
	ctfs.append(ctf(2, 30000.0, Enabled::Rejected)).unwrap();
	ctfs.close();
	output.commit(&ctfs).unwrap();

	assert_that!(&output.exists(), eq(true));
	assert_that!(&output.load().unwrap(), eq(ctfs));
}


#[test]
fn ctf_set_non_finite() {

	let mut ctfs = CtfSet::new();
	ctfs.append(ctf(1, 12000.0, Enabled::Accepted)).unwrap();

	assert_that!(&ctfs.append(ctf(2, f64::NAN, Enabled::Accepted)).is_err(), eq(true));
	let mut infinite = ctf(2, 12000.0, Enabled::Accepted);
	infinite.criteria.push(("ctfCritFitting".to_string(), f64::INFINITY));
	assert_that!(&ctfs.append(infinite).is_err(), eq(true));
	assert_that!(&ctfs.update(ctf(1, f64::NAN, Enabled::Accepted)).is_err(), eq(true));

	// nothing changed
	assert_that!(&ctfs.len(), eq(1));
	assert_that!(&ctfs.defocus_range(), eq(Some(DefocusRange { min: 11900.0, max: 12000.0 })));
}
