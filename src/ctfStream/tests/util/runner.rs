use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;

use ctf_stream::metadata::{label, MetaData, Row};
use ctf_stream::runner::Runner;


/// Stands in for the external binaries: writes the files they would, with made-up numbers.
#[derive(Default)]
pub struct ScriptedRunner {
	calls: RefCell<Vec<(String,Vec<String>)>>,
	/// micrographs the estimator crashes on, whatever the downsampling
	failing: Vec<String>,
	/// micrographs and downsampling factors whose estimates come out bad
	bad: Vec<(String,f64)>,
	/// when set, the PSD sorter always fails
	broken_sorter: bool,
	/// micrographs the estimator writes parameters for, and then crashes on
	crash_after_writing: Vec<String>,
	/// micrographs the estimator writes a NaN defocus for
	non_finite: Vec<String>,
	/// micrographs the estimator writes parameters for, but with no defocus V
	partial: Vec<String>,
	/// files to write on the nth call to the estimator, counting from 1
	side_writes: Vec<(usize,PathBuf,String)>
}

impl ScriptedRunner {

	pub fn new() -> Self {
		Self::default()
	}

	pub fn failing(mut self, name: &str) -> Self {
		self.failing.push(name.to_string());
		self
	}

	pub fn bad(mut self, name: &str, down_factor: f64) -> Self {
		self.bad.push((name.to_string(), down_factor));
		self
	}

	pub fn broken_sorter(mut self) -> Self {
		self.broken_sorter = true;
		self
	}

	pub fn crash_after_writing(mut self, name: &str) -> Self {
		self.crash_after_writing.push(name.to_string());
		self
	}

	pub fn non_finite(mut self, name: &str) -> Self {
		self.non_finite.push(name.to_string());
		self
	}

	pub fn partial(mut self, name: &str) -> Self {
		self.partial.push(name.to_string());
		self
	}

	/// Has the nth estimator call also write a file, like something else in the project might at any time.
	pub fn write_on_estimate(mut self, call: usize, path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
		self.side_writes.push((call, path.into(), contents.into()));
		self
	}

	/// the arguments of every call to the program, in order
	pub fn calls(&self, program: &str) -> Vec<Vec<String>> {
		self.calls.borrow()
			.iter()
			.filter(|(p, _)| p == program)
			.map(|(_, args)| args.clone())
			.collect()
	}

	fn estimate(&self, args: &[String]) -> Result<()> {

		let call = self.calls("estimate").len();
		for (_, path, contents) in self.side_writes.iter().filter(|(n, _, _)| *n == call) {
			fs::write(path, contents)
				.context("Failed to write side file")?;
		}

		let prefix = PathBuf::from(arg(args, "--oroot")?);
		let name = micrograph_name(&prefix)?;
		if self.failing.contains(&name) {
			bail!("estimator crashed on {}", name);
		}

		let down_factor = arg(args, "--downSamplingPerformed")?.parse::<f64>()?;
		let sampling_rate = arg(args, "--sampling_rate")?.parse::<f64>()?;

		let mut row = Row::new();
		row.set(label::SAMPLING_RATE, sampling_rate);
		row.set(label::VOLTAGE, arg(args, "--kV")?);
		if self.non_finite.contains(&name) {
			row.set(label::DEFOCUS_U, f64::NAN);
		} else {
			row.set(label::DEFOCUS_U, 10000.0 + 1000.0*down_factor);
		}
		if !self.partial.contains(&name) {
			row.set(label::DEFOCUS_V, 9800.0 + 1000.0*down_factor);
		}
		row.set(label::DEFOCUS_ANGLE, 45.0);
		row.set(label::CRIT_CORR13, 0.5);
		row.set(label::DOWNSAMPLE_PERFORMED, down_factor);
		MetaData::single("fullMicrograph", row)
			.write(format!("{}.ctfparam", prefix.to_string_lossy()))?;
		fs::write(format!("{}.psd", prefix.to_string_lossy()), "")
			.context("Failed to write PSD")?;

		if self.crash_after_writing.contains(&name) {
			bail!("estimator crashed on {} after writing its parameters", name);
		}

		Ok(())
	}

	fn estimate_from_psd(&self, args: &[String]) -> Result<()> {

		let psd = PathBuf::from(arg(args, "--psd")?);
		let name = micrograph_name(&psd)?;
		if self.failing.contains(&name) {
			bail!("estimator crashed on {}", name);
		}

		let mut row = Row::new();
		row.set(label::SAMPLING_RATE, arg(args, "--sampling_rate")?);
		row.set(label::VOLTAGE, arg(args, "--kV")?);
		row.set(label::DEFOCUS_U, arg(args, "--defocusU")?);
		row.set(label::DEFOCUS_V, arg(args, "--defocusV")?);
		row.set(label::DEFOCUS_ANGLE, arg(args, "--azimuthal_angle")?);
		row.set(label::CRIT_CORR13, 0.5);
		row.set(label::DOWNSAMPLE_PERFORMED, arg(args, "--downSamplingPerformed")?);
		MetaData::single("fullMicrograph", row)
			.write(psd.with_extension("ctfparam"))
	}

	fn sort_psds(&self, args: &[String]) -> Result<()> {

		if self.broken_sorter {
			bail!("sorter is broken");
		}

		let path = arg(args, "-i")?;
		let mut evaluation = MetaData::read(path)?;
		let row = evaluation.first_mut()
			.context("empty evaluation")?;
		let name = Path::new(row.get(label::MICROGRAPH).context("no micrograph")?)
			.file_stem()
			.context("no micrograph name")?
			.to_string_lossy()
			.to_string();
		let down_factor = row.require_f64(label::DOWNSAMPLE_PERFORMED)?;
		let bad = self.bad.iter()
			.any(|(n, f)| *n == name && *f == down_factor);

		row.set(label::CRIT_FIRST_ZERO, 10.0);
		row.set(label::CRIT_MAX_FREQ, 5.0);
		row.set(label::CRIT_FIRST_ZERO_RATIO, 1.0);
		row.set(label::CRIT_FIRST_MIN_FIRST_ZERO_RATIO, 2.0);
		row.set(label::CRIT_CORR13, if bad { -1.0 } else { 0.5 });
		row.set(label::CRIT_CTF_MARGIN, 3.0);
		row.set(label::CRIT_NON_ASTIGMATIC_VALIDITY, 5.0);
		evaluation.write(path)
	}
}

#[async_trait(?Send)]
impl Runner for ScriptedRunner {

	async fn run(&self, program: &str, args: &[String]) -> Result<()> {

		self.calls.borrow_mut()
			.push((program.to_string(), args.to_vec()));

		match program {
			"downsample" => {
				let out = arg(args, "-o")?;
				fs::write(out, "")
					.context("Failed to write downsampled micrograph")
			}
			"estimate" => self.estimate(args),
			"sort_psds" => self.sort_psds(args),
			"estimate_from_psd" => self.estimate_from_psd(args),
			_ => bail!("No such program: {}", program)
		}
	}
}


pub fn arg<'a>(args: &'a [String], name: &str) -> Result<&'a str> {
	let i = args.iter()
		.position(|a| a == name)
		.context(format!("missing argument {}", name))?;
	args.get(i + 1)
		.map(String::as_str)
		.context(format!("argument {} has no value", name))
}


/// micrograph folders are named like 000001_name
fn micrograph_name(prefix: &Path) -> Result<String> {
	let dir = prefix.parent()
		.and_then(|p| p.file_name())
		.context("prefix has no folder")?
		.to_string_lossy()
		.to_string();
	let (_, name) = dir.split_once('_')
		.context("folder has no id")?;
	Ok(name.to_string())
}
