//! CTF estimation for one micrograph, by way of the external binaries.


use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::ops::Deref;
use std::path::Path;
use std::rc::Rc;

use anyhow::{bail, Context, Result};
use display_error_chain::ErrorChainExt;
use tracing::{debug, info, warn};

use crate::config::{Config, ConfigCtf, ConfigPrograms};
use crate::logging::ResultExt;
use crate::metadata::{label, MetaData, Row};
use crate::paths::{Artifact, ProjectPaths};
use crate::quality::{self, Enabled};
use crate::results;
use crate::runner::Runner;
use crate::sets::{Acquisition, CtfSet, Micrograph};


/// Downsampling factors to try, in order.
/// With automatic downsampling, one step coarser, then one step finer (but never below 1).
pub fn downsample_ladder(down_factor: f64, auto: bool) -> Vec<f64> {
	let mut ladder = vec![down_factor];
	if auto {
		ladder.push(down_factor + 1.0);
		if down_factor >= 2.0 {
			ladder.push(down_factor - 1.0);
		} else if down_factor > 1.0 {
			ladder.push((down_factor + 1.0)/2.0);
		}
	}
	ladder
}


/// where the estimator looks for the defocus, in A
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DefocusWindow {
	pub center: f64,
	pub range: f64
}


#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Outcome {
	Accepted {
		down_factor: f64
	},
	/// no downsampling factor passed the quality gate, the last one tried was kept
	Rejected {
		down_factor: f64
	},
	/// nothing usable came out of the estimator, a placeholder result was written instead
	Failed
}


/// defocus search range around corrected defoci, in A
const RECALC_DEFOCUS_RANGE: f64 = 5000.0;


/// A correction to an estimate: the CTF gets fitted again from the existing PSD, starting from these.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Recalculation {
	/// in A
	pub defocus_u: f64,
	/// in A
	pub defocus_v: f64,
	/// in degrees
	pub angle: f64,
	/// in normalized frequency (1/px)
	pub low_res: f64,
	/// in normalized frequency (1/px)
	pub high_res: f64
}

impl Recalculation {

	pub fn check(&self) -> Result<()> {
		let values = [self.defocus_u, self.defocus_v, self.angle, self.low_res, self.high_res];
		if values.iter().any(|v| !v.is_finite()) {
			bail!("Recalculation values must be finite numbers: {:?}", self);
		}
		if self.defocus_u <= 0.0 || self.defocus_v <= 0.0 {
			bail!("Defoci must be positive: U={}, V={}", self.defocus_u, self.defocus_v);
		}
		if self.low_res <= 0.0 || self.low_res >= self.high_res || self.high_res > 0.5 {
			bail!("Resolution range must be within (0, 0.5]: {} - {}", self.low_res, self.high_res);
		}
		Ok(())
	}
}


/// what a successful attempt left on disk, kept in case a later attempt clobbers it
struct Attempt {
	down_factor: f64,
	enabled: Enabled,
	ctfparam: MetaData,
	evaluation: MetaData
}


pub struct Estimator {
	ctf: ConfigCtf,
	programs: ConfigPrograms,
	paths: ProjectPaths,
	/// defocus U from a previous estimation, by micrograph name
	previous_defocus: HashMap<String,f64>,
	runner: Rc<dyn Runner>
}

impl Estimator {

	pub fn new(config: &Config, paths: ProjectPaths, runner: Rc<dyn Runner>) -> Result<Self> {

		let previous_defocus = match (config.ctf.use_previous_defocus, &config.input.previous_ctfs) {
			(true, Some(path)) => {
				let previous = CtfSet::read(path)
					.context("Failed to read previous CTF estimation")?;
				info!("Using defoci from {} previous CTF estimates", previous.len());
				previous.iter()
					.map(|ctf| (ctf.micrograph.name.clone(), ctf.defocus_u))
					.collect()
			}
			_ => HashMap::new()
		};

		Ok(Self {
			ctf: config.ctf.clone(),
			programs: config.programs.clone(),
			paths,
			previous_defocus,
			runner
		})
	}

	pub fn defocus_window(&self, micrograph: &Micrograph) -> DefocusWindow {

		if self.ctf.use_previous_defocus {
			if let Some(&defocus) = self.previous_defocus.get(&micrograph.name) {
				if defocus > 0.0 {
					return DefocusWindow {
						center: defocus,
						range: 0.01*defocus
					};
				}
			}
		}

		DefocusWindow {
			center: (self.ctf.max_defocus + self.ctf.min_defocus)/2.0,
			range: (self.ctf.max_defocus - self.ctf.min_defocus)/2.0
		}
	}

	pub fn estimator_args(&self, input: &Path, micrograph: &Micrograph, acquisition: &Acquisition, down_factor: f64) -> Vec<String> {

		let window = self.defocus_window(micrograph);
		let prefix = self.paths.artifact(micrograph, Artifact::Prefix);

		let mut args = vec![
			"--micrograph".to_string(), input.to_string_lossy().to_string(),
			"--oroot".to_string(), prefix.to_string_lossy().to_string(),
			"--sampling_rate".to_string(), (acquisition.sampling_rate*down_factor).to_string(),
			"--defocusU".to_string(), format!("{:.6}", window.center),
			"--defocus_range".to_string(), format!("{:.6}", window.range),
			"--overlap".to_string(), "0.7".to_string(),
			"--kV".to_string(), acquisition.voltage.to_string(),
			"--Cs".to_string(), acquisition.spherical_aberration.to_string(),
			"--ctfmodelSize".to_string(), self.ctf.window_size.to_string(),
			"--Q0".to_string(), acquisition.amplitude_contrast.to_string(),
			"--min_freq".to_string(), self.ctf.low_res.to_string(),
			"--max_freq".to_string(), self.ctf.high_res.to_string(),
			"--pieceDim".to_string(), self.ctf.window_size.to_string()
		];
		if self.ctf.fast_defocus && !self.ctf.use_previous_defocus {
			args.push("--fastDefocus".to_string());
		}
		args.push("--downSamplingPerformed".to_string());
		args.push(down_factor.to_string());

		args
	}

	/// Estimates the CTF of one micrograph, walking down the downsampling ladder until an estimate passes
	/// the quality gate. Never fails: when no attempt produced anything, a placeholder result is written.
	#[tracing::instrument(skip_all, level = 5, name = "Estimate", fields(mic = %micrograph.name))]
	pub async fn estimate(&self, micrograph: &Micrograph, acquisition: &Acquisition) -> Outcome {

		let Ok(_) = self.prepare(micrograph)
			.context("Failed to prepare micrograph folder")
			.warn_err()
			else { return Outcome::Failed; };

		let ladder = downsample_ladder(self.ctf.down_factor, self.ctf.auto_downsampling);
		let mut kept = None::<Attempt>;
		let mut last_failed = false;

		for down_factor in ladder {
			match self.attempt(micrograph, acquisition, down_factor).await {
				Ok(attempt) => {
					let accepted = attempt.enabled == Enabled::Accepted;
					kept = Some(attempt);
					last_failed = false;
					if accepted {
						break;
					}
				}
				Err(e) => {
					warn!("Estimate at downsampling {} failed: {}", down_factor, e.deref().chain());
					last_failed = true;
				}
			}
		}

		let tmp = self.paths.artifact(micrograph, Artifact::Downsampled);
		if tmp.exists() {
			fs::remove_file(&tmp)
				.context(format!("Failed to remove downsampled micrograph: {}", tmp.to_string_lossy()))
				.warn_err()
				.ok();
		}

		let Some(attempt) = kept
			else {
				warn!("No estimate for micrograph {}, writing placeholder", micrograph.name);
				// a crashed estimator may have written parameters anyway, they can't stand
				remove_if_exists(&self.paths.artifact(micrograph, Artifact::CtfParam))
					.warn_err()
					.ok();
				results::write_error_result(&self.paths, micrograph)
					.context("Failed to write placeholder result")
					.warn_err()
					.ok();
				return Outcome::Failed;
			};

		// a later failed attempt may have left junk behind, put the kept result back
		if last_failed {
			self.restore(micrograph, &attempt.ctfparam, &attempt.evaluation)
				.context("Failed to restore earlier estimate")
				.warn_err()
				.ok();
		}

		match attempt.enabled {
			Enabled::Accepted => {
				info!("Accepted at downsampling {}", attempt.down_factor);
				Outcome::Accepted { down_factor: attempt.down_factor }
			}
			Enabled::Rejected => {
				info!("Rejected, kept estimate at downsampling {}", attempt.down_factor);
				Outcome::Rejected { down_factor: attempt.down_factor }
			}
		}
	}

	/// makes the micrograph folder and clears out results of any earlier run
	fn prepare(&self, micrograph: &Micrograph) -> Result<()> {

		let dir = self.paths.micrograph_dir(micrograph);
		fs::create_dir_all(&dir)
			.context(format!("Failed to create folder: {}", dir.to_string_lossy()))?;

		for artifact in [Artifact::CtfParam, Artifact::ErrorParam, Artifact::Evaluation] {
			remove_if_exists(&self.paths.artifact(micrograph, artifact))?;
		}

		Ok(())
	}

	async fn attempt(&self, micrograph: &Micrograph, acquisition: &Acquisition, down_factor: f64) -> Result<Attempt> {

		let ctfparam_path = self.paths.artifact(micrograph, Artifact::CtfParam);
		let evaluation_path = self.paths.artifact(micrograph, Artifact::Evaluation);
		remove_if_exists(&ctfparam_path)?;
		remove_if_exists(&evaluation_path)?;

		// downsample, if needed
		let input = if down_factor != 1.0 {
			let tmp = self.paths.artifact(micrograph, Artifact::Downsampled);
			let tmp_dir = self.paths.tmp();
			fs::create_dir_all(&tmp_dir)
				.context(format!("Failed to create folder: {}", tmp_dir.to_string_lossy()))?;
			let args = vec![
				"-i".to_string(), micrograph.path.to_string_lossy().to_string(),
				"-o".to_string(), tmp.to_string_lossy().to_string(),
				"--step".to_string(), down_factor.to_string(),
				"--method".to_string(), "fourier".to_string()
			];
			self.runner.run(&self.programs.downsample, &args)
				.await
				.context("Failed to downsample micrograph")?;
			tmp
		} else {
			micrograph.path.clone()
		};

		// estimate
		let args = self.estimator_args(&input, micrograph, acquisition, down_factor);
		self.runner.run(&self.programs.estimate, &args)
			.await
			.context("CTF estimator failed")?;
		if !ctfparam_path.exists() {
			bail!("CTF estimator finished, but wrote no parameters at: {}", ctfparam_path.to_string_lossy());
		}
		let ctfparam = MetaData::read(&ctfparam_path)?;
		let params = ctfparam.first()
			.context("CTF estimator wrote an empty parameter file")?;
		results::check_params(params)
			.context("CTF estimator wrote unusable parameters")?;

		let (enabled, evaluation) = self.judge(micrograph, down_factor, params).await?;

		Ok(Attempt {
			down_factor,
			enabled,
			ctfparam,
			evaluation
		})
	}

	/// Writes the evaluation record, has the PSD sorter fill in the quality criteria,
	/// then flags the record with what the quality gate says.
	async fn judge(&self, micrograph: &Micrograph, down_factor: f64, params: &Row) -> Result<(Enabled,MetaData)> {

		let evaluation_path = self.paths.artifact(micrograph, Artifact::Evaluation);
		MetaData::single("", results::evaluation_row(&self.paths, micrograph, down_factor))
			.write(&evaluation_path)?;

		// the sorter fills in the quality criteria, without them the gate rejects, so a failed sort isn't fatal
		self.runner.run(&self.programs.sort_psds, &["-i".to_string(), evaluation_path.to_string_lossy().to_string()])
			.await
			.context("PSD sorter failed")
			.warn_err()
			.ok();

		let mut evaluation = MetaData::read(&evaluation_path)?;
		let row = evaluation.first_mut()
			.context("Evaluation record has no rows")?;
		let mut merged = params.clone();
		merged.merge(row);
		results::check_params(&merged)
			.context("PSD sorter wrote unusable criteria")?;

		let verdict = quality::evaluate(&merged)?;
		let enabled = verdict.enabled();
		debug!("Downsampling {}: {}", down_factor, verdict.describe());
		row.set(label::ENABLED, enabled.value());
		evaluation.write(&evaluation_path)?;

		Ok((enabled, evaluation))
	}

	pub fn recalc_args(&self, micrograph: &Micrograph, acquisition: &Acquisition, down_factor: f64, recalc: &Recalculation) -> Vec<String> {
		vec![
			"--psd".to_string(), self.paths.artifact(micrograph, Artifact::Psd).to_string_lossy().to_string(),
			"--sampling_rate".to_string(), (acquisition.sampling_rate*down_factor).to_string(),
			"--downSamplingPerformed".to_string(), down_factor.to_string(),
			"--kV".to_string(), acquisition.voltage.to_string(),
			"--Cs".to_string(), acquisition.spherical_aberration.to_string(),
			"--Q0".to_string(), acquisition.amplitude_contrast.to_string(),
			"--min_freq".to_string(), recalc.low_res.to_string(),
			"--max_freq".to_string(), recalc.high_res.to_string(),
			"--defocusU".to_string(), recalc.defocus_u.to_string(),
			"--defocusV".to_string(), recalc.defocus_v.to_string(),
			"--azimuthal_angle".to_string(), recalc.angle.to_string(),
			"--defocus_range".to_string(), RECALC_DEFOCUS_RANGE.to_string(),
			"--ctfmodelSize".to_string(), self.ctf.window_size.to_string()
		]
	}

	/// Fits the CTF of an estimated micrograph again from its PSD, around corrected defoci,
	/// and runs the quality gate over the new fit. If anything fails, the earlier estimate stays.
	#[tracing::instrument(skip_all, level = 5, name = "Recalculate", fields(mic = %micrograph.name))]
	pub async fn recalculate(&self, micrograph: &Micrograph, acquisition: &Acquisition, recalc: &Recalculation) -> Result<Outcome> {

		recalc.check()?;

		let psd_path = self.paths.artifact(micrograph, Artifact::Psd);
		if !psd_path.exists() {
			bail!("Micrograph {} has no PSD to recalculate from: {}", micrograph.name, psd_path.to_string_lossy());
		}

		let ctfparam_path = self.paths.artifact(micrograph, Artifact::CtfParam);
		let evaluation_path = self.paths.artifact(micrograph, Artifact::Evaluation);
		let ctfparam = MetaData::read(&ctfparam_path)
			.context(format!("Micrograph {} has no estimate to recalculate", micrograph.name))?;
		let evaluation = MetaData::read(&evaluation_path)?;
		let down_factor = ctfparam.first()
			.map(|row| row.get_f64(label::DOWNSAMPLE_PERFORMED))
			.transpose()?
			.flatten()
			.unwrap_or(1.0);

		let result = self.refit(micrograph, acquisition, recalc, down_factor).await;
		if result.is_err() {
			self.restore(micrograph, &ctfparam, &evaluation)
				.context("Failed to restore the earlier estimate")?;
		}
		let enabled = result?;

		info!("Recalculated at downsampling {}: {}", down_factor, if enabled == Enabled::Accepted { "accepted" } else { "rejected" });
		Ok(match enabled {
			Enabled::Accepted => Outcome::Accepted { down_factor },
			Enabled::Rejected => Outcome::Rejected { down_factor }
		})
	}

	async fn refit(&self, micrograph: &Micrograph, acquisition: &Acquisition, recalc: &Recalculation, down_factor: f64) -> Result<Enabled> {

		// the estimator writes its parameters next to the PSD
		let ctfparam_path = self.paths.artifact(micrograph, Artifact::CtfParam);
		remove_if_exists(&ctfparam_path)?;

		let args = self.recalc_args(micrograph, acquisition, down_factor, recalc);
		self.runner.run(&self.programs.estimate_from_psd, &args)
			.await
			.context("CTF estimator failed to fit the PSD")?;
		if !ctfparam_path.exists() {
			bail!("CTF estimator finished, but wrote no parameters at: {}", ctfparam_path.to_string_lossy());
		}

		let params = MetaData::read_row(&ctfparam_path)?;
		results::check_params(&params)
			.context("CTF estimator wrote unusable parameters")?;

		let (enabled, _) = self.judge(micrograph, down_factor, &params).await?;
		Ok(enabled)
	}

	fn restore(&self, micrograph: &Micrograph, ctfparam: &MetaData, evaluation: &MetaData) -> Result<()> {
		ctfparam.write(self.paths.artifact(micrograph, Artifact::CtfParam))?;
		evaluation.write(self.paths.artifact(micrograph, Artifact::Evaluation))?;
		Ok(())
	}
}


fn remove_if_exists(path: &Path) -> Result<()> {
	match fs::remove_file(path) {
		Ok(()) => Ok(()),
		Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
		Err(e) => Err(e)
			.context(format!("Failed to remove file: {}", path.to_string_lossy()))
	}
}
