//! The per-micrograph result files, and how a CTF model is read out of them.


use std::fs;
use std::ops::Deref;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use display_error_chain::ErrorChainExt;
use tracing::warn;

use crate::metadata::{label, MetaData, Row};
use crate::paths::{Artifact, ProjectPaths};
use crate::quality::{self, Enabled};
use crate::sets::{CtfModel, Micrograph};


const ERROR_BLOCK: &str = "fullMicrograph";

/// every usable parameter file has these
const REQUIRED_LABELS: [&str; 4] = [
	label::DEFOCUS_U,
	label::DEFOCUS_V,
	label::DEFOCUS_ANGLE,
	label::SAMPLING_RATE
];


/// Checks a parameter row can make a CTF model: the required values are there,
/// and every number in it is finite.
pub fn check_params(row: &Row) -> Result<()> {
	for l in REQUIRED_LABELS {
		row.require_f64(l)?;
	}
	for (l, _) in row.iter().filter(|(l, _)| l.starts_with(label::CRIT_PREFIX)) {
		row.require_f64(l)?;
	}
	row.get_f64(label::DOWNSAMPLE_PERFORMED)?;
	Ok(())
}


/// the record the PSD sorter reads, and the quality gate flags
pub fn evaluation_row(paths: &ProjectPaths, micrograph: &Micrograph, down_factor: f64) -> Row {
	let mut row = Row::new();
	row.set(label::MICROGRAPH, micrograph.path.to_string_lossy());
	row.set(label::PSD, paths.artifact(micrograph, Artifact::Psd).to_string_lossy());
	row.set(label::PSD_ENHANCED, paths.artifact(micrograph, Artifact::EnhancedPsd).to_string_lossy());
	row.set(label::CTF_MODEL, paths.artifact(micrograph, Artifact::CtfParam).to_string_lossy());
	row.set(label::IMAGE1, paths.artifact(micrograph, Artifact::ModelQuadrant).to_string_lossy());
	row.set(label::IMAGE2, paths.artifact(micrograph, Artifact::ModelHalfPlane).to_string_lossy());
	row.set(label::DOWNSAMPLE_PERFORMED, down_factor);
	row.set(label::MICROGRAPH_ID, micrograph.id);
	row
}


/// Writes the placeholder result for a micrograph that has no estimate, returns its path.
/// The evaluation record is rewritten to point at it, flagged as rejected.
pub fn write_error_result(paths: &ProjectPaths, micrograph: &Micrograph) -> Result<PathBuf> {

	let dir = paths.micrograph_dir(micrograph);
	fs::create_dir_all(&dir)
		.context(format!("Failed to create micrograph folder: {}", dir.to_string_lossy()))?;

	let path = paths.artifact(micrograph, Artifact::ErrorParam);
	MetaData::single(ERROR_BLOCK, Row::error_placeholder())
		.write(&path)?;

	let mut evaluation = evaluation_row(paths, micrograph, -999.0);
	evaluation.set(label::CTF_MODEL, path.to_string_lossy());
	evaluation.set(label::ENABLED, Enabled::Rejected.value());
	MetaData::single("", evaluation)
		.write(paths.artifact(micrograph, Artifact::Evaluation))?;

	Ok(path)
}


/// A micrograph's result: the estimated parameters merged with its evaluation record.
pub struct MicrographResult {
	pub row: Row,
	pub result_file: PathBuf,
	pub enabled: Enabled
}


/// Gathers whatever the estimation left behind for a micrograph.
/// Without a usable parameter file, the placeholder result stands in (and gets written, if it isn't there yet).
pub fn read_result(paths: &ProjectPaths, micrograph: &Micrograph) -> Result<MicrographResult> {

	let ctfparam = paths.artifact(micrograph, Artifact::CtfParam);
	let evaluation = paths.artifact(micrograph, Artifact::Evaluation);
	let error_param = paths.artifact(micrograph, Artifact::ErrorParam);

	let (mut row, result_file, enabled) = match read_estimate(&ctfparam, &evaluation) {

		Ok(Some((row, enabled))) => (row, ctfparam, enabled),

		Ok(None) => {
			if !error_param.exists() {
				write_error_result(paths, micrograph)?;
			}
			(read_placeholder(&error_param, &evaluation)?, error_param, Enabled::Rejected)
		}

		Err(e) => {
			warn!("Unusable CTF parameters for micrograph {}, using the placeholder: {}", micrograph.name, e.deref().chain());
			fs::remove_file(&ctfparam)
				.context(format!("Failed to remove unusable CTF parameters: {}", ctfparam.to_string_lossy()))?;
			write_error_result(paths, micrograph)?;
			(read_placeholder(&error_param, &evaluation)?, error_param, Enabled::Rejected)
		}
	};

	row.set(label::MICROGRAPH_ID, micrograph.id);
	row.set(label::ENABLED, enabled.value());

	Ok(MicrographResult {
		row,
		result_file,
		enabled
	})
}


/// the estimated parameters merged with the evaluation, if there are any parameters
fn read_estimate(ctfparam: &Path, evaluation: &Path) -> Result<Option<(Row,Enabled)>> {

	if !ctfparam.exists() {
		return Ok(None);
	}

	let mut row = MetaData::read_row(ctfparam)?;
	if evaluation.exists() {
		row.merge(&MetaData::read_row(evaluation)?);
	}
	check_params(&row)?;

	// the evaluation record has the last word, but if the estimate stopped before writing one, judge it here
	let enabled = match row.get_i64(label::ENABLED)? {
		Some(enabled) => Enabled::from_value(enabled)?,
		None => quality::evaluate(&row)?.enabled()
	};

	Ok(Some((row, enabled)))
}


fn read_placeholder(error_param: &Path, evaluation: &Path) -> Result<Row> {
	let mut row = MetaData::read_row(error_param)?;
	if evaluation.exists() {
		row.merge(&MetaData::read_row(evaluation)?);
	}
	Ok(row)
}


/// Builds the output-set entry for a micrograph from its result files.
pub fn read_ctf_model(paths: &ProjectPaths, micrograph: &Micrograph) -> Result<CtfModel> {

	let result = read_result(paths, micrograph)
		.context(format!("Failed to read CTF result for micrograph {}", micrograph.name))?;
	let row = &result.row;

	let criteria = row.iter()
		.filter(|(l, _)| l.starts_with(label::CRIT_PREFIX))
		.map(|(l, _)| Ok((l.to_string(), row.require_f64(l)?)))
		.collect::<Result<Vec<_>>>()?;

	Ok(CtfModel {
		micrograph: micrograph.clone(),
		defocus_u: row.require_f64(label::DEFOCUS_U)?,
		defocus_v: row.require_f64(label::DEFOCUS_V)?,
		defocus_angle: row.require_f64(label::DEFOCUS_ANGLE)?,
		sampling_rate: row.require_f64(label::SAMPLING_RATE)?,
		down_factor: row.get_f64(label::DOWNSAMPLE_PERFORMED)?
			.unwrap_or(1.0),
		enabled: result.enabled,
		criteria,
		result_file: result.result_file,
		psd: paths.artifact(micrograph, Artifact::Psd),
		enhanced_psd: paths.artifact(micrograph, Artifact::EnhancedPsd),
		model_quadrant: paths.artifact(micrograph, Artifact::ModelQuadrant),
		model_halfplane: paths.artifact(micrograph, Artifact::ModelHalfPlane)
	})
}
