//! Reading and writing of Xmipp-style STAR metadata files.
//!
//! The external binaries read and write these for every micrograph. A file holds one data block,
//! either as `_label value` lines for a single row, or as a `loop_` table for many rows.


use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use anyhow::{bail, Context, Result};


pub const STAR_HEADER: &str = "# XMIPP_STAR_1 *";

/// written in place of a value a row doesn't have, when other rows in a loop do
const MISSING: &str = "NA";

const PLACEHOLDER: f64 = -999.0;


/// metadata labels, without the leading underscore
pub mod label {
	pub const MICROGRAPH: &str = "micrograph";
	pub const MICROGRAPH_ID: &str = "micrographId";
	pub const ENABLED: &str = "enabled";
	pub const PSD: &str = "psd";
	pub const PSD_ENHANCED: &str = "psdEnhanced";
	pub const CTF_MODEL: &str = "ctfModel";
	pub const IMAGE1: &str = "image1";
	pub const IMAGE2: &str = "image2";

	pub const SAMPLING_RATE: &str = "ctfSamplingRate";
	pub const VOLTAGE: &str = "ctfVoltage";
	pub const DEFOCUS_U: &str = "ctfDefocusU";
	pub const DEFOCUS_V: &str = "ctfDefocusV";
	pub const DEFOCUS_ANGLE: &str = "ctfDefocusAngle";
	pub const SPHERICAL_ABERRATION: &str = "ctfSphericalAberration";
	pub const Q0: &str = "ctfQ0";
	pub const DOWNSAMPLE_PERFORMED: &str = "CtfDownsampleFactor";

	pub const CRIT_FIRST_ZERO: &str = "ctfCritFirstZero";
	pub const CRIT_MAX_FREQ: &str = "ctfCritMaxFreq";
	pub const CRIT_FIRST_ZERO_RATIO: &str = "ctfCritfirstZeroRatio";
	pub const CRIT_FIRST_MIN_FIRST_ZERO_RATIO: &str = "ctfCritFirstMinFirstZeroRatio";
	pub const CRIT_CORR13: &str = "ctfCritCorr13";
	pub const CRIT_CTF_MARGIN: &str = "ctfCritCtfMargin";
	pub const CRIT_NON_ASTIGMATIC_VALIDITY: &str = "ctfCritNonAstigmaticValidty";

	/// prefix shared by every quality criterion label
	pub const CRIT_PREFIX: &str = "ctfCrit";
}


/// labels of the error parameter file, written when no estimate could be made for a micrograph
const ERROR_LABELS: [&str; 41] = [
	label::SAMPLING_RATE,
	label::VOLTAGE,
	label::DEFOCUS_U,
	label::DEFOCUS_V,
	label::DEFOCUS_ANGLE,
	label::SPHERICAL_ABERRATION,
	"ctfChromaticAberration",
	"ctfEnergyLoss",
	"ctfLensStability",
	"ctfConvergenceCone",
	"ctfLongitudinalDisplacement",
	"ctfTransversalDisplacement",
	label::Q0,
	"ctfK",
	"ctfBgGaussianK",
	"ctfBgGaussianSigmaU",
	"ctfBgGaussianSigmaV",
	"ctfBgGaussianCU",
	"ctfBgGaussianCV",
	"ctfBgGaussianAngle",
	"ctfBgSqrtK",
	"ctfBgSqrtU",
	"ctfBgSqrtV",
	"ctfBgSqrtAngle",
	"ctfBgBaseline",
	"ctfBgGaussian2K",
	"ctfBgGaussian2SigmaU",
	"ctfBgGaussian2SigmaV",
	"ctfBgGaussian2CU",
	"ctfBgGaussian2CV",
	"ctfBgGaussian2Angle",
	"ctfX0",
	"ctfXF",
	"ctfY0",
	"ctfYF",
	"ctfCritFitting",
	label::CRIT_CORR13,
	label::DOWNSAMPLE_PERFORMED,
	"ctfCritPsdStdQ",
	"ctfCritPsdPCA1",
	"ctfCritPsdPCARuns",
];


/// One row of a metadata table. Labels keep the order they were first set in.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
	values: Vec<(String,String)>
}

impl Row {

	pub fn new() -> Self {
		Self::default()
	}

	/// the row written in place of a real estimate, every value set to the placeholder
	pub fn error_placeholder() -> Self {
		let mut row = Self::new();
		for l in ERROR_LABELS {
			row.set(l, PLACEHOLDER);
		}
		row
	}

	pub fn len(&self) -> usize {
		self.values.len()
	}

	pub fn is_empty(&self) -> bool {
		self.values.is_empty()
	}

	pub fn labels(&self) -> impl Iterator<Item=&str> {
		self.values.iter()
			.map(|(l, _)| l.as_str())
	}

	pub fn iter(&self) -> impl Iterator<Item=(&str,&str)> {
		self.values.iter()
			.map(|(l, v)| (l.as_str(), v.as_str()))
	}

	pub fn get(&self, label: &str) -> Option<&str> {
		self.values.iter()
			.find(|(l, _)| l == label)
			.map(|(_, v)| v.as_str())
	}

	/// NaN and infinities count as not a number, nothing downstream can use them
	pub fn get_f64(&self, label: &str) -> Result<Option<f64>> {
		self.get(label)
			.map(|v| {
				let value = f64::from_str(v)
					.context(format!("Value for {} was not a number: {}", label, v))?;
				if !value.is_finite() {
					bail!("Value for {} was not finite: {}", label, v);
				}
				Ok(value)
			})
			.transpose()
	}

	pub fn require_f64(&self, label: &str) -> Result<f64> {
		self.get_f64(label)?
			.context(format!("Missing metadata value: {}", label))
	}

	pub fn get_i64(&self, label: &str) -> Result<Option<i64>> {
		self.get(label)
			.map(|v| i64::from_str(v)
				.context(format!("Value for {} was not an integer: {}", label, v))
			)
			.transpose()
	}

	pub fn set(&mut self, label: impl AsRef<str>, value: impl ToString) {
		let label = label.as_ref();
		let value = value.to_string();
		match self.values.iter_mut().find(|(l, _)| l == label) {
			Some((_, v)) => *v = value,
			None => self.values.push((label.to_string(), value))
		}
	}

	pub fn remove(&mut self, label: &str) -> Option<String> {
		let i = self.values.iter()
			.position(|(l, _)| l == label)?;
		Some(self.values.remove(i).1)
	}

	/// copies every value of the other row into this one, overwriting values already here
	pub fn merge(&mut self, other: &Row) {
		for (l, v) in &other.values {
			self.set(l, v);
		}
	}
}


/// A metadata table: a named data block with zero or more rows.
#[derive(Debug, Clone, PartialEq)]
pub struct MetaData {
	pub block: String,
	rows: Vec<Row>
}

impl MetaData {

	pub fn new(block: impl Into<String>) -> Self {
		Self {
			block: block.into(),
			rows: Vec::new()
		}
	}

	pub fn single(block: impl Into<String>, row: Row) -> Self {
		Self {
			block: block.into(),
			rows: vec![row]
		}
	}

	pub fn len(&self) -> usize {
		self.rows.len()
	}

	pub fn is_empty(&self) -> bool {
		self.rows.is_empty()
	}

	pub fn rows(&self) -> &[Row] {
		&self.rows
	}

	pub fn first(&self) -> Option<&Row> {
		self.rows.first()
	}

	pub fn first_mut(&mut self) -> Option<&mut Row> {
		self.rows.first_mut()
	}

	pub fn push(&mut self, row: Row) {
		self.rows.push(row);
	}

	/// every label used by any row, in first-seen order
	pub fn labels(&self) -> Vec<&str> {
		let mut labels = Vec::<&str>::new();
		for row in &self.rows {
			for l in row.labels() {
				if !labels.contains(&l) {
					labels.push(l);
				}
			}
		}
		labels
	}

	pub fn read(path: impl AsRef<Path>) -> Result<Self> {
		let path = path.as_ref();
		let txt = fs::read_to_string(path)
			.context(format!("Failed to read metadata file: {}", path.to_string_lossy()))?;
		Self::parse(&txt)
			.context(format!("Failed to parse metadata file: {}", path.to_string_lossy()))
	}

	/// reads the only row of a single-row file
	pub fn read_row(path: impl AsRef<Path>) -> Result<Row> {
		let path = path.as_ref();
		Self::read(path)?
			.rows
			.into_iter()
			.next()
			.context(format!("Metadata file has no rows: {}", path.to_string_lossy()))
	}

	pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
		let path = path.as_ref();
		fs::write(path, self.to_star())
			.context(format!("Failed to write metadata file: {}", path.to_string_lossy()))
	}

	pub fn parse(txt: &str) -> Result<Self> {

		let mut block = None;
		let mut loop_labels = None::<Vec<String>>;
		let mut single = None::<Row>;
		let mut rows = Vec::<Row>::new();

		for (line_i, line) in txt.lines().enumerate() {
			let line = line.trim();
			if line.is_empty() || line.starts_with('#') {
				continue;
			}

			if let Some(name) = line.strip_prefix("data_") {
				if block.is_some() {
					bail!("line {}: only one data block per file is supported", line_i + 1);
				}
				block = Some(name.to_string());
				continue;
			}

			if line == "loop_" {
				if single.is_some() {
					bail!("line {}: loop_ after single-row values", line_i + 1);
				}
				loop_labels = Some(Vec::new());
				continue;
			}

			let tokens = tokenize(line)
				.context(format!("line {}", line_i + 1))?;

			match &mut loop_labels {

				Some(labels) => {
					if let Some(l) = line.strip_prefix('_') {
						if !rows.is_empty() {
							bail!("line {}: label after loop rows", line_i + 1);
						}
						// labels can be followed by a comment
						let l = l.split_whitespace()
							.next()
							.unwrap_or_default();
						labels.push(l.to_string());
					} else {
						if tokens.len() != labels.len() {
							bail!("line {}: expected {} values, found {}", line_i + 1, labels.len(), tokens.len());
						}
						let mut row = Row::new();
						for (l, v) in labels.iter().zip(tokens) {
							if v != MISSING {
								row.set(l, v);
							}
						}
						rows.push(row);
					}
				}

				None => {
					let Some(l) = line.strip_prefix('_')
						else { bail!("line {}: expected a _label, found: {}", line_i + 1, line); };
					let l = l.split_whitespace()
						.next()
						.unwrap_or_default();
					let value = tokens.into_iter()
						.nth(1)
						.context(format!("line {}: label {} has no value", line_i + 1, l))?;
					single.get_or_insert_with(Row::new)
						.set(l, value);
				}
			}
		}

		if let Some(row) = single {
			rows.push(row);
		}

		Ok(Self {
			block: block.context("no data_ block found")?,
			rows
		})
	}

	pub fn to_star(&self) -> String {

		let mut out = String::new();
		// writing into a String can't fail
		let _ = writeln!(out, "{}", STAR_HEADER);
		let _ = writeln!(out, "#");
		let _ = writeln!(out, "data_{}", self.block);

		match self.rows.as_slice() {

			[] => (),

			[row] => {
				for (l, v) in row.iter() {
					let _ = writeln!(out, " _{} {}", l, quote(v));
				}
			}

			rows => {
				let labels = self.labels();
				let _ = writeln!(out, "loop_");
				for l in &labels {
					let _ = writeln!(out, " _{}", l);
				}
				for row in rows {
					let values = labels.iter()
						.map(|l| row.get(l).map(quote).unwrap_or_else(|| MISSING.to_string()))
						.collect::<Vec<_>>();
					let _ = writeln!(out, " {}", values.join(" "));
				}
			}
		}

		out
	}
}


fn quote(value: &str) -> String {
	if value.is_empty() || value.contains(char::is_whitespace) {
		format!("'{}'", value)
	} else {
		value.to_string()
	}
}


fn tokenize(line: &str) -> Result<Vec<String>> {

	let mut tokens = Vec::new();
	let mut chars = line.chars().peekable();

	loop {

		// skip whitespace
		while chars.next_if(|c| c.is_whitespace()).is_some() {}

		let Some(c) = chars.next()
			else { break; };

		if c == '\'' || c == '"' {
			let mut token = String::new();
			loop {
				match chars.next() {
					Some(q) if q == c => break,
					Some(q) => token.push(q),
					None => bail!("unterminated quoted value")
				}
			}
			tokens.push(token);
		} else {
			let mut token = c.to_string();
			while let Some(c) = chars.next_if(|c| !c.is_whitespace()) {
				token.push(c);
			}
			tokens.push(token);
		}
	}

	Ok(tokens)
}
