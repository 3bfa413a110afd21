//! The quality gate applied to every CTF estimate.


use anyhow::{bail, Result};

use crate::metadata::{label, Row};


/// Whether a micrograph's CTF is accepted downstream. Rejected estimates are kept, just flagged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enabled {
	Accepted,
	Rejected
}

impl Enabled {

	pub fn value(&self) -> i64 {
		match self {
			Self::Accepted => 1,
			Self::Rejected => -1
		}
	}

	pub fn from_value(value: i64) -> Result<Self> {
		match value {
			1 => Ok(Self::Accepted),
			-1 => Ok(Self::Rejected),
			_ => bail!("Unrecognized enabled value: {}", value)
		}
	}
}


#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Bound {
	/// reject when the value is below this
	Min(f64),
	/// reject when the value is above this
	Max(f64)
}


#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Criterion {
	pub label: &'static str,
	pub bound: Bound
}

impl Criterion {

	const fn min(label: &'static str, min: f64) -> Self {
		Self {
			label,
			bound: Bound::Min(min)
		}
	}

	const fn max(label: &'static str, max: f64) -> Self {
		Self {
			label,
			bound: Bound::Max(max)
		}
	}

	pub fn rejects(&self, value: f64) -> bool {
		match self.bound {
			Bound::Min(min) => value < min,
			Bound::Max(max) => value > max
		}
	}
}


/// a micrograph is rejected if any of these is violated
pub const REJECTION_CRITERIA: [Criterion; 9] = [
	Criterion::min(label::CRIT_FIRST_ZERO, 5.0),
	Criterion::max(label::CRIT_MAX_FREQ, 20.0),
	Criterion::min(label::CRIT_FIRST_ZERO_RATIO, 0.9),
	Criterion::max(label::CRIT_FIRST_ZERO_RATIO, 1.1),
	Criterion::max(label::CRIT_FIRST_MIN_FIRST_ZERO_RATIO, 10.0),
	Criterion::min(label::CRIT_CORR13, 0.0),
	Criterion::min(label::CRIT_CTF_MARGIN, 0.0),
	Criterion::min(label::CRIT_NON_ASTIGMATIC_VALIDITY, 0.3),
	Criterion::max(label::CRIT_NON_ASTIGMATIC_VALIDITY, 25.0),
];


#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
	/// criteria the estimate violated, with the offending value
	pub violated: Vec<(Criterion,f64)>,
	/// criteria with no value in the estimate
	pub missing: Vec<&'static str>
}

impl Evaluation {

	/// Estimates missing any criterion can't be vouched for, so they're rejected too.
	pub fn enabled(&self) -> Enabled {
		if self.violated.is_empty() && self.missing.is_empty() {
			Enabled::Accepted
		} else {
			Enabled::Rejected
		}
	}

	pub fn describe(&self) -> String {
		if self.enabled() == Enabled::Accepted {
			return "passed".to_string();
		}
		let mut reasons = self.violated.iter()
			.map(|(c, v)| match c.bound {
				Bound::Min(min) => format!("{}={} < {}", c.label, v, min),
				Bound::Max(max) => format!("{}={} > {}", c.label, v, max)
			})
			.collect::<Vec<_>>();
		for l in &self.missing {
			reasons.push(format!("{} missing", l));
		}
		reasons.join(", ")
	}
}


pub fn evaluate(row: &Row) -> Result<Evaluation> {

	let mut violated = Vec::new();
	let mut missing = Vec::new();

	for criterion in REJECTION_CRITERIA {
		match row.get_f64(criterion.label)? {
			Some(value) if criterion.rejects(value) => violated.push((criterion, value)),
			Some(_) => (),
			None => if !missing.contains(&criterion.label) {
				missing.push(criterion.label);
			}
		}
	}

	Ok(Evaluation {
		violated,
		missing
	})
}
