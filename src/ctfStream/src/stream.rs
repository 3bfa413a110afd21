//! Streaming CTF estimation: keeps the output CTF set in step with an input micrograph set that may still be growing.


use std::collections::HashSet;

use anyhow::{bail, Context, Result};
use tracing::{debug, info};

use crate::aggregate;
use crate::engine::{Engine, Step, StepId, StepStatus};
use crate::paths::ProjectPaths;
use crate::results;
use crate::sets::{Acquisition, CtfSet, InputSource, Micrograph, OutputSink};


/// What one poll saw.
#[derive(Debug, Clone, PartialEq)]
pub struct PollReport {
	/// micrographs scheduled by this poll
	pub scheduled: usize,
	pub input_size: usize,
	pub input_closed: bool,
	pub output_size: usize,
	pub output_closed: bool
}


pub struct CtfStream<I,O> {
	input: I,
	output: O,
	paths: ProjectPaths,
	/// names of micrographs with steps in the engine, or already in the output set
	scheduled: HashSet<String>,
	close_step: Option<StepId>,
	acquisition: Option<Acquisition>
}

impl<I,O> CtfStream<I,O>
	where
		I: InputSource,
		O: OutputSink
{

	/// Picks up where any earlier run left off: micrographs already in the output set count as scheduled,
	/// everything else gets scheduled again.
	pub fn open(input: I, output: O, paths: ProjectPaths) -> Result<Self> {

		let ctfs = output.load()
			.context("Failed to load output CTF set")?;
		if !output.exists() {
			output.commit(&ctfs)
				.context("Failed to create output CTF set")?;
			info!("Created empty output CTF set");
		} else {
			info!("Resuming with {} CTFs already in the output set", ctfs.len());
		}

		let scheduled = ctfs.iter()
			.map(|ctf| ctf.micrograph.name.clone())
			.collect();

		Ok(Self {
			input,
			output,
			paths,
			scheduled,
			close_step: None,
			acquisition: None
		})
	}

	pub fn paths(&self) -> &ProjectPaths {
		&self.paths
	}

	pub fn is_scheduled(&self, micrograph_name: &str) -> bool {
		self.scheduled.contains(micrograph_name)
	}

	/// the optics of the input set, as of the last poll
	pub fn acquisition(&self) -> Option<&Acquisition> {
		self.acquisition.as_ref()
	}

	pub fn close_step(&self) -> Option<StepId> {
		self.close_step
	}

	pub fn load_output(&self) -> Result<CtfSet> {
		self.output.load()
	}

	/// Schedules steps for any micrographs not seen before, and closes the output stream when it's time.
	/// Polling again without anything new in the input or output changes nothing.
	pub fn poll(&mut self, engine: &mut impl Engine) -> Result<PollReport> {

		let micrographs = self.input.load()
			.context("Failed to load input micrographs")?;
		let mut ctfs = self.output.load()
			.context("Failed to load output CTF set")?;
		self.acquisition = Some(micrographs.acquisition.clone());

		// the close step waits on every publish step, so it goes in first
		let close_step = *self.close_step
			.get_or_insert_with(|| engine.insert_waiting(Step::CloseOutput));

		let new_micrographs = micrographs.iter()
			.filter(|m| !self.scheduled.contains(&m.name))
			.cloned()
			.collect::<Vec<_>>();

		for micrograph in &new_micrographs {
			let estimate = engine.insert(Step::Estimate(micrograph.clone()), &[]);
			let publish = engine.insert(Step::Publish(micrograph.clone()), &[estimate]);
			engine.add_prerequisite(close_step, publish);
			self.scheduled.insert(micrograph.name.clone());
		}
		if !new_micrographs.is_empty() {
			info!("Scheduled {} new micrographs", new_micrographs.len());
		}

		// the last publish may have just happened, so check even without anything new
		let finished = micrographs.is_stream_closed() && micrographs.len() == ctfs.len();
		if finished && !ctfs.is_stream_closed() {
			ctfs.close();
			self.output.commit(&ctfs)
				.context("Failed to close output CTF set")?;
			info!("All {} micrographs have CTFs, closed the output stream", ctfs.len());
		}

		if micrographs.is_stream_closed() && engine.status(close_step) == Some(StepStatus::Waiting) {
			debug!("Input stream closed, close step can run");
			engine.set_status(close_step, StepStatus::New);
		}

		Ok(PollReport {
			scheduled: new_micrographs.len(),
			input_size: micrographs.len(),
			input_closed: micrographs.is_stream_closed(),
			output_size: ctfs.len(),
			output_closed: ctfs.is_stream_closed()
		})
	}

	/// Adds one micrograph's result to the output set. A micrograph with no estimate gets the placeholder result.
	/// Publishing a micrograph that's already in the output set does nothing.
	pub fn publish(&mut self, micrograph: &Micrograph) -> Result<()> {

		let mut ctfs = self.output.load()
			.context("Failed to load output CTF set")?;
		if ctfs.contains(micrograph.id) {
			debug!("Micrograph {} already published", micrograph.name);
			return Ok(());
		}

		let ctf = results::read_ctf_model(&self.paths, micrograph)?;
		debug!("Publishing micrograph {}: enabled={}", micrograph.name, ctf.enabled.value());
		ctfs.append(ctf)?;

		aggregate::rebuild(&self.paths, ctfs.iter().map(|ctf| &ctf.micrograph))
			.context("Failed to rebuild aggregate results")?;

		self.output.commit(&ctfs)
			.context("Failed to save output CTF set")?;

		Ok(())
	}

	/// Replaces an already published micrograph's record with whatever its result files say now.
	pub fn republish(&mut self, micrograph: &Micrograph) -> Result<()> {

		let mut ctfs = self.output.load()
			.context("Failed to load output CTF set")?;

		let ctf = results::read_ctf_model(&self.paths, micrograph)?;
		info!("Republishing micrograph {}: enabled={}", micrograph.name, ctf.enabled.value());
		ctfs.update(ctf)?;

		aggregate::rebuild(&self.paths, ctfs.iter().map(|ctf| &ctf.micrograph))
			.context("Failed to rebuild aggregate results")?;

		self.output.commit(&ctfs)
			.context("Failed to save output CTF set")?;

		Ok(())
	}

	/// Closes the output stream for good, after the input stream closed and every micrograph was published.
	pub fn close_output(&mut self) -> Result<()> {

		let mut ctfs = self.output.load()
			.context("Failed to load output CTF set")?;
		if ctfs.is_stream_closed() {
			return Ok(());
		}

		let micrographs = self.input.load()
			.context("Failed to load input micrographs")?;
		if !micrographs.is_stream_closed() {
			bail!("Input stream is still open, can't close the output stream");
		}
		if micrographs.len() != ctfs.len() {
			bail!("Output has {} CTFs, but input has {} micrographs, can't close the output stream", ctfs.len(), micrographs.len());
		}

		ctfs.close();
		self.output.commit(&ctfs)
			.context("Failed to close output CTF set")?;
		info!("Closed the output stream with {} CTFs", ctfs.len());

		Ok(())
	}
}
