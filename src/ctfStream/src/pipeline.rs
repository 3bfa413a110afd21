use std::ops::Deref;
use std::panic::AssertUnwindSafe;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use display_error_chain::ErrorChainExt;
use futures_util::FutureExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::{JoinSet, LocalSet};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::engine::{Engine, Step, StepId, StepStatus, Steps};
use crate::estimate::{Estimator, Outcome, Recalculation};
use crate::logging::ResultExt;
use crate::paths::ProjectPaths;
use crate::runner::Runner;
use crate::sets::{FileInput, FileOutput, InputSource, OutputSink};
use crate::stream::CtfStream;


/// What a run got done.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
	pub polls: usize,
	pub accepted: usize,
	pub rejected: usize,
	pub failed: usize,
	pub published: usize,
	pub output_size: usize,
	pub output_closed: bool
}


pub struct Pipeline {
	config: Config,
	paths: ProjectPaths,
	runner: Rc<dyn Runner>
}

impl Pipeline {

	pub fn new(config: Config, paths: ProjectPaths, runner: Rc<dyn Runner>) -> Self {
		Self {
			config,
			paths,
			runner
		}
	}

	/// Runs until the output stream closes, or until a signal says to stop.
	/// With `once`, runs only what the input has right now, and doesn't wait for more.
	#[tracing::instrument(skip_all, level = 5, name = "Pipeline", fields(run))]
	pub fn run(self, once: bool) -> Result<RunSummary> {

		// tag the run so interleaved logs from several runs make sense
		tracing::Span::current().record("run", fastrand::u32(..));

		let msgs = self.config.validate();
		if !msgs.is_empty() {
			bail!("Invalid configuration:\n\t{}", msgs.join("\n\t"));
		}

		// start a single-threaded tokio runtime
		let runtime = tokio::runtime::Builder::new_current_thread()
			.enable_io()
			.enable_time()
			.build()
			.context("Failed to create tokio runtime")?;
		debug!("Async runtime started");

		let result = runtime.block_on(async move {
			LocalSet::new().run_until(async move {
				self.event_loop(once).await
			}).await
		});

		runtime.shutdown_timeout(Duration::from_millis(500));
		debug!("Async runtime finished");

		result
	}

	async fn event_loop(self, once: bool) -> Result<RunSummary> {

		let input = FileInput::new(&self.config.input.micrographs);
		let output = FileOutput::new(self.paths.output_set());
		let mut stream = CtfStream::open(input, output, self.paths.clone())?;
		let estimator = Rc::new(Estimator::new(&self.config, self.paths.clone(), self.runner.clone())?);

		let mut steps = Steps::new();
		let mut running = JoinSet::<(StepId,Result<Outcome>)>::new();
		let mut summary = RunSummary::default();
		let mut stopping = false;

		let mut sigint = signal(SignalKind::interrupt())
			.context("Failed to install SIGINT handler")?;
		let mut sigterm = signal(SignalKind::terminate())
			.context("Failed to install SIGTERM handler")?;

		loop {

			if !stopping {
				// a half-written input file shouldn't end the run, the next poll will see it whole
				if let Ok(report) = stream.poll(&mut steps)
					.context("Failed to poll, will try again")
					.log_err()
				{
					summary.polls += 1;
					summary.output_size = report.output_size;
					summary.output_closed = report.output_closed;
				}

				self.dispatch(&mut stream, &estimator, &mut steps, &mut running, &mut summary);
			}

			// are we done yet?
			if running.is_empty() {
				if stopping {
					info!("Stopped, {} steps never ran", steps.count(StepStatus::New) + steps.count(StepStatus::Waiting));
					break;
				}
				if summary.output_closed {
					info!("Output stream closed, all done");
					break;
				}
				if once {
					info!("Nothing left to run for now");
					break;
				}
			}

			tokio::select! {

				Some(result) = running.join_next(), if !running.is_empty() => {
					let Ok((id, outcome)) = result
						.map_err(|e| anyhow!("Estimate task was lost: {}", e))
						.log_err()
						else { continue; };
					let status = match outcome {
						Ok(Outcome::Accepted { .. }) => {
							summary.accepted += 1;
							StepStatus::Finished
						}
						Ok(Outcome::Rejected { .. }) => {
							summary.rejected += 1;
							StepStatus::Finished
						}
						Ok(Outcome::Failed) => {
							summary.failed += 1;
							StepStatus::Failed
						}
						Err(e) => {
							error!("Estimate step {} crashed: {}", id, e.deref().chain());
							summary.failed += 1;
							StepStatus::Failed
						}
					};
					steps.set_status(id, status);
				}

				_ = tokio::time::sleep(self.config.run.poll_interval), if !once => {
					// time to poll again
				}

				_ = sigint.recv() => {
					info!("Received SIGINT, waiting for {} running estimates ...", running.len());
					stopping = true;
				}

				_ = sigterm.recv() => {
					info!("Received SIGTERM, waiting for {} running estimates ...", running.len());
					stopping = true;
				}
			}
		}

		// one last look, in case the last publish finished the stream
		if !stopping {
			if let Ok(report) = stream.poll(&mut steps)
				.context("Failed to poll one last time")
				.log_err()
			{
				summary.output_size = report.output_size;
				summary.output_closed = report.output_closed;
			}
		}

		Ok(summary)
	}

	/// Runs every ready step: estimates go off into tasks, publishing and closing happen right here,
	/// so only this loop ever writes the output set.
	fn dispatch(&self,
		stream: &mut CtfStream<FileInput,FileOutput>,
		estimator: &Rc<Estimator>,
		steps: &mut Steps,
		running: &mut JoinSet<(StepId,Result<Outcome>)>,
		summary: &mut RunSummary
	) {
		loop {
			let mut progressed = false;

			for id in steps.ready() {

				let Some(step) = steps.step(id).cloned()
					else { continue; };

				match step {

					Step::Estimate(micrograph) => {
						if running.len() >= self.config.run.threads {
							continue;
						}
						let Some(acquisition) = stream.acquisition().cloned()
							else { continue; };
						steps.set_status(id, StepStatus::Running);
						let estimator = estimator.clone();
						running.spawn_local(async move {
							// a panic in one estimate shouldn't take the whole stream down
							let outcome = AssertUnwindSafe(estimator.estimate(&micrograph, &acquisition))
								.catch_unwind()
								.await
								.map_err(|_| anyhow!("Estimate of micrograph {} panicked", micrograph.name));
							(id, outcome)
						});
					}

					Step::Publish(micrograph) => {
						let Ok(_) = stream.publish(&micrograph)
							.context(format!("Failed to publish micrograph {}, will try again", micrograph.name))
							.log_err()
							// leave it new, the next poll retries it
							else { continue; };
						summary.published += 1;
						steps.set_status(id, StepStatus::Finished);
						progressed = true;
					}

					Step::CloseOutput => {
						let status = match stream.close_output()
							.warn_err()
						{
							Ok(()) => StepStatus::Finished,
							// not closable yet, put it back to wait for the next poll
							Err(()) => StepStatus::Waiting
						};
						steps.set_status(id, status);
						progressed = true;
					}
				}
			}

			if !progressed {
				break;
			}
		}

		match stream.load_output() {
			Ok(ctfs) => {
				summary.output_size = ctfs.len();
				summary.output_closed = ctfs.is_stream_closed();
			}
			Err(e) => warn!("Failed to reload output CTF set: {}", e.deref().chain())
		}
	}
}


/// Fits one published micrograph's CTF again, around corrected defoci, and updates its record in the output set.
/// The output set stays as open or closed as it was.
#[tracing::instrument(skip_all, level = 5, name = "Recalc", fields(mic = micrograph_name))]
pub fn recalculate(config: &Config, paths: ProjectPaths, runner: Rc<dyn Runner>, micrograph_name: &str, recalc: Recalculation) -> Result<Outcome> {

	let input = FileInput::new(&config.input.micrographs);
	let micrographs = input.load()
		.context("Failed to load input micrographs")?;
	let micrograph = micrographs.get_by_name(micrograph_name)
		.cloned()
		.context(format!("Input has no micrograph named {}", micrograph_name))?;

	let output = FileOutput::new(paths.output_set());
	if !output.load()?.contains(micrograph.id) {
		bail!("Micrograph {} hasn't been published yet, nothing to recalculate", micrograph.name);
	}
	let mut stream = CtfStream::open(input, output, paths.clone())?;

	let estimator = Estimator::new(config, paths, runner)?;
	let runtime = tokio::runtime::Builder::new_current_thread()
		.enable_io()
		.enable_time()
		.build()
		.context("Failed to create tokio runtime")?;
	let outcome = runtime.block_on(estimator.recalculate(&micrograph, &micrographs.acquisition, &recalc))?;

	stream.republish(&micrograph)?;

	Ok(outcome)
}
