//! Log output, all of it through `tracing`.
//!
//! The binary logs to stderr, or appends to a log file when given one.
//! Either way, the `CTF_STREAM_LOG` environment variable overrides the filter,
//! which also goes for tests.


use std::env;
use std::fs::OpenOptions;
use std::ops::Deref;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use display_error_chain::ErrorChainExt;
use time::format_description::FormatItem;
use time::macros::format_description;
use time::UtcOffset;
use tracing::{error, warn};
use tracing::dispatcher::DefaultGuard;
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use tracing_subscriber::fmt::format::{Format, Full};
use tracing_subscriber::fmt::time::OffsetTime;
use tracing_subscriber::fmt::writer::BoxMakeWriter;


pub const LOG_ENV: &str = "CTF_STREAM_LOG";

const TEST_FILTER: &str = "ctf_stream=trace";


pub fn init(log: impl AsRef<str>, log_file: Option<&Path>) -> Result<()> {

	let log = env::var(LOG_ENV)
		.unwrap_or_else(|_| log.as_ref().to_string());

	// no color codes in files
	let (writer, ansi) = match log_file {
		None => (BoxMakeWriter::new(std::io::stderr), true),
		Some(path) => {
			let file = OpenOptions::new()
				.create(true)
				.append(true)
				.open(path)
				.context(format!("Failed to open log file: {}", path.to_string_lossy()))?;
			(BoxMakeWriter::new(Mutex::new(file)), false)
		}
	};

	let subscriber = FmtSubscriber::builder()
		.with_env_filter(log_filter(&log)?)
		.event_format(log_format(ansi))
		.with_writer(writer)
		.finish();
	tracing::subscriber::set_global_default(subscriber)
		.context("Failed to set logging subscriber")?;

	Ok(())
}


/// Logs to the test harness, which only shows output for failed tests.
pub fn init_test() -> DefaultGuard {

	let filter = env::var(LOG_ENV)
		.ok()
		.and_then(|log| log_filter(log).ok())
		.unwrap_or_else(|| EnvFilter::new(TEST_FILTER));

	let subscriber = FmtSubscriber::builder()
		.with_env_filter(filter)
		.event_format(log_format(true))
		.with_test_writer()
		.finish();

	tracing::subscriber::set_default(subscriber)
}


fn log_filter(log: impl AsRef<str>) -> Result<EnvFilter> {
	let log = log.as_ref();
	EnvFilter::builder()
		.parse(log)
		.context(format!("Failed to parse log filter: {}", log))
}


type LogFormat = Format<Full,OffsetTime<&'static [FormatItem<'static>]>>;

fn log_format(ansi: bool) -> LogFormat {

	// local time, to the tenth of a millisecond
	let timer = OffsetTime::new(
		UtcOffset::current_local_offset()
			.unwrap_or(UtcOffset::UTC),
		format_description!(
			version = 2,
			"[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:4] [offset_hour sign:mandatory]:[offset_minute]"
		)
	);

	Format::default()
		.with_timer(timer)
		.with_target(false)
		.with_ansi(ansi)
}


/// For failures that shouldn't stop anything: log the error chain, then drop it.
pub trait ResultExt<T> {

	/// logs at ERROR
	fn log_err(self) -> Result<T,()>;

	/// logs at WARN, for the failures we expect now and then
	fn warn_err(self) -> Result<T,()>;
}

impl<T> ResultExt<T> for Result<T,anyhow::Error> {

	fn log_err(self) -> Result<T,()> {
		self.map_err(|e| error!("{}", e.deref().chain()))
	}

	fn warn_err(self) -> Result<T,()> {
		self.map_err(|e| warn!("{}", e.deref().chain()))
	}
}
