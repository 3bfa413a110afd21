use std::process::Stdio;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::trace;


/// Runs the external binaries. Success is a zero exit code, and nothing else.
#[async_trait(?Send)]
pub trait Runner {
	async fn run(&self, program: &str, args: &[String]) -> Result<()>;
}


/// Runs the binaries as child processes.
pub struct ProcessRunner;

#[async_trait(?Send)]
impl Runner for ProcessRunner {

	async fn run(&self, program: &str, args: &[String]) -> Result<()> {

		trace!("Exec: {} {}", program, args.join(" "));

		let output = Command::new(program)
			.args(args)
			.stdin(Stdio::null())
			.stdout(Stdio::null())
			.stderr(Stdio::piped())
			.kill_on_drop(true)
			.output()
			.await
			.context(format!("Failed to start process: {}", program))?;

		if !output.status.success() {
			let stderr = String::from_utf8_lossy(&output.stderr);
			bail!("{} failed with exit code {:?}: {}", program, output.status.code(), last_line(&stderr));
		}

		trace!("{} finished", program);
		Ok(())
	}
}


/// the tools print their actual complaint last
fn last_line(txt: &str) -> &str {
	txt.lines()
		.rev()
		.map(str::trim)
		.find(|line| !line.is_empty())
		.unwrap_or("(no output)")
}
