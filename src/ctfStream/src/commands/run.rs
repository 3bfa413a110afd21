use std::rc::Rc;

use anyhow::Result;
use tracing::info;

use ctf_stream::config::Config;
use ctf_stream::paths::ProjectPaths;
use ctf_stream::pipeline::Pipeline;
use ctf_stream::runner::ProcessRunner;

use crate::ArgsRun;


pub fn run(args: ArgsRun) -> Result<()> {

	let paths = ProjectPaths::new(&args.project);
	let config = Config::read(paths.config())?;
	info!("Project: {}", paths.root().to_string_lossy());
	info!("Input micrographs: {}", config.input.micrographs.to_string_lossy());

	let summary = Pipeline::new(config, paths, Rc::new(ProcessRunner))
		.run(args.once)?;

	info!("Accepted {}, rejected {}, failed {}, published {}",
		summary.accepted, summary.rejected, summary.failed, summary.published
	);
	info!("Output has {} CTFs, stream {}",
		summary.output_size,
		if summary.output_closed { "closed" } else { "open" }
	);

	Ok(())
}
