use std::rc::Rc;

use anyhow::{Context, Result};
use tracing::info;

use ctf_stream::config::Config;
use ctf_stream::estimate::{Outcome, Recalculation};
use ctf_stream::paths::ProjectPaths;
use ctf_stream::pipeline;
use ctf_stream::runner::ProcessRunner;

use crate::ArgsRecalc;


pub fn run(args: ArgsRecalc) -> Result<()> {

	let paths = ProjectPaths::new(&args.project);
	let config = Config::read(paths.config())?;

	let name = args.micrograph
		.context("Need the name of the micrograph to recalculate")?;
	let recalc = Recalculation {
		defocus_u: args.defocus_u
			.context("Recalculation needs --defocus-u")?,
		defocus_v: args.defocus_v
			.context("Recalculation needs --defocus-v")?,
		angle: args.angle
			.context("Recalculation needs --angle")?,
		low_res: args.low_res.unwrap_or(config.ctf.low_res),
		high_res: args.high_res.unwrap_or(config.ctf.high_res)
	};

	let outcome = pipeline::recalculate(&config, paths, Rc::new(ProcessRunner), &name, recalc)?;
	match outcome {
		Outcome::Accepted { down_factor } => info!("Micrograph {} recalculated at downsampling {}, accepted", name, down_factor),
		Outcome::Rejected { down_factor } => info!("Micrograph {} recalculated at downsampling {}, rejected", name, down_factor),
		Outcome::Failed => info!("Micrograph {} couldn't be recalculated", name)
	}

	Ok(())
}
