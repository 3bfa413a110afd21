use anyhow::{bail, Result};

use ctf_stream::config::Config;
use ctf_stream::paths::ProjectPaths;

use crate::ArgsProject;


pub fn run(args: ArgsProject) -> Result<()> {

	let paths = ProjectPaths::new(&args.project);
	let config = Config::read(paths.config())?;

	let msgs = config.validate();
	if !msgs.is_empty() {
		for msg in &msgs {
			println!("{}", msg);
		}
		bail!("Config has {} problem(s)", msgs.len());
	}

	println!("Config is valid");
	Ok(())
}
