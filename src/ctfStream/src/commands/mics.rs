use anyhow::{Context, Result};
use tracing::info;

use ctf_stream::config::Config;
use ctf_stream::paths::ProjectPaths;
use ctf_stream::sets::{Acquisition, MicrographSet};

use crate::{ArgsAddMics, ArgsProject};


pub fn add(args: ArgsAddMics) -> Result<()> {

	let paths = ProjectPaths::new(&args.project);
	let config = Config::read(paths.config())?;
	let path = &config.input.micrographs;

	let mut micrographs = if path.exists() {
		MicrographSet::read(path)?
	} else {
		let acquisition = Acquisition {
			sampling_rate: args.sampling_rate
				.context("A new micrograph set needs --sampling-rate")?,
			voltage: args.voltage
				.context("A new micrograph set needs --voltage")?,
			spherical_aberration: args.cs
				.context("A new micrograph set needs --cs")?,
			amplitude_contrast: args.amplitude_contrast
				.context("A new micrograph set needs --amplitude-contrast")?
		};
		info!("Creating micrograph set: {}", path.to_string_lossy());
		MicrographSet::new(acquisition)
	};

	for micrograph in args.micrographs {
		let micrograph = micrographs.append(micrograph)?;
		info!("Added micrograph {}: {}", micrograph.id, micrograph.name);
	}

	micrographs.write(path)
}


pub fn close(args: ArgsProject) -> Result<()> {

	let paths = ProjectPaths::new(&args.project);
	let config = Config::read(paths.config())?;
	let path = &config.input.micrographs;

	let mut micrographs = MicrographSet::read(path)?;
	micrographs.close();
	micrographs.write(path)?;
	info!("Closed micrograph set with {} micrographs", micrographs.len());

	Ok(())
}
