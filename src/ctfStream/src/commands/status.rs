use anyhow::Result;

use ctf_stream::config::Config;
use ctf_stream::paths::ProjectPaths;
use ctf_stream::quality::Enabled;
use ctf_stream::sets::{CtfSet, MicrographSet};


pub fn run(args: crate::ArgsProject) -> Result<()> {

	let paths = ProjectPaths::new(&args.project);
	let config = Config::read(paths.config())?;

	let micrographs = MicrographSet::read(&config.input.micrographs)?;
	println!("Input:  {} micrographs, stream {}", micrographs.len(), micrographs.stream_state.id());

	let output_path = paths.output_set();
	if !output_path.exists() {
		println!("Output: not started");
		return Ok(());
	}
	let ctfs = CtfSet::read(&output_path)?;
	let accepted = ctfs.iter()
		.filter(|ctf| ctf.enabled == Enabled::Accepted)
		.count();
	println!("Output: {} CTFs, stream {}", ctfs.len(), ctfs.stream_state().id());
	println!("        {} accepted, {} rejected", accepted, ctfs.len() - accepted);
	if let Some(range) = ctfs.defocus_range() {
		println!("        defocus {:.1} - {:.1} A", range.min, range.max);
	}

	Ok(())
}
