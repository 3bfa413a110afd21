use std::fs;
use std::path::{Path, PathBuf};

use assert_fs::TempDir;
use indoc::indoc;

use ctf_stream::config::Config;
use ctf_stream::paths::ProjectPaths;
use ctf_stream::sets::{Acquisition, CtfSet, FileInput, FileOutput, MicrographSet};
use ctf_stream::stream::CtfStream;


pub const CONFIG: &str = indoc! { r#"
	[input]
	micrographs = "micrographs.json"

	[ctf]
	down_factor = 1
	auto_downsampling = true
	fast_defocus = true
	min_defocus = 5000
	max_defocus = 25000

	[programs]
	estimate = "estimate"
	downsample = "downsample"
	sort_psds = "sort_psds"
	estimate_from_psd = "estimate_from_psd"

	[run]
	threads = 2
	poll_interval_ms = 10
"# };


pub fn acquisition() -> Acquisition {
	Acquisition {
		sampling_rate: 1.5,
		voltage: 300.0,
		spherical_aberration: 2.7,
		amplitude_contrast: 0.1
	}
}


/// A project folder in a temp dir, with a config file and (eventually) a micrograph set.
pub struct Project {
	dir: TempDir
}

impl Project {

	pub fn new() -> Self {
		Self::with_config(CONFIG)
	}

	pub fn with_config(toml: &str) -> Self {
		let dir = TempDir::new()
			.expect("Failed to make temp folder");
		let project = Self {
			dir
		};
		project.write(&project.paths().config(), toml);
		project
	}

	pub fn path(&self) -> &Path {
		self.dir.path()
	}

	pub fn paths(&self) -> ProjectPaths {
		ProjectPaths::new(self.dir.path())
	}

	pub fn config(&self) -> Config {
		Config::read(self.paths().config())
			.expect("Failed to read config")
	}

	pub fn write(&self, path: &Path, txt: &str) {
		fs::write(path, txt)
			.expect(&format!("Failed to write file: {}", path.to_string_lossy()));
	}

	pub fn micrographs_path(&self) -> PathBuf {
		self.path().join("micrographs.json")
	}

	/// adds (empty) micrograph files to the input set, making it if needed
	pub fn add_micrographs(&self, names: &[&str]) {
		let path = self.micrographs_path();
		let mut micrographs = if path.exists() {
			MicrographSet::read(&path)
				.expect("Failed to read micrographs")
		} else {
			MicrographSet::new(acquisition())
		};
		let raw = self.path().join("raw");
		fs::create_dir_all(&raw)
			.expect("Failed to create raw folder");
		for name in names {
			let mic_path = raw.join(format!("{}.mrc", name));
			self.write(&mic_path, "");
			micrographs.append(mic_path)
				.expect("Failed to append micrograph");
		}
		micrographs.write(&path)
			.expect("Failed to write micrographs");
	}

	pub fn close_micrographs(&self) {
		let path = self.micrographs_path();
		let mut micrographs = MicrographSet::read(&path)
			.expect("Failed to read micrographs");
		micrographs.close();
		micrographs.write(&path)
			.expect("Failed to write micrographs");
	}

	pub fn micrographs(&self) -> MicrographSet {
		MicrographSet::read(self.micrographs_path())
			.expect("Failed to read micrographs")
	}

	pub fn ctfs(&self) -> CtfSet {
		CtfSet::read(self.paths().output_set())
			.expect("Failed to read CTFs")
	}

	pub fn stream(&self) -> CtfStream<FileInput,FileOutput> {
		CtfStream::open(
			FileInput::new(self.micrographs_path()),
			FileOutput::new(self.paths().output_set()),
			self.paths()
		).expect("Failed to open stream")
	}

	pub fn print(&self) {
		println!("Project Folder: {}", self.path().to_string_lossy());
		print_tree(self.path(), 1);
	}
}


fn print_tree(dir: &Path, depth: usize) {
	let mut entries = fs::read_dir(dir)
		.expect(&format!("Failed to read dir: {}", dir.to_string_lossy()))
		.filter_map(|e| e.ok())
		.collect::<Vec<_>>();
	entries.sort_by_key(|e| e.file_name());
	for entry in entries {
		println!("{}{}", "\t".repeat(depth), entry.file_name().to_string_lossy());
		if entry.path().is_dir() {
			print_tree(&entry.path(), depth + 1);
		}
	}
}
