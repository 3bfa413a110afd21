use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use toml::{Table, Value};


/// Config is the contents of ctf.toml.
/// Read once before anything runs, and never changed afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
	pub input: ConfigInput,
	pub ctf: ConfigCtf,
	pub programs: ConfigPrograms,
	pub run: ConfigRun
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConfigInput {
	/// the micrograph set to estimate CTFs for
	pub micrographs: PathBuf,
	/// a previous CTF set, to seed the defocus search
	pub previous_ctfs: Option<PathBuf>
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConfigCtf {
	pub down_factor: f64,
	/// also try down_factor+1 and down_factor-1 when an estimate doesn't pass the quality gate
	pub auto_downsampling: bool,
	pub fast_defocus: bool,
	/// center the defocus search on the previous CTF set, instead of the min/max defocus
	pub use_previous_defocus: bool,
	/// in pixels
	pub window_size: u32,
	/// in normalized frequency (1/px)
	pub low_res: f64,
	/// in normalized frequency (1/px)
	pub high_res: f64,
	/// in A
	pub min_defocus: f64,
	/// in A
	pub max_defocus: f64
}

impl Default for ConfigCtf {
	fn default() -> Self {
		Self {
			down_factor: 1.0,
			auto_downsampling: true,
			fast_defocus: true,
			use_previous_defocus: false,
			window_size: 256,
			low_res: 0.05,
			high_res: 0.35,
			min_defocus: 5000.0,
			max_defocus: 90000.0
		}
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConfigPrograms {
	pub estimate: String,
	pub downsample: String,
	pub sort_psds: String,
	/// fits a CTF again from an existing PSD, for recalculations
	pub estimate_from_psd: String
}

impl Default for ConfigPrograms {
	fn default() -> Self {
		Self {
			estimate: "xmipp_ctf_estimate_from_micrograph".to_string(),
			downsample: "xmipp_transform_downsample".to_string(),
			sort_psds: "xmipp_ctf_sort_psds".to_string(),
			estimate_from_psd: "xmipp_ctf_estimate_from_psd".to_string()
		}
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConfigRun {
	/// how many estimates can run at once
	pub threads: usize,
	pub poll_interval: Duration
}

impl Default for ConfigRun {
	fn default() -> Self {
		Self {
			threads: 4,
			poll_interval: Duration::from_secs(5)
		}
	}
}


impl Config {

	pub fn read(path: impl AsRef<Path>) -> Result<Self> {
		let path = path.as_ref();
		let toml = fs::read_to_string(path)
			.with_context(|| format!("Failed to read config file at: {}", path.to_string_lossy()))?;

		// relative paths in the config are relative to the config file
		let base_dir = path.parent()
			.unwrap_or(Path::new("."));

		Self::parse(&toml, base_dir)
			.with_context(|| format!("Failed to parse config file at: {}", path.to_string_lossy()))
	}

	pub fn parse(toml: &str, base_dir: impl AsRef<Path>) -> Result<Self> {

		let base_dir = base_dir.as_ref();
		let toml = toml.parse::<Table>()
			.context("Config file was not valid TOML")?;

		// read the input section
		let input = {

			let toml_input = section(&toml, "input")?
				.context("Missing [input] section from config file")?;

			let micrographs = toml_input.get("micrographs")
				.context("Missing input.micrographs")?
				.as_str()
				.context("input.micrographs was not a string")?;

			let previous_ctfs = get_str(Some(toml_input), "input", "previous_ctfs")?;

			ConfigInput {
				micrographs: base_dir.join(micrographs),
				previous_ctfs: previous_ctfs.map(|p| base_dir.join(p))
			}
		};

		// read the ctf section
		let ctf = {
			let toml_ctf = section(&toml, "ctf")?;
			let default = ConfigCtf::default();
			ConfigCtf {
				down_factor: get_f64(toml_ctf, "ctf", "down_factor")?.unwrap_or(default.down_factor),
				auto_downsampling: get_bool(toml_ctf, "ctf", "auto_downsampling")?.unwrap_or(default.auto_downsampling),
				fast_defocus: get_bool(toml_ctf, "ctf", "fast_defocus")?.unwrap_or(default.fast_defocus),
				use_previous_defocus: get_bool(toml_ctf, "ctf", "use_previous_defocus")?.unwrap_or(default.use_previous_defocus),
				window_size: get_u32(toml_ctf, "ctf", "window_size")?.unwrap_or(default.window_size),
				low_res: get_f64(toml_ctf, "ctf", "low_res")?.unwrap_or(default.low_res),
				high_res: get_f64(toml_ctf, "ctf", "high_res")?.unwrap_or(default.high_res),
				min_defocus: get_f64(toml_ctf, "ctf", "min_defocus")?.unwrap_or(default.min_defocus),
				max_defocus: get_f64(toml_ctf, "ctf", "max_defocus")?.unwrap_or(default.max_defocus)
			}
		};

		// read the programs section
		let programs = {
			let toml_programs = section(&toml, "programs")?;
			let default = ConfigPrograms::default();
			ConfigPrograms {
				estimate: get_str(toml_programs, "programs", "estimate")?.unwrap_or(default.estimate),
				downsample: get_str(toml_programs, "programs", "downsample")?.unwrap_or(default.downsample),
				sort_psds: get_str(toml_programs, "programs", "sort_psds")?.unwrap_or(default.sort_psds),
				estimate_from_psd: get_str(toml_programs, "programs", "estimate_from_psd")?.unwrap_or(default.estimate_from_psd)
			}
		};

		// read the run section
		let run = {
			let toml_run = section(&toml, "run")?;
			let default = ConfigRun::default();
			ConfigRun {
				threads: get_u32(toml_run, "run", "threads")?
					.map(|t| t as usize)
					.unwrap_or(default.threads),
				poll_interval: get_u32(toml_run, "run", "poll_interval_ms")?
					.map(|ms| Duration::from_millis(ms as u64))
					.unwrap_or(default.poll_interval)
			}
		};

		Ok(Config {
			input,
			ctf,
			programs,
			run
		})
	}

	/// Problems that should keep a run from starting, as messages for humans.
	/// Empty means the config is good to go.
	pub fn validate(&self) -> Vec<String> {

		let mut msgs = Vec::new();

		// NaN slips past every comparison below
		let numbers = [
			("Downsampling factor", self.ctf.down_factor),
			("Low resolution", self.ctf.low_res),
			("High resolution", self.ctf.high_res),
			("Minimum defocus", self.ctf.min_defocus),
			("Maximum defocus", self.ctf.max_defocus)
		];
		for (name, value) in numbers {
			if !value.is_finite() {
				msgs.push(format!("{} must be a finite number: {}", name, value));
			}
		}

		if self.ctf.down_factor < 1.0 {
			msgs.push("Downsampling factor must be >=1.".to_string());
		}

		if self.ctf.use_previous_defocus && self.input.previous_ctfs.is_none() {
			msgs.push("If you want to use a previous estimation of the CTF, the corresponding set of CTFs is needed".to_string());
		}

		if self.ctf.min_defocus < 0.0 {
			msgs.push(format!("Minimum defocus can't be negative: {}", self.ctf.min_defocus));
		}
		if self.ctf.min_defocus >= self.ctf.max_defocus {
			msgs.push(format!("Minimum defocus ({}) must be less than maximum defocus ({})", self.ctf.min_defocus, self.ctf.max_defocus));
		}

		for (name, value) in [("Low", self.ctf.low_res), ("High", self.ctf.high_res)] {
			if value <= 0.0 || value > 0.5 {
				msgs.push(format!("{} resolution must be in (0, 0.5] in normalized frequency: {}", name, value));
			}
		}
		if self.ctf.low_res >= self.ctf.high_res {
			msgs.push(format!("Low resolution ({}) must be less than high resolution ({})", self.ctf.low_res, self.ctf.high_res));
		}

		if self.ctf.window_size == 0 {
			msgs.push("Window size must be at least 1 pixel".to_string());
		}

		if self.run.threads == 0 {
			msgs.push("Need at least one thread".to_string());
		}
		if self.run.poll_interval.is_zero() {
			msgs.push("Poll interval must be at least 1 ms".to_string());
		}

		msgs
	}
}


fn section<'t>(toml: &'t Table, name: &str) -> Result<Option<&'t Table>> {
	toml.get(name)
		.map(|v| v.as_table()
			.context(format!("{} key is not a table", name))
		)
		.transpose()
}


fn get<'t>(table: Option<&'t Table>, key: &str) -> Option<&'t Value> {
	table.and_then(|t| t.get(key))
}


fn get_str(table: Option<&Table>, section: &str, key: &str) -> Result<Option<String>> {
	get(table, key)
		.map(|v| v.as_str()
			.map(str::to_string)
			.context(format!("{}.{} was not a string", section, key))
		)
		.transpose()
}


fn get_bool(table: Option<&Table>, section: &str, key: &str) -> Result<Option<bool>> {
	get(table, key)
		.map(|v| v.as_bool()
			.context(format!("{}.{} was not a boolean", section, key))
		)
		.transpose()
}


fn get_f64(table: Option<&Table>, section: &str, key: &str) -> Result<Option<f64>> {
	get(table, key)
		.map(|v| match v {
			// let integers stand in for floats, nobody wants to write 2.0
			Value::Integer(i) => Ok(*i as f64),
			Value::Float(f) => Ok(*f),
			_ => bail!("{}.{} was not a number", section, key)
		})
		.transpose()
}


fn get_u32(table: Option<&Table>, section: &str, key: &str) -> Result<Option<u32>> {
	get(table, key)
		.map(|v| {
			let i = v.as_integer()
				.context(format!("{}.{} was not an integer", section, key))?;
			u32::try_from(i)
				.context(format!("{}.{} was out of range: {}", section, key, i))
		})
		.transpose()
}
