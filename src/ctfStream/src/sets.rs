//! The input micrograph set and the output CTF set, persisted as JSON documents.


use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use serde_json::{json, Map, Value};

use crate::quality::Enabled;


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
	Open,
	Closed
}

impl StreamState {

	pub fn id(&self) -> &'static str {
		match self {
			Self::Open => "open",
			Self::Closed => "closed"
		}
	}

	pub fn from_id(id: &str) -> Result<Self> {
		match id {
			"open" => Ok(Self::Open),
			"closed" => Ok(Self::Closed),
			_ => bail!("Unrecognized stream state: {}", id)
		}
	}
}


#[derive(Debug, Clone, PartialEq)]
pub struct Micrograph {
	pub id: u64,
	pub name: String,
	pub path: PathBuf
}

impl Micrograph {

	fn to_json(&self) -> Value {
		json!({
			"id": self.id,
			"name": &self.name,
			"path": self.path.to_string_lossy()
		})
	}

	fn from_json(value: &Value) -> Result<Self> {
		let obj = value.as_object()
			.context("micrograph was not an object")?;
		Ok(Self {
			id: get_u64(obj, "id")?,
			name: get_str(obj, "name")?.to_string(),
			path: PathBuf::from(get_str(obj, "path")?)
		})
	}
}


/// optics of the microscope, shared by every micrograph in a set
#[derive(Debug, Clone, PartialEq)]
pub struct Acquisition {
	/// in A/px
	pub sampling_rate: f64,
	/// in kV
	pub voltage: f64,
	/// in mm
	pub spherical_aberration: f64,
	pub amplitude_contrast: f64
}


/// The micrographs coming out of acquisition. Owned by whoever is acquiring, this crate only reads it
/// (outside of the add-mics and close-mics commands, which stand in for acquisition).
#[derive(Debug, Clone, PartialEq)]
pub struct MicrographSet {
	pub stream_state: StreamState,
	pub acquisition: Acquisition,
	micrographs: Vec<Micrograph>
}

impl MicrographSet {

	pub fn new(acquisition: Acquisition) -> Self {
		Self {
			stream_state: StreamState::Open,
			acquisition,
			micrographs: Vec::new()
		}
	}

	pub fn len(&self) -> usize {
		self.micrographs.len()
	}

	pub fn is_empty(&self) -> bool {
		self.micrographs.is_empty()
	}

	pub fn iter(&self) -> impl Iterator<Item=&Micrograph> {
		self.micrographs.iter()
	}

	pub fn get_by_name(&self, name: &str) -> Option<&Micrograph> {
		self.micrographs.iter()
			.find(|m| m.name == name)
	}

	pub fn is_stream_closed(&self) -> bool {
		self.stream_state == StreamState::Closed
	}

	/// adds a micrograph to the end of the set, named after the file stem
	pub fn append(&mut self, path: impl Into<PathBuf>) -> Result<&Micrograph> {

		if self.is_stream_closed() {
			bail!("Micrograph set is closed, can't add more micrographs");
		}

		let path = path.into();
		let name = path.file_stem()
			.context(format!("Micrograph path has no file name: {}", path.to_string_lossy()))?
			.to_string_lossy()
			.to_string();
		if self.get_by_name(&name).is_some() {
			bail!("Micrograph set already has a micrograph named {}", name);
		}

		let id = self.micrographs.iter()
			.map(|m| m.id)
			.max()
			.unwrap_or(0) + 1;
		self.micrographs.push(Micrograph {
			id,
			name,
			path
		});

		self.micrographs.last()
			.ok_or_else(|| anyhow!("Micrograph vanished after append"))
	}

	pub fn close(&mut self) {
		self.stream_state = StreamState::Closed;
	}

	pub fn read(path: impl AsRef<Path>) -> Result<Self> {
		let path = path.as_ref();
		let doc = read_json(path)?;
		Self::from_json(&doc)
			.context(format!("Failed to read micrograph set: {}", path.to_string_lossy()))
	}

	pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
		write_json(path.as_ref(), &self.to_json())
	}

	fn to_json(&self) -> Value {
		json!({
			"stream_state": self.stream_state.id(),
			"sampling_rate": self.acquisition.sampling_rate,
			"voltage": self.acquisition.voltage,
			"spherical_aberration": self.acquisition.spherical_aberration,
			"amplitude_contrast": self.acquisition.amplitude_contrast,
			"micrographs": self.micrographs.iter()
				.map(Micrograph::to_json)
				.collect::<Vec<_>>()
		})
	}

	fn from_json(doc: &Value) -> Result<Self> {
		let obj = doc.as_object()
			.context("micrograph set was not an object")?;
		let micrographs = obj.get("micrographs")
			.context("missing micrographs")?
			.as_array()
			.context("micrographs was not an array")?
			.iter()
			.map(Micrograph::from_json)
			.collect::<Result<Vec<_>>>()?;
		Ok(Self {
			stream_state: StreamState::from_id(get_str(obj, "stream_state")?)?,
			acquisition: Acquisition {
				sampling_rate: get_f64(obj, "sampling_rate")?,
				voltage: get_f64(obj, "voltage")?,
				spherical_aberration: get_f64(obj, "spherical_aberration")?,
				amplitude_contrast: get_f64(obj, "amplitude_contrast")?
			},
			micrographs
		})
	}
}


/// Where the poller gets the current snapshot of the input set.
pub trait InputSource {
	fn load(&self) -> Result<MicrographSet>;
}


pub struct FileInput {
	path: PathBuf
}

impl FileInput {

	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self {
			path: path.into()
		}
	}
}

impl InputSource for FileInput {

	fn load(&self) -> Result<MicrographSet> {
		MicrographSet::read(&self.path)
	}
}


/// The CTF estimated for one micrograph, or the placeholder written when estimation failed.
#[derive(Debug, Clone, PartialEq)]
pub struct CtfModel {
	pub micrograph: Micrograph,
	/// in A
	pub defocus_u: f64,
	/// in A
	pub defocus_v: f64,
	/// in degrees
	pub defocus_angle: f64,
	/// sampling rate the estimate was made at, after downsampling
	pub sampling_rate: f64,
	pub down_factor: f64,
	pub enabled: Enabled,
	/// quality criteria reported by the external tools, by label
	pub criteria: Vec<(String,f64)>,
	/// the per-micrograph parameter file this model was read from
	pub result_file: PathBuf,
	pub psd: PathBuf,
	pub enhanced_psd: PathBuf,
	pub model_quadrant: PathBuf,
	pub model_halfplane: PathBuf
}

impl CtfModel {

	/// JSON has no NaN or infinity, a record carrying one could never be read back
	pub fn check_finite(&self) -> Result<()> {
		let values = [
			("defocus U", self.defocus_u),
			("defocus V", self.defocus_v),
			("defocus angle", self.defocus_angle),
			("sampling rate", self.sampling_rate),
			("downsampling factor", self.down_factor)
		];
		let criteria = self.criteria.iter()
			.map(|(label, value)| (label.as_str(), *value));
		for (name, value) in values.into_iter().chain(criteria) {
			if !value.is_finite() {
				bail!("CTF for micrograph {} has a {} that isn't a finite number: {}", self.micrograph.name, name, value);
			}
		}
		Ok(())
	}

	pub fn criterion(&self, label: &str) -> Option<f64> {
		self.criteria.iter()
			.find(|(l, _)| l == label)
			.map(|(_, v)| *v)
	}

	fn to_json(&self) -> Value {
		let mut criteria = Map::<String,Value>::new();
		for (label, value) in &self.criteria {
			criteria.insert(label.clone(), (*value).into());
		}
		json!({
			"micrograph": self.micrograph.to_json(),
			"defocus_u": self.defocus_u,
			"defocus_v": self.defocus_v,
			"defocus_angle": self.defocus_angle,
			"sampling_rate": self.sampling_rate,
			"down_factor": self.down_factor,
			"enabled": self.enabled.value(),
			"criteria": criteria,
			"result_file": self.result_file.to_string_lossy(),
			"psd": self.psd.to_string_lossy(),
			"enhanced_psd": self.enhanced_psd.to_string_lossy(),
			"model_quadrant": self.model_quadrant.to_string_lossy(),
			"model_halfplane": self.model_halfplane.to_string_lossy()
		})
	}

	fn from_json(value: &Value) -> Result<Self> {
		let obj = value.as_object()
			.context("ctf was not an object")?;
		let criteria = obj.get("criteria")
			.context("missing criteria")?
			.as_object()
			.context("criteria was not an object")?
			.iter()
			.map(|(label, value)| {
				let value = value.as_f64()
					.context(format!("criterion {} was not a number", label))?;
				Ok((label.clone(), value))
			})
			.collect::<Result<Vec<_>>>()?;
		let enabled = obj.get("enabled")
			.context("missing enabled")?
			.as_i64()
			.context("enabled was not an integer")?;
		Ok(Self {
			micrograph: Micrograph::from_json(obj.get("micrograph").context("missing micrograph")?)?,
			defocus_u: get_f64(obj, "defocus_u")?,
			defocus_v: get_f64(obj, "defocus_v")?,
			defocus_angle: get_f64(obj, "defocus_angle")?,
			sampling_rate: get_f64(obj, "sampling_rate")?,
			down_factor: get_f64(obj, "down_factor")?,
			enabled: Enabled::from_value(enabled)?,
			criteria,
			result_file: PathBuf::from(get_str(obj, "result_file")?),
			psd: PathBuf::from(get_str(obj, "psd")?),
			enhanced_psd: PathBuf::from(get_str(obj, "enhanced_psd")?),
			model_quadrant: PathBuf::from(get_str(obj, "model_quadrant")?),
			model_halfplane: PathBuf::from(get_str(obj, "model_halfplane")?)
		})
	}
}


#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DefocusRange {
	pub min: f64,
	pub max: f64
}


/// The CTF results, one per processed micrograph. Only this crate writes it.
#[derive(Debug, Clone, PartialEq)]
pub struct CtfSet {
	stream_state: StreamState,
	defocus_range: Option<DefocusRange>,
	ctfs: Vec<CtfModel>
}

impl CtfSet {

	pub fn new() -> Self {
		Self {
			stream_state: StreamState::Open,
			defocus_range: None,
			ctfs: Vec::new()
		}
	}

	pub fn len(&self) -> usize {
		self.ctfs.len()
	}

	pub fn is_empty(&self) -> bool {
		self.ctfs.is_empty()
	}

	pub fn iter(&self) -> impl Iterator<Item=&CtfModel> {
		self.ctfs.iter()
	}

	pub fn get(&self, micrograph_id: u64) -> Option<&CtfModel> {
		self.ctfs.iter()
			.find(|c| c.micrograph.id == micrograph_id)
	}

	pub fn contains(&self, micrograph_id: u64) -> bool {
		self.get(micrograph_id).is_some()
	}

	pub fn stream_state(&self) -> StreamState {
		self.stream_state
	}

	pub fn is_stream_closed(&self) -> bool {
		self.stream_state == StreamState::Closed
	}

	pub fn defocus_range(&self) -> Option<DefocusRange> {
		self.defocus_range
	}

	pub fn append(&mut self, ctf: CtfModel) -> Result<()> {
		if self.is_stream_closed() {
			bail!("CTF set is closed, can't append CTF for micrograph {}", ctf.micrograph.name);
		}
		if self.contains(ctf.micrograph.id) {
			bail!("CTF set already has a CTF for micrograph {}", ctf.micrograph.name);
		}
		ctf.check_finite()?;
		self.ctfs.push(ctf);
		self.update_defocus_range();
		Ok(())
	}

	pub fn update(&mut self, ctf: CtfModel) -> Result<()> {
		ctf.check_finite()?;
		let existing = self.ctfs.iter_mut()
			.find(|c| c.micrograph.id == ctf.micrograph.id)
			.context(format!("CTF set has no CTF for micrograph {}", ctf.micrograph.name))?;
		*existing = ctf;
		self.update_defocus_range();
		Ok(())
	}

	/// Closes the stream. Once closed, the set never opens again.
	pub fn close(&mut self) {
		self.stream_state = StreamState::Closed;
	}

	fn update_defocus_range(&mut self) {
		self.defocus_range = self.ctfs.iter()
			.filter(|c| c.enabled == Enabled::Accepted)
			.flat_map(|c| [c.defocus_u, c.defocus_v])
			.fold(None, |range, defocus| match range {
				None => Some(DefocusRange { min: defocus, max: defocus }),
				Some(DefocusRange { min, max }) => Some(DefocusRange {
					min: min.min(defocus),
					max: max.max(defocus)
				})
			});
	}

	pub fn read(path: impl AsRef<Path>) -> Result<Self> {
		let path = path.as_ref();
		let doc = read_json(path)?;
		Self::from_json(&doc)
			.context(format!("Failed to read CTF set: {}", path.to_string_lossy()))
	}

	pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
		write_json(path.as_ref(), &self.to_json())
	}

	fn to_json(&self) -> Value {
		let mut doc = Map::<String,Value>::new();
		doc.insert("stream_state".to_string(), self.stream_state.id().into());
		if let Some(range) = &self.defocus_range {
			doc.insert("defocus_min".to_string(), range.min.into());
			doc.insert("defocus_max".to_string(), range.max.into());
		}
		doc.insert("ctfs".to_string(), self.ctfs.iter()
			.map(CtfModel::to_json)
			.collect::<Vec<_>>()
			.into()
		);
		doc.into()
	}

	fn from_json(doc: &Value) -> Result<Self> {
		let obj = doc.as_object()
			.context("CTF set was not an object")?;
		let ctfs = obj.get("ctfs")
			.context("missing ctfs")?
			.as_array()
			.context("ctfs was not an array")?
			.iter()
			.map(CtfModel::from_json)
			.collect::<Result<Vec<_>>>()?;
		let defocus_range = match (obj.get("defocus_min"), obj.get("defocus_max")) {
			(Some(_), Some(_)) => Some(DefocusRange {
				min: get_f64(obj, "defocus_min")?,
				max: get_f64(obj, "defocus_max")?
			}),
			_ => None
		};
		Ok(Self {
			stream_state: StreamState::from_id(get_str(obj, "stream_state")?)?,
			defocus_range,
			ctfs
		})
	}
}


/// Where the poller and the publish steps keep the output set.
pub trait OutputSink {
	fn load(&self) -> Result<CtfSet>;
	fn commit(&self, ctfs: &CtfSet) -> Result<()>;
	fn exists(&self) -> bool;
}


pub struct FileOutput {
	path: PathBuf
}

impl FileOutput {

	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self {
			path: path.into()
		}
	}
}

impl OutputSink for FileOutput {

	fn load(&self) -> Result<CtfSet> {
		if self.path.exists() {
			CtfSet::read(&self.path)
		} else {
			Ok(CtfSet::new())
		}
	}

	fn commit(&self, ctfs: &CtfSet) -> Result<()> {
		ctfs.write(&self.path)
	}

	fn exists(&self) -> bool {
		self.path.exists()
	}
}


fn read_json(path: &Path) -> Result<Value> {
	let txt = fs::read_to_string(path)
		.context(format!("Failed to read file: {}", path.to_string_lossy()))?;
	serde_json::from_str::<Value>(&txt)
		.context(format!("File was not valid JSON: {}", path.to_string_lossy()))
}


/// writes next to the destination first, so readers never see a half-written document
fn write_json(path: &Path, doc: &Value) -> Result<()> {

	let txt = serde_json::to_string_pretty(doc)
		.context("Failed to serialize JSON")?;

	let mut tmp_name = path.file_name()
		.context(format!("Path has no file name: {}", path.to_string_lossy()))?
		.to_os_string();
	tmp_name.push(".tmp");
	let tmp_path = path.with_file_name(tmp_name);

	fs::write(&tmp_path, txt)
		.context(format!("Failed to write file: {}", tmp_path.to_string_lossy()))?;
	fs::rename(&tmp_path, path)
		.context(format!("Failed to move {} to {}", tmp_path.to_string_lossy(), path.to_string_lossy()))?;

	Ok(())
}


fn get_str<'a>(obj: &'a Map<String,Value>, key: &str) -> Result<&'a str> {
	obj.get(key)
		.context(format!("missing {}", key))?
		.as_str()
		.context(format!("{} was not a string", key))
}


fn get_f64(obj: &Map<String,Value>, key: &str) -> Result<f64> {
	obj.get(key)
		.context(format!("missing {}", key))?
		.as_f64()
		.context(format!("{} was not a number", key))
}


fn get_u64(obj: &Map<String,Value>, key: &str) -> Result<u64> {
	obj.get(key)
		.context(format!("missing {}", key))?
		.as_u64()
		.context(format!("{} was not an unsigned integer", key))
}
