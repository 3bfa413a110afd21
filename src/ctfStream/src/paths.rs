use std::path::{Path, PathBuf};

use crate::sets::Micrograph;


/// Files the external tools read and write for each micrograph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Artifact {
	/// the output root handed to the estimator, it appends its own extensions
	Prefix,
	CtfParam,
	ErrorParam,
	Psd,
	EnhancedPsd,
	ModelQuadrant,
	ModelHalfPlane,
	/// the evaluation record the quality gate reads and flags
	Evaluation,
	/// the downsampled copy of the micrograph, removed after estimation
	Downsampled
}

impl Artifact {

	fn file_name(&self) -> &'static str {
		match self {
			Self::Prefix => "xmipp_ctf",
			Self::CtfParam => "xmipp_ctf.ctfparam",
			Self::ErrorParam => "xmipp_ctf_error.ctfparam",
			Self::Psd => "xmipp_ctf.psd",
			Self::EnhancedPsd => "xmipp_ctf_enhanced_psd.xmp",
			Self::ModelQuadrant => "xmipp_ctf_ctfmodel_quadrant.xmp",
			Self::ModelHalfPlane => "xmipp_ctf_ctfmodel_halfplane.xmp",
			Self::Evaluation => "xmipp_ctf.xmd",
			Self::Downsampled => "" // lives in tmp, see below
		}
	}
}


/// Layout of a project folder.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectPaths {
	root: PathBuf
}

impl ProjectPaths {

	pub fn new(root: impl Into<PathBuf>) -> Self {
		Self {
			root: root.into()
		}
	}

	pub fn root(&self) -> &Path {
		&self.root
	}

	pub fn config(&self) -> PathBuf {
		self.root.join("ctf.toml")
	}

	pub fn output_set(&self) -> PathBuf {
		self.root.join("ctfs.json")
	}

	/// the table of every published micrograph's results
	pub fn aggregate(&self) -> PathBuf {
		self.root.join("micrographs.xmd")
	}

	pub fn extra(&self) -> PathBuf {
		self.root.join("extra")
	}

	pub fn tmp(&self) -> PathBuf {
		self.root.join("tmp")
	}

	pub fn micrograph_dir(&self, micrograph: &Micrograph) -> PathBuf {
		self.extra().join(micrograph_key(micrograph))
	}

	pub fn artifact(&self, micrograph: &Micrograph, artifact: Artifact) -> PathBuf {
		match artifact {
			// some input formats can't be written back out, so downsampled copies are always MRC
			Artifact::Downsampled => self.tmp().join(format!("{}.mrc", micrograph_key(micrograph))),
			_ => self.micrograph_dir(micrograph).join(artifact.file_name())
		}
	}
}


/// ids keep two micrographs with the same name apart, the name is there for humans
fn micrograph_key(micrograph: &Micrograph) -> String {
	let name = micrograph.name.chars()
		.map(|c| match c {
			'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
			_ => '_'
		})
		.collect::<String>();
	format!("{:06}_{}", micrograph.id, name)
}
