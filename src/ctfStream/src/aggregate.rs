use std::collections::BTreeMap;

use anyhow::{Context, Result};
use tracing::debug;

use crate::metadata::MetaData;
use crate::paths::ProjectPaths;
use crate::results;
use crate::sets::Micrograph;


/// Merges the results of the given micrographs into one table, one row per micrograph, ordered by micrograph id.
/// The same micrographs give the same table, whatever order they come in.
pub fn merge<'m>(paths: &ProjectPaths, micrographs: impl IntoIterator<Item=&'m Micrograph>) -> Result<MetaData> {

	let mut rows = BTreeMap::new();
	for micrograph in micrographs {
		let result = results::read_result(paths, micrograph)
			.context(format!("Failed to read result for micrograph {}", micrograph.name))?;
		rows.insert(micrograph.id, result.row);
	}

	let mut table = MetaData::new("");
	for (_, row) in rows {
		table.push(row);
	}

	Ok(table)
}


/// Rebuilds the aggregate table of the project.
pub fn rebuild<'m>(paths: &ProjectPaths, micrographs: impl IntoIterator<Item=&'m Micrograph>) -> Result<MetaData> {
	let table = merge(paths, micrographs)?;
	let path = paths.aggregate();
	table.write(&path)?;
	debug!("Wrote {} results to {}", table.len(), path.to_string_lossy());
	Ok(table)
}
