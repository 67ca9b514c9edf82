//! Per-folder Direct-Edit metadata
//!
//! Values live in `user.*` extended attributes of the document folder. When
//! the filesystem refuses them, a JSON sidecar file inside the folder takes
//! over. Reads look at both.

use serde_json::{Map, Value};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::logging::*;

/// Sidecar used where extended attributes are unavailable
pub const SIDECAR_NAME: &str = ".nxdirectedit.json";

fn sidecar(dir: &Path) -> PathBuf {
	dir.join(SIDECAR_NAME)
}

fn read_sidecar(dir: &Path) -> Map<String, Value> {
	match fs::read(sidecar(dir)) {
		Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
		Err(_) => Map::new(),
	}
}

fn write_sidecar(dir: &Path, values: &Map<String, Value>) -> io::Result<()> {
	if values.is_empty() {
		return match fs::remove_file(sidecar(dir)) {
			Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
			_ => Ok(()),
		};
	}
	let bytes = serde_json::to_vec(values).map_err(io::Error::other)?;
	fs::write(sidecar(dir), bytes)
}

#[cfg(unix)]
fn xattr_name(name: &str) -> String {
	format!("user.{}", name)
}

/// Store `value` under `name` on `dir`
pub fn set(dir: &Path, name: &str, value: &str) -> io::Result<()> {
	#[cfg(unix)]
	{
		match xattr::set(dir, xattr_name(name), value.as_bytes()) {
			Ok(()) => return Ok(()),
			Err(e) => debug!("No xattr support on {} ({}), using the sidecar", dir.display(), e),
		}
	}
	let mut values = read_sidecar(dir);
	values.insert(name.to_string(), Value::String(value.to_string()));
	write_sidecar(dir, &values)
}

pub fn get(dir: &Path, name: &str) -> Option<String> {
	#[cfg(unix)]
	{
		if let Ok(Some(bytes)) = xattr::get(dir, xattr_name(name)) {
			return Some(String::from_utf8_lossy(&bytes).into_owned());
		}
	}
	read_sidecar(dir).get(name).and_then(Value::as_str).map(str::to_string)
}

pub fn remove(dir: &Path, name: &str) {
	#[cfg(unix)]
	{
		let _ = xattr::remove(dir, xattr_name(name));
	}
	let mut values = read_sidecar(dir);
	if values.remove(name).is_some() {
		if let Err(e) = write_sidecar(dir, &values) {
			warn!("Cannot update metadata of {}: {}", dir.display(), e);
		}
	}
}

/// Entries of `dir` other than the metadata sidecar
pub fn children(dir: &Path) -> io::Result<Vec<PathBuf>> {
	let mut children = Vec::new();
	for entry in fs::read_dir(dir)? {
		let entry = entry?;
		if entry.file_name() != SIDECAR_NAME {
			children.push(entry.path());
		}
	}
	children.sort();
	Ok(children)
}


// vim: ts=4
