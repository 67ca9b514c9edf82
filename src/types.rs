//! Persistent transfer records
//!
//! Downloads, Uploads, Sessions and the minimal DocPair rows used by
//! Direct-Transfer. Everything here round-trips through the transfer store
//! as JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::constants::DEFAULT_PROVIDER;

/// Status of a transfer or a session
///
/// Persisted as its integer value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", from = "u8")]
pub enum TransferStatus {
	Ongoing = 1,
	Paused = 2,
	Suspended = 3,
	Done = 4,
	Cancelled = 5,
}

impl TransferStatus {
	/// Statuses that allow chunk work to continue
	pub fn is_active(self) -> bool {
		matches!(self, TransferStatus::Ongoing | TransferStatus::Done)
	}
}

impl From<TransferStatus> for u8 {
	fn from(status: TransferStatus) -> u8 {
		status as u8
	}
}

impl From<u8> for TransferStatus {
	fn from(value: u8) -> Self {
		match value {
			1 => TransferStatus::Ongoing,
			2 => TransferStatus::Paused,
			3 => TransferStatus::Suspended,
			5 => TransferStatus::Cancelled,
			// Legacy rows carry values that no longer exist
			_ => TransferStatus::Done,
		}
	}
}

impl fmt::Display for TransferStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			TransferStatus::Ongoing => "ONGOING",
			TransferStatus::Paused => "PAUSED",
			TransferStatus::Suspended => "SUSPENDED",
			TransferStatus::Done => "DONE",
			TransferStatus::Cancelled => "CANCELLED",
		};
		f.write_str(name)
	}
}

/// Direction of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Nature {
	Download,
	Upload,
}

impl fmt::Display for Nature {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Nature::Download => f.write_str("download"),
			Nature::Upload => f.write_str("upload"),
		}
	}
}

/// Common shape of Downloads and Uploads
pub trait Transfer {
	const NATURE: Nature;

	fn uid(&self) -> Option<u64>;
	fn path(&self) -> &Path;
	fn status(&self) -> TransferStatus;
	fn progress(&self) -> f64;
	fn is_direct_transfer(&self) -> bool {
		false
	}

	fn name(&self) -> String {
		self.path()
			.file_name()
			.map(|n| n.to_string_lossy().into_owned())
			.unwrap_or_default()
	}
}

/// Server-side upload batch descriptor
///
/// Opaque to the core except for the few fields providers rely on; every
/// other key survives persistence through `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Batch {
	#[serde(rename = "batchId")]
	pub batch_id: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub provider: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub etag: Option<String>,
	#[serde(rename = "extraInfo", default, skip_serializing_if = "Map::is_empty")]
	pub extra_info: Map<String, Value>,
	#[serde(default)]
	pub upload_idx: u64,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub blobs: Vec<Value>,
	#[serde(flatten)]
	pub extra: Map<String, Value>,
}

impl Batch {
	pub fn new(batch_id: &str) -> Self {
		Batch { batch_id: batch_id.to_string(), ..Default::default() }
	}

	/// Any provider other than the in-repository one is external
	pub fn is_external(&self) -> bool {
		match self.provider.as_deref() {
			Some(p) => !p.is_empty() && p != DEFAULT_PROVIDER,
			None => false,
		}
	}

	/// Copy suitable for persistence
	pub fn without_blobs(&self) -> Batch {
		Batch { blobs: Vec::new(), ..self.clone() }
	}
}

/// Download row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Download {
	#[serde(default)]
	pub uid: Option<u64>,
	pub path: PathBuf,
	pub status: TransferStatus,
	#[serde(default)]
	pub engine: Option<String>,
	#[serde(default)]
	pub is_direct_edit: bool,
	#[serde(default)]
	pub progress: f64,
	#[serde(default)]
	pub filesize: u64,
	#[serde(default)]
	pub doc_pair: Option<u64>,
	#[serde(default)]
	pub tmpname: Option<PathBuf>,
	#[serde(default)]
	pub url: Option<String>,
}

impl Download {
	pub fn new(path: &Path, url: &str, tmpname: &Path, filesize: u64) -> Self {
		Download {
			uid: None,
			path: path.to_path_buf(),
			status: TransferStatus::Ongoing,
			engine: None,
			is_direct_edit: false,
			progress: 0.0,
			filesize,
			doc_pair: None,
			tmpname: Some(tmpname.to_path_buf()),
			url: Some(url.to_string()),
		}
	}
}

impl Transfer for Download {
	const NATURE: Nature = Nature::Download;

	fn uid(&self) -> Option<u64> {
		self.uid
	}
	fn path(&self) -> &Path {
		&self.path
	}
	fn status(&self) -> TransferStatus {
		self.status
	}
	fn progress(&self) -> f64 {
		self.progress
	}
}

/// Upload row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Upload {
	#[serde(default)]
	pub uid: Option<u64>,
	pub path: PathBuf,
	pub status: TransferStatus,
	#[serde(default)]
	pub engine: Option<String>,
	#[serde(default)]
	pub is_direct_edit: bool,
	#[serde(default)]
	pub is_direct_transfer: bool,
	#[serde(default)]
	pub progress: f64,
	#[serde(default)]
	pub filesize: u64,
	#[serde(default)]
	pub doc_pair: Option<u64>,
	pub batch: Batch,
	#[serde(default)]
	pub chunk_size: u64,
	#[serde(default)]
	pub remote_parent_path: String,
	#[serde(default)]
	pub remote_parent_ref: String,
	#[serde(default)]
	pub request_uid: Option<String>,
	/// Batch was refreshed in memory and must be persisted in full
	#[serde(skip)]
	pub dirty: bool,
}

impl Upload {
	pub fn new(path: &Path, batch: Batch, filesize: u64, chunk_size: u64) -> Self {
		Upload {
			uid: None,
			path: path.to_path_buf(),
			status: TransferStatus::Ongoing,
			engine: None,
			is_direct_edit: false,
			is_direct_transfer: false,
			progress: 0.0,
			filesize,
			doc_pair: None,
			batch,
			chunk_size,
			remote_parent_path: String::new(),
			remote_parent_ref: String::new(),
			request_uid: None,
			dirty: false,
		}
	}
}

impl Transfer for Upload {
	const NATURE: Nature = Nature::Upload;

	fn uid(&self) -> Option<u64> {
		self.uid
	}
	fn path(&self) -> &Path {
		&self.path
	}
	fn status(&self) -> TransferStatus {
		self.status
	}
	fn progress(&self) -> f64 {
		self.progress
	}
	fn is_direct_transfer(&self) -> bool {
		self.is_direct_transfer
	}
}

/// Direct-Transfer grouping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
	pub uid: u64,
	pub status: TransferStatus,
	pub remote_path: String,
	pub remote_ref: String,
	pub uploaded_items: u64,
	pub total_items: u64,
	pub planned_items: u64,
	pub engine: String,
	pub created_on: DateTime<Utc>,
	#[serde(default)]
	pub completed_on: Option<DateTime<Utc>>,
	#[serde(default)]
	pub description: String,
}

impl Session {
	pub fn is_terminal(&self) -> bool {
		matches!(self.status, TransferStatus::Done | TransferStatus::Cancelled)
	}
}

/// What to do when the destination already holds a document with the same name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicateBehavior {
	#[default]
	Create,
	Ignore,
	Override,
}

/// Minimal local/remote pairing record used by Direct-Transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocPair {
	#[serde(default)]
	pub id: u64,
	pub local_path: PathBuf,
	pub local_name: String,
	#[serde(default)]
	pub folderish: bool,
	#[serde(default)]
	pub size: u64,
	#[serde(default)]
	pub remote_parent_path: String,
	#[serde(default)]
	pub remote_parent_ref: String,
	#[serde(default)]
	pub remote_ref: Option<String>,
	#[serde(default)]
	pub session: Option<u64>,
	#[serde(default)]
	pub duplicate_behavior: DuplicateBehavior,
}

impl DocPair {
	pub fn new(local_path: &Path, folderish: bool) -> Self {
		DocPair {
			id: 0,
			local_path: local_path.to_path_buf(),
			local_name: local_path
				.file_name()
				.map(|n| n.to_string_lossy().into_owned())
				.unwrap_or_default(),
			folderish,
			size: 0,
			remote_parent_path: String::new(),
			remote_parent_ref: String::new(),
			remote_ref: None,
			session: None,
			duplicate_behavior: DuplicateBehavior::Create,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_status_integer_encoding() {
		assert_eq!(serde_json::to_string(&TransferStatus::Paused).unwrap(), "2");
		let status: TransferStatus = serde_json::from_str("5").unwrap();
		assert_eq!(status, TransferStatus::Cancelled);
		// Unknown legacy value
		let status: TransferStatus = serde_json::from_str("9").unwrap();
		assert_eq!(status, TransferStatus::Done);
	}

	#[test]
	fn test_batch_descriptor_keeps_provider_fields() {
		let raw = r#"{
			"batchId": "b-1",
			"provider": "s3",
			"etag": "abc",
			"extraInfo": {"bucket": "bkt", "expiration": 1700000000000},
			"key": "uploads/b-1",
			"multiPartUploadId": "mpu-9"
		}"#;
		let batch: Batch = serde_json::from_str(raw).unwrap();
		assert!(batch.is_external());
		let back: Batch = serde_json::from_str(&serde_json::to_string(&batch).unwrap()).unwrap();
		assert_eq!(back, batch);
		assert_eq!(back.extra["key"], "uploads/b-1");
		assert_eq!(back.extra_info["bucket"], "bkt");
	}

	#[test]
	fn test_default_provider_is_not_external() {
		let mut batch = Batch::new("b");
		assert!(!batch.is_external());
		batch.provider = Some("default".into());
		assert!(!batch.is_external());
	}

	#[test]
	fn test_upload_dirty_flag_not_persisted() {
		let mut upload = Upload::new(Path::new("/tmp/a"), Batch::new("b"), 10, 4);
		upload.dirty = true;
		let json = serde_json::to_string(&upload).unwrap();
		let back: Upload = serde_json::from_str(&json).unwrap();
		assert!(!back.dirty);
		assert_eq!(back.name(), "a");
	}
}

// vim: ts=4
