//! Options recognised by the upload entry points

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::TransferError;
use crate::remote::Headers;

/// What to upload and how to link it
///
/// Built in code through the setters, or parsed from a JSON object coming
/// from an outer surface. Unknown keys are rejected.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "snake_case")]
pub struct UploadOptions {
	/// Automation command linking the blob (`Blob.AttachOnDocument`, `FileManager.Import`...)
	pub command: String,
	/// Name given to the blob instead of the local file name
	pub filename: Option<String>,
	pub mime_type: Option<String>,
	pub doc_pair: Option<u64>,
	pub engine_uid: Option<String>,
	pub is_direct_edit: bool,
	pub is_direct_transfer: bool,
	pub remote_parent_path: String,
	pub remote_parent_ref: String,
	pub overwrite: Option<bool>,
	pub headers: Headers,
	/// Extra parameters of the linking command
	pub params: Map<String, Value>,
	/// Automation context of the linking command
	pub context: Map<String, Value>,
}

impl UploadOptions {
	pub fn new(command: &str) -> Self {
		UploadOptions { command: command.to_string(), ..Default::default() }
	}

	/// Parse options from a JSON object
	pub fn from_value(value: Value) -> Result<Self, TransferError> {
		let options: UploadOptions = serde_json::from_value(value)
			.map_err(|e| TransferError::InvalidOption { message: e.to_string() })?;
		options.validate()?;
		Ok(options)
	}

	pub fn validate(&self) -> Result<(), TransferError> {
		if self.command.is_empty() && !self.is_direct_transfer {
			return Err(TransferError::InvalidOption {
				message: "a linking command is required".to_string(),
			});
		}
		Ok(())
	}

	pub fn filename(mut self, filename: &str) -> Self {
		self.filename = Some(filename.to_string());
		self
	}

	pub fn mime_type(mut self, mime_type: &str) -> Self {
		self.mime_type = Some(mime_type.to_string());
		self
	}

	pub fn doc_pair(mut self, doc_pair: u64) -> Self {
		self.doc_pair = Some(doc_pair);
		self
	}

	pub fn engine(mut self, engine_uid: &str) -> Self {
		self.engine_uid = Some(engine_uid.to_string());
		self
	}

	pub fn direct_edit(mut self) -> Self {
		self.is_direct_edit = true;
		self
	}

	pub fn direct_transfer(mut self) -> Self {
		self.is_direct_transfer = true;
		self
	}

	pub fn remote_parent(mut self, path: &str, reference: &str) -> Self {
		self.remote_parent_path = path.to_string();
		self.remote_parent_ref = reference.to_string();
		self
	}

	pub fn overwrite(mut self, overwrite: bool) -> Self {
		self.overwrite = Some(overwrite);
		self
	}

	pub fn header(mut self, key: &str, value: &str) -> Self {
		self.headers.insert(key.to_string(), value.to_string());
		self
	}

	pub fn param(mut self, key: &str, value: impl Into<Value>) -> Self {
		self.params.insert(key.to_string(), value.into());
		self
	}

	pub fn context(mut self, key: &str, value: impl Into<Value>) -> Self {
		self.context.insert(key.to_string(), value.into());
		self
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn test_from_value() {
		let options = UploadOptions::from_value(json!({
			"command": "NuxeoDrive.CreateFile",
			"doc_pair": 12,
			"engine_uid": "e1",
			"overwrite": true,
			"headers": {"X-Custom": "1"},
			"params": {"parentId": "abc"}
		}))
		.unwrap();
		assert_eq!(options.command, "NuxeoDrive.CreateFile");
		assert_eq!(options.doc_pair, Some(12));
		assert_eq!(options.overwrite, Some(true));
		assert_eq!(options.headers["X-Custom"], "1");
		assert_eq!(options.params["parentId"], "abc");
		assert!(!options.is_direct_edit);
	}

	#[test]
	fn test_unknown_option_rejected() {
		let err = UploadOptions::from_value(json!({"command": "X", "colour": "blue"})).unwrap_err();
		assert!(matches!(err, TransferError::InvalidOption { .. }));
	}

	#[test]
	fn test_command_required() {
		assert!(UploadOptions::from_value(json!({})).is_err());
		assert!(UploadOptions::from_value(json!({"is_direct_transfer": true})).is_ok());
	}

	#[test]
	fn test_builder() {
		let options = UploadOptions::new("Blob.AttachOnDocument")
			.engine("e1")
			.direct_edit()
			.param("document", "uid")
			.header("NX-metric-drive-request", "{}");
		assert_eq!(options.engine_uid.as_deref(), Some("e1"));
		assert!(options.is_direct_edit);
		assert_eq!(options.params["document"], "uid");
	}
}

// vim: ts=4
