//! Notifications emitted by the Direct-Edit worker
//!
//! The worker never talks to a UI directly. Listeners receive these events
//! on the worker's task and decide how to surface them.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Error notifications carrying a translatable code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditErrorCode {
	CantFindEngine,
	NotFound,
	Version,
	Proxy,
	CorruptedDownloadRetry,
	CorruptedDownloadFailure,
	NoAssociatedSoftware,
	UploadFailed,
	NotEnabled,
}

impl EditErrorCode {
	pub fn as_str(&self) -> &'static str {
		match self {
			EditErrorCode::CantFindEngine => "DIRECT_EDIT_CANT_FIND_ENGINE",
			EditErrorCode::NotFound => "DIRECT_EDIT_NOT_FOUND",
			EditErrorCode::Version => "DIRECT_EDIT_VERSION",
			EditErrorCode::Proxy => "DIRECT_EDIT_PROXY",
			EditErrorCode::CorruptedDownloadRetry => "DIRECT_EDIT_CORRUPTED_DOWNLOAD_RETRY",
			EditErrorCode::CorruptedDownloadFailure => "DIRECT_EDIT_CORRUPTED_DOWNLOAD_FAILURE",
			EditErrorCode::NoAssociatedSoftware => "DIRECT_EDIT_NO_ASSOCIATED_SOFTWARE",
			EditErrorCode::UploadFailed => "DIRECT_EDIT_UPLOAD_FAILED",
			EditErrorCode::NotEnabled => "DIRECT_EDIT_NOT_ENABLED",
		}
	}
}

impl fmt::Display for EditErrorCode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, Clone, PartialEq)]
pub enum DirectEditEvent {
	/// The blob is about to be downloaded
	Starting { hostname: String, filename: String },

	/// The file is ready; the UI should launch the associated application
	OpenDocument { path: PathBuf, filename: String, elapsed: Duration },

	/// Local changes were pushed
	EditDocument { name: String, elapsed: Duration },

	UploadCompleted { name: String },

	/// Remote blob changed since the download; nothing was uploaded
	Conflict { name: String, path: PathBuf, remote_digest: String },

	/// `action` is one of `lock`, `unlock`, `unlock_orphan`
	LockError { action: String, name: String, uid: String },

	Forbidden { uid: String, hostname: String, user: String },

	Readonly { name: String },

	Locked { name: String, owner: String, created: Option<DateTime<Utc>> },

	Error { code: EditErrorCode, values: Vec<String> },

	/// Telemetry to forward to the server
	Metrics { values: Map<String, Value> },
}

impl DirectEditEvent {
	pub fn error(code: EditErrorCode, values: &[&str]) -> Self {
		DirectEditEvent::Error { code, values: values.iter().map(|v| v.to_string()).collect() }
	}
}

pub trait DirectEditListener: Send + Sync {
	fn on_event(&self, _event: &DirectEditEvent) {}
}

impl<T: Fn(&DirectEditEvent) + Send + Sync> DirectEditListener for T {
	fn on_event(&self, event: &DirectEditEvent) {
		self(event);
	}
}


// vim: ts=4
