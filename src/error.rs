//! Error types for transfer operations

use std::error::Error;
use std::fmt;
use std::io;
use std::path::PathBuf;

/// Main error type for transfer pipelines and the Direct-Edit worker
#[derive(Debug)]
pub enum TransferError {
	/// Download row left the Ongoing/Done states mid-flight
	DownloadPaused(u64),

	/// Upload row left the Ongoing/Done states mid-flight
	UploadPaused(u64),

	/// Upload row was cancelled by the user
	UploadCancelled(u64),

	/// Digest of a local file does not match the expected one
	CorruptedFile { path: PathBuf, expected: String, computed: String },

	/// Remote returned 404, or a local record is missing
	NotFound { message: String },

	/// Document is locked by another user
	DocumentAlreadyLocked(String),

	/// Remote returned 403
	Forbidden { message: String },

	/// Remote returned 401
	Unauthorized,

	/// Network failure or timeout
	Connection { message: String },

	/// Worker was asked to stop
	ThreadInterrupt,

	/// Digest algorithm is not in the registry
	UnknownDigest(String),

	/// Rejected upload option or configuration value
	InvalidOption { message: String },

	/// Remote error (nested)
	Remote(RemoteError),

	/// Store error (nested)
	Store(StoreError),

	/// I/O error
	Io(io::Error),

	/// Generic error message
	Other { message: String },
}

impl TransferError {
	/// HTTP status carried by the error, if any
	pub fn status(&self) -> Option<u16> {
		match self {
			TransferError::NotFound { .. } => Some(404),
			TransferError::Forbidden { .. } => Some(403),
			TransferError::Unauthorized => Some(401),
			TransferError::Remote(e) => e.status(),
			_ => None,
		}
	}

	/// Transient network or server-side failure worth a retry
	pub fn is_transient(&self) -> bool {
		match self {
			TransferError::Connection { .. } => true,
			TransferError::Remote(e) => e.is_connection_error() || e.is_server_error(),
			_ => false,
		}
	}

	/// Pause/cancel control-flow errors that must unwind without side effects
	pub fn is_status_change(&self) -> bool {
		matches!(
			self,
			TransferError::DownloadPaused(_)
				| TransferError::UploadPaused(_)
				| TransferError::UploadCancelled(_)
		)
	}
}

impl fmt::Display for TransferError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			TransferError::DownloadPaused(uid) => write!(f, "Download {} paused", uid),
			TransferError::UploadPaused(uid) => write!(f, "Upload {} paused", uid),
			TransferError::UploadCancelled(uid) => write!(f, "Upload {} cancelled", uid),
			TransferError::CorruptedFile { path, expected, computed } => write!(
				f,
				"Corrupted file {}: expected digest {}, got {}",
				path.display(),
				expected,
				computed
			),
			TransferError::NotFound { message } => write!(f, "Not found: {}", message),
			TransferError::DocumentAlreadyLocked(user) => {
				write!(f, "Document already locked by {}", user)
			}
			TransferError::Forbidden { message } => write!(f, "Forbidden: {}", message),
			TransferError::Unauthorized => write!(f, "Unauthorized: invalid credentials"),
			TransferError::Connection { message } => write!(f, "Connection error: {}", message),
			TransferError::ThreadInterrupt => write!(f, "Worker interrupted"),
			TransferError::UnknownDigest(algo) => write!(f, "Unknown digest algorithm {:?}", algo),
			TransferError::InvalidOption { message } => write!(f, "Invalid option: {}", message),
			TransferError::Remote(e) => write!(f, "Remote error: {}", e),
			TransferError::Store(e) => write!(f, "Store error: {}", e),
			TransferError::Io(e) => write!(f, "I/O error: {}", e),
			TransferError::Other { message } => write!(f, "{}", message),
		}
	}
}

impl Error for TransferError {}

impl From<io::Error> for TransferError {
	fn from(e: io::Error) -> Self {
		TransferError::Io(e)
	}
}

impl From<String> for TransferError {
	fn from(e: String) -> Self {
		TransferError::Other { message: e }
	}
}

impl From<StoreError> for TransferError {
	fn from(e: StoreError) -> Self {
		TransferError::Store(e)
	}
}

impl From<RemoteError> for TransferError {
	fn from(e: RemoteError) -> Self {
		match e {
			RemoteError::Http { status: 401, .. } => TransferError::Unauthorized,
			RemoteError::Http { status: 403, message } => TransferError::Forbidden { message },
			RemoteError::Http { status: 404, message } => TransferError::NotFound { message },
			RemoteError::Connection { message } => TransferError::Connection { message },
			other => TransferError::Remote(other),
		}
	}
}

/// Errors returned by the remote repository client
#[derive(Debug, Clone)]
pub enum RemoteError {
	/// Non-success HTTP status
	Http { status: u16, message: String },

	/// Network failure or timeout
	Connection { message: String },

	/// Response body could not be decoded
	Decode { message: String },

	/// The object store no longer knows the multipart upload
	NoSuchUpload { upload_id: String },

	/// A mandatory attribute is missing from a remote descriptor
	MissingField { field: String },
}

impl RemoteError {
	pub fn status(&self) -> Option<u16> {
		match self {
			RemoteError::Http { status, .. } => Some(*status),
			_ => None,
		}
	}

	pub fn is_not_found(&self) -> bool {
		self.status() == Some(404)
	}

	pub fn is_connection_error(&self) -> bool {
		matches!(self, RemoteError::Connection { .. })
	}

	pub fn is_server_error(&self) -> bool {
		matches!(self.status(), Some(s) if s >= 500)
	}

	/// Error body for HTTP errors, empty otherwise
	pub fn message(&self) -> &str {
		match self {
			RemoteError::Http { message, .. }
			| RemoteError::Connection { message }
			| RemoteError::Decode { message } => message,
			RemoteError::NoSuchUpload { upload_id } => upload_id,
			RemoteError::MissingField { field } => field,
		}
	}
}

impl fmt::Display for RemoteError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			RemoteError::Http { status, message } => {
				write!(f, "HTTP error (status code: {}): {}", status, message)
			}
			RemoteError::Connection { message } => write!(f, "Connection failed: {}", message),
			RemoteError::Decode { message } => write!(f, "Invalid response: {}", message),
			RemoteError::NoSuchUpload { upload_id } => {
				write!(f, "No such upload {} on the object store", upload_id)
			}
			RemoteError::MissingField { field } => {
				write!(f, "Missing mandatory attribute {:?}", field)
			}
		}
	}
}

impl Error for RemoteError {}

impl From<reqwest::Error> for RemoteError {
	fn from(e: reqwest::Error) -> Self {
		if let Some(status) = e.status() {
			RemoteError::Http { status: status.as_u16(), message: e.to_string() }
		} else if e.is_decode() {
			RemoteError::Decode { message: e.to_string() }
		} else {
			RemoteError::Connection { message: e.to_string() }
		}
	}
}

impl From<serde_json::Error> for RemoteError {
	fn from(e: serde_json::Error) -> Self {
		RemoteError::Decode { message: e.to_string() }
	}
}

/// Errors from the durable transfer store
#[derive(Debug)]
pub enum StoreError {
	/// Underlying database failure
	Database { message: String },

	/// Row could not be (de)serialized
	Serialization { message: String },
}

impl fmt::Display for StoreError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			StoreError::Database { message } => write!(f, "Database error: {}", message),
			StoreError::Serialization { message } => {
				write!(f, "Serialization error: {}", message)
			}
		}
	}
}

impl Error for StoreError {}

macro_rules! store_database_error {
	($($t:ty),*) => {
		$(impl From<$t> for StoreError {
			fn from(e: $t) -> Self {
				StoreError::Database { message: e.to_string() }
			}
		})*
	};
}

store_database_error!(
	redb::Error,
	redb::DatabaseError,
	redb::TransactionError,
	redb::TableError,
	redb::StorageError,
	redb::CommitError
);

impl From<serde_json::Error> for StoreError {
	fn from(e: serde_json::Error) -> Self {
		StoreError::Serialization { message: e.to_string() }
	}
}


// vim: ts=4
