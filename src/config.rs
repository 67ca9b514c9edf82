//! Transfer engine options
//!
//! A single `Options` struct carries every tunable used by the pipelines and
//! the Direct-Edit worker. Values follow a priority chain:
//! 1. Built-in defaults (`Options::default()`)
//! 2. Config file (TOML, JSON or JSON5)
//! 3. Environment variables (`NXTRANSFER_*` prefix)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::TransferError;
use crate::logging::*;

const MIB: u64 = 1024 * 1024;

/// Unified options for transfers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Options {
	// ========================================================================
	// UPLOADS
	// ========================================================================
	/// Chunk size in MiB (1..=20)
	pub chunk_size: u64,

	/// Files bigger than this (MiB) are uploaded by chunks
	pub chunk_limit: u64,

	/// Allow chunked uploads at all
	pub chunk_upload: bool,

	/// Keep-alive interval for external-provider batches
	pub batch_ping_interval_secs: u64,

	// ========================================================================
	// DOWNLOADS
	// ========================================================================
	/// Downloads bigger than this (MiB) are streamed to disk by chunks
	pub tmp_file_limit: u64,

	/// Read/write buffer size in bytes
	pub file_buffer_size: usize,

	/// Skip digest verification entirely
	pub disabled_file_integrity_check: bool,

	// ========================================================================
	// RETRY POLICY
	// ========================================================================
	/// Per-file error threshold before giving up
	pub max_errors: u32,

	/// Base delay of the retry queue
	pub blocklist_delay_secs: u64,

	/// Base delay between corrupted-download retries (multiplied by attempt)
	pub corrupted_retry_delay_secs: u64,

	// ========================================================================
	// TIMEOUTS
	// ========================================================================
	/// Server-side transaction timeout for long operations
	pub tx_timeout_secs: u64,

	/// Default socket timeout
	pub timeout_secs: u64,

	// ========================================================================
	// FEATURES
	// ========================================================================
	/// Use the object-store provider when the remote offers it
	pub feature_s3: bool,

	/// Attach request UIDs to idempotent operations
	pub feature_idempotency: bool,

	/// Enable the Direct-Edit worker
	pub feature_direct_edit: bool,

	/// Lock documents on the remote while they are edited
	pub direct_edit_auto_lock: bool,

	// ========================================================================
	// PATHS
	// ========================================================================
	/// Transfer store database
	pub database: PathBuf,

	/// Working folder of the Direct-Edit worker
	pub direct_edit_folder: PathBuf,
}

impl Default for Options {
	fn default() -> Self {
		let home = std::env::var("HOME")
			.map(PathBuf::from)
			.unwrap_or_else(|_| PathBuf::from("."));
		let base = home.join(".nxtransfer");
		Options {
			chunk_size: 20,
			chunk_limit: 20,
			chunk_upload: true,
			batch_ping_interval_secs: 55 * 60,
			tmp_file_limit: 10,
			file_buffer_size: MIB as usize,
			disabled_file_integrity_check: false,
			max_errors: 3,
			blocklist_delay_secs: 30,
			corrupted_retry_delay_secs: 5,
			tx_timeout_secs: 300,
			timeout_secs: 30,
			feature_s3: false,
			feature_idempotency: false,
			feature_direct_edit: true,
			direct_edit_auto_lock: true,
			database: base.join("transfers.redb"),
			direct_edit_folder: base.join("edit"),
		}
	}
}

impl Options {
	/// Load options from a file, then apply environment overrides
	///
	/// `.toml` files are parsed as TOML, anything else as JSON5 (which also
	/// accepts plain JSON).
	pub fn load(path: &Path) -> Result<Self, TransferError> {
		let text = std::fs::read_to_string(path)?;
		let mut options: Options = match path.extension().and_then(|e| e.to_str()) {
			Some("toml") => toml::from_str(&text).map_err(|e| TransferError::InvalidOption {
				message: format!("{}: {}", path.display(), e),
			})?,
			_ => json5::from_str(&text).map_err(|e| TransferError::InvalidOption {
				message: format!("{}: {}", path.display(), e),
			})?,
		};
		options.apply_env();
		options.validate()?;
		Ok(options)
	}

	/// Override fields from `NXTRANSFER_*` environment variables
	pub fn apply_env(&mut self) {
		env_override("NXTRANSFER_CHUNK_SIZE", &mut self.chunk_size);
		env_override("NXTRANSFER_CHUNK_LIMIT", &mut self.chunk_limit);
		env_override("NXTRANSFER_CHUNK_UPLOAD", &mut self.chunk_upload);
		env_override("NXTRANSFER_TMP_FILE_LIMIT", &mut self.tmp_file_limit);
		env_override("NXTRANSFER_MAX_ERRORS", &mut self.max_errors);
		env_override("NXTRANSFER_TX_TIMEOUT", &mut self.tx_timeout_secs);
		env_override("NXTRANSFER_TIMEOUT", &mut self.timeout_secs);
		env_override(
			"NXTRANSFER_DISABLED_FILE_INTEGRITY_CHECK",
			&mut self.disabled_file_integrity_check,
		);
		env_override("NXTRANSFER_FEATURE_S3", &mut self.feature_s3);
		env_override("NXTRANSFER_FEATURE_IDEMPOTENCY", &mut self.feature_idempotency);
		env_override("NXTRANSFER_FEATURE_DIRECT_EDIT", &mut self.feature_direct_edit);
		if let Ok(path) = std::env::var("NXTRANSFER_DATABASE") {
			self.database = PathBuf::from(path);
		}
		if let Ok(path) = std::env::var("NXTRANSFER_DIRECT_EDIT_FOLDER") {
			self.direct_edit_folder = PathBuf::from(path);
		}
	}

	/// Reject values the pipelines cannot work with
	pub fn validate(&self) -> Result<(), TransferError> {
		if !(1..=20).contains(&self.chunk_size) {
			return Err(TransferError::InvalidOption {
				message: format!("chunkSize must be between 1 and 20 MiB, got {}", self.chunk_size),
			});
		}
		if self.file_buffer_size == 0 {
			return Err(TransferError::InvalidOption {
				message: "fileBufferSize must not be 0".to_string(),
			});
		}
		if self.max_errors == 0 {
			return Err(TransferError::InvalidOption {
				message: "maxErrors must be at least 1".to_string(),
			});
		}
		Ok(())
	}

	pub fn chunk_size_bytes(&self) -> u64 {
		self.chunk_size * MIB
	}

	pub fn chunk_limit_bytes(&self) -> u64 {
		self.chunk_limit * MIB
	}

	pub fn tmp_file_limit_bytes(&self) -> u64 {
		self.tmp_file_limit * MIB
	}

	pub fn tx_timeout(&self) -> Duration {
		Duration::from_secs(self.tx_timeout_secs)
	}

	pub fn timeout(&self) -> Duration {
		Duration::from_secs(self.timeout_secs)
	}

	pub fn blocklist_delay(&self) -> Duration {
		Duration::from_secs(self.blocklist_delay_secs)
	}

	pub fn batch_ping_interval(&self) -> Duration {
		Duration::from_secs(self.batch_ping_interval_secs)
	}
}

fn env_override<T: FromStr>(name: &str, slot: &mut T) {
	if let Ok(raw) = std::env::var(name) {
		match raw.parse::<T>() {
			Ok(value) => *slot = value,
			Err(_) => warn!("Ignoring invalid value {:?} for {}", raw, name),
		}
	}
}


// vim: ts=4
