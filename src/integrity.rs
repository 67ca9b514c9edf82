//! Streaming digest verification
//!
//! A small registry maps algorithm names and well-known hex digest lengths
//! to hash functions. Files are hashed in fixed-size buffers so large
//! downloads can report progress and be interrupted between reads.

use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncReadExt;

use crate::action::{Action, ActionKind, ActionRegistry, ProgressSink};
use crate::constants::UNACCESSIBLE_HASH;
use crate::error::TransferError;
use crate::logging::*;

/// Supported digest algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
	Md5,
	Sha1,
	Sha256,
	Sha512,
	Blake3,
}

impl DigestAlgorithm {
	/// Look an algorithm up by name (`MD5`, `sha-256`, `blake3`...)
	pub fn from_name(name: &str) -> Option<Self> {
		match name.to_ascii_lowercase().replace('-', "").as_str() {
			"md5" => Some(DigestAlgorithm::Md5),
			"sha1" => Some(DigestAlgorithm::Sha1),
			"sha256" => Some(DigestAlgorithm::Sha256),
			"sha512" => Some(DigestAlgorithm::Sha512),
			"blake3" => Some(DigestAlgorithm::Blake3),
			_ => None,
		}
	}

	/// Guess the algorithm from the length of a hex digest
	///
	/// 64 hex chars is ambiguous; it resolves to SHA-256 which is what
	/// remotes send.
	pub fn from_digest(digest: &str) -> Option<Self> {
		if !digest.chars().all(|c| c.is_ascii_hexdigit()) {
			return None;
		}
		match digest.len() {
			32 => Some(DigestAlgorithm::Md5),
			40 => Some(DigestAlgorithm::Sha1),
			64 => Some(DigestAlgorithm::Sha256),
			128 => Some(DigestAlgorithm::Sha512),
			_ => None,
		}
	}

	/// Resolve by explicit name first, then by digest length
	pub fn resolve(name: Option<&str>, digest: &str) -> Option<Self> {
		name.and_then(Self::from_name).or_else(|| Self::from_digest(digest))
	}

	pub fn name(&self) -> &'static str {
		match self {
			DigestAlgorithm::Md5 => "md5",
			DigestAlgorithm::Sha1 => "sha1",
			DigestAlgorithm::Sha256 => "sha256",
			DigestAlgorithm::Sha512 => "sha512",
			DigestAlgorithm::Blake3 => "blake3",
		}
	}

	pub fn hasher(&self) -> Hasher {
		match self {
			DigestAlgorithm::Md5 => Hasher::Md5(Md5::new()),
			DigestAlgorithm::Sha1 => Hasher::Sha1(Sha1::new()),
			DigestAlgorithm::Sha256 => Hasher::Sha256(Sha256::new()),
			DigestAlgorithm::Sha512 => Hasher::Sha512(Sha512::new()),
			DigestAlgorithm::Blake3 => Hasher::Blake3(Box::new(blake3::Hasher::new())),
		}
	}
}

/// Incremental hasher for any registered algorithm
pub enum Hasher {
	Md5(Md5),
	Sha1(Sha1),
	Sha256(Sha256),
	Sha512(Sha512),
	Blake3(Box<blake3::Hasher>),
}

impl Hasher {
	pub fn update(&mut self, data: &[u8]) {
		match self {
			Hasher::Md5(h) => h.update(data),
			Hasher::Sha1(h) => h.update(data),
			Hasher::Sha256(h) => h.update(data),
			Hasher::Sha512(h) => h.update(data),
			Hasher::Blake3(h) => {
				h.update(data);
			}
		}
	}

	pub fn finalize_hex(self) -> String {
		match self {
			Hasher::Md5(h) => hex::encode(h.finalize()),
			Hasher::Sha1(h) => hex::encode(h.finalize()),
			Hasher::Sha256(h) => hex::encode(h.finalize()),
			Hasher::Sha512(h) => hex::encode(h.finalize()),
			Hasher::Blake3(h) => h.finalize().to_hex().to_string(),
		}
	}
}

/// Classification of a remote digest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestStatus {
	Ok,
	/// Blob lives outside the binary store; not syncable
	NotInBinaryStore,
	RemoteHashEmpty,
	/// Digest still being computed server-side
	RemoteHashAsync,
	/// Unknown algorithm
	RemoteHashExotic,
}

pub fn digest_status(digest: &str) -> DigestStatus {
	if digest.is_empty() {
		DigestStatus::RemoteHashEmpty
	} else if digest == UNACCESSIBLE_HASH {
		DigestStatus::NotInBinaryStore
	} else if digest.contains('-') {
		DigestStatus::RemoteHashAsync
	} else if DigestAlgorithm::from_digest(digest).is_some() {
		DigestStatus::Ok
	} else {
		DigestStatus::RemoteHashExotic
	}
}

/// Hash a whole file, calling `on_read` with the size of every buffer read
pub async fn compute_digest(
	path: &Path,
	algorithm: DigestAlgorithm,
	buffer_size: usize,
	mut on_read: impl FnMut(u64) -> Result<(), TransferError>,
) -> Result<String, TransferError> {
	let mut file = tokio::fs::File::open(path).await?;
	let mut hasher = algorithm.hasher();
	let mut buffer = vec![0u8; buffer_size.max(1)];
	loop {
		let n = file.read(&mut buffer).await?;
		if n == 0 {
			break;
		}
		hasher.update(&buffer[..n]);
		on_read(n as u64)?;
	}
	Ok(hasher.finalize_hex())
}

/// Verifies downloaded files against their expected digest
pub struct IntegrityChecker {
	actions: Arc<ActionRegistry>,
	buffer_size: usize,
	disabled: bool,
}

impl IntegrityChecker {
	pub fn new(actions: Arc<ActionRegistry>, buffer_size: usize, disabled: bool) -> Self {
		IntegrityChecker { actions, buffer_size, disabled }
	}

	fn algorithm(&self, path: &Path, digest: &str, name: Option<&str>) -> Option<DigestAlgorithm> {
		if self.disabled {
			debug!("Integrity check disabled, skipping {}", path.display());
			return None;
		}
		let algorithm = DigestAlgorithm::resolve(name, digest);
		if algorithm.is_none() {
			warn!(
				"Unknown digest algorithm for {} (digest {:?}, algorithm {:?}), skipping check",
				path.display(),
				digest,
				name
			);
		}
		algorithm
	}

	fn verdict(&self, path: &Path, expected: &str, computed: String) -> Result<(), TransferError> {
		if computed.eq_ignore_ascii_case(expected) {
			return Ok(());
		}
		// A corrupted temporary file must not be resumed
		if let Err(e) = std::fs::remove_file(path) {
			warn!("Cannot remove corrupted file {}: {}", path.display(), e);
		}
		Err(TransferError::CorruptedFile {
			path: path.to_path_buf(),
			expected: expected.to_string(),
			computed,
		})
	}

	/// Stream-hash `path` under a Verification action
	pub async fn check(
		&self,
		path: &Path,
		digest: &str,
		algorithm: Option<&str>,
		callback: Option<&dyn ProgressSink>,
	) -> Result<(), TransferError> {
		let algorithm = match self.algorithm(path, digest, algorithm) {
			Some(algorithm) => algorithm,
			None => return Ok(()),
		};
		let size = tokio::fs::metadata(path).await?.len();
		let action = self.actions.start(Action::file(ActionKind::Verification, path, size));
		let computed = compute_digest(path, algorithm, self.buffer_size, |n| {
			action.add_progress(n as f64);
			match callback {
				Some(sink) => sink.on_progress(&action.snapshot()),
				None => Ok(()),
			}
		})
		.await?;
		action.finish();
		self.verdict(path, digest, computed)
	}

	/// One-shot check without progress reporting, for small files
	pub async fn check_simple(
		&self,
		path: &Path,
		digest: &str,
		algorithm: Option<&str>,
	) -> Result<(), TransferError> {
		let algorithm = match self.algorithm(path, digest, algorithm) {
			Some(algorithm) => algorithm,
			None => return Ok(()),
		};
		let computed = compute_digest(path, algorithm, self.buffer_size, |_| Ok(())).await?;
		self.verdict(path, digest, computed)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicU64, Ordering};
	use tempfile::TempDir;

	const EMPTY_MD5: &str = "d41d8cd98f00b204e9800998ecf8427e";

	fn checker(disabled: bool) -> IntegrityChecker {
		IntegrityChecker::new(Arc::new(ActionRegistry::new()), 4, disabled)
	}

	#[test]
	fn test_registry() {
		assert_eq!(DigestAlgorithm::from_name("SHA-256"), Some(DigestAlgorithm::Sha256));
		assert_eq!(DigestAlgorithm::from_name("whirlpool"), None);
		assert_eq!(DigestAlgorithm::from_digest(EMPTY_MD5), Some(DigestAlgorithm::Md5));
		assert_eq!(DigestAlgorithm::from_digest(&"a".repeat(40)), Some(DigestAlgorithm::Sha1));
		assert_eq!(DigestAlgorithm::from_digest(&"a".repeat(128)), Some(DigestAlgorithm::Sha512));
		assert_eq!(DigestAlgorithm::from_digest("xyz"), None);
		assert_eq!(
			DigestAlgorithm::resolve(Some("blake3"), &"a".repeat(64)),
			Some(DigestAlgorithm::Blake3)
		);
	}

	#[test]
	fn test_digest_status() {
		assert_eq!(digest_status(""), DigestStatus::RemoteHashEmpty);
		assert_eq!(digest_status("notInBinaryStore"), DigestStatus::NotInBinaryStore);
		assert_eq!(digest_status("abc-12"), DigestStatus::RemoteHashAsync);
		assert_eq!(digest_status(EMPTY_MD5), DigestStatus::Ok);
		assert_eq!(digest_status("0123"), DigestStatus::RemoteHashExotic);
	}

	#[tokio::test]
	async fn test_compute_digest_progress_sums_to_size() {
		let dir = TempDir::new().unwrap();
		let path = dir.path().join("f");
		std::fs::write(&path, b"hello world").unwrap();
		let total = AtomicU64::new(0);
		let first = compute_digest(&path, DigestAlgorithm::Md5, 4, |n| {
			total.fetch_add(n, Ordering::SeqCst);
			Ok(())
		})
		.await
		.unwrap();
		assert_eq!(first, "5eb63bbbe01eeed093cb22bb8f5acdc3");
		assert_eq!(total.load(Ordering::SeqCst), 11);
		let second = compute_digest(&path, DigestAlgorithm::Md5, 1024, |_| Ok(())).await.unwrap();
		assert_eq!(first, second);
	}

	#[tokio::test]
	async fn test_check_mismatch_removes_file() {
		let dir = TempDir::new().unwrap();
		let path = dir.path().join("f.part");
		std::fs::write(&path, b"data").unwrap();
		let err = checker(false).check(&path, EMPTY_MD5, None, None).await.unwrap_err();
		match err {
			TransferError::CorruptedFile { expected, computed, .. } => {
				assert_eq!(expected, EMPTY_MD5);
				assert_ne!(computed, EMPTY_MD5);
			}
			other => panic!("unexpected error {:?}", other),
		}
		assert!(!path.exists());
	}

	#[tokio::test]
	async fn test_check_unknown_or_disabled_passes() {
		let dir = TempDir::new().unwrap();
		let path = dir.path().join("f");
		std::fs::write(&path, b"data").unwrap();
		assert!(checker(false).check_simple(&path, "exotic", None).await.is_ok());
		assert!(checker(true).check(&path, EMPTY_MD5, None, None).await.is_ok());
		assert!(path.exists());
	}

	#[tokio::test]
	async fn test_check_callback_can_interrupt() {
		let dir = TempDir::new().unwrap();
		let path = dir.path().join("f");
		std::fs::write(&path, b"0123456789").unwrap();
		let stop = |_: &crate::action::ActionSnapshot| -> Result<(), TransferError> {
			Err(TransferError::ThreadInterrupt)
		};
		let err = checker(false).check(&path, EMPTY_MD5, None, Some(&stop)).await.unwrap_err();
		assert!(matches!(err, TransferError::ThreadInterrupt));
		assert!(path.exists());
	}
}

// vim: ts=4
