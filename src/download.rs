//! Download pipeline
//!
//! Bytes are streamed into a temporary file next to the destination. A
//! temporary file left by an interrupted attempt is resumed with a ranged
//! GET. Once complete, the temporary file is verified against the expected
//! digest, the Download row is marked Done and the caller publishes the file
//! with [`Downloader::publish`].

use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

use crate::action::{Action, ActionGuard, ActionKind, ActionRegistry, ProgressSink};
use crate::config::Options;
use crate::error::TransferError;
use crate::integrity::IntegrityChecker;
use crate::logging::*;
use crate::remote::RemoteRepository;
use crate::store::TransferStore;
use crate::types::{Download, Nature, TransferStatus};
use crate::utils::{safe_rename, PathLock};

/// One file to fetch
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadRequest {
	pub url: String,
	/// Final location of the file
	pub file_path: PathBuf,
	/// Temporary file the bytes are streamed into
	pub file_out: PathBuf,
	pub digest: String,
	pub digest_algorithm: Option<String>,
	pub doc_pair: Option<u64>,
	pub engine_uid: Option<String>,
	pub is_direct_edit: bool,
}

impl DownloadRequest {
	pub fn new(url: &str, file_path: &Path, file_out: &Path, digest: &str) -> Self {
		DownloadRequest {
			url: url.to_string(),
			file_path: file_path.to_path_buf(),
			file_out: file_out.to_path_buf(),
			digest: digest.to_string(),
			digest_algorithm: None,
			doc_pair: None,
			engine_uid: None,
			is_direct_edit: false,
		}
	}

	pub fn algorithm(mut self, algorithm: &str) -> Self {
		self.digest_algorithm = Some(algorithm.to_string());
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
}

pub struct Downloader {
	remote: Arc<dyn RemoteRepository>,
	store: Arc<TransferStore>,
	actions: Arc<ActionRegistry>,
	options: Arc<Options>,
	integrity: IntegrityChecker,
}

impl Downloader {
	pub fn new(
		remote: Arc<dyn RemoteRepository>,
		store: Arc<TransferStore>,
		actions: Arc<ActionRegistry>,
		options: Arc<Options>,
	) -> Self {
		let integrity = IntegrityChecker::new(
			Arc::clone(&actions),
			options.file_buffer_size,
			options.disabled_file_integrity_check,
		);
		Downloader { remote, store, actions, options, integrity }
	}

	/// Fail when the row left the Ongoing/Done states
	fn gate(&self, uid: u64) -> Result<(), TransferError> {
		match self.store.get_download_by_uid(uid)? {
			Some(row) if row.status.is_active() => Ok(()),
			_ => Err(TransferError::DownloadPaused(uid)),
		}
	}

	fn register(&self, req: &DownloadRequest, size: u64) -> Result<Download, TransferError> {
		if let Some(existing) = self.store.get_download(&req.file_path)? {
			debug!("Resuming download {:?} of {}", existing.uid, req.file_path.display());
			return Ok(existing);
		}
		let mut download = Download::new(&req.file_path, &req.url, &req.file_out, size);
		download.engine = req.engine_uid.clone();
		download.is_direct_edit = req.is_direct_edit;
		download.doc_pair = req.doc_pair;
		self.store.save_download(&mut download)?;
		Ok(download)
	}

	/// Fetch `req.url` into `req.file_out` and verify it; returns the temporary path
	pub async fn download(
		&self,
		req: &DownloadRequest,
		callback: Option<&dyn ProgressSink>,
	) -> Result<PathBuf, TransferError> {
		if let Some(parent) = req.file_out.parent() {
			tokio::fs::create_dir_all(parent).await?;
		}
		let _lock = PathLock::acquire(&req.file_out).await?;
		// Read under the lock: a concurrent writer may have just finished
		let mut offset = match tokio::fs::metadata(&req.file_out).await {
			Ok(meta) => meta.len(),
			Err(_) => 0,
		};

		let response = self.remote.download(&req.url, offset).await?;
		if offset > 0 && !response.is_partial() {
			warn!("Range ignored for {}, downloading from scratch", req.url);
			offset = 0;
		}
		let total = response.content_length.map(|len| offset + len);
		let chunked = response
			.content_length
			.map_or(true, |len| len > self.options.tmp_file_limit_bytes());
		debug!(
			"Downloading {} into {} from offset {} (size {:?}, chunked: {})",
			req.url,
			req.file_out.display(),
			offset,
			total,
			chunked
		);

		let mut download = self.register(req, total.unwrap_or(offset))?;
		let uid = download.uid.unwrap_or_default();
		self.gate(uid)?;

		let mut file =
			tokio::fs::OpenOptions::new().write(true).create(true).open(&req.file_out).await?;
		file.set_len(offset).await?;
		file.seek(std::io::SeekFrom::Start(offset)).await?;
		let mut written = offset;
		let mut body = response.body;

		let action = self.actions.start(Action::file(
			ActionKind::Download,
			&req.file_path,
			total.unwrap_or(0),
		));
		action.update(|a| {
			if total.is_none() {
				a.size = -1;
			}
			a.chunk_size = self.options.file_buffer_size as u64;
			a.set_progress(offset as f64);
		});

		if chunked {
			let buffer_size = self.options.file_buffer_size as u64;
			let mut pending = 0u64;
			action.update(Action::chunk_started);
			while let Some(data) = body.next().await {
				let data = data?;
				let data = cap(&data, written, total);
				if data.is_empty() {
					continue;
				}
				file.write_all(data).await?;
				written += data.len() as u64;
				pending += data.len() as u64;
				if pending < buffer_size {
					continue;
				}
				pending = 0;
				self.checkpoint(&action, &mut download, written, total, callback)?;
				action.update(Action::chunk_started);
			}
			if pending > 0 {
				self.checkpoint(&action, &mut download, written, total, callback)?;
			}
		} else {
			let mut content = Vec::new();
			while let Some(data) = body.next().await {
				let data = data?;
				content.extend_from_slice(cap(&data, written + content.len() as u64, total));
			}
			file.write_all(&content).await?;
			written += content.len() as u64;
			action.set_progress(written as f64);
		}
		file.flush().await?;
		drop(file);

		// The Verification action takes over the worker slot
		action.finish();

		let algorithm = req.digest_algorithm.as_deref();
		if chunked {
			self.integrity.check(&req.file_out, &req.digest, algorithm, callback).await?;
		} else {
			self.integrity.check_simple(&req.file_out, &req.digest, algorithm).await?;
		}

		download.status = TransferStatus::Done;
		self.store.set_transfer_status(&download);
		info!("Downloaded {} ({} bytes)", req.file_path.display(), written);
		Ok(req.file_out.clone())
	}

	fn checkpoint(
		&self,
		action: &ActionGuard<'_>,
		download: &mut Download,
		written: u64,
		total: Option<u64>,
		callback: Option<&dyn ProgressSink>,
	) -> Result<(), TransferError> {
		action.update(|a| {
			a.chunk_done();
			a.set_progress(written as f64);
		});
		download.progress = match total {
			Some(total) if total > 0 => written as f64 * 100.0 / total as f64,
			_ => action.percent(),
		};
		self.store.set_transfer_progress(&*download);
		self.gate(download.uid.unwrap_or_default())?;
		if let Some(sink) = callback {
			sink.on_progress(&action.snapshot())?;
		}
		Ok(())
	}

	/// Move the verified temporary file into place and forget the row
	pub fn publish(&self, req: &DownloadRequest) -> Result<(), TransferError> {
		safe_rename(&req.file_out, &req.file_path)?;
		self.store.remove_transfer(Nature::Download, None, Some(&req.file_path), false);
		Ok(())
	}
}

/// Part of `data` that fits before the advertised size
fn cap(data: &[u8], written: u64, total: Option<u64>) -> &[u8] {
	match total {
		Some(total) => {
			let room = total.saturating_sub(written) as usize;
			if data.len() > room {
				warn!("Remote sent more than the advertised {} bytes, truncating", total);
			}
			&data[..data.len().min(room)]
		}
		None => data,
	}
}


// vim: ts=4
