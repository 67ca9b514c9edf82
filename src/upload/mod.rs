//! Upload pipeline
//!
//! An upload runs in two steps:
//! 1. the blob is sent into a server-side batch, by chunks or in one go,
//!    through the uploader of the batch's provider;
//! 2. the blob is linked to a document by an Automation command.
//!
//! The Upload row makes both steps resumable. A failure during step 1
//! resumes from the next unacknowledged chunk as long as the batch is still
//! alive; a failure during step 2 redoes the completion and the link.
//!
//! Between chunks the row is re-read: a user pause or cancel surfaces as
//! [`TransferError::UploadPaused`] / [`TransferError::UploadCancelled`].

pub mod options;

pub use options::UploadOptions;

use serde_json::{json, Value};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use uuid::Uuid;

use crate::action::{Action, ActionGuard, ActionKind, ActionRegistry, ProgressSink};
use crate::config::Options;
use crate::constants::{
	BATCH_NO_DROP_HEADER, IDEMPOTENCY_KEY_HEADER, IDEMPOTENT_COMMANDS, S3_HANDLER, TX_TIMEOUT_HEADER,
};
use crate::error::{RemoteError, TransferError};
use crate::logging::*;
use crate::remote::{
	BlobUploader, FileBlob, Headers, Operation, OperationInput, RemoteRepository, TokenCallback,
};
use crate::store::{TransferStore, UploadLookup};
use crate::types::{Batch, DuplicateBehavior, Nature, TransferStatus, Upload};

/// Outcome of step 1
#[derive(Debug, Clone)]
pub struct UploadedBlob {
	/// Blob carrying the batch identifiers needed to link it
	pub blob: FileBlob,
	pub transfer: Upload,
	pub chunked: bool,
}

/// Descriptor refreshed by the provider while chunks are in flight
type RefreshCell = Arc<Mutex<Option<Batch>>>;

/// Step 1 and step 2, shared by every upload flavour
pub struct BaseUploader {
	remote: Arc<dyn RemoteRepository>,
	store: Arc<TransferStore>,
	actions: Arc<ActionRegistry>,
	options: Arc<Options>,
}

impl BaseUploader {
	pub fn new(
		remote: Arc<dyn RemoteRepository>,
		store: Arc<TransferStore>,
		actions: Arc<ActionRegistry>,
		options: Arc<Options>,
	) -> Self {
		BaseUploader { remote, store, actions, options }
	}

	pub fn remote(&self) -> &Arc<dyn RemoteRepository> {
		&self.remote
	}

	pub fn store(&self) -> &Arc<TransferStore> {
		&self.store
	}

	/// Row of a previous attempt for this file
	pub fn get_upload(&self, path: &Path, opts: &UploadOptions) -> Result<Option<Upload>, TransferError> {
		let lookup = match opts.doc_pair {
			Some(id) if opts.is_direct_transfer => UploadLookup::DocPair(id),
			_ => UploadLookup::Path(path),
		};
		let upload = if opts.is_direct_transfer {
			self.store.get_dt_upload(lookup)?
		} else {
			self.store.get_upload(lookup)?
		};
		Ok(upload)
	}

	/// Fail when the row left the Ongoing/Done states
	fn gate(&self, transfer: &mut Upload) -> Result<(), TransferError> {
		let uid = match transfer.uid {
			Some(uid) => uid,
			None => return Ok(()),
		};
		let current = if transfer.is_direct_transfer {
			self.store.get_dt_upload(UploadLookup::Uid(uid))?
		} else {
			self.store.get_upload(UploadLookup::Uid(uid))?
		};
		let status = match current {
			Some(row) => row.status,
			None => return Err(TransferError::UploadCancelled(uid)),
		};
		transfer.status = status;
		match status {
			TransferStatus::Cancelled => Err(TransferError::UploadCancelled(uid)),
			s if !s.is_active() => Err(TransferError::UploadPaused(uid)),
			_ => Ok(()),
		}
	}

	/// Move a descriptor refreshed by the provider onto the row
	fn absorb_refresh(cell: &RefreshCell, transfer: &mut Upload) {
		let refreshed = cell.lock().unwrap_or_else(|e| e.into_inner()).take();
		if let Some(batch) = refreshed {
			transfer.batch = batch;
			transfer.dirty = true;
		}
	}

	fn persist_dirty(&self, transfer: &mut Upload) {
		if transfer.dirty {
			debug!("Saving refreshed batch of upload {:?}", transfer.uid);
			self.store.update_upload(transfer);
			transfer.dirty = false;
		}
	}

	/// Step 1: send the blob into a batch
	pub async fn upload_chunks(
		&self,
		path: &Path,
		opts: &UploadOptions,
		callback: Option<&dyn ProgressSink>,
	) -> Result<UploadedBlob, TransferError> {
		let mut blob =
			FileBlob::from_path(path, opts.filename.as_deref(), opts.mime_type.as_deref())?;
		let action = self.actions.start(Action::file(ActionKind::Upload, path, blob.size));
		action.update(|a| a.is_direct_transfer = opts.is_direct_transfer);

		let mut transfer = self.get_upload(path, opts)?;
		let result = self.send_blob(path, opts, &mut blob, &action, &mut transfer, callback).await;

		// Runs on every exit path
		let percent = action.percent();
		if percent < 100.0 && !action.uploaded() {
			debug!("Upload progression stopped at {:.2}%", percent);
			if let Some(transfer) = transfer.as_mut() {
				transfer.progress = percent;
				self.store.set_transfer_progress(&*transfer);
			}
		}
		action.finish();

		let chunked = result?;
		let transfer = transfer.ok_or_else(|| TransferError::Other {
			message: format!("Upload row of {} vanished", path.display()),
		})?;
		Ok(UploadedBlob { blob, transfer, chunked })
	}

	async fn send_blob(
		&self,
		path: &Path,
		opts: &UploadOptions,
		blob: &mut FileBlob,
		action: &ActionGuard<'_>,
		slot: &mut Option<Upload>,
		callback: Option<&dyn ProgressSink>,
	) -> Result<bool, TransferError> {
		let mut resumed: Option<(Batch, u64)> = None;

		if let Some(existing) = slot.as_ref() {
			debug!("Retrieved transfer for {}: upload {:?}", path.display(), existing.uid);
			if !existing.status.is_active() {
				return Err(TransferError::UploadPaused(existing.uid.unwrap_or_default()));
			}
			// External batches hold no blob at the index until completed
			let file_idx =
				if existing.batch.is_external() { None } else { Some(existing.batch.upload_idx) };
			match self.remote.batch_get(&existing.batch.batch_id, file_idx).await {
				Ok(_) => {
					debug!("Associated batch found, resuming the upload");
					resumed = Some((existing.batch.clone(), existing.chunk_size));
				}
				Err(e) if e.is_not_found() => {
					debug!("No associated batch found, restarting from zero");
				}
				Err(e) => return Err(e.into()),
			}
		}

		let (batch, chunk_size) = match resumed {
			Some((batch, chunk_size)) => (batch, chunk_size),
			None => {
				let handler = if self.options.feature_s3 && self.remote.has_external_provider().await {
					Some(S3_HANDLER)
				} else {
					None
				};
				(self.remote.batch_create(handler).await?, 0)
			}
		};
		let chunk_size = if chunk_size > 0 { chunk_size } else { self.options.chunk_size_bytes() };
		let chunked = self.options.chunk_upload && blob.size > self.options.chunk_limit_bytes();
		let external = batch.is_external();

		blob.batch_id = Some(batch.batch_id.clone());
		blob.file_idx = Some(batch.upload_idx);

		let refreshed: RefreshCell = Arc::new(Mutex::new(None));
		let cell = Arc::clone(&refreshed);
		let token_callback: TokenCallback = Arc::new(move |batch: &Batch| {
			*cell.lock().unwrap_or_else(|e| e.into_inner()) = Some(batch.clone());
		});
		let mut uploader = self
			.remote
			.uploader(batch.clone(), blob.clone(), chunked, chunk_size, token_callback)
			.await?;
		debug!(
			"Using {} uploader for batch {} (chunked: {})",
			if external { "external" } else { "default" },
			batch.batch_id,
			uploader.chunked()
		);

		let transfer = match slot.take() {
			None => {
				// Obsolete row of the same file, e.g. one with unusable provider metadata
				self.store.remove_transfer(
					Nature::Upload,
					opts.doc_pair,
					Some(path),
					opts.is_direct_transfer,
				);
				let mut upload = Upload::new(path, uploader.batch().clone(), blob.size, chunk_size);
				upload.engine = opts.engine_uid.clone();
				upload.is_direct_edit = opts.is_direct_edit;
				upload.doc_pair = opts.doc_pair;
				upload.remote_parent_path = opts.remote_parent_path.clone();
				upload.remote_parent_ref = opts.remote_parent_ref.clone();
				if self.options.feature_idempotency
					&& IDEMPOTENT_COMMANDS.contains(&opts.command.as_str())
				{
					upload.request_uid = Some(Uuid::new_v4().to_string());
				}
				if opts.is_direct_transfer {
					self.store.save_dt_upload(&mut upload)?;
				} else {
					self.store.save_upload(&mut upload)?;
				}
				// The descriptor is saved already
				refreshed.lock().unwrap_or_else(|e| e.into_inner()).take();
				upload
			}
			Some(mut existing) => {
				if existing.batch.batch_id != batch.batch_id {
					// The previous batch expired: link against the new one
					existing.batch = uploader.batch().clone();
					self.store.update_upload(&existing);
					if existing.status == TransferStatus::Done {
						// Nothing was completed on the new batch yet
						existing.status = TransferStatus::Ongoing;
						self.store.set_transfer_status(&existing);
					}
				}
				existing
			}
		};
		let transfer = slot.insert(transfer);
		Self::absorb_refresh(&refreshed, transfer);
		self.persist_dirty(transfer);
		self.gate(transfer)?;

		// A previous attempt finished the object but crashed before telling the server
		let already_completed = external && uploader.batch().etag.is_some();
		let mut multipart_gone = false;

		if uploader.chunked() {
			let done = chunk_size * uploader.uploaded_chunk_ids().len() as u64;
			action.update(|a| {
				a.chunk_size = chunk_size;
				a.set_progress(done as f64);
			});
			let mut last_ping = Instant::now();

			while !already_completed {
				action.update(Action::chunk_started);
				match uploader.upload_next_chunk().await {
					Ok(Some(index)) => debug!("Sent chunk {} of {}", index, path.display()),
					Ok(None) => break,
					Err(RemoteError::NoSuchUpload { upload_id }) => {
						// Completion will fail cleanly and force a restart
						warn!("Multipart upload {} is gone, completing anyway", upload_id);
						multipart_gone = true;
						break;
					}
					Err(e) => return Err(e.into()),
				}
				action.update(|a| {
					a.chunk_done();
					a.add_progress(chunk_size as f64);
				});

				transfer.progress = action.percent();
				self.store.set_transfer_progress(&*transfer);
				Self::absorb_refresh(&refreshed, transfer);
				self.persist_dirty(transfer);

				if external && last_ping.elapsed() >= self.options.batch_ping_interval() {
					debug!("Keeping batch {} alive", transfer.batch.batch_id);
					if let Err(e) = self.remote.batch_get(&transfer.batch.batch_id, None).await {
						warn!("Cannot ping batch {}: {}", transfer.batch.batch_id, e);
					}
					last_ping = Instant::now();
				}

				if let Some(sink) = callback {
					sink.on_progress(&action.snapshot())?;
				}
				self.gate(transfer)?;
			}
		} else {
			if !already_completed {
				uploader.upload().await?;
			}
			// Flips `uploaded` for empty files too
			action.add_progress(blob.size as f64);
			transfer.progress = action.percent();
		}

		if external && !already_completed && !multipart_gone && uploader.batch().blobs.is_empty() {
			// Resuming with every part sent: close the multipart upload
			uploader.upload().await?;
		}

		Self::absorb_refresh(&refreshed, transfer);
		transfer.batch = uploader.batch().clone();
		self.store.update_upload(transfer);
		transfer.dirty = false;

		blob.batch_id = Some(transfer.batch.batch_id.clone());
		blob.file_idx = Some(0);
		blob.upload_idx = 1;

		if transfer.status != TransferStatus::Done {
			let mut headers = Headers::new();
			headers.insert(TX_TIMEOUT_HEADER.to_string(), self.options.tx_timeout_secs.to_string());
			self.remote.batch_complete(&transfer.batch, &headers).await?;
			transfer.status = TransferStatus::Done;
			self.store.set_transfer_status(&*transfer);
			self.gate(transfer)?;
		}
		Ok(uploader.chunked())
	}

	/// Step 2: run the linking command with the uploaded blob as input
	pub async fn link_blob_to_doc(
		&self,
		path: &Path,
		opts: &UploadOptions,
		uploaded: &UploadedBlob,
	) -> Result<Value, TransferError> {
		let action = self.actions.start(Action::file(ActionKind::Linking, path, uploaded.blob.size));
		action.update(|a| a.is_direct_transfer = opts.is_direct_transfer);

		let mut operation = Operation::new(&opts.command)
			.input(OperationInput::Blob(uploaded.blob.clone()))
			.timeout(self.options.tx_timeout())
			.header(TX_TIMEOUT_HEADER, self.options.tx_timeout_secs.to_string());
		for (key, value) in &opts.headers {
			operation = operation.header(key, value.clone());
		}
		if let Some(request_uid) = &uploaded.transfer.request_uid {
			operation = operation.header(IDEMPOTENCY_KEY_HEADER, request_uid.clone());
		}
		if uploaded.chunked {
			// Keep the batch for a retry of this very call
			operation = operation.header(BATCH_NO_DROP_HEADER, "true");
		}
		for (key, value) in &opts.params {
			operation = operation.param(key, value.clone());
		}
		for (key, value) in &opts.context {
			operation = operation.context(key, value.clone());
		}
		if let Some(overwrite) = opts.overwrite {
			operation = operation.param("overwrite", overwrite);
		}

		let result = self.remote.execute(operation).await;
		action.finish();

		match result {
			Ok(doc) => {
				if uploaded.chunked {
					let batch_id = &uploaded.transfer.batch.batch_id;
					if let Err(e) = self.remote.batch_delete(batch_id, None).await {
						warn!("Cannot delete batch {}: {}", batch_id, e);
					}
				}
				Ok(doc)
			}
			Err(e) => {
				if e.is_not_found() || e.to_string().contains("status code: 404") {
					// Completion was lost server-side; the next attempt redoes it
					warn!("Linking {} returned 404, the upload will be completed again", path.display());
					let mut transfer = uploaded.transfer.clone();
					transfer.status = TransferStatus::Ongoing;
					self.store.set_transfer_status(&transfer);
				}
				Err(e.into())
			}
		}
	}

	/// Step 1 then step 2
	pub async fn upload_impl(
		&self,
		path: &Path,
		opts: &UploadOptions,
		callback: Option<&dyn ProgressSink>,
	) -> Result<Value, TransferError> {
		opts.validate()?;
		let uploaded = self.upload_chunks(path, opts, callback).await?;
		self.link_blob_to_doc(path, opts, &uploaded).await
	}
}

/// The upload flavours
pub enum Uploader {
	/// Keeps the row once linked
	Base(BaseUploader),
	/// Synchronization and Direct-Edit: the row is removed once linked
	Sync(BaseUploader),
	/// Pushes items of a Direct-Transfer session
	DirectTransfer(BaseUploader),
}

impl Uploader {
	pub fn base(&self) -> &BaseUploader {
		match self {
			Uploader::Base(base) | Uploader::Sync(base) | Uploader::DirectTransfer(base) => base,
		}
	}

	/// Upload `path` and return the linked document
	pub async fn upload(
		&self,
		path: &Path,
		opts: &UploadOptions,
		callback: Option<&dyn ProgressSink>,
	) -> Result<Value, TransferError> {
		match self {
			Uploader::Base(base) => base.upload_impl(path, opts, callback).await,
			Uploader::Sync(base) => {
				let doc = base.upload_impl(path, opts, callback).await?;
				base.store.remove_transfer(Nature::Upload, None, Some(path), false);
				Ok(doc)
			}
			Uploader::DirectTransfer(base) => direct_transfer(base, path, opts, callback).await,
		}
	}
}

async fn direct_transfer(
	base: &BaseUploader,
	path: &Path,
	opts: &UploadOptions,
	callback: Option<&dyn ProgressSink>,
) -> Result<Value, TransferError> {
	let pair_id = opts.doc_pair.ok_or_else(|| TransferError::InvalidOption {
		message: "Direct-Transfer needs a doc_pair".to_string(),
	})?;
	let pair = base.store.get_doc_pair(pair_id)?.ok_or_else(|| TransferError::NotFound {
		message: format!("doc pair {}", pair_id),
	})?;
	info!(
		"Direct Transfer of {} into {} ({})",
		path.display(),
		pair.remote_parent_path,
		pair.remote_parent_ref
	);

	let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
	if pair.duplicate_behavior == DuplicateBehavior::Ignore
		&& base.remote.exists_in_parent(&pair.remote_parent_ref, &name).await?
	{
		debug!("Ignoring the transfer as a document already has the name {:?} on the server", name);
		base.store.remove_transfer(Nature::Upload, Some(pair.id), Some(path), true);
		if let Some(session) = pair.session {
			base.store.update_session(session);
		}
		return Ok(json!({}));
	}

	let item = if pair.folderish {
		let item = base.remote.create_folder(&pair.remote_parent_path, &pair.local_name, &opts.headers).await?;
		let remote_path = item.get("path").and_then(Value::as_str).unwrap_or_default();
		let remote_ref = item.get("uid").and_then(Value::as_str).unwrap_or_default();
		base.store.update_remote_parent_path_dt(path, remote_path, remote_ref);
		base.store.set_doc_pair_remote_ref(pair.id, remote_ref);
		item
	} else {
		let mut import = UploadOptions::new("FileManager.Import")
			.direct_transfer()
			.doc_pair(pair.id)
			.remote_parent(&pair.remote_parent_path, &pair.remote_parent_ref)
			.context("currentDocument", pair.remote_parent_path.clone())
			.overwrite(pair.duplicate_behavior == DuplicateBehavior::Override);
		import.engine_uid = opts.engine_uid.clone();
		import.headers = opts.headers.clone();
		import.filename = opts.filename.clone();
		import.mime_type = opts.mime_type.clone();
		let item = base.upload_impl(path, &import, callback).await?;
		if let Some(uid) = item.get("uid").and_then(Value::as_str) {
			base.store.set_doc_pair_remote_ref(pair.id, uid);
		}
		item
	};

	base.store.remove_transfer(Nature::Upload, Some(pair.id), Some(path), true);
	if let Some(session) = pair.session {
		base.store.update_session(session);
	}
	Ok(item)
}

// vim: ts=4
