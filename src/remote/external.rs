//! Object-store provider
//!
//! Batches opened on the external handler receive their bytes directly in an
//! object store through multipart uploads. The repository hands out
//! short-lived credentials in the batch's `extraInfo`; the uploader refreshes
//! them when they are about to expire and reports the new descriptor through
//! the token callback so it can be persisted.
//!
//! Provider state kept in the batch descriptor:
//! - `key`: object key of the blob
//! - `multiPartUploadId`: id of the multipart upload in progress
//! - `etag`: set once the object is complete

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::error::RemoteError;
use crate::logging::*;
use crate::remote::{BlobUploader, FileBlob, RemoteResult, TokenCallback};
use crate::types::Batch;

const KEY_FIELD: &str = "key";
const UPLOAD_ID_FIELD: &str = "multiPartUploadId";

/// Credentials are refreshed when they expire within this margin
const EXPIRATION_MARGIN_MS: i64 = 60_000;

/// Wire client of the object store, injected by the application
#[async_trait]
pub trait ObjectStore: Send + Sync {
	/// Start a multipart upload; returns its id
	async fn create_multipart(&self, batch: &Batch, key: &str) -> RemoteResult<String>;

	/// Parts already received: (part number, etag)
	async fn list_parts(
		&self,
		batch: &Batch,
		key: &str,
		upload_id: &str,
	) -> RemoteResult<Vec<(u64, String)>>;

	/// Send one part (numbered from 1); returns its etag
	async fn upload_part(
		&self,
		batch: &Batch,
		key: &str,
		upload_id: &str,
		part: u64,
		data: Vec<u8>,
	) -> RemoteResult<String>;

	/// Assemble the parts; returns the object etag
	async fn complete_multipart(
		&self,
		batch: &Batch,
		key: &str,
		upload_id: &str,
		parts: &[(u64, String)],
	) -> RemoteResult<String>;

	/// Single-shot upload; returns the object etag
	async fn put_object(&self, batch: &Batch, key: &str, data: Vec<u8>) -> RemoteResult<String>;

	/// Ask the repository for fresh credentials; `None` when unchanged
	async fn refresh_credentials(&self, batch: &Batch) -> RemoteResult<Option<Batch>>;

	/// Credentials of `batch` are expired or about to be
	fn credentials_expired(&self, batch: &Batch) -> bool {
		match batch.extra_info.get("expiration").and_then(Value::as_i64) {
			Some(expiration) => Utc::now().timestamp_millis() + EXPIRATION_MARGIN_MS >= expiration,
			None => false,
		}
	}
}

/// Multipart uploader over an [`ObjectStore`]
pub struct ExternalUploader {
	store: Arc<dyn ObjectStore>,
	batch: Batch,
	blob: FileBlob,
	chunked: bool,
	chunk_size: u64,
	chunk_count: u64,
	key: String,
	parts: BTreeMap<u64, String>,
	token_callback: TokenCallback,
}

impl ExternalUploader {
	pub fn new(
		store: Arc<dyn ObjectStore>,
		batch: Batch,
		blob: FileBlob,
		chunked: bool,
		chunk_size: u64,
		token_callback: TokenCallback,
	) -> Self {
		let chunk_size = if chunked { chunk_size.max(1) } else { 0 };
		let chunk_count = if chunked { blob.size.div_ceil(chunk_size).max(1) } else { 1 };
		let key = match batch.extra.get(KEY_FIELD).and_then(Value::as_str) {
			Some(key) => key.to_string(),
			None => {
				let base = batch.extra_info.get("baseKey").and_then(Value::as_str).unwrap_or("");
				format!("{}{}/{}", base, batch.batch_id, blob.name)
			}
		};
		ExternalUploader {
			store,
			batch,
			blob,
			chunked,
			chunk_size,
			chunk_count,
			key,
			parts: BTreeMap::new(),
			token_callback,
		}
	}

	fn upload_id(&self) -> Option<String> {
		self.batch.extra.get(UPLOAD_ID_FIELD).and_then(Value::as_str).map(str::to_string)
	}

	/// Resume the multipart upload recorded in the batch, or start one
	pub async fn prepare(&mut self) -> RemoteResult<()> {
		self.batch.extra.insert(KEY_FIELD.to_string(), json!(self.key));
		if !self.chunked || self.batch.etag.is_some() {
			return Ok(());
		}
		self.refresh_if_needed().await?;
		if let Some(upload_id) = self.upload_id() {
			match self.store.list_parts(&self.batch, &self.key, &upload_id).await {
				Ok(parts) => {
					debug!("Resuming multipart upload {} with {} part(s)", upload_id, parts.len());
					self.parts = parts.into_iter().collect();
					return Ok(());
				}
				Err(RemoteError::NoSuchUpload { .. }) => {
					warn!("Multipart upload {} vanished, starting a new one", upload_id);
				}
				Err(e) => return Err(e),
			}
		}
		let upload_id = self.store.create_multipart(&self.batch, &self.key).await?;
		debug!("Started multipart upload {} for {}", upload_id, self.key);
		self.batch.extra.insert(UPLOAD_ID_FIELD.to_string(), json!(upload_id));
		self.parts.clear();
		(self.token_callback)(&self.batch);
		Ok(())
	}

	async fn refresh_if_needed(&mut self) -> RemoteResult<()> {
		if !self.store.credentials_expired(&self.batch) {
			return Ok(());
		}
		if let Some(fresh) = self.store.refresh_credentials(&self.batch).await? {
			info!("Refreshed object store credentials of batch {}", self.batch.batch_id);
			self.batch.extra_info = fresh.extra_info;
			(self.token_callback)(&self.batch);
		}
		Ok(())
	}

	async fn read(&self, offset: u64, len: u64) -> RemoteResult<Vec<u8>> {
		let io_error = |e: std::io::Error| RemoteError::Connection { message: e.to_string() };
		let mut file = tokio::fs::File::open(&self.blob.path).await.map_err(io_error)?;
		file.seek(std::io::SeekFrom::Start(offset)).await.map_err(io_error)?;
		let mut data = Vec::new();
		file.take(len).read_to_end(&mut data).await.map_err(io_error)?;
		Ok(data)
	}

	fn finish(&mut self, etag: String) {
		self.batch.etag = Some(etag.clone());
		self.batch.blobs.push(json!({
			"name": self.blob.name,
			"size": self.blob.size,
			"fileIdx": self.batch.upload_idx,
			"etag": etag,
		}));
	}
}

#[async_trait]
impl BlobUploader for ExternalUploader {
	fn chunked(&self) -> bool {
		self.chunked
	}

	fn chunk_size(&self) -> u64 {
		self.chunk_size
	}

	fn chunk_count(&self) -> u64 {
		self.chunk_count
	}

	fn uploaded_chunk_ids(&self) -> Vec<u64> {
		self.parts.keys().copied().collect()
	}

	async fn upload_next_chunk(&mut self) -> RemoteResult<Option<u64>> {
		if !self.chunked {
			return Ok(None);
		}
		let part = match (1..=self.chunk_count).find(|p| !self.parts.contains_key(p)) {
			Some(part) => part,
			None => return Ok(None),
		};
		let upload_id = self
			.upload_id()
			.ok_or_else(|| RemoteError::MissingField { field: UPLOAD_ID_FIELD.to_string() })?;
		self.refresh_if_needed().await?;
		let data = self.read((part - 1) * self.chunk_size, self.chunk_size).await?;
		let etag = self.store.upload_part(&self.batch, &self.key, &upload_id, part, data).await?;
		self.parts.insert(part, etag);
		Ok(Some(part))
	}

	async fn upload(&mut self) -> RemoteResult<()> {
		if self.chunked {
			while self.upload_next_chunk().await?.is_some() {}
			let upload_id = self
				.upload_id()
				.ok_or_else(|| RemoteError::MissingField { field: UPLOAD_ID_FIELD.to_string() })?;
			let parts: Vec<(u64, String)> =
				self.parts.iter().map(|(n, e)| (*n, e.clone())).collect();
			let etag =
				self.store.complete_multipart(&self.batch, &self.key, &upload_id, &parts).await?;
			self.finish(etag);
		} else {
			self.refresh_if_needed().await?;
			let data = self.read(0, self.blob.size).await?;
			let etag = self.store.put_object(&self.batch, &self.key, data).await?;
			self.finish(etag);
		}
		Ok(())
	}

	fn batch(&self) -> &Batch {
		&self.batch
	}
}


// vim: ts=4
