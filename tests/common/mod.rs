//! Shared fixtures for the integration tests
//!
//! `MockRemote` keeps batches, documents and downloadable bodies in memory.
//! Failures are queued per method name with [`MockRemote::fail`] and handed
//! out one per call.

#![allow(dead_code)]

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tempfile::TempDir;

use nxtransfer::remote::{
	BlobUploader, DownloadResponse, ExternalUploader, FileBlob, Headers, ObjectStore, Operation,
	OperationInput, RemoteRepository, RemoteResult, TokenCallback,
};
use nxtransfer::{ActionRegistry, Batch, DigestAlgorithm, Options, RemoteError, TransferStore};

// ===================================================================
// HELPERS
// ===================================================================

pub const MIB: u64 = 1024 * 1024;

pub fn md5_hex(data: &[u8]) -> String {
	let mut hasher = DigestAlgorithm::Md5.hasher();
	hasher.update(data);
	hasher.finalize_hex()
}

/// Deterministic, non-repeating-enough content
pub fn content(size: usize) -> Vec<u8> {
	(0..size).map(|i| (i % 251) as u8).collect()
}

pub fn write_file(dir: &Path, name: &str, data: &[u8]) -> std::path::PathBuf {
	let path = dir.join(name);
	std::fs::write(&path, data).unwrap();
	path
}

pub fn http_error(status: u16, message: &str) -> RemoteError {
	RemoteError::Http { status, message: message.to_string() }
}

/// A store and its collaborators inside a temporary directory
pub struct Fixture {
	pub dir: TempDir,
	pub store: Arc<TransferStore>,
	pub actions: Arc<ActionRegistry>,
	pub options: Arc<Options>,
}

impl Fixture {
	pub fn new(options: Options) -> Self {
		nxtransfer::logging::init_tracing();
		let dir = TempDir::new().unwrap();
		let store = Arc::new(TransferStore::open(&dir.path().join("transfers.redb")).unwrap());
		Fixture { dir, store, actions: Arc::new(ActionRegistry::new()), options: Arc::new(options) }
	}

	pub fn path(&self) -> &Path {
		self.dir.path()
	}
}

/// Options with small chunks so tests stay fast
pub fn chunked_options(chunk_mib: u64) -> Options {
	Options { chunk_size: chunk_mib, chunk_limit: 1, ..Options::default() }
}

/// A `File` document whose `file:content` is served at `url`
pub fn file_document(uid: &str, name: &str, data: &[u8], url: &str) -> Value {
	json!({
		"entity-type": "document",
		"uid": uid,
		"path": format!("/default-domain/workspaces/ws/{}", name),
		"type": "File",
		"title": name,
		"facets": ["Versionable", "Commentable"],
		"isVersion": false,
		"isProxy": false,
		"contextParameters": {"permissions": ["Read", "ReadWrite", "Write", "Everything"]},
		"properties": {
			"dc:title": name,
			"file:content": {
				"name": name,
				"digest": md5_hex(data),
				"digestAlgorithm": "MD5",
				"length": data.len().to_string(),
				"mime-type": "application/octet-stream",
				"data": url,
			},
		},
	})
}

// ===================================================================
// REPOSITORY
// ===================================================================

#[derive(Debug, Clone, Default)]
pub struct MockBatch {
	pub provider: Option<String>,
	pub chunks: BTreeMap<u64, Vec<u8>>,
	pub completed: bool,
}

impl MockBatch {
	pub fn data(&self) -> Vec<u8> {
		self.chunks.values().flatten().copied().collect()
	}
}

#[derive(Default)]
pub struct MockState {
	pub batches: BTreeMap<String, MockBatch>,
	pub documents: HashMap<String, Value>,
	pub bodies: HashMap<String, Vec<u8>>,
	pub existing: HashSet<(String, String)>,
	pub locks: HashMap<String, String>,
	pub executed: Vec<Operation>,
	pub folders: Vec<(String, String)>,
	pub unlocks: Vec<(String, Headers)>,
	pub completions: Vec<String>,
	pub deleted_batches: Vec<String>,
	/// Content of each blob handed to a linking command
	pub linked: Vec<Vec<u8>>,
	/// Chunks that reached the server, resends included
	pub chunks_sent: u64,
	/// Range requests are answered with the full body
	pub ignore_ranges: bool,
	/// Batch lookups that named no file, i.e. keep-alive pings
	pub pings: u64,
	failures: HashMap<String, VecDeque<RemoteError>>,
	next_id: u64,
}

impl MockState {
	fn next_id(&mut self) -> u64 {
		self.next_id += 1;
		self.next_id
	}

	fn take_failure(&mut self, method: &str) -> RemoteResult<()> {
		match self.failures.get_mut(method).and_then(VecDeque::pop_front) {
			Some(error) => Err(error),
			None => Ok(()),
		}
	}
}

pub struct MockRemote {
	pub user: String,
	state: Arc<Mutex<MockState>>,
	object_store: Option<Arc<MemoryObjectStore>>,
}

impl MockRemote {
	pub fn new(user: &str) -> Self {
		MockRemote { user: user.to_string(), state: Arc::default(), object_store: None }
	}

	/// Advertise an external provider backed by `store`
	pub fn with_object_store(mut self, store: Arc<MemoryObjectStore>) -> Self {
		self.object_store = Some(store);
		self
	}

	pub fn state(&self) -> MutexGuard<'_, MockState> {
		self.state.lock().unwrap()
	}

	/// Queue `error` for the next call of `method`
	pub fn fail(&self, method: &str, error: RemoteError) {
		self.state().failures.entry(method.to_string()).or_default().push_back(error);
	}

	pub fn add_document(&self, uid: &str, doc: Value) {
		self.state().documents.insert(uid.to_string(), doc);
	}

	pub fn add_body(&self, url: &str, data: &[u8]) {
		self.state().bodies.insert(url.to_string(), data.to_vec());
	}

	pub fn add_existing(&self, parent_ref: &str, name: &str) {
		self.state().existing.insert((parent_ref.to_string(), name.to_string()));
	}

	/// Replace the digest of the main blob, as a concurrent edit would
	pub fn set_remote_digest(&self, uid: &str, digest: &str) {
		let mut state = self.state();
		if let Some(doc) = state.documents.get_mut(uid) {
			doc["properties"]["file:content"]["digest"] = json!(digest);
		}
	}

	pub fn commands(&self) -> Vec<String> {
		self.state().executed.iter().map(|op| op.command.clone()).collect()
	}

	pub fn chunks_sent(&self) -> u64 {
		self.state().chunks_sent
	}

	pub fn batch(&self, batch_id: &str) -> Option<MockBatch> {
		self.state().batches.get(batch_id).cloned()
	}
}

#[async_trait]
impl RemoteRepository for MockRemote {
	fn user_id(&self) -> &str {
		&self.user
	}

	async fn has_external_provider(&self) -> bool {
		self.object_store.is_some()
	}

	async fn batch_create(&self, handler: Option<&str>) -> RemoteResult<Batch> {
		let mut state = self.state();
		state.take_failure("batch_create")?;
		let batch_id = format!("batch-{}", state.next_id());
		state.batches.insert(
			batch_id.clone(),
			MockBatch { provider: handler.map(str::to_string), ..Default::default() },
		);
		let mut batch = Batch::new(&batch_id);
		if let Some(handler) = handler {
			batch.provider = Some(handler.to_string());
			batch.extra_info.insert("bucket".to_string(), json!("nuxeo-bucket"));
			batch.extra_info.insert("baseKey".to_string(), json!("drive/"));
			batch.extra_info.insert("token".to_string(), json!("initial"));
		}
		Ok(batch)
	}

	async fn batch_get(&self, batch_id: &str, file_idx: Option<u64>) -> RemoteResult<Value> {
		let mut state = self.state();
		state.take_failure("batch_get")?;
		if file_idx.is_none() {
			state.pings += 1;
		}
		match state.batches.get(batch_id) {
			Some(batch) => Ok(json!({
				"batchId": batch_id,
				"uploadedChunkIds": batch.chunks.keys().collect::<Vec<_>>(),
			})),
			None => Err(http_error(404, "Batch not found")),
		}
	}

	async fn batch_delete(&self, batch_id: &str, _file_idx: Option<u64>) -> RemoteResult<()> {
		let mut state = self.state();
		state.take_failure("batch_delete")?;
		state.deleted_batches.push(batch_id.to_string());
		match state.batches.remove(batch_id) {
			Some(_) => Ok(()),
			None => Err(http_error(404, "Batch not found")),
		}
	}

	async fn batch_complete(&self, batch: &Batch, _headers: &Headers) -> RemoteResult<Value> {
		let mut state = self.state();
		state.take_failure("batch_complete")?;
		if batch.is_external() && batch.etag.is_none() {
			return Err(http_error(500, "Multipart upload is not complete"));
		}
		state.completions.push(batch.batch_id.clone());
		match state.batches.get_mut(&batch.batch_id) {
			Some(mock) => {
				mock.completed = true;
				Ok(json!({"batchId": batch.batch_id, "uploaded": "true"}))
			}
			None => Err(http_error(404, "Batch not found")),
		}
	}

	async fn uploader(
		&self,
		batch: Batch,
		blob: FileBlob,
		chunked: bool,
		chunk_size: u64,
		token_callback: TokenCallback,
	) -> RemoteResult<Box<dyn BlobUploader>> {
		if batch.is_external() {
			let store = self
				.object_store
				.clone()
				.ok_or_else(|| RemoteError::MissingField { field: "provider".to_string() })?;
			let mut uploader =
				ExternalUploader::new(store, batch, blob, chunked, chunk_size, token_callback);
			uploader.prepare().await?;
			return Ok(Box::new(uploader));
		}
		let uploaded = self
			.state()
			.batches
			.get(&batch.batch_id)
			.map(|b| b.chunks.keys().copied().collect())
			.unwrap_or_default();
		let chunk_size = if chunked { chunk_size.max(1) } else { blob.size };
		let chunk_count = if chunked { blob.size.div_ceil(chunk_size).max(1) } else { 1 };
		Ok(Box::new(MockUploader {
			state: Arc::clone(&self.state),
			batch,
			blob,
			chunked,
			chunk_size,
			chunk_count,
			uploaded,
		}))
	}

	async fn execute(&self, operation: Operation) -> RemoteResult<Value> {
		let mut state = self.state();
		state.executed.push(operation.clone());
		state.take_failure("execute")?;

		let uid = match operation.params.get("document").and_then(Value::as_str) {
			Some(uid) => uid.to_string(),
			None => format!("doc-{}", state.next_id()),
		};
		let name = match &operation.input {
			OperationInput::Blob(blob) => blob.name.clone(),
			_ => String::new(),
		};
		if let OperationInput::Blob(blob) = &operation.input {
			// Attached content becomes the new remote blob
			let data = blob
				.batch_id
				.as_ref()
				.and_then(|id| state.batches.get(id))
				.map(MockBatch::data)
				.unwrap_or_default();
			if let Some(doc) = state.documents.get_mut(&uid) {
				doc["properties"]["file:content"]["digest"] = json!(md5_hex(&data));
			}
			state.linked.push(data);
		}
		let parent = operation.context.get("currentDocument").and_then(Value::as_str).unwrap_or("");
		Ok(json!({
			"entity-type": "document",
			"uid": uid,
			"path": format!("{}/{}", parent, name),
			"title": name,
		}))
	}

	async fn fetch_document(
		&self,
		uid: &str,
		_headers: &Headers,
		_enrichers: &[&str],
	) -> RemoteResult<Value> {
		let mut state = self.state();
		state.take_failure("fetch_document")?;
		state.documents.get(uid).cloned().ok_or_else(|| http_error(404, "Document not found"))
	}

	async fn lock(&self, uid: &str) -> RemoteResult<()> {
		let mut state = self.state();
		state.take_failure("lock")?;
		match state.locks.get(uid) {
			Some(owner) => {
				Err(http_error(409, &format!("Document already locked by {}: {}", owner, uid)))
			}
			None => {
				state.locks.insert(uid.to_string(), self.user.clone());
				Ok(())
			}
		}
	}

	async fn unlock(&self, uid: &str, headers: &Headers) -> RemoteResult<()> {
		let mut state = self.state();
		state.unlocks.push((uid.to_string(), headers.clone()));
		state.take_failure("unlock")?;
		state.locks.remove(uid);
		Ok(())
	}

	async fn download(&self, url: &str, offset: u64) -> RemoteResult<DownloadResponse> {
		let mut state = self.state();
		state.take_failure("download")?;
		let body = state.bodies.get(url).cloned().ok_or_else(|| http_error(404, "Not Found"))?;
		let offset = if state.ignore_ranges { 0 } else { offset.min(body.len() as u64) };
		let rest = body[offset as usize..].to_vec();
		let content_length = Some(rest.len() as u64);
		let pieces: Vec<RemoteResult<Vec<u8>>> = rest.chunks(64 * 1024).map(|c| Ok(c.to_vec())).collect();
		Ok(DownloadResponse {
			status: if offset > 0 { 206 } else { 200 },
			content_length,
			body: futures::stream::iter(pieces).boxed(),
		})
	}

	async fn exists_in_parent(&self, parent_ref: &str, name: &str) -> RemoteResult<bool> {
		let mut state = self.state();
		state.take_failure("exists_in_parent")?;
		Ok(state.existing.contains(&(parent_ref.to_string(), name.to_string())))
	}

	async fn create_folder(
		&self,
		parent_path: &str,
		title: &str,
		_headers: &Headers,
	) -> RemoteResult<Value> {
		let mut state = self.state();
		state.take_failure("create_folder")?;
		let uid = format!("folder-{}", state.next_id());
		state.folders.push((parent_path.to_string(), title.to_string()));
		Ok(json!({
			"entity-type": "document",
			"uid": uid,
			"path": format!("{}/{}", parent_path, title),
			"type": "Folder",
		}))
	}
}

/// In-repository provider: chunks land in the shared state
struct MockUploader {
	state: Arc<Mutex<MockState>>,
	batch: Batch,
	blob: FileBlob,
	chunked: bool,
	chunk_size: u64,
	chunk_count: u64,
	uploaded: BTreeSet<u64>,
}

impl MockUploader {
	fn read(&self, offset: u64, len: u64) -> RemoteResult<Vec<u8>> {
		let io_error = |e: std::io::Error| RemoteError::Connection { message: e.to_string() };
		let mut file = std::fs::File::open(&self.blob.path).map_err(io_error)?;
		file.seek(SeekFrom::Start(offset)).map_err(io_error)?;
		let mut data = Vec::new();
		file.take(len).read_to_end(&mut data).map_err(io_error)?;
		Ok(data)
	}

	fn send(&mut self, index: u64, data: Vec<u8>) -> RemoteResult<()> {
		let mut state = self.state.lock().unwrap();
		state.take_failure("upload_chunk")?;
		let batch = state
			.batches
			.get_mut(&self.batch.batch_id)
			.ok_or_else(|| http_error(404, "Batch not found"))?;
		batch.chunks.insert(index, data);
		state.chunks_sent += 1;
		self.uploaded.insert(index);
		Ok(())
	}
}

#[async_trait]
impl BlobUploader for MockUploader {
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
		self.uploaded.iter().copied().collect()
	}

	async fn upload_next_chunk(&mut self) -> RemoteResult<Option<u64>> {
		if !self.chunked {
			return Ok(None);
		}
		let index = match (0..self.chunk_count).find(|i| !self.uploaded.contains(i)) {
			Some(index) => index,
			None => return Ok(None),
		};
		let data = self.read(index * self.chunk_size, self.chunk_size)?;
		self.send(index, data)?;
		Ok(Some(index))
	}

	async fn upload(&mut self) -> RemoteResult<()> {
		if self.chunked {
			while self.upload_next_chunk().await?.is_some() {}
			return Ok(());
		}
		let data = self.read(0, self.blob.size)?;
		self.send(0, data)
	}

	fn batch(&self) -> &Batch {
		&self.batch
	}
}

// ===================================================================
// OBJECT STORE
// ===================================================================

/// Multipart store whose credentials expire right before one given part
#[derive(Default)]
pub struct MemoryObjectStore {
	pub parts: Mutex<BTreeMap<u64, Vec<u8>>>,
	pub objects: Mutex<BTreeMap<String, Vec<u8>>>,
	pub refreshes: AtomicU32,
	/// Part number whose upload first needs fresh credentials
	pub expire_before_part: Option<u64>,
	/// Part number before which the pending multipart upload is aborted, once
	pub lose_upload_before: Mutex<Option<u64>>,
	pub parts_sent: AtomicU32,
	pub multiparts_completed: AtomicU32,
	uploads: AtomicU32,
}

impl MemoryObjectStore {
	pub fn expiring_before(part: u64) -> Self {
		MemoryObjectStore { expire_before_part: Some(part), ..Default::default() }
	}

	pub fn losing_upload_before(part: u64) -> Self {
		MemoryObjectStore { lose_upload_before: Mutex::new(Some(part)), ..Default::default() }
	}

	fn current_upload(&self) -> String {
		format!("mpu-{}", self.uploads.load(Ordering::SeqCst))
	}
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
	async fn create_multipart(&self, _batch: &Batch, _key: &str) -> RemoteResult<String> {
		let n = self.uploads.fetch_add(1, Ordering::SeqCst) + 1;
		self.parts.lock().unwrap().clear();
		Ok(format!("mpu-{}", n))
	}

	async fn list_parts(
		&self,
		_batch: &Batch,
		_key: &str,
		upload_id: &str,
	) -> RemoteResult<Vec<(u64, String)>> {
		if upload_id != self.current_upload() {
			return Err(RemoteError::NoSuchUpload { upload_id: upload_id.to_string() });
		}
		Ok(self.parts.lock().unwrap().keys().map(|n| (*n, format!("etag-{}", n))).collect())
	}

	async fn upload_part(
		&self,
		_batch: &Batch,
		_key: &str,
		upload_id: &str,
		part: u64,
		data: Vec<u8>,
	) -> RemoteResult<String> {
		{
			let mut lose = self.lose_upload_before.lock().unwrap();
			if *lose == Some(part) {
				// Aborted server side, e.g. by a lifecycle rule
				*lose = None;
				self.uploads.fetch_add(1, Ordering::SeqCst);
				self.parts.lock().unwrap().clear();
			}
		}
		if upload_id != self.current_upload() {
			return Err(RemoteError::NoSuchUpload { upload_id: upload_id.to_string() });
		}
		self.parts_sent.fetch_add(1, Ordering::SeqCst);
		self.parts.lock().unwrap().insert(part, data);
		Ok(format!("etag-{}", part))
	}

	async fn complete_multipart(
		&self,
		_batch: &Batch,
		key: &str,
		_upload_id: &str,
		parts: &[(u64, String)],
	) -> RemoteResult<String> {
		self.multiparts_completed.fetch_add(1, Ordering::SeqCst);
		let stored = self.parts.lock().unwrap();
		let data: Vec<u8> =
			parts.iter().filter_map(|(n, _)| stored.get(n)).flatten().copied().collect();
		self.objects.lock().unwrap().insert(key.to_string(), data);
		Ok("etag-object".to_string())
	}

	async fn put_object(&self, _batch: &Batch, key: &str, data: Vec<u8>) -> RemoteResult<String> {
		self.objects.lock().unwrap().insert(key.to_string(), data);
		Ok("etag-object".to_string())
	}

	async fn refresh_credentials(&self, batch: &Batch) -> RemoteResult<Option<Batch>> {
		self.refreshes.fetch_add(1, Ordering::SeqCst);
		let mut fresh = batch.clone();
		fresh.extra_info.insert("token".to_string(), json!("refreshed"));
		Ok(Some(fresh))
	}

	fn credentials_expired(&self, batch: &Batch) -> bool {
		let part = match self.expire_before_part {
			Some(part) => part,
			None => return false,
		};
		let next = self.parts.lock().unwrap().len() as u64 + 1;
		next >= part && batch.extra_info.get("token") != Some(&json!("refreshed"))
	}
}

// vim: ts=4
