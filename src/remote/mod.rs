//! Remote repository abstraction
//!
//! The pipelines and the Direct-Edit worker only talk to the content
//! repository through [`RemoteRepository`]. [`http::HttpRemote`] is the
//! REST/Automation implementation; tests plug in an in-memory one.
//!
//! Uploading bytes is delegated to provider-specific [`BlobUploader`]s handed
//! out by the repository for a given batch.

pub mod external;
pub mod http;
pub mod info;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::error::RemoteError;
use crate::types::Batch;
use crate::utils::guess_mime_type;

pub use external::{ExternalUploader, ObjectStore};
pub use http::HttpRemote;
pub use info::{BlobInfo, ChangeSummary, NuxeoDocumentInfo, RemoteFileInfo};

/// Result type for remote operations
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Extra request headers, sorted for stable wire output
pub type Headers = BTreeMap<String, String>;

/// Called by external uploaders whenever the batch descriptor changed
/// (refreshed credentials, new multipart upload id)
pub type TokenCallback = Arc<dyn Fn(&Batch) + Send + Sync>;

/// A local file about to be sent into a batch
#[derive(Debug, Clone, PartialEq)]
pub struct FileBlob {
	pub path: PathBuf,
	pub name: String,
	pub size: u64,
	pub mimetype: Option<String>,
	pub batch_id: Option<String>,
	pub file_idx: Option<u64>,
	pub upload_idx: u64,
}

impl FileBlob {
	pub fn from_path(path: &Path, name: Option<&str>, mimetype: Option<&str>) -> io::Result<Self> {
		let size = std::fs::metadata(path)?.len();
		let name = match name {
			Some(name) => name.to_string(),
			None => path
				.file_name()
				.map(|n| n.to_string_lossy().into_owned())
				.unwrap_or_default(),
		};
		let mimetype = mimetype.map(str::to_string).or_else(|| Some(guess_mime_type(&name).to_string()));
		Ok(FileBlob {
			path: path.to_path_buf(),
			name,
			size,
			mimetype,
			batch_id: None,
			file_idx: None,
			upload_idx: 0,
		})
	}
}

/// Input of an Automation operation
#[derive(Debug, Clone, Default, PartialEq)]
pub enum OperationInput {
	#[default]
	None,
	/// A blob already uploaded into a batch
	Blob(FileBlob),
	/// A document reference (uid or path)
	Document(String),
}

/// An Automation command invocation
#[derive(Debug, Clone, Default)]
pub struct Operation {
	pub command: String,
	pub input: OperationInput,
	pub params: Map<String, Value>,
	pub context: Map<String, Value>,
	pub headers: Headers,
	pub timeout: Option<Duration>,
}

impl Operation {
	pub fn new(command: &str) -> Self {
		Operation { command: command.to_string(), ..Default::default() }
	}

	pub fn input(mut self, input: OperationInput) -> Self {
		self.input = input;
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

	pub fn header(mut self, key: &str, value: impl Into<String>) -> Self {
		self.headers.insert(key.to_string(), value.into());
		self
	}

	pub fn timeout(mut self, timeout: Duration) -> Self {
		self.timeout = Some(timeout);
		self
	}
}

/// Streaming body of a (possibly ranged) GET
pub struct DownloadResponse {
	/// 200 for a full body, 206 when the range was honoured
	pub status: u16,
	/// Length of this body, not of the whole file
	pub content_length: Option<u64>,
	pub body: BoxStream<'static, RemoteResult<Vec<u8>>>,
}

impl DownloadResponse {
	pub fn is_partial(&self) -> bool {
		self.status == 206
	}
}

impl fmt::Debug for DownloadResponse {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("DownloadResponse")
			.field("status", &self.status)
			.field("content_length", &self.content_length)
			.finish()
	}
}

/// Provider-specific byte mover for one blob of one batch
#[async_trait]
pub trait BlobUploader: Send {
	fn chunked(&self) -> bool;

	/// Bytes per chunk; 0 for single-shot uploads
	fn chunk_size(&self) -> u64;

	fn chunk_count(&self) -> u64;

	/// Chunks the provider already acknowledged (known when resuming)
	fn uploaded_chunk_ids(&self) -> Vec<u64>;

	/// Send the next missing chunk; `None` once every chunk is acknowledged
	async fn upload_next_chunk(&mut self) -> RemoteResult<Option<u64>>;

	/// Send whatever is missing and finalize the blob on the provider side
	async fn upload(&mut self) -> RemoteResult<()>;

	/// Batch descriptor as the uploader last saw it
	fn batch(&self) -> &Batch;
}

/// Operations the transfer engine invokes on the content repository
#[async_trait]
pub trait RemoteRepository: Send + Sync {
	/// Login of the authenticated user
	fn user_id(&self) -> &str;

	/// The repository offers an external (object-store) upload handler
	async fn has_external_provider(&self) -> bool;

	/// Open a new batch, optionally on a specific provider
	async fn batch_create(&self, handler: Option<&str>) -> RemoteResult<Batch>;

	/// Existence check and keep-alive of a batch
	async fn batch_get(&self, batch_id: &str, file_idx: Option<u64>) -> RemoteResult<Value>;

	async fn batch_delete(&self, batch_id: &str, file_idx: Option<u64>) -> RemoteResult<()>;

	/// Tell the repository the provider finished receiving the blob
	async fn batch_complete(&self, batch: &Batch, headers: &Headers) -> RemoteResult<Value>;

	/// Uploader for `blob` inside `batch`
	async fn uploader(
		&self,
		batch: Batch,
		blob: FileBlob,
		chunked: bool,
		chunk_size: u64,
		token_callback: TokenCallback,
	) -> RemoteResult<Box<dyn BlobUploader>>;

	/// Run an Automation command
	async fn execute(&self, operation: Operation) -> RemoteResult<Value>;

	/// Fetch a document with extra headers and enrichers
	async fn fetch_document(
		&self,
		uid: &str,
		headers: &Headers,
		enrichers: &[&str],
	) -> RemoteResult<Value>;

	async fn lock(&self, uid: &str) -> RemoteResult<()>;

	async fn unlock(&self, uid: &str, headers: &Headers) -> RemoteResult<()>;

	/// GET `url`, starting at `offset` when non-zero
	async fn download(&self, url: &str, offset: u64) -> RemoteResult<DownloadResponse>;

	/// A live document named `name` already sits in `parent_ref`
	async fn exists_in_parent(&self, parent_ref: &str, name: &str) -> RemoteResult<bool>;

	/// Create a folder under `parent_path`; returns the new document
	async fn create_folder(
		&self,
		parent_path: &str,
		title: &str,
		headers: &Headers,
	) -> RemoteResult<Value>;

	/// Fresh document info without enrichers
	async fn get_info(&self, uid: &str) -> RemoteResult<NuxeoDocumentInfo> {
		let doc = self.fetch_document(uid, &Headers::new(), &[]).await?;
		NuxeoDocumentInfo::from_value(&doc)
	}

	/// Resolve the blob at `xpath` of document `uid` and stream it into `file_out`
	async fn get_blob(&self, uid: &str, xpath: &str, file_out: &Path) -> RemoteResult<BlobInfo> {
		let info = self.get_info(uid).await?;
		let blob = info
			.get_blob(xpath)
			.ok_or_else(|| RemoteError::MissingField { field: xpath.to_string() })?;
		match &blob.data {
			Some(url) => {
				let response = self.download(url, 0).await?;
				write_body(response, file_out).await?;
			}
			None => {
				// Note contents are inlined in the document
				let text = info.note_text().unwrap_or_default();
				tokio::fs::write(file_out, text.as_bytes())
					.await
					.map_err(|e| RemoteError::Connection { message: e.to_string() })?;
			}
		}
		Ok(blob)
	}
}

async fn write_body(response: DownloadResponse, file_out: &Path) -> RemoteResult<()> {
	use futures::StreamExt;
	use tokio::io::AsyncWriteExt;

	let io_error = |e: io::Error| RemoteError::Connection { message: e.to_string() };
	let mut file = tokio::fs::File::create(file_out).await.map_err(io_error)?;
	let mut body = response.body;
	while let Some(chunk) = body.next().await {
		file.write_all(&chunk?).await.map_err(io_error)?;
	}
	file.flush().await.map_err(io_error)?;
	Ok(())
}


// vim: ts=4
