//! REST/Automation client
//!
//! Talks to the repository over `reqwest`: batch endpoints under
//! `api/v1/upload/`, commands under `api/v1/automation/`, documents under
//! `api/v1/id/`. Default-provider blobs go through [`DefaultUploader`];
//! batches opened on the object-store handler are driven by an
//! [`ExternalUploader`] over the injected [`ObjectStore`].

use async_trait::async_trait;
use futures::StreamExt;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, RANGE};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use url::Url;

use crate::config::Options;
use crate::constants::S3_HANDLER;
use crate::error::RemoteError;
use crate::logging::*;
use crate::remote::external::{ExternalUploader, ObjectStore};
use crate::remote::{
	BlobUploader, DownloadResponse, FileBlob, Headers, Operation, OperationInput, RemoteRepository,
	RemoteResult, TokenCallback,
};
use crate::types::Batch;

const AUTH_TOKEN_HEADER: &str = "x-authentication-token";

fn io_error(e: std::io::Error) -> RemoteError {
	RemoteError::Connection { message: e.to_string() }
}

/// Turn a non-success response into [`RemoteError::Http`]
async fn check(resp: Response) -> RemoteResult<Response> {
	let status = resp.status();
	if status.is_success() {
		return Ok(resp);
	}
	let message = resp.text().await.unwrap_or_default();
	Err(RemoteError::Http { status: status.as_u16(), message })
}

/// Decode a JSON body; empty bodies (void operations) become `Null`
async fn json_body(resp: Response) -> RemoteResult<Value> {
	let bytes = check(resp).await?.bytes().await?;
	if bytes.is_empty() {
		return Ok(Value::Null);
	}
	Ok(serde_json::from_slice(&bytes)?)
}

fn apply_headers(mut req: RequestBuilder, headers: &Headers) -> RequestBuilder {
	for (name, value) in headers {
		req = req.header(name.as_str(), value.as_str());
	}
	req
}

/// Escape a value embedded in an NXQL string literal
fn escape_nxql(value: &str) -> String {
	value.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Repository client over HTTP
pub struct HttpRemote {
	http: reqwest::Client,
	base_url: Url,
	user_id: String,
	timeout: Duration,
	object_store: Option<Arc<dyn ObjectStore>>,
}

impl HttpRemote {
	/// Client for `server_url` authenticated with a token
	pub fn new(server_url: &str, user_id: &str, token: &str, options: &Options) -> RemoteResult<Self> {
		let mut base = server_url.trim_end_matches('/').to_string();
		base.push('/');
		let base_url = Url::parse(&base).map_err(|e| RemoteError::Decode { message: e.to_string() })?;

		let mut headers = HeaderMap::new();
		let value = HeaderValue::from_str(token).map_err(|_| RemoteError::Http {
			status: 401,
			message: "invalid authentication token".to_string(),
		})?;
		headers.insert(HeaderName::from_static(AUTH_TOKEN_HEADER), value);

		let http = reqwest::Client::builder()
			.default_headers(headers)
			.connect_timeout(options.timeout())
			.build()?;

		debug!("Remote client for {} as {}", base_url, user_id);
		Ok(HttpRemote {
			http,
			base_url,
			user_id: user_id.to_string(),
			timeout: options.timeout(),
			object_store: None,
		})
	}

	/// Enable uploads through the external provider
	pub fn with_object_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
		self.object_store = Some(store);
		self
	}

	pub fn base_url(&self) -> &Url {
		&self.base_url
	}

	fn url(&self, path: &str) -> RemoteResult<Url> {
		self.base_url
			.join(path.trim_start_matches('/'))
			.map_err(|e| RemoteError::Decode { message: format!("{}: {}", path, e) })
	}

	fn request(&self, method: Method, path: &str) -> RemoteResult<RequestBuilder> {
		Ok(self.http.request(method, self.url(path)?).timeout(self.timeout))
	}

	fn batch_path(batch_id: &str, file_idx: Option<u64>) -> String {
		match file_idx {
			Some(idx) => format!("api/v1/upload/{}/{}", batch_id, idx),
			None => format!("api/v1/upload/{}", batch_id),
		}
	}

	/// Upload handlers declared by the server
	pub async fn upload_handlers(&self) -> RemoteResult<Vec<String>> {
		let resp = self.request(Method::GET, "api/v1/upload/handlers")?.send().await?;
		let body = json_body(resp).await?;
		Ok(body
			.get("handlers")
			.and_then(Value::as_array)
			.map(|handlers| {
				handlers
					.iter()
					.filter_map(|h| h.get("name").and_then(Value::as_str))
					.map(str::to_string)
					.collect()
			})
			.unwrap_or_default())
	}

	/// Run an NXQL query through `Document.Query`
	pub async fn query(&self, nxql: &str) -> RemoteResult<Value> {
		self.execute(Operation::new("Document.Query").param("query", nxql)).await
	}
}

#[async_trait]
impl RemoteRepository for HttpRemote {
	fn user_id(&self) -> &str {
		&self.user_id
	}

	async fn has_external_provider(&self) -> bool {
		if self.object_store.is_none() {
			return false;
		}
		// Not cached: a one-time server error must not disable the provider for good
		match self.upload_handlers().await {
			Ok(handlers) => handlers.iter().any(|h| h == S3_HANDLER),
			Err(e) => {
				warn!("Cannot list upload handlers: {}", e);
				false
			}
		}
	}

	async fn batch_create(&self, handler: Option<&str>) -> RemoteResult<Batch> {
		let path = match handler {
			Some(handler) => format!("api/v1/upload/new/{}", handler),
			None => "api/v1/upload/".to_string(),
		};
		let resp = self.request(Method::POST, &path)?.send().await?;
		let body = json_body(resp).await?;
		let batch: Batch = serde_json::from_value(body)?;
		debug!("Created batch {} (provider {:?})", batch.batch_id, batch.provider);
		Ok(batch)
	}

	async fn batch_get(&self, batch_id: &str, file_idx: Option<u64>) -> RemoteResult<Value> {
		let resp = self.request(Method::GET, &Self::batch_path(batch_id, file_idx))?.send().await?;
		json_body(resp).await
	}

	async fn batch_delete(&self, batch_id: &str, file_idx: Option<u64>) -> RemoteResult<()> {
		let resp =
			self.request(Method::DELETE, &Self::batch_path(batch_id, file_idx))?.send().await?;
		check(resp).await?;
		Ok(())
	}

	async fn batch_complete(&self, batch: &Batch, headers: &Headers) -> RemoteResult<Value> {
		// The in-repository provider completes on its own
		if !batch.is_external() {
			return Ok(Value::Null);
		}
		let path = format!("api/v1/upload/{}/{}/complete", batch.batch_id, batch.upload_idx);
		let body = serde_json::to_value(batch.without_blobs())?;
		let req = apply_headers(self.request(Method::POST, &path)?, headers);
		let resp = req.json(&body).send().await?;
		json_body(resp).await
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
			let store = match &self.object_store {
				Some(store) => Arc::clone(store),
				None => {
					return Err(RemoteError::Http {
						status: 501,
						message: format!("no object store for provider {:?}", batch.provider),
					})
				}
			};
			let mut uploader =
				ExternalUploader::new(store, batch, blob, chunked, chunk_size, token_callback);
			uploader.prepare().await?;
			return Ok(Box::new(uploader));
		}
		let mut uploader = DefaultUploader::new(self, batch, blob, chunked, chunk_size)?;
		uploader.prepare().await?;
		Ok(Box::new(uploader))
	}

	async fn execute(&self, operation: Operation) -> RemoteResult<Value> {
		let mut body = Map::new();
		let path = match &operation.input {
			OperationInput::Blob(blob) => {
				let batch_id = blob.batch_id.as_deref().ok_or_else(|| RemoteError::MissingField {
					field: "batchId".to_string(),
				})?;
				format!(
					"api/v1/upload/{}/{}/execute/{}",
					batch_id,
					blob.file_idx.unwrap_or(0),
					operation.command
				)
			}
			OperationInput::Document(doc) => {
				let input = if doc.starts_with('/') { doc.clone() } else { format!("doc:{}", doc) };
				body.insert("input".to_string(), json!(input));
				format!("api/v1/automation/{}", operation.command)
			}
			OperationInput::None => format!("api/v1/automation/{}", operation.command),
		};
		body.insert("params".to_string(), Value::Object(operation.params));
		body.insert("context".to_string(), Value::Object(operation.context));

		let mut req = apply_headers(self.request(Method::POST, &path)?, &operation.headers);
		if let Some(timeout) = operation.timeout {
			req = req.timeout(timeout);
		}
		debug!("Calling {} ({})", operation.command, path);
		let resp = req.json(&Value::Object(body)).send().await?;
		json_body(resp).await
	}

	async fn fetch_document(
		&self,
		uid: &str,
		headers: &Headers,
		enrichers: &[&str],
	) -> RemoteResult<Value> {
		let mut req = apply_headers(self.request(Method::GET, &format!("api/v1/id/{}", uid))?, headers)
			.header("properties", "*");
		if !enrichers.is_empty() {
			req = req.header("enrichers-document", enrichers.join(","));
		}
		json_body(req.send().await?).await
	}

	async fn lock(&self, uid: &str) -> RemoteResult<()> {
		let op = Operation::new("Document.Lock").input(OperationInput::Document(uid.to_string()));
		self.execute(op).await?;
		Ok(())
	}

	async fn unlock(&self, uid: &str, headers: &Headers) -> RemoteResult<()> {
		let mut op =
			Operation::new("Document.Unlock").input(OperationInput::Document(uid.to_string()));
		op.headers = headers.clone();
		self.execute(op).await?;
		Ok(())
	}

	async fn download(&self, url: &str, offset: u64) -> RemoteResult<DownloadResponse> {
		let target = match Url::parse(url) {
			Ok(absolute) => absolute,
			Err(_) => self.url(url)?,
		};
		let mut req = self.http.get(target);
		if offset > 0 {
			req = req.header(RANGE, format!("bytes={}-", offset));
		}
		let resp = req.send().await?;
		if offset > 0 && resp.status() == StatusCode::RANGE_NOT_SATISFIABLE {
			// Nothing left past the offset
			return Ok(DownloadResponse {
				status: 206,
				content_length: Some(0),
				body: futures::stream::empty().boxed(),
			});
		}
		let resp = check(resp).await?;
		let status = resp.status().as_u16();
		let content_length = resp.content_length();
		let body = resp
			.bytes_stream()
			.map(|chunk| chunk.map(|b| b.to_vec()).map_err(RemoteError::from))
			.boxed();
		Ok(DownloadResponse { status, content_length, body })
	}

	async fn exists_in_parent(&self, parent_ref: &str, name: &str) -> RemoteResult<bool> {
		let nxql = format!(
			"SELECT * FROM Document WHERE ecm:parentId = '{}' AND dc:title = '{}' \
			 AND ecm:isProxy = 0 AND ecm:isVersion = 0 AND ecm:isTrashed = 0",
			escape_nxql(parent_ref),
			escape_nxql(name)
		);
		let result = self.query(&nxql).await?;
		Ok(result.get("entries").and_then(Value::as_array).map_or(false, |e| !e.is_empty()))
	}

	async fn create_folder(
		&self,
		parent_path: &str,
		title: &str,
		headers: &Headers,
	) -> RemoteResult<Value> {
		let path = format!("api/v1/path/{}", parent_path.trim_start_matches('/'));
		let body = json!({
			"entity-type": "document",
			"name": title,
			"type": "Folder",
			"properties": {"dc:title": title},
		});
		let req = apply_headers(self.request(Method::POST, &path)?, headers);
		json_body(req.json(&body).send().await?).await
	}
}

/// Uploader of the in-repository provider
///
/// Chunked uploads send `X-Upload-Chunk-*` headers; the server keeps track
/// of acknowledged chunks and reports them as `uploadedChunkIds`.
pub struct DefaultUploader {
	http: reqwest::Client,
	url: Url,
	timeout: Duration,
	batch: Batch,
	blob: FileBlob,
	chunked: bool,
	chunk_size: u64,
	chunk_count: u64,
	uploaded: BTreeSet<u64>,
}

impl DefaultUploader {
	fn new(
		remote: &HttpRemote,
		batch: Batch,
		blob: FileBlob,
		chunked: bool,
		chunk_size: u64,
	) -> RemoteResult<Self> {
		let url = remote.url(&HttpRemote::batch_path(&batch.batch_id, Some(batch.upload_idx)))?;
		let chunk_size = if chunked { chunk_size.max(1) } else { 0 };
		let chunk_count = if chunked { blob.size.div_ceil(chunk_size).max(1) } else { 1 };
		Ok(DefaultUploader {
			http: remote.http.clone(),
			url,
			timeout: remote.timeout,
			batch,
			blob,
			chunked,
			chunk_size,
			chunk_count,
			uploaded: BTreeSet::new(),
		})
	}

	/// Learn which chunks the server already holds
	async fn prepare(&mut self) -> RemoteResult<()> {
		if !self.chunked {
			return Ok(());
		}
		let resp = self.http.get(self.url.clone()).timeout(self.timeout).send().await?;
		let info = match json_body(resp).await {
			Ok(info) => info,
			Err(e) if e.is_not_found() => return Ok(()),
			Err(e) => return Err(e),
		};
		if let Some(ids) = info.get("uploadedChunkIds").and_then(Value::as_array) {
			for id in ids {
				let id = match id {
					Value::Number(n) => n.as_u64(),
					Value::String(s) => s.parse().ok(),
					_ => None,
				};
				if let Some(id) = id {
					self.uploaded.insert(id);
				}
			}
			debug!("Batch {} already holds chunks {:?}", self.batch.batch_id, self.uploaded);
		}
		Ok(())
	}

	fn headers(&self, upload_type: &str) -> RemoteResult<HeaderMap> {
		let mut headers = HeaderMap::new();
		let name = utf8_percent_encode(&self.blob.name, NON_ALPHANUMERIC).to_string();
		let mimetype = self.blob.mimetype.as_deref().unwrap_or("application/octet-stream");
		let pairs = [
			("x-upload-type", upload_type.to_string()),
			("x-file-name", name),
			("x-file-size", self.blob.size.to_string()),
			("x-file-type", mimetype.to_string()),
		];
		for (key, value) in pairs {
			let value = HeaderValue::from_str(&value)
				.map_err(|e| RemoteError::Decode { message: e.to_string() })?;
			headers.insert(HeaderName::from_static(key), value);
		}
		headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"));
		Ok(headers)
	}

	async fn read_chunk(&self, index: u64) -> RemoteResult<Vec<u8>> {
		let mut file = tokio::fs::File::open(&self.blob.path).await.map_err(io_error)?;
		file.seek(std::io::SeekFrom::Start(index * self.chunk_size)).await.map_err(io_error)?;
		let mut data = Vec::with_capacity(self.chunk_size as usize);
		file.take(self.chunk_size).read_to_end(&mut data).await.map_err(io_error)?;
		Ok(data)
	}

	fn mark_uploaded(&mut self) {
		self.batch.blobs.push(json!({
			"name": self.blob.name,
			"size": self.blob.size,
			"fileIdx": self.batch.upload_idx,
		}));
	}
}

#[async_trait]
impl BlobUploader for DefaultUploader {
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
		let data = self.read_chunk(index).await?;
		let mut headers = self.headers("chunked")?;
		headers.insert("x-upload-chunk-index", HeaderValue::from(index));
		headers.insert("x-upload-chunk-count", HeaderValue::from(self.chunk_count));
		let resp = self
			.http
			.post(self.url.clone())
			.timeout(self.timeout)
			.headers(headers)
			.body(data)
			.send()
			.await?;
		check(resp).await?;
		self.uploaded.insert(index);
		Ok(Some(index))
	}

	async fn upload(&mut self) -> RemoteResult<()> {
		if self.chunked {
			while self.upload_next_chunk().await?.is_some() {}
		} else {
			let data = tokio::fs::read(&self.blob.path).await.map_err(io_error)?;
			let headers = self.headers("normal")?;
			let resp = self
				.http
				.post(self.url.clone())
				.timeout(self.timeout)
				.headers(headers)
				.body(data)
				.send()
				.await?;
			check(resp).await?;
		}
		self.mark_uploaded();
		Ok(())
	}

	fn batch(&self) -> &Batch {
		&self.batch
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_escape_nxql() {
		assert_eq!(escape_nxql("it's"), "it\\'s");
		assert_eq!(escape_nxql("a\\b"), "a\\\\b");
	}

	#[test]
	fn test_urls() {
		let remote =
			HttpRemote::new("https://srv/nuxeo/", "alice", "token", &Options::default()).unwrap();
		assert_eq!(remote.base_url().as_str(), "https://srv/nuxeo/");
		assert_eq!(
			remote.url("/api/v1/upload/").unwrap().as_str(),
			"https://srv/nuxeo/api/v1/upload/"
		);
		assert_eq!(HttpRemote::batch_path("b1", Some(0)), "api/v1/upload/b1/0");
		assert_eq!(HttpRemote::batch_path("b1", None), "api/v1/upload/b1");
		assert_eq!(remote.user_id(), "alice");
	}

	#[test]
	fn test_rejects_invalid_token() {
		assert!(HttpRemote::new("https://srv/nuxeo", "alice", "bad\ntoken", &Options::default())
			.is_err());
	}

	#[tokio::test]
	async fn test_no_external_provider_without_store() {
		let remote =
			HttpRemote::new("https://srv.invalid/nuxeo", "alice", "t", &Options::default()).unwrap();
		assert!(!remote.has_external_provider().await);
	}

	#[test]
	fn test_default_uploader_chunk_layout() {
		let dir = tempfile::TempDir::new().unwrap();
		let path = dir.path().join("big.bin");
		std::fs::write(&path, vec![0u8; 10]).unwrap();
		let remote =
			HttpRemote::new("https://srv/nuxeo", "alice", "t", &Options::default()).unwrap();
		let blob = FileBlob::from_path(&path, None, None).unwrap();
		let uploader = DefaultUploader::new(&remote, Batch::new("b1"), blob.clone(), true, 4).unwrap();
		assert_eq!(uploader.chunk_count(), 3);
		assert_eq!(uploader.url.as_str(), "https://srv/nuxeo/api/v1/upload/b1/0");
		let single = DefaultUploader::new(&remote, Batch::new("b1"), blob, false, 4).unwrap();
		assert_eq!(single.chunk_size(), 0);
		assert_eq!(single.chunk_count(), 1);
	}
}

// vim: ts=4
