//! Direct-Edit worker
//!
//! Opening a remote document for edition downloads its blob into a
//! per-document folder of the Direct-Edit folder and records where it came
//! from in the folder metadata. From then on the worker watches the folder:
//! saved changes are pushed back, office lock files drive the remote lock,
//! and a remote change made meanwhile is reported as a conflict instead of
//! being overwritten.
//!
//! The worker owns four queues, drained in this order on every loop turn:
//! lock requests, ready retries, uploads, then raw filesystem events.

pub mod events;
pub mod metadata;
pub mod watcher;

pub use events::{DirectEditEvent, DirectEditListener, EditErrorCode};
pub use watcher::{FolderWatcher, FsEvent, FsEventKind, NotifyWatcher};

use regex::Regex;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::action::{new_worker_id, run_as_worker, ActionRegistry, ActionSnapshot};
use crate::blocklist::{BlocklistItem, BlocklistQueue};
use crate::config::Options;
use crate::constants::*;
use crate::download::{DownloadRequest, Downloader};
use crate::engine::{Engine, EngineRegistry};
use crate::error::TransferError;
use crate::integrity::{compute_digest, DigestAlgorithm};
use crate::logging::*;
use crate::remote::info::{BlobInfo, NuxeoDocumentInfo};
use crate::remote::{Headers, RemoteRepository};
use crate::store::TransferStore;
use crate::types::Nature;
use crate::upload::{BaseUploader, UploadOptions, Uploader};
use crate::utils::{guess_mime_type, is_lock_file, is_temp_file, quote_url, safe_filename, safe_rename};
use crate::worker::WorkerControl;

const LOOP_DELAY: Duration = Duration::from_millis(500);

static LOCKED_BY: LazyLock<Option<Regex>> =
	LazyLock::new(|| Regex::new(r"Document already locked by ([^\s:]+):").ok());

static DOC_FOLDER: LazyLock<Option<Regex>> = LazyLock::new(|| {
	Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}_").ok()
});

static DOWNLOAD_URL: LazyLock<Option<Regex>> =
	LazyLock::new(|| Regex::new(r"(?i)^([^/]+/){3}(?P<xpath>.+)/(?P<filename>[^?]*)").ok());

/// Owner of a remote lock, from a "Document already locked by ..." error body
fn locked_by(message: &str) -> Option<String> {
	let re = LOCKED_BY.as_ref()?;
	re.captures(message).map(|c| c[1].to_string())
}

/// Folder names look like `<document uid>_<xpath>`
fn is_valid_folder_name(name: &str) -> bool {
	DOC_FOLDER.as_ref().map_or(false, |re| re.is_match(name))
}

/// Blob xpath embedded in a download URL such as `nxfile/default/<uid>/file:content/a.odt`
fn xpath_from_url(download_url: &str) -> Option<String> {
	let re = DOWNLOAD_URL.as_ref()?;
	re.captures(download_url).map(|c| c["xpath"].to_string())
}

fn is_version_error(error: &TransferError) -> bool {
	match error {
		TransferError::Remote(e) => {
			e.status() == Some(500) && e.message().contains("Cannot set property on a version")
		}
		_ => false,
	}
}

fn file_name(path: &Path) -> String {
	path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()
}

/// What the lock queue should do with a document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockAction {
	Lock,
	Unlock,
	UnlockOrphan,
}

impl LockAction {
	pub fn as_str(&self) -> &'static str {
		match self {
			LockAction::Lock => "lock",
			LockAction::Unlock => "unlock",
			LockAction::UnlockOrphan => "unlock_orphan",
		}
	}
}

impl fmt::Display for LockAction {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Auto-lock service: locks documents while an editor has them open
pub trait AutoLockService: Send + Sync {
	/// A file is being edited; the service decides whether to lock it
	fn set_autolock(&self, path: &Path);

	fn document_locked(&self, _name: &str) {}

	fn document_unlocked(&self, _name: &str) {}

	/// An orphan lock was released or its file is gone
	fn orphan_unlocked(&self, _path: &Path) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenError {
	NoAssociatedSoftware,
	AccessDenied,
	Other(String),
}

/// Launches the application associated with a file
pub trait FileOpener: Send + Sync {
	fn open(&self, path: &Path) -> Result<(), OpenError>;
}

/// Counters reported by [`DirectEdit::get_metrics`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DirectEditMetrics {
	pub edit_files: u64,
	pub conflicts: u64,
	pub recoveries: u64,
	pub fs_events: u64,
}

/// Everything the folder metadata says about an edited file
#[derive(Clone)]
struct EditDetails {
	uid: String,
	engine: Arc<Engine>,
	digest_algorithm: String,
	digest: String,
	xpath: Option<String>,
	editing: bool,
}

impl fmt::Debug for EditDetails {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("EditDetails")
			.field("uid", &self.uid)
			.field("engine", &self.engine.uid)
			.field("digest", &self.digest)
			.field("xpath", &self.xpath)
			.field("editing", &self.editing)
			.finish()
	}
}

pub struct DirectEdit {
	folder: PathBuf,
	engines: Arc<EngineRegistry>,
	store: Arc<TransferStore>,
	actions: Arc<ActionRegistry>,
	options: Arc<Options>,
	control: Arc<WorkerControl>,
	autolock: Option<Arc<dyn AutoLockService>>,
	opener: Option<Arc<dyn FileOpener>>,
	listeners: RwLock<Vec<Arc<dyn DirectEditListener>>>,

	upload_queue: Mutex<VecDeque<PathBuf>>,
	lock_queue: Mutex<VecDeque<(PathBuf, LockAction)>>,
	error_queue: BlocklistQueue<PathBuf>,
	/// Items handed back by the error queue, kept to stretch their next delay
	retrying: Mutex<HashMap<PathBuf, BlocklistItem<PathBuf>>>,
	watchdog_tx: UnboundedSender<FsEvent>,
	watchdog_rx: Mutex<UnboundedReceiver<FsEvent>>,
	watcher: Mutex<Option<Box<dyn FolderWatcher>>>,

	metrics: Mutex<DirectEditMetrics>,
	/// Telemetry of the files opened by this process
	file_metrics: Mutex<HashMap<PathBuf, Map<String, Value>>>,
	upload_errors: Mutex<HashMap<PathBuf, u32>>,
}

impl DirectEdit {
	pub fn new(
		folder: &Path,
		engines: Arc<EngineRegistry>,
		store: Arc<TransferStore>,
		actions: Arc<ActionRegistry>,
		options: Arc<Options>,
	) -> Self {
		let (watchdog_tx, watchdog_rx) = mpsc::unbounded_channel();
		DirectEdit {
			folder: folder.to_path_buf(),
			engines,
			store,
			actions,
			error_queue: BlocklistQueue::new(options.blocklist_delay()),
			options,
			control: Arc::new(WorkerControl::new("DirectEdit")),
			autolock: None,
			opener: None,
			listeners: RwLock::new(Vec::new()),
			upload_queue: Mutex::new(VecDeque::new()),
			lock_queue: Mutex::new(VecDeque::new()),
			retrying: Mutex::new(HashMap::new()),
			watchdog_tx,
			watchdog_rx: Mutex::new(watchdog_rx),
			watcher: Mutex::new(Some(Box::new(NotifyWatcher::new()))),
			metrics: Mutex::new(DirectEditMetrics::default()),
			file_metrics: Mutex::new(HashMap::new()),
			upload_errors: Mutex::new(HashMap::new()),
		}
	}

	pub fn with_autolock(mut self, autolock: Arc<dyn AutoLockService>) -> Self {
		self.autolock = Some(autolock);
		self
	}

	pub fn with_opener(mut self, opener: Arc<dyn FileOpener>) -> Self {
		self.opener = Some(opener);
		self
	}

	/// Replace the filesystem watcher; `None` leaves event feeding to the caller
	pub fn with_watcher(self, watcher: Option<Box<dyn FolderWatcher>>) -> Self {
		*self.watcher.lock().unwrap_or_else(|e| e.into_inner()) = watcher;
		self
	}

	pub fn subscribe(&self, listener: Arc<dyn DirectEditListener>) {
		self.listeners.write().unwrap_or_else(|e| e.into_inner()).push(listener);
	}

	pub fn folder(&self) -> &Path {
		&self.folder
	}

	pub fn control(&self) -> &Arc<WorkerControl> {
		&self.control
	}

	/// Entry point of the filesystem watcher
	pub fn watchdog_sender(&self) -> UnboundedSender<FsEvent> {
		self.watchdog_tx.clone()
	}

	pub fn stop(&self) {
		self.control.stop();
	}

	pub fn get_metrics(&self) -> DirectEditMetrics {
		self.metrics.lock().unwrap_or_else(|e| e.into_inner()).clone()
	}

	/// Paths waiting in the upload queue
	pub fn pending_uploads(&self) -> Vec<PathBuf> {
		self.upload_queue.lock().unwrap_or_else(|e| e.into_inner()).iter().cloned().collect()
	}

	/// Paths waiting in the lock queue
	pub fn pending_locks(&self) -> Vec<(PathBuf, LockAction)> {
		self.lock_queue.lock().unwrap_or_else(|e| e.into_inner()).iter().cloned().collect()
	}

	/// Paths waiting for a retry
	pub fn pending_retries(&self) -> Vec<PathBuf> {
		self.error_queue.items().into_iter().map(|item| item.payload).collect()
	}

	fn emit(&self, event: DirectEditEvent) {
		debug!("Direct Edit event: {:?}", event);
		let listeners = self.listeners.read().unwrap_or_else(|e| e.into_inner());
		for listener in listeners.iter() {
			listener.on_event(&event);
		}
	}

	fn queue_upload(&self, path: PathBuf) {
		self.upload_queue.lock().unwrap_or_else(|e| e.into_inner()).push_back(path);
	}

	fn queue_lock(&self, path: PathBuf, action: LockAction) {
		self.lock_queue.lock().unwrap_or_else(|e| e.into_inner()).push_back((path, action));
	}

	fn use_autolock(&self) -> bool {
		self.options.direct_edit_auto_lock && self.autolock.is_some()
	}

	fn downloader(&self, engine: &Engine) -> Downloader {
		Downloader::new(
			Arc::clone(&engine.remote),
			Arc::clone(&self.store),
			Arc::clone(&self.actions),
			Arc::clone(&self.options),
		)
	}

	fn uploader(&self, engine: &Engine) -> Uploader {
		Uploader::Sync(BaseUploader::new(
			Arc::clone(&engine.remote),
			Arc::clone(&self.store),
			Arc::clone(&self.actions),
			Arc::clone(&self.options),
		))
	}

	// ========================================================================
	// AUTO-LOCK REQUESTS
	// ========================================================================

	/// Release locks the auto-lock service no longer tracks
	pub fn autolock_orphans(&self, locks: &[PathBuf]) {
		debug!("Orphans lock: {:?}", locks);
		for lock in locks {
			if !lock.starts_with(&self.folder) {
				continue;
			}
			info!("Should unlock {}", lock.display());
			if !lock.exists() {
				if let Some(autolock) = &self.autolock {
					autolock.orphan_unlocked(lock);
				}
				continue;
			}
			self.queue_lock(lock.clone(), LockAction::UnlockOrphan);
		}
	}

	pub fn autolock_lock(&self, path: &Path) {
		self.queue_lock(path.to_path_buf(), LockAction::Lock);
	}

	pub fn autolock_unlock(&self, path: &Path) {
		self.queue_lock(path.to_path_buf(), LockAction::Unlock);
	}

	/// Accept `digest` as the last known remote digest and push the file
	pub fn force_update(&self, path: &Path, digest: &str) -> Result<(), TransferError> {
		if let Some(dir) = path.parent() {
			metadata::set(dir, DIGEST_META, digest)?;
		}
		self.queue_upload(path.to_path_buf());
		Ok(())
	}

	// ========================================================================
	// OPEN FOR EDIT
	// ========================================================================

	fn get_engine(&self, server_url: &str, doc_id: Option<&str>, user: Option<&str>) -> Option<Arc<Engine>> {
		let engine = self.engines.get(server_url, user);
		if engine.is_none() {
			warn!(
				"No engine found for user {:?} on server {:?}, doc_id={:?}",
				user, server_url, doc_id
			);
			self.emit(DirectEditEvent::error(
				EditErrorCode::CantFindEngine,
				&[user.unwrap_or("Unknown"), server_url],
			));
		}
		engine
	}

	/// Document info, or `None` when it cannot be edited (an event tells why)
	async fn get_info(&self, engine: &Engine, doc_id: &str) -> Result<Option<NuxeoDocumentInfo>, TransferError> {
		let mut headers = Headers::new();
		headers.insert("fetch-document".to_string(), "lock".to_string());
		let doc = match engine.remote.fetch_document(doc_id, &headers, &["permissions"]).await {
			Ok(doc) => doc,
			Err(e) => match TransferError::from(e) {
				TransferError::Forbidden { .. } => {
					warn!(
						"Access to the document {:?} on server {:?} is forbidden for user {:?}",
						doc_id,
						engine.hostname(),
						engine.remote.user_id()
					);
					self.emit(DirectEditEvent::Forbidden {
						uid: doc_id.to_string(),
						hostname: engine.hostname(),
						user: engine.remote.user_id().to_string(),
					});
					return Ok(None);
				}
				TransferError::Unauthorized => {
					engine.set_invalid_credentials(true);
					return Ok(None);
				}
				TransferError::NotFound { .. } => {
					self.emit(DirectEditEvent::error(EditErrorCode::NotFound, &[doc_id, &engine.hostname()]));
					return Ok(None);
				}
				other => return Err(other),
			},
		};
		let info = NuxeoDocumentInfo::from_value(&doc)?;

		if info.is_version {
			self.emit(DirectEditEvent::error(
				EditErrorCode::Version,
				&[info.version.as_deref().unwrap_or_default(), &info.name, &info.uid],
			));
			return Ok(None);
		}
		if info.is_proxy {
			self.emit(DirectEditEvent::error(EditErrorCode::Proxy, &[&info.name, &info.uid]));
			return Ok(None);
		}
		if let Some(owner) = &info.lock_owner {
			if owner != engine.remote.user_id() {
				info!("Doc {:?} was locked by {} on {:?}, edit not allowed", info.name, owner, info.lock_created);
				self.emit(DirectEditEvent::Locked {
					name: info.name.clone(),
					owner: owner.clone(),
					created: info.lock_created,
				});
				return Ok(None);
			}
		}
		if !info.permissions.is_empty() && !info.permissions.iter().any(|p| p == "Write") {
			info!("Doc {:?} is readonly for you, edit not allowed", info.name);
			self.emit(DirectEditEvent::Readonly { name: info.name.clone() });
			return Ok(None);
		}
		Ok(Some(info))
	}

	/// Staging file of an in-flight download
	fn tmp_file(&self, doc_id: &str, filename: &str) -> Result<PathBuf, TransferError> {
		let folder = self.folder.join(format!("{}{}", doc_id, DOWNLOAD_FOLDER_SUFFIX));
		std::fs::create_dir_all(&folder)?;
		Ok(folder.join(filename))
	}

	/// Fetch the blob into `file_out`; `None` when the download kept failing
	async fn download(
		&self,
		engine: &Engine,
		info: &NuxeoDocumentInfo,
		file_path: &Path,
		file_out: &Path,
		blob: &BlobInfo,
		xpath: &str,
		url: Option<&str>,
	) -> Result<Option<PathBuf>, TransferError> {
		// Never resume a previous attempt
		if let Err(e) = std::fs::remove_file(file_out) {
			if e.kind() != std::io::ErrorKind::NotFound {
				return Err(e.into());
			}
		}

		let url = match url {
			Some(url) => url,
			None => {
				self.control.check()?;
				engine.remote.get_blob(&info.uid, xpath, file_out).await?;
				return Ok(Some(file_out.to_path_buf()));
			}
		};

		let mut request = DownloadRequest::new(
			&quote_url(url),
			file_path,
			file_out,
			blob.digest.as_deref().unwrap_or_default(),
		)
		.engine(&engine.uid)
		.direct_edit();
		if let Some(algorithm) = &blob.digest_algorithm {
			request = request.algorithm(algorithm);
		}

		let downloader = self.downloader(engine);
		let stop = |_: &ActionSnapshot| self.control.check();
		let mut result = Ok(None);
		let attempts = self.options.max_errors.max(1);
		for attempt in 1..=attempts {
			match downloader.download(&request, Some(&stop)).await {
				Ok(path) => {
					result = Ok(Some(path));
					break;
				}
				Err(TransferError::CorruptedFile { .. }) => {
					self.emit(DirectEditEvent::error(EditErrorCode::CorruptedDownloadRetry, &[]));
					let _ = std::fs::remove_file(file_out);
					if attempt < attempts {
						let delay = self.options.corrupted_retry_delay_secs * attempt as u64;
						tokio::time::sleep(Duration::from_secs(delay)).await;
					}
				}
				Err(e) => {
					result = Err(e);
					break;
				}
			}
		}
		self.store.remove_transfer(Nature::Download, None, Some(file_path), false);
		if let Ok(None) = result {
			self.emit(DirectEditEvent::error(EditErrorCode::CorruptedDownloadFailure, &[]));
		}
		result
	}

	/// Download the document and lay out its folder; returns the live file
	pub async fn prepare_edit(
		&self,
		server_url: &str,
		doc_id: &str,
		user: Option<&str>,
		download_url: Option<&str>,
	) -> Result<Option<PathBuf>, TransferError> {
		let start = Instant::now();
		let engine = match self.get_engine(server_url, Some(doc_id), user) {
			Some(engine) => engine,
			None => return Ok(None),
		};
		let info = match self.get_info(&engine, doc_id).await? {
			Some(info) => info,
			None => return Ok(None),
		};

		let mut url = None;
		let mut url_xpath = None;
		if let Some(download_url) = download_url {
			url_xpath = xpath_from_url(download_url);
			let mut full = server_url.to_string();
			if !full.ends_with('/') {
				full.push('/');
			}
			full.push_str(download_url);
			url = Some(full);
		}
		let xpath = match url_xpath {
			Some(xpath) if xpath != "blobholder:0" => xpath,
			None if info.doc_type == "Note" => "note:note".to_string(),
			_ => "file:content".to_string(),
		};
		let blob = match info.get_blob(&xpath) {
			Some(blob) => blob,
			None => {
				warn!("No blob associated with xpath {:?} for file {:?}", xpath, info.path);
				return Ok(None);
			}
		};

		let filename = blob.name.clone();
		self.emit(DirectEditEvent::Starting { hostname: engine.hostname(), filename: filename.clone() });

		let dir_path = self.folder.join(safe_filename(&format!("{}_{}", doc_id, xpath)));
		std::fs::create_dir_all(&dir_path)?;
		info!("Editing {:?}", filename);
		let file_path = dir_path.join(&filename);
		let file_out = self.tmp_file(doc_id, &filename)?;

		let downloaded = self
			.download(&engine, &info, &file_path, &file_out, &blob, &xpath, url.as_deref())
			.await;
		let tmp_file = match downloaded {
			Ok(Some(tmp_file)) => tmp_file,
			Ok(None) => {
				warn!("Download failed");
				return Ok(None);
			}
			Err(TransferError::Connection { message }) => {
				warn!("Unable to perform Direct Edit: {}", message);
				return Ok(None);
			}
			Err(TransferError::NotFound { .. }) => {
				self.emit(DirectEditEvent::error(EditErrorCode::NotFound, &[doc_id, &engine.hostname()]));
				return Ok(None);
			}
			Err(e) => return Err(e),
		};

		metadata::set(&dir_path, DOC_UID_META, doc_id)?;
		metadata::set(&dir_path, SERVER_URL_META, server_url)?;
		if let Some(user) = user {
			metadata::set(&dir_path, USER_META, user)?;
		}
		metadata::set(&dir_path, XPATH_META, &xpath)?;
		if let Some(digest) = blob.digest.as_deref().filter(|d| !d.is_empty()) {
			metadata::set(&dir_path, DIGEST_META, digest)?;
			let algorithm = match &blob.digest_algorithm {
				Some(algorithm) => algorithm.clone(),
				None => DigestAlgorithm::from_digest(digest)
					.map(|a| a.name().to_string())
					.ok_or_else(|| TransferError::UnknownDigest(digest.to_string()))?,
			};
			metadata::set(&dir_path, DIGEST_ALGO_META, &algorithm)?;
		}
		metadata::set(&dir_path, FILENAME_META, &filename)?;

		safe_rename(&tmp_file, &file_path)?;
		let _ = std::fs::remove_dir(file_out.parent().unwrap_or(&self.folder));

		self.file_metrics.lock().unwrap_or_else(|e| e.into_inner()).insert(
			file_path.clone(),
			Map::from_iter([
				("action".to_string(), json!("directEdit")),
				("xpath".to_string(), json!(xpath)),
				("mimetype".to_string(), json!(blob.mimetype.as_deref().unwrap_or_else(|| guess_mime_type(&filename)))),
			]),
		);
		self.metrics.lock().unwrap_or_else(|e| e.into_inner()).edit_files += 1;
		self.emit(DirectEditEvent::OpenDocument {
			path: file_path.clone(),
			filename,
			elapsed: start.elapsed(),
		});
		Ok(Some(file_path))
	}

	/// Open a remote document for edition
	pub async fn edit(
		&self,
		server_url: &str,
		doc_id: &str,
		user: Option<&str>,
		download_url: Option<&str>,
	) -> Result<Option<PathBuf>, TransferError> {
		if !self.options.feature_direct_edit {
			self.emit(DirectEditEvent::error(EditErrorCode::NotEnabled, &[]));
			return Ok(None);
		}
		info!("Direct Editing doc {:?} on {:?}", doc_id, server_url);
		let path = self.prepare_edit(server_url, doc_id, user, download_url).await?;
		debug!("Direct Edit preparation returned file path {:?}", path);
		if let Some(path) = &path {
			self.open_file(path);
		}
		Ok(path)
	}

	fn open_file(&self, path: &Path) {
		let opener = match &self.opener {
			Some(opener) => opener,
			None => return,
		};
		let mut result = opener.open(path);
		if result == Err(OpenError::AccessDenied) {
			// The OS may still be scanning the fresh file
			debug!("Access denied while opening {}, trying again", path.display());
			result = opener.open(path);
		}
		match result {
			Ok(()) => {}
			Err(OpenError::NoAssociatedSoftware) => {
				let name = file_name(path);
				let mimetype = guess_mime_type(&name);
				self.emit(DirectEditEvent::error(EditErrorCode::NoAssociatedSoftware, &[&name, mimetype]));
			}
			Err(e) => warn!("Cannot open {}: {:?}", path.display(), e),
		}
	}

	// ========================================================================
	// FOLDER METADATA
	// ========================================================================

	fn extract_edit_info(&self, path: &Path) -> Result<EditDetails, TransferError> {
		let not_found = || TransferError::NotFound { message: path.display().to_string() };
		let dir = path.parent().ok_or_else(not_found)?;
		let server_url = metadata::get(dir, SERVER_URL_META).ok_or_else(not_found)?;
		let user = metadata::get(dir, USER_META);
		let engine = self.get_engine(&server_url, None, user.as_deref()).ok_or_else(not_found)?;
		let uid = metadata::get(dir, DOC_UID_META).ok_or_else(not_found)?;
		let digest = metadata::get(dir, DIGEST_META).ok_or_else(not_found)?;
		let digest_algorithm = metadata::get(dir, DIGEST_ALGO_META).ok_or_else(not_found)?;
		let details = EditDetails {
			uid,
			engine,
			digest_algorithm,
			digest,
			xpath: metadata::get(dir, XPATH_META),
			editing: metadata::get(dir, LOCK_META).as_deref() == Some("1"),
		};
		debug!("Direct Edit {:?}", details);
		Ok(details)
	}

	async fn local_digest(&self, path: &Path, algorithm: &str) -> Result<String, TransferError> {
		let algorithm = DigestAlgorithm::from_name(algorithm)
			.ok_or_else(|| TransferError::UnknownDigest(algorithm.to_string()))?;
		compute_digest(path, algorithm, self.options.file_buffer_size, |_| Ok(())).await
	}

	// ========================================================================
	// LOCK QUEUE
	// ========================================================================

	/// Lock `uid`; `false` when we already held the lock
	async fn lock_document(&self, remote: &dyn RemoteRepository, uid: &str) -> Result<bool, TransferError> {
		let error = match remote.lock(uid).await {
			Ok(()) => return Ok(true),
			Err(e) => e,
		};
		// Servers answer 409, or 500 before the conflict status existed
		if matches!(error.status(), Some(409) | Some(500)) {
			if let Some(owner) = locked_by(error.message()) {
				if owner == remote.user_id() {
					debug!("You already locked that document!");
					return Ok(false);
				}
				return Err(TransferError::DocumentAlreadyLocked(owner));
			}
		}
		Err(error.into())
	}

	async fn process_lock(&self, path: &Path, action: LockAction) -> Result<(), TransferError> {
		let details = self.extract_edit_info(path)?;
		let dir = path.parent().unwrap_or(&self.folder);
		let remote = &details.engine.remote;
		let name = file_name(path);

		if action == LockAction::Lock {
			self.lock_document(remote.as_ref(), &details.uid).await?;
			metadata::set(dir, LOCK_META, "1")?;
			if let Some(autolock) = &self.autolock {
				autolock.document_locked(&name);
			}
			return Ok(());
		}

		let mut headers = Headers::new();
		let metrics = self.file_metrics.lock().unwrap_or_else(|e| e.into_inner()).get(path).cloned();
		if let Some(metrics) = metrics {
			headers.insert(METRIC_REQUEST_HEADER.to_string(), Value::Object(metrics).to_string());
		}
		let purge = match remote.unlock(&details.uid, &headers).await {
			Ok(()) => false,
			Err(e) if e.is_not_found() => true,
			Err(e) if matches!(e.status(), Some(409) | Some(500)) && locked_by(e.message()).is_some() => true,
			Err(e) => return Err(e.into()),
		};

		if purge || action == LockAction::UnlockOrphan {
			debug!("Remove orphan: {}", dir.display());
			if let Some(autolock) = &self.autolock {
				autolock.orphan_unlocked(path);
			}
			self.purge(dir);
			return Ok(());
		}

		metadata::remove(dir, LOCK_META);
		if let Some(autolock) = &self.autolock {
			autolock.document_unlocked(&name);
		}
		Ok(())
	}

	async fn handle_lock_queue(&self) -> Result<(), TransferError> {
		let items: Vec<(PathBuf, LockAction)> =
			self.lock_queue.lock().unwrap_or_else(|e| e.into_inner()).drain(..).collect();
		let mut errors = Vec::new();

		for (path, action) in items {
			debug!("Handling Direct Edit lock queue: action={}, path={}", action, path.display());
			let uid = path.parent().and_then(|d| metadata::get(d, DOC_UID_META)).unwrap_or_default();
			let lock_error = || DirectEditEvent::LockError {
				action: action.to_string(),
				name: file_name(&path),
				uid: uid.clone(),
			};
			match self.process_lock(&path, action).await {
				Ok(()) => {}
				Err(TransferError::ThreadInterrupt) => return Err(TransferError::ThreadInterrupt),
				Err(TransferError::NotFound { .. }) => debug!("Document {} no more exists", path.display()),
				Err(TransferError::DocumentAlreadyLocked(owner)) => {
					warn!("Document {} already locked by {}", path.display(), owner);
					self.emit(lock_error());
				}
				Err(e) if e.is_transient() => {
					warn!("Connection error while trying to {} document {}: {}", action, path.display(), e);
					errors.push((path.clone(), action));
				}
				Err(e) => {
					error!("Cannot {} document {}: {}", action, path.display(), e);
					self.emit(lock_error());
				}
			}
		}

		let mut queue = self.lock_queue.lock().unwrap_or_else(|e| e.into_inner());
		queue.extend(errors);
		Ok(())
	}

	// ========================================================================
	// UPLOAD QUEUE
	// ========================================================================

	async fn upload_one(&self, path: &Path, details: &EditDetails) -> Result<(), TransferError> {
		let xpath = match &details.xpath {
			Some(xpath) => xpath.clone(),
			None => {
				info!("Direct Edit on {} has no xpath, defaulting to file:content", path.display());
				"file:content".to_string()
			}
		};
		let current = self.local_digest(path, &details.digest_algorithm).await?;
		if current.is_empty() || current == details.digest {
			return Ok(());
		}

		let start = Instant::now();
		debug!(
			"Local digest {} differs from the recorded {}, modification detected for {}",
			current,
			details.digest,
			path.display()
		);
		let remote = &details.engine.remote;

		if !details.editing {
			// Check the remote digest to prevent data loss
			let remote_info = remote.get_info(&details.uid).await?;
			if remote_info.is_version || remote_info.is_proxy {
				warn!(
					"Unable to process Direct Edit on {} ({}) because it is a version",
					remote_info.name, details.uid
				);
				return Ok(());
			}
			if let Some(remote_blob) = remote_info.get_blob(&xpath) {
				let remote_digest = remote_blob.digest.unwrap_or_default();
				if remote_digest != details.digest {
					debug!(
						"Remote digest {} differs from the recorded {}, conflict detected for {}",
						remote_digest,
						details.digest,
						path.display()
					);
					self.metrics.lock().unwrap_or_else(|e| e.into_inner()).conflicts += 1;
					self.emit(DirectEditEvent::Conflict {
						name: file_name(path),
						path: path.to_path_buf(),
						remote_digest,
					});
					return Ok(());
				}
			}
		}

		info!("Uploading file {}", path.display());
		let options = if xpath == "note:note" {
			UploadOptions::new("NuxeoDrive.AttachBlob").param("applyVersioningPolicy", true)
		} else {
			UploadOptions::new("Blob.AttachOnDocument").param("xpath", xpath.as_str()).param("void_op", true)
		};
		let options =
			options.param("document", details.uid.as_str()).engine(&details.engine.uid).direct_edit();
		let stop = |_: &ActionSnapshot| self.control.check();
		self.uploader(&details.engine).upload(path, &options, Some(&stop)).await?;

		if let Some(dir) = path.parent() {
			metadata::set(dir, DIGEST_META, &current)?;
		}
		let name = file_name(path);
		self.emit(DirectEditEvent::UploadCompleted { name: name.clone() });
		self.emit(DirectEditEvent::EditDocument { name, elapsed: start.elapsed() });

		let known = self.file_metrics.lock().unwrap_or_else(|e| e.into_inner()).contains_key(path);
		if !known {
			// Changes left behind by a previous run
			self.metrics.lock().unwrap_or_else(|e| e.into_inner()).recoveries += 1;
			self.emit(DirectEditEvent::Metrics {
				values: Map::from_iter([("directEditRecovery".to_string(), json!(1))]),
			});
		}
		Ok(())
	}

	/// Requeue a failed upload, or give up once it failed too often
	fn upload_failed(&self, path: &Path) {
		let errors = {
			let mut counters = self.upload_errors.lock().unwrap_or_else(|e| e.into_inner());
			let count = counters.entry(path.to_path_buf()).or_insert(0);
			*count += 1;
			*count
		};
		let retried = self.retrying.lock().unwrap_or_else(|e| e.into_inner()).remove(path);
		if errors < self.options.max_errors {
			match retried {
				Some(item) => self.error_queue.repush(item, true),
				None => self.error_queue.push(path.to_path_buf()),
			}
			return;
		}

		error!("Giving up the upload of {} after {} errors", path.display(), errors);
		self.upload_errors.lock().unwrap_or_else(|e| e.into_inner()).remove(path);
		self.emit(DirectEditEvent::error(EditErrorCode::UploadFailed, &[&file_name(path)]));
		let metrics = self.file_metrics.lock().unwrap_or_else(|e| e.into_inner()).remove(path);
		if let Some(values) = metrics {
			self.emit(DirectEditEvent::Metrics { values });
		}
	}

	async fn handle_upload_queue(&self) -> Result<(), TransferError> {
		loop {
			let path = match self.upload_queue.lock().unwrap_or_else(|e| e.into_inner()).pop_front() {
				Some(path) => path,
				None => break,
			};
			self.control.check()?;

			if path.is_dir() {
				// An OS may extract an edited archive in place
				debug!("Skipping Direct Edit queue path {} (folder)", path.display());
				continue;
			}
			debug!("Handling Direct Edit queue path {}", path.display());

			let details = match self.extract_edit_info(&path) {
				Ok(details) => details,
				Err(TransferError::NotFound { .. }) => {
					debug!("No Direct Edit details for {}", path.display());
					continue;
				}
				Err(e) => return Err(e),
			};

			match self.upload_one(&path, &details).await {
				Ok(()) => {
					self.upload_errors.lock().unwrap_or_else(|e| e.into_inner()).remove(&path);
					self.retrying.lock().unwrap_or_else(|e| e.into_inner()).remove(&path);
				}
				Err(TransferError::ThreadInterrupt) => return Err(TransferError::ThreadInterrupt),
				Err(TransferError::NotFound { .. }) => debug!("{} not found on the server", path.display()),
				Err(TransferError::Forbidden { .. }) => {
					let engine = &details.engine;
					warn!(
						"Upload queue error: access to the document {} on server {:?} is forbidden for user {:?}",
						path.display(),
						engine.hostname(),
						engine.remote.user_id()
					);
					self.emit(DirectEditEvent::Forbidden {
						uid: path.display().to_string(),
						hostname: engine.hostname(),
						user: engine.remote.user_id().to_string(),
					});
				}
				Err(e) if is_version_error(&e) => {
					warn!("Unable to process Direct Edit on {} ({:?}) because it is a version", path.display(), details);
				}
				Err(e) => {
					if e.is_transient() {
						warn!("Connection error while uploading {}: {}", path.display(), e);
					} else {
						error!("Direct Edit unhandled error for {}: {}", path.display(), e);
					}
					self.upload_failed(&path);
				}
			}
		}
		Ok(())
	}

	// ========================================================================
	// WATCHDOG
	// ========================================================================

	/// Route one filesystem event of the Direct-Edit folder
	pub fn handle_watchdog_event(&self, evt: &FsEvent) -> Result<(), TransferError> {
		self.metrics.lock().unwrap_or_else(|e| e.into_inner()).fs_events += 1;
		let mut src_path = evt.src_path.clone();
		if src_path.is_dir() {
			return Ok(());
		}
		if is_temp_file(&file_name(&src_path)) {
			return Ok(());
		}
		info!("Handling watchdog event [{:?}] on {}", evt.kind, evt.src_path.display());

		if evt.kind == FsEventKind::Moved {
			if let Some(dest) = &evt.dest_path {
				src_path = dest.clone();
			}
		}
		let dir = match src_path.parent() {
			Some(dir) => dir,
			None => return Ok(()),
		};
		let name = match metadata::get(dir, FILENAME_META) {
			Some(name) => name,
			None => return Ok(()),
		};
		let editing = metadata::get(dir, LOCK_META).as_deref() == Some("1");
		let event_name = file_name(&src_path);

		if name != event_name {
			if is_lock_file(&event_name) {
				if evt.kind == FsEventKind::Created && self.use_autolock() && !editing {
					// Some editors only write their lock file until the first save
					if let Some(autolock) = &self.autolock {
						autolock.set_autolock(&dir.join(&name));
					}
				} else if evt.kind == FsEventKind::Deleted {
					metadata::remove(dir, LOCK_META);
				}
			}
			return Ok(());
		}

		if self.use_autolock() && !editing {
			if let Some(autolock) = &self.autolock {
				autolock.set_autolock(&src_path);
			}
		}
		if evt.kind != FsEventKind::Deleted {
			self.queue_upload(src_path);
		}
		Ok(())
	}

	// ========================================================================
	// CLEANUP
	// ========================================================================

	fn purge(&self, dir: &Path) {
		debug!("Removing {}", dir.display());
		let _ = std::fs::remove_dir_all(dir);
	}

	/// Housekeeping of the Direct-Edit folder left by a previous run
	pub async fn cleanup(&self) -> Result<(), TransferError> {
		if !self.folder.exists() {
			std::fs::create_dir_all(&self.folder)?;
			return Ok(());
		}
		info!("Cleanup Direct Edit folder");

		for child in metadata::children(&self.folder)? {
			if !child.is_dir() {
				debug!("Skipping clean-up of {} (not a folder)", child.display());
				continue;
			}
			if !is_valid_folder_name(&file_name(&child)) {
				debug!("Skipping clean-up of {} (invalid folder name)", child.display());
				continue;
			}
			let children = match metadata::children(&child) {
				Ok(children) => children,
				Err(e) => {
					warn!("Cannot list {}: {}", child.display(), e);
					continue;
				}
			};
			if children.is_empty() {
				self.purge(&child);
				continue;
			}
			let file = match metadata::get(&child, FILENAME_META) {
				Some(name) => child.join(name),
				None => {
					self.purge(&child);
					continue;
				}
			};
			if !children.contains(&file) {
				debug!("Leaving {} alone (edited file is gone)", child.display());
				continue;
			}
			let details = match self.extract_edit_info(&file) {
				Ok(details) => details,
				Err(TransferError::NotFound { .. }) => {
					// Engine is not known anymore
					self.purge(&child);
					continue;
				}
				Err(e) => {
					error!("Unhandled clean-up error on {}: {}", child.display(), e);
					continue;
				}
			};
			match self.local_digest(&file, &details.digest_algorithm).await {
				Ok(digest) if digest != details.digest => {
					warn!("{} has been modified and not synchronized, add to upload queue", file.display());
					self.queue_upload(file);
					continue;
				}
				Ok(_) => {}
				Err(e) => {
					error!("Unhandled clean-up error on {}: {}", file.display(), e);
					continue;
				}
			}
			if children.len() == 1 && !details.editing {
				self.purge(&child);
			}
		}
		Ok(())
	}

	// ========================================================================
	// MAIN LOOP
	// ========================================================================

	/// One turn of the worker: every queue is drained once
	pub async fn handle_queues(&self) -> Result<(), TransferError> {
		self.handle_lock_queue().await?;

		for item in self.error_queue.get() {
			self.queue_upload(item.payload.clone());
			self.retrying.lock().unwrap_or_else(|e| e.into_inner()).insert(item.payload.clone(), item);
		}

		self.handle_upload_queue().await?;

		let events: Vec<FsEvent> = {
			let mut rx = self.watchdog_rx.lock().unwrap_or_else(|e| e.into_inner());
			std::iter::from_fn(|| rx.try_recv().ok()).collect()
		};
		for evt in events {
			match self.handle_watchdog_event(&evt) {
				Ok(()) => {}
				Err(TransferError::ThreadInterrupt) => return Err(TransferError::ThreadInterrupt),
				Err(e) => error!("Watchdog error: {}", e),
			}
		}
		Ok(())
	}

	fn setup_watchdog(&self) -> Result<(), TransferError> {
		let mut watcher = self.watcher.lock().unwrap_or_else(|e| e.into_inner());
		if let Some(watcher) = watcher.as_mut() {
			watcher.watch(&self.folder, self.watchdog_tx.clone())?;
		}
		Ok(())
	}

	fn stop_watchdog(&self) {
		let mut watcher = self.watcher.lock().unwrap_or_else(|e| e.into_inner());
		if let Some(watcher) = watcher.as_mut() {
			watcher.unwatch();
		}
	}

	async fn execute(&self) -> Result<(), TransferError> {
		self.cleanup().await?;
		self.setup_watchdog()?;
		loop {
			self.control.interact().await?;
			match self.handle_queues().await {
				Ok(()) | Err(TransferError::NotFound { .. }) => {}
				Err(TransferError::ThreadInterrupt) => return Err(TransferError::ThreadInterrupt),
				Err(e) => error!("Unhandled Direct Edit error: {}", e),
			}
			tokio::time::sleep(LOOP_DELAY).await;
		}
	}

	/// Run the worker until [`DirectEdit::stop`]
	pub async fn run(self: Arc<Self>) -> Result<(), TransferError> {
		self.control.start();
		let result = run_as_worker(new_worker_id(), self.execute()).await;
		self.stop_watchdog();
		match result {
			Err(TransferError::ThreadInterrupt) => {
				info!("Direct Edit worker stopped");
				Ok(())
			}
			other => other,
		}
	}
}


// vim: ts=4
