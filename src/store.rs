//! Durable transfer store
//!
//! Downloads, Uploads, Sessions and Direct-Transfer doc pairs live in a redb
//! database. Rows are JSON documents keyed by a monotone numeric UID.
//! Writes are serialized by a process-wide lock; reads use their own
//! snapshot transactions and never block writers.
//!
//! Status and progress mutators never fail: errors are logged and the call
//! degrades to a no-op, so a flaky disk cannot take a transfer down.

use chrono::Utc;
use redb::{ReadableDatabase, ReadableTable, TableDefinition, WriteTransaction};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use crate::error::StoreError;
use crate::events::{EventSink, StoreEvent};
use crate::logging::*;
use crate::types::{Batch, DocPair, Download, Nature, Session, Transfer, TransferStatus, Upload};

type RowTable = TableDefinition<'static, u64, &'static [u8]>;

/// Key: download UID, Value: JSON Download
const DOWNLOADS: RowTable = TableDefinition::new("downloads");

/// Key: upload UID, Value: JSON Upload (batch without blobs)
const UPLOADS: RowTable = TableDefinition::new("uploads");

/// Key: session UID, Value: JSON Session
const SESSIONS: RowTable = TableDefinition::new("sessions");

/// Key: (session UID, item UID), Value: arbitrary JSON
const SESSION_ITEMS: TableDefinition<(u64, u64), &[u8]> = TableDefinition::new("session_items");

/// Key: doc pair id, Value: JSON DocPair
const DOC_PAIRS: RowTable = TableDefinition::new("doc_pairs");

/// Key: sequence name, Value: last assigned UID
const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("sequences");

/// How to find an upload row
#[derive(Debug, Clone, Copy)]
pub enum UploadLookup<'a> {
	Uid(u64),
	DocPair(u64),
	Path(&'a Path),
}

fn table_for(nature: Nature) -> RowTable {
	match nature {
		Nature::Download => DOWNLOADS,
		Nature::Upload => UPLOADS,
	}
}

fn next_uid(txn: &WriteTransaction, name: &str) -> Result<u64, StoreError> {
	let mut table = txn.open_table(SEQUENCES)?;
	let current = table.get(name)?.map(|v| v.value()).unwrap_or(0);
	let next = current + 1;
	table.insert(name, next)?;
	Ok(next)
}

fn get_row<T: DeserializeOwned>(
	txn: &WriteTransaction,
	def: RowTable,
	uid: u64,
) -> Result<Option<T>, StoreError> {
	let table = txn.open_table(def)?;
	let raw = table.get(uid)?.map(|v| v.value().to_vec());
	match raw {
		Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
		None => Ok(None),
	}
}

fn put_row<T: Serialize>(
	txn: &WriteTransaction,
	def: RowTable,
	uid: u64,
	row: &T,
) -> Result<(), StoreError> {
	let mut table = txn.open_table(def)?;
	let bytes = serde_json::to_vec(row)?;
	table.insert(uid, bytes.as_slice())?;
	Ok(())
}

fn delete_row(txn: &WriteTransaction, def: RowTable, uid: u64) -> Result<bool, StoreError> {
	let mut table = txn.open_table(def)?;
	let removed = table.remove(uid)?.is_some();
	Ok(removed)
}

fn all_rows<T: DeserializeOwned>(
	txn: &WriteTransaction,
	def: RowTable,
) -> Result<Vec<(u64, T)>, StoreError> {
	let table = txn.open_table(def)?;
	let mut rows = Vec::new();
	for entry in table.iter()? {
		let (key, value) = entry?;
		match serde_json::from_slice::<T>(value.value()) {
			Ok(row) => rows.push((key.value(), row)),
			Err(e) => warn!("Skipping unreadable row {}: {}", key.value(), e),
		}
	}
	Ok(rows)
}

/// Read-modify-write of a JSON row; `f` returns whether anything changed
fn modify_row(
	txn: &WriteTransaction,
	def: RowTable,
	uid: u64,
	f: impl FnOnce(&mut Map<String, Value>) -> bool,
) -> Result<bool, StoreError> {
	let mut row: Map<String, Value> = match get_row(txn, def, uid)? {
		Some(row) => row,
		None => return Ok(false),
	};
	if !f(&mut row) {
		return Ok(false);
	}
	put_row(txn, def, uid, &row)?;
	Ok(true)
}

fn row_status(row: &Map<String, Value>) -> TransferStatus {
	let raw = row.get("status").and_then(Value::as_u64).unwrap_or(0);
	TransferStatus::from(raw as u8)
}

fn set_status(row: &mut Map<String, Value>, status: TransferStatus) {
	row.insert("status".to_string(), json!(u8::from(status)));
}

fn row_is_direct_transfer(row: &Map<String, Value>) -> bool {
	row.get("is_direct_transfer").and_then(Value::as_bool).unwrap_or(false)
}

/// Only ever move progress forward, within [0, 100]
fn advance_progress(row: &mut Map<String, Value>, progress: f64) {
	let current = row.get("progress").and_then(Value::as_f64).unwrap_or(0.0);
	let value = progress.clamp(0.0, 100.0).max(current);
	row.insert("progress".to_string(), json!(value));
}

fn transfer_event(nature: Nature, uid: u64, is_direct_transfer: bool) -> StoreEvent {
	if is_direct_transfer {
		StoreEvent::DirectTransferUpdated { uid }
	} else {
		StoreEvent::TransferUpdated { nature, uid }
	}
}

fn persistable(upload: &Upload) -> Upload {
	Upload { batch: upload.batch.without_blobs(), ..upload.clone() }
}

/// Durable store of transfers and sessions
pub struct TransferStore {
	db: redb::Database,
	write_lock: Mutex<()>,
	sinks: RwLock<Vec<Arc<dyn EventSink>>>,
}

impl TransferStore {
	/// Open or create the store
	pub fn open(path: &Path) -> Result<Self, StoreError> {
		if let Some(parent) = path.parent() {
			if !parent.as_os_str().is_empty() {
				std::fs::create_dir_all(parent)
					.map_err(|e| StoreError::Database { message: e.to_string() })?;
			}
		}
		let db = redb::Database::create(path)?;
		{
			let txn = db.begin_write()?;
			let _ = txn.open_table(DOWNLOADS)?;
			let _ = txn.open_table(UPLOADS)?;
			let _ = txn.open_table(SESSIONS)?;
			let _ = txn.open_table(SESSION_ITEMS)?;
			let _ = txn.open_table(DOC_PAIRS)?;
			let _ = txn.open_table(SEQUENCES)?;
			txn.commit()?;
		}
		Ok(TransferStore { db, write_lock: Mutex::new(()), sinks: RwLock::new(Vec::new()) })
	}

	/// Register an observer of status and counter changes
	pub fn subscribe(&self, sink: Arc<dyn EventSink>) {
		self.sinks.write().unwrap_or_else(|e| e.into_inner()).push(sink);
	}

	fn emit(&self, event: StoreEvent) {
		let sinks = self.sinks.read().unwrap_or_else(|e| e.into_inner()).clone();
		for sink in sinks {
			sink.on_event(event.clone());
		}
	}

	fn write<R>(
		&self,
		f: impl FnOnce(&WriteTransaction) -> Result<R, StoreError>,
	) -> Result<R, StoreError> {
		let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
		let txn = self.db.begin_write()?;
		let result = f(&txn)?;
		txn.commit()?;
		Ok(result)
	}

	fn rows<T: DeserializeOwned>(&self, def: RowTable) -> Result<Vec<T>, StoreError> {
		let txn = self.db.begin_read()?;
		let table = txn.open_table(def)?;
		let mut rows = Vec::new();
		for entry in table.iter()? {
			let (key, value) = entry?;
			match serde_json::from_slice::<T>(value.value()) {
				Ok(row) => rows.push(row),
				Err(e) => warn!("Skipping unreadable row {}: {}", key.value(), e),
			}
		}
		Ok(rows)
	}

	fn row<T: DeserializeOwned>(&self, def: RowTable, uid: u64) -> Result<Option<T>, StoreError> {
		let txn = self.db.begin_read()?;
		let table = txn.open_table(def)?;
		let result = match table.get(uid)? {
			Some(value) => Some(serde_json::from_slice(value.value())?),
			None => None,
		};
		Ok(result)
	}

	// ========================================================================
	// DOWNLOADS
	// ========================================================================

	/// Insert a download and assign its UID; replaces any row for the same path
	pub fn save_download(&self, download: &mut Download) -> Result<u64, StoreError> {
		self.write(|txn| {
			let existing: Vec<(u64, Download)> = all_rows(txn, DOWNLOADS)?;
			for (uid, row) in existing {
				if row.path == download.path {
					debug!("Replacing stale download {} for {}", uid, row.path.display());
					delete_row(txn, DOWNLOADS, uid)?;
				}
			}
			let uid = next_uid(txn, "downloads")?;
			download.uid = Some(uid);
			put_row(txn, DOWNLOADS, uid, &*download)?;
			Ok(uid)
		})
	}

	pub fn get_download(&self, path: &Path) -> Result<Option<Download>, StoreError> {
		Ok(self.rows::<Download>(DOWNLOADS)?.into_iter().find(|d| d.path == path))
	}

	pub fn get_download_by_uid(&self, uid: u64) -> Result<Option<Download>, StoreError> {
		self.row(DOWNLOADS, uid)
	}

	pub fn get_downloads(&self) -> Result<Vec<Download>, StoreError> {
		self.rows(DOWNLOADS)
	}

	pub fn get_downloads_with_status(
		&self,
		status: TransferStatus,
	) -> Result<Vec<Download>, StoreError> {
		Ok(self.get_downloads()?.into_iter().filter(|d| d.status == status).collect())
	}

	// ========================================================================
	// UPLOADS
	// ========================================================================

	fn insert_upload(&self, upload: &mut Upload, direct_transfer: bool) -> Result<u64, StoreError> {
		upload.is_direct_transfer = direct_transfer;
		self.write(|txn| {
			if direct_transfer {
				upload.status = Self::dt_upload_status(txn, upload)?;
			}
			let existing: Vec<(u64, Upload)> = all_rows(txn, UPLOADS)?;
			for (uid, row) in existing {
				if row.path == upload.path && row.is_direct_transfer == direct_transfer {
					debug!("Replacing stale upload {} for {}", uid, row.path.display());
					delete_row(txn, UPLOADS, uid)?;
				}
			}
			let uid = next_uid(txn, "uploads")?;
			upload.uid = Some(uid);
			put_row(txn, UPLOADS, uid, &persistable(upload))?;
			Ok(uid)
		})
	}

	/// A Direct-Transfer upload inherits the status of its session, and is
	/// cancelled right away when its doc pair is already gone
	fn dt_upload_status(
		txn: &WriteTransaction,
		upload: &Upload,
	) -> Result<TransferStatus, StoreError> {
		let pair: Option<DocPair> = match upload.doc_pair {
			Some(id) => get_row(txn, DOC_PAIRS, id)?,
			None => None,
		};
		let pair = match pair {
			Some(pair) => pair,
			None => return Ok(TransferStatus::Cancelled),
		};
		let session: Option<Session> = match pair.session {
			Some(uid) => get_row(txn, SESSIONS, uid)?,
			None => return Ok(upload.status),
		};
		Ok(match session {
			Some(session) => session.status,
			None => TransferStatus::Cancelled,
		})
	}

	/// Insert a sync upload and assign its UID; the batch is stored without blobs
	pub fn save_upload(&self, upload: &mut Upload) -> Result<u64, StoreError> {
		self.insert_upload(upload, false)
	}

	/// Insert a Direct-Transfer upload and assign its UID
	pub fn save_dt_upload(&self, upload: &mut Upload) -> Result<u64, StoreError> {
		self.insert_upload(upload, true)
	}

	/// Rewrite the batch descriptor of an existing upload
	pub fn update_upload(&self, upload: &Upload) {
		let uid = match upload.uid {
			Some(uid) => uid,
			None => return,
		};
		let batch = match serde_json::to_value(upload.batch.without_blobs()) {
			Ok(batch) => batch,
			Err(e) => {
				warn!("Cannot serialize batch of upload {}: {}", uid, e);
				return;
			}
		};
		let result = self.write(|txn| {
			modify_row(txn, UPLOADS, uid, |row| {
				row.insert("batch".to_string(), batch);
				true
			})
		});
		if let Err(e) = result {
			warn!("Cannot update upload {}: {}", uid, e);
		}
	}

	fn find_upload(&self, lookup: UploadLookup<'_>, direct_transfer: bool) -> Result<Option<Upload>, StoreError> {
		if let UploadLookup::Uid(uid) = lookup {
			let row: Option<Upload> = self.row(UPLOADS, uid)?;
			return Ok(row.filter(|u| u.is_direct_transfer == direct_transfer));
		}
		let rows: Vec<Upload> = self.rows(UPLOADS)?;
		Ok(rows.into_iter().filter(|u| u.is_direct_transfer == direct_transfer).find(|u| {
			match lookup {
				UploadLookup::DocPair(id) => u.doc_pair == Some(id),
				UploadLookup::Path(path) => u.path == path,
				UploadLookup::Uid(_) => false,
			}
		}))
	}

	pub fn get_upload(&self, lookup: UploadLookup<'_>) -> Result<Option<Upload>, StoreError> {
		self.find_upload(lookup, false)
	}

	pub fn get_dt_upload(&self, lookup: UploadLookup<'_>) -> Result<Option<Upload>, StoreError> {
		self.find_upload(lookup, true)
	}

	pub fn get_uploads(&self) -> Result<Vec<Upload>, StoreError> {
		Ok(self.rows::<Upload>(UPLOADS)?.into_iter().filter(|u| !u.is_direct_transfer).collect())
	}

	pub fn get_dt_uploads(&self) -> Result<Vec<Upload>, StoreError> {
		Ok(self.rows::<Upload>(UPLOADS)?.into_iter().filter(|u| u.is_direct_transfer).collect())
	}

	pub fn get_uploads_with_status(&self, status: TransferStatus) -> Result<Vec<Upload>, StoreError> {
		Ok(self.get_uploads()?.into_iter().filter(|u| u.status == status).collect())
	}

	pub fn get_dt_uploads_with_status(
		&self,
		status: TransferStatus,
	) -> Result<Vec<Upload>, StoreError> {
		Ok(self.get_dt_uploads()?.into_iter().filter(|u| u.status == status).collect())
	}

	// ========================================================================
	// TRANSFER STATUS
	// ========================================================================

	/// Persist the progress of `transfer`
	pub fn set_transfer_progress<T: Transfer>(&self, transfer: &T) {
		let uid = match transfer.uid() {
			Some(uid) => uid,
			None => return,
		};
		let progress = transfer.progress();
		let result = self.write(|txn| {
			modify_row(txn, table_for(T::NATURE), uid, |row| {
				advance_progress(row, progress);
				true
			})
		});
		if let Err(e) = result {
			warn!("Cannot save progress of {} {}: {}", T::NATURE, uid, e);
		}
	}

	/// Persist the status of `transfer` and notify subscribers
	pub fn set_transfer_status<T: Transfer>(&self, transfer: &T) {
		if let Some(uid) = transfer.uid() {
			self.update_status(T::NATURE, uid, transfer.is_direct_transfer(), |row| {
				set_status(row, transfer.status());
				true
			});
		}
	}

	fn update_status(
		&self,
		nature: Nature,
		uid: u64,
		is_direct_transfer: bool,
		f: impl FnOnce(&mut Map<String, Value>) -> bool,
	) {
		let result = self.write(|txn| modify_row(txn, table_for(nature), uid, f));
		match result {
			Ok(true) => self.emit(transfer_event(nature, uid, is_direct_transfer)),
			Ok(false) => debug!("No {} {} to update", nature, uid),
			Err(e) => warn!("Cannot update status of {} {}: {}", nature, uid, e),
		}
	}

	/// Set status to Paused and record progress in one write
	pub fn pause_transfer(&self, nature: Nature, uid: u64, progress: f64, is_direct_transfer: bool) {
		self.update_status(nature, uid, is_direct_transfer, |row| {
			set_status(row, TransferStatus::Paused);
			advance_progress(row, progress);
			true
		});
	}

	pub fn resume_transfer(&self, nature: Nature, uid: u64, is_direct_transfer: bool) {
		self.update_status(nature, uid, is_direct_transfer, |row| {
			set_status(row, TransferStatus::Ongoing);
			true
		});
	}

	/// User-facing cancel; the running pipeline notices at its next chunk
	pub fn cancel_transfer(&self, nature: Nature, uid: u64, is_direct_transfer: bool) {
		self.update_status(nature, uid, is_direct_transfer, |row| {
			set_status(row, TransferStatus::Cancelled);
			true
		});
	}

	/// Flip every Ongoing transfer to Suspended (engine shutdown)
	pub fn suspend_transfers(&self) {
		let result = self.write(|txn| {
			let mut changed = Vec::new();
			for nature in [Nature::Download, Nature::Upload] {
				let rows: Vec<(u64, Map<String, Value>)> = all_rows(txn, table_for(nature))?;
				for (uid, mut row) in rows {
					if row_status(&row) == TransferStatus::Ongoing {
						set_status(&mut row, TransferStatus::Suspended);
						put_row(txn, table_for(nature), uid, &row)?;
						changed.push(transfer_event(nature, uid, row_is_direct_transfer(&row)));
					}
				}
			}
			Ok(changed)
		});
		match result {
			Ok(events) => {
				for event in events {
					self.emit(event);
				}
			}
			Err(e) => warn!("Cannot suspend transfers: {}", e),
		}
	}

	/// Rebind a transfer to another engine/doc pair
	pub fn set_transfer_doc(&self, nature: Nature, uid: u64, engine: &str, doc_pair: u64) {
		let result = self.write(|txn| {
			modify_row(txn, table_for(nature), uid, |row| {
				row.insert("engine".to_string(), json!(engine));
				row.insert("doc_pair".to_string(), json!(doc_pair));
				true
			})
		});
		if let Err(e) = result {
			warn!("Cannot rebind {} {}: {}", nature, uid, e);
		}
	}

	/// Delete a transfer by doc pair (preferred) or path
	pub fn remove_transfer(
		&self,
		nature: Nature,
		doc_pair: Option<u64>,
		path: Option<&Path>,
		is_direct_transfer: bool,
	) {
		if doc_pair.is_none() && path.is_none() {
			return;
		}
		let def = table_for(nature);
		let result = self.write(|txn| {
			let rows: Vec<(u64, Map<String, Value>)> = all_rows(txn, def)?;
			let mut removed = 0;
			for (uid, row) in rows {
				if nature == Nature::Upload && row_is_direct_transfer(&row) != is_direct_transfer {
					continue;
				}
				let hit = match doc_pair {
					Some(id) => row.get("doc_pair").and_then(Value::as_u64) == Some(id),
					None => path.map_or(false, |p| {
						row.get("path").and_then(Value::as_str).map(Path::new) == Some(p)
					}),
				};
				if hit && delete_row(txn, def, uid)? {
					removed += 1;
				}
			}
			Ok(removed)
		});
		match result {
			Ok(0) => debug!("No {} to remove", nature),
			Ok(n) => debug!("Removed {} {} row(s)", n, nature),
			Err(e) => warn!("Cannot remove {}: {}", nature, e),
		}
	}

	// ========================================================================
	// SESSIONS
	// ========================================================================

	pub fn create_session(
		&self,
		remote_path: &str,
		remote_ref: &str,
		total: u64,
		engine: &str,
		description: &str,
	) -> Result<u64, StoreError> {
		self.write(|txn| {
			let uid = next_uid(txn, "sessions")?;
			let session = Session {
				uid,
				status: TransferStatus::Ongoing,
				remote_path: remote_path.to_string(),
				remote_ref: remote_ref.to_string(),
				uploaded_items: 0,
				total_items: total,
				planned_items: total,
				engine: engine.to_string(),
				created_on: Utc::now(),
				completed_on: None,
				description: description.to_string(),
			};
			put_row(txn, SESSIONS, uid, &session)?;
			Ok(uid)
		})
	}

	pub fn get_session(&self, uid: u64) -> Result<Option<Session>, StoreError> {
		self.row(SESSIONS, uid)
	}

	/// Ongoing and paused sessions
	pub fn get_active_sessions(&self) -> Result<Vec<Session>, StoreError> {
		let mut sessions: Vec<Session> = self
			.rows::<Session>(SESSIONS)?
			.into_iter()
			.filter(|s| matches!(s.status, TransferStatus::Ongoing | TransferStatus::Paused))
			.collect();
		sessions.sort_by_key(|s| s.created_on);
		Ok(sessions)
	}

	/// Done and cancelled sessions, newest first
	pub fn get_completed_sessions(&self, limit: usize) -> Result<Vec<Session>, StoreError> {
		let mut sessions: Vec<Session> =
			self.rows::<Session>(SESSIONS)?.into_iter().filter(Session::is_terminal).collect();
		sessions.sort_by(|a, b| b.completed_on.cmp(&a.completed_on));
		sessions.truncate(limit);
		Ok(sessions)
	}

	fn modify_session(
		&self,
		uid: u64,
		f: impl FnOnce(&WriteTransaction, &mut Session) -> Result<bool, StoreError>,
	) -> Option<Session> {
		let result = self.write(|txn| {
			let mut session: Session = match get_row(txn, SESSIONS, uid)? {
				Some(session) => session,
				None => return Ok(None),
			};
			if !f(txn, &mut session)? {
				return Ok(None);
			}
			put_row(txn, SESSIONS, uid, &session)?;
			Ok(Some(session))
		});
		match result {
			Ok(Some(session)) => {
				self.emit(StoreEvent::SessionUpdated { uid, terminal: session.is_terminal() });
				Some(session)
			}
			Ok(None) => None,
			Err(e) => {
				warn!("Cannot update session {}: {}", uid, e);
				None
			}
		}
	}

	/// Count one more uploaded item; the session is Done once all are uploaded
	pub fn update_session(&self, uid: u64) -> Option<Session> {
		self.modify_session(uid, |_, session| {
			if session.uploaded_items >= session.total_items {
				return Ok(false);
			}
			session.uploaded_items += 1;
			if session.uploaded_items == session.total_items {
				session.status = TransferStatus::Done;
				session.completed_on = Some(Utc::now());
			}
			Ok(true)
		})
	}

	/// Forget one pending item of the session
	///
	/// Returns `None` without touching the row when every remaining item is
	/// already uploaded, so `uploaded_items` never exceeds `total_items`.
	pub fn decrease_session_counts(&self, uid: u64) -> Option<Session> {
		self.modify_session(uid, |_, session| {
			// Nothing pending: decrementing would break uploaded <= total
			if session.total_items == 0 || session.total_items <= session.uploaded_items {
				return Ok(false);
			}
			session.total_items -= 1;
			session.planned_items = session.planned_items.saturating_sub(1);
			if session.uploaded_items == session.total_items {
				session.status = if session.total_items > 0 {
					TransferStatus::Done
				} else {
					TransferStatus::Cancelled
				};
				session.completed_on = Some(Utc::now());
			}
			Ok(true)
		})
	}

	pub fn change_session_status(&self, uid: u64, status: TransferStatus) -> Option<Session> {
		self.modify_session(uid, |_, session| {
			session.status = status;
			if session.is_terminal() && session.completed_on.is_none() {
				session.completed_on = Some(Utc::now());
			}
			Ok(true)
		})
	}

	fn session_upload_uids(
		txn: &WriteTransaction,
		session: u64,
	) -> Result<Vec<(u64, Map<String, Value>)>, StoreError> {
		let pairs: Vec<(u64, DocPair)> = all_rows(txn, DOC_PAIRS)?;
		let ids: HashSet<u64> =
			pairs.into_iter().filter(|(_, p)| p.session == Some(session)).map(|(id, _)| id).collect();
		let uploads: Vec<(u64, Map<String, Value>)> = all_rows(txn, UPLOADS)?;
		Ok(uploads
			.into_iter()
			.filter(|(_, row)| row_is_direct_transfer(row))
			.filter(|(_, row)| {
				row.get("doc_pair").and_then(Value::as_u64).map_or(false, |id| ids.contains(&id))
			})
			.collect())
	}

	fn flip_session_uploads(&self, uid: u64, from: TransferStatus, to: TransferStatus) -> Option<Session> {
		let mut flipped = Vec::new();
		let session = self.modify_session(uid, |txn, session| {
			for (upload_uid, mut row) in Self::session_upload_uids(txn, uid)? {
				if row_status(&row) == from {
					set_status(&mut row, to);
					put_row(txn, UPLOADS, upload_uid, &row)?;
					flipped.push(upload_uid);
				}
			}
			session.status = to;
			Ok(true)
		});
		for upload_uid in flipped {
			self.emit(StoreEvent::DirectTransferUpdated { uid: upload_uid });
		}
		session
	}

	/// Pause the session and its ongoing uploads
	pub fn pause_session(&self, uid: u64) -> Option<Session> {
		self.flip_session_uploads(uid, TransferStatus::Ongoing, TransferStatus::Paused)
	}

	/// Resume the session and its paused uploads
	pub fn resume_session(&self, uid: u64) -> Option<Session> {
		self.flip_session_uploads(uid, TransferStatus::Paused, TransferStatus::Ongoing)
	}

	/// Cancel the session: its uploads and doc pairs are deleted and the
	/// batches they used are returned so callers can drop them remotely
	pub fn cancel_session(&self, uid: u64) -> Vec<Batch> {
		let mut batches = Vec::new();
		self.modify_session(uid, |txn, session| {
			for (upload_uid, row) in Self::session_upload_uids(txn, uid)? {
				if let Some(batch) = row.get("batch") {
					if let Ok(batch) = serde_json::from_value::<Batch>(batch.clone()) {
						batches.push(batch);
					}
				}
				delete_row(txn, UPLOADS, upload_uid)?;
			}
			let pairs: Vec<(u64, DocPair)> = all_rows(txn, DOC_PAIRS)?;
			for (id, pair) in pairs {
				if pair.session == Some(uid) {
					delete_row(txn, DOC_PAIRS, id)?;
				}
			}
			session.total_items = session.uploaded_items;
			session.planned_items = session.uploaded_items;
			session.status = TransferStatus::Cancelled;
			session.completed_on = Some(Utc::now());
			Ok(true)
		});
		batches
	}

	/// Attach an arbitrary description of one item to a session
	pub fn save_session_item(&self, session: u64, item: &Value) -> Result<u64, StoreError> {
		self.write(|txn| {
			let uid = next_uid(txn, "session_items")?;
			let mut table = txn.open_table(SESSION_ITEMS)?;
			let bytes = serde_json::to_vec(item)?;
			table.insert((session, uid), bytes.as_slice())?;
			Ok(uid)
		})
	}

	pub fn get_session_items(&self, session: u64) -> Result<Vec<Value>, StoreError> {
		let txn = self.db.begin_read()?;
		let table = txn.open_table(SESSION_ITEMS)?;
		let mut items = Vec::new();
		for entry in table.range((session, 0)..=(session, u64::MAX))? {
			let (_, value) = entry?;
			items.push(serde_json::from_slice(value.value())?);
		}
		Ok(items)
	}

	// ========================================================================
	// DOC PAIRS
	// ========================================================================

	/// Record an item planned for Direct-Transfer and assign its id
	pub fn plan_direct_transfer_item(&self, pair: &mut DocPair) -> Result<u64, StoreError> {
		self.write(|txn| {
			let id = next_uid(txn, "doc_pairs")?;
			pair.id = id;
			put_row(txn, DOC_PAIRS, id, &*pair)?;
			Ok(id)
		})
	}

	pub fn get_doc_pair(&self, id: u64) -> Result<Option<DocPair>, StoreError> {
		self.row(DOC_PAIRS, id)
	}

	/// Record the remote document created for a pair
	pub fn set_doc_pair_remote_ref(&self, id: u64, remote_ref: &str) {
		let result = self.write(|txn| {
			modify_row(txn, DOC_PAIRS, id, |row| {
				row.insert("remote_ref".to_string(), json!(remote_ref));
				true
			})
		});
		if let Err(e) = result {
			warn!("Cannot update doc pair {}: {}", id, e);
		}
	}

	/// Point the children of a freshly created remote folder at it
	pub fn update_remote_parent_path_dt(&self, local_folder: &Path, remote_path: &str, remote_ref: &str) {
		let result = self.write(|txn| {
			let pairs: Vec<(u64, DocPair)> = all_rows(txn, DOC_PAIRS)?;
			for (id, mut pair) in pairs {
				if pair.local_path.parent() == Some(local_folder) {
					pair.remote_parent_path = remote_path.to_string();
					pair.remote_parent_ref = remote_ref.to_string();
					put_row(txn, DOC_PAIRS, id, &pair)?;
				}
			}
			Ok(())
		});
		if let Err(e) = result {
			warn!("Cannot update children of {}: {}", local_folder.display(), e);
		}
	}

	pub fn remove_doc_pair(&self, id: u64) {
		if let Err(e) = self.write(|txn| delete_row(txn, DOC_PAIRS, id)) {
			warn!("Cannot remove doc pair {}: {}", id, e);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::path::PathBuf;
	use std::sync::Mutex as StdMutex;
	use tempfile::TempDir;

	fn open_store() -> (TempDir, TransferStore) {
		let dir = TempDir::new().unwrap();
		let store = TransferStore::open(&dir.path().join("transfers.redb")).unwrap();
		(dir, store)
	}

	#[test]
	fn test_save_and_get_download() {
		let (_dir, store) = open_store();
		let mut download = Download::new(Path::new("/data/a.txt"), "https://srv/a", Path::new("/tmp/a.part"), 3);
		let uid = store.save_download(&mut download).unwrap();
		assert_eq!(download.uid, Some(uid));
		let back = store.get_download(Path::new("/data/a.txt")).unwrap().unwrap();
		assert_eq!(back, download);
		assert!(store.get_download(Path::new("/data/b.txt")).unwrap().is_none());
	}

	#[test]
	fn test_one_row_per_path() {
		let (_dir, store) = open_store();
		let mut first = Download::new(Path::new("/p"), "u", Path::new("/t"), 1);
		let mut second = first.clone();
		store.save_download(&mut first).unwrap();
		store.save_download(&mut second).unwrap();
		assert_eq!(store.get_downloads().unwrap().len(), 1);
		assert_ne!(first.uid, second.uid);

		let mut sync = Upload::new(Path::new("/p"), Batch::new("b1"), 1, 1);
		let mut dt = Upload::new(Path::new("/p"), Batch::new("b2"), 1, 1);
		store.save_upload(&mut sync).unwrap();
		store.save_upload(&mut sync.clone()).unwrap();
		let mut pair = DocPair::new(Path::new("/p"), false);
		store.plan_direct_transfer_item(&mut pair).unwrap();
		dt.doc_pair = Some(pair.id);
		store.save_dt_upload(&mut dt).unwrap();
		assert_eq!(store.get_uploads().unwrap().len(), 1);
		assert_eq!(store.get_dt_uploads().unwrap().len(), 1);
	}

	#[test]
	fn test_upload_roundtrip_strips_blobs() {
		let (_dir, store) = open_store();
		let mut batch = Batch::new("batch-1");
		batch.provider = Some("s3".into());
		batch.extra_info.insert("bucket".into(), json!("bkt"));
		batch.blobs.push(json!({"name": "f"}));
		let mut upload = Upload::new(Path::new("/data/f.bin"), batch, 42, 4);
		upload.remote_parent_path = "/ws".into();
		upload.request_uid = Some("req".into());
		store.save_upload(&mut upload).unwrap();

		let back = store.get_upload(UploadLookup::Path(Path::new("/data/f.bin"))).unwrap().unwrap();
		assert!(back.batch.blobs.is_empty());
		let mut expected = upload.clone();
		expected.batch.blobs.clear();
		assert_eq!(back, expected);
		assert!(store.get_dt_upload(UploadLookup::Path(Path::new("/data/f.bin"))).unwrap().is_none());
		assert!(store.get_upload(UploadLookup::Uid(upload.uid.unwrap())).unwrap().is_some());
	}

	#[test]
	fn test_dt_upload_without_doc_pair_is_cancelled() {
		let (_dir, store) = open_store();
		let mut upload = Upload::new(Path::new("/x"), Batch::new("b"), 1, 1);
		upload.doc_pair = Some(77);
		store.save_dt_upload(&mut upload).unwrap();
		assert_eq!(upload.status, TransferStatus::Cancelled);
		let back = store.get_dt_upload(UploadLookup::DocPair(77)).unwrap().unwrap();
		assert_eq!(back.status, TransferStatus::Cancelled);
	}

	#[test]
	fn test_dt_upload_inherits_session_status() {
		let (_dir, store) = open_store();
		let session = store.create_session("/ws", "ref", 1, "engine", "").unwrap();
		store.pause_session(session);
		let mut pair = DocPair::new(Path::new("/x"), false);
		pair.session = Some(session);
		store.plan_direct_transfer_item(&mut pair).unwrap();
		let mut upload = Upload::new(Path::new("/x"), Batch::new("b"), 1, 1);
		upload.doc_pair = Some(pair.id);
		store.save_dt_upload(&mut upload).unwrap();
		assert_eq!(upload.status, TransferStatus::Paused);
	}

	#[test]
	fn test_pause_transfer_is_idempotent() {
		let (_dir, store) = open_store();
		let mut upload = Upload::new(Path::new("/f"), Batch::new("b"), 100, 10);
		let uid = store.save_upload(&mut upload).unwrap();
		store.pause_transfer(Nature::Upload, uid, 40.0, false);
		store.pause_transfer(Nature::Upload, uid, 30.0, false);
		let row = store.get_upload(UploadLookup::Uid(uid)).unwrap().unwrap();
		assert_eq!(row.status, TransferStatus::Paused);
		assert_eq!(row.progress, 40.0);
		store.pause_transfer(Nature::Upload, uid, 60.0, false);
		let row = store.get_upload(UploadLookup::Uid(uid)).unwrap().unwrap();
		assert_eq!(row.progress, 60.0);

		store.resume_transfer(Nature::Upload, uid, false);
		let row = store.get_upload(UploadLookup::Uid(uid)).unwrap().unwrap();
		assert_eq!(row.status, TransferStatus::Ongoing);
	}

	#[test]
	fn test_status_events() {
		let (_dir, store) = open_store();
		let seen = Arc::new(StdMutex::new(Vec::new()));
		let sink = Arc::clone(&seen);
		store.subscribe(Arc::new(move |event: StoreEvent| sink.lock().unwrap().push(event)));

		let mut download = Download::new(Path::new("/d"), "u", Path::new("/t"), 1);
		let uid = store.save_download(&mut download).unwrap();
		download.status = TransferStatus::Done;
		store.set_transfer_status(&download);

		let mut pair = DocPair::new(Path::new("/u"), false);
		store.plan_direct_transfer_item(&mut pair).unwrap();
		let mut upload = Upload::new(Path::new("/u"), Batch::new("b"), 1, 1);
		upload.doc_pair = Some(pair.id);
		let up_uid = store.save_dt_upload(&mut upload).unwrap();
		store.pause_transfer(Nature::Upload, up_uid, 0.0, true);

		let events = seen.lock().unwrap().clone();
		assert_eq!(
			events,
			vec![
				StoreEvent::TransferUpdated { nature: Nature::Download, uid },
				StoreEvent::DirectTransferUpdated { uid: up_uid },
			]
		);
	}

	#[test]
	fn test_suspend_transfers() {
		let (_dir, store) = open_store();
		let mut a = Download::new(Path::new("/a"), "u", Path::new("/ta"), 1);
		let mut b = Upload::new(Path::new("/b"), Batch::new("b"), 1, 1);
		let mut c = Upload::new(Path::new("/c"), Batch::new("c"), 1, 1);
		store.save_download(&mut a).unwrap();
		store.save_upload(&mut b).unwrap();
		let c_uid = store.save_upload(&mut c).unwrap();
		store.pause_transfer(Nature::Upload, c_uid, 0.0, false);
		store.suspend_transfers();
		assert_eq!(store.get_downloads_with_status(TransferStatus::Suspended).unwrap().len(), 1);
		assert_eq!(store.get_uploads_with_status(TransferStatus::Suspended).unwrap().len(), 1);
		assert_eq!(store.get_uploads_with_status(TransferStatus::Paused).unwrap().len(), 1);
	}

	#[test]
	fn test_remove_transfer_prefers_doc_pair() {
		let (_dir, store) = open_store();
		let mut a = Upload::new(Path::new("/a"), Batch::new("a"), 1, 1);
		a.doc_pair = Some(5);
		let mut b = Upload::new(Path::new("/b"), Batch::new("b"), 1, 1);
		store.save_upload(&mut a).unwrap();
		store.save_upload(&mut b).unwrap();
		// doc_pair wins over the (different) path
		store.remove_transfer(Nature::Upload, Some(5), Some(Path::new("/b")), false);
		let left: Vec<PathBuf> = store.get_uploads().unwrap().into_iter().map(|u| u.path).collect();
		assert_eq!(left, vec![PathBuf::from("/b")]);
		store.remove_transfer(Nature::Upload, None, Some(Path::new("/b")), false);
		assert!(store.get_uploads().unwrap().is_empty());
	}

	#[test]
	fn test_set_transfer_doc_and_update_upload() {
		let (_dir, store) = open_store();
		let mut upload = Upload::new(Path::new("/a"), Batch::new("old"), 1, 1);
		let uid = store.save_upload(&mut upload).unwrap();
		store.set_transfer_doc(Nature::Upload, uid, "engine-2", 9);
		upload.batch.batch_id = "new".into();
		store.update_upload(&upload);
		let row = store.get_upload(UploadLookup::DocPair(9)).unwrap().unwrap();
		assert_eq!(row.engine.as_deref(), Some("engine-2"));
		assert_eq!(row.batch.batch_id, "new");
	}

	#[test]
	fn test_session_counters() {
		let (_dir, store) = open_store();
		let uid = store.create_session("/ws", "ref", 2, "engine", "two files").unwrap();
		let s = store.update_session(uid).unwrap();
		assert_eq!(s.uploaded_items, 1);
		assert_eq!(s.status, TransferStatus::Ongoing);
		let s = store.decrease_session_counts(uid).unwrap();
		assert_eq!(s.total_items, 1);
		assert_eq!(s.planned_items, 1);
		assert_eq!(s.status, TransferStatus::Done);
		assert!(s.completed_on.is_some());
		// Nothing pending anymore
		assert!(store.decrease_session_counts(uid).is_none());
		assert!(store.update_session(uid).is_none());
	}

	#[test]
	fn test_decrease_to_zero_cancels() {
		let (_dir, store) = open_store();
		let uid = store.create_session("/ws", "ref", 1, "engine", "").unwrap();
		let s = store.decrease_session_counts(uid).unwrap();
		assert_eq!(s.total_items, 0);
		assert_eq!(s.status, TransferStatus::Cancelled);
		assert!(store.decrease_session_counts(uid).is_none());
		let s = store.get_session(uid).unwrap().unwrap();
		assert_eq!(s.total_items, 0);
	}

	#[test]
	fn test_pause_resume_cancel_session() {
		let (_dir, store) = open_store();
		let session = store.create_session("/ws", "ref", 2, "engine", "").unwrap();
		let mut uids = Vec::new();
		for name in ["/s/a", "/s/b"] {
			let mut pair = DocPair::new(Path::new(name), false);
			pair.session = Some(session);
			store.plan_direct_transfer_item(&mut pair).unwrap();
			let mut upload = Upload::new(Path::new(name), Batch::new(name), 1, 1);
			upload.doc_pair = Some(pair.id);
			uids.push(store.save_dt_upload(&mut upload).unwrap());
		}
		store.pause_session(session);
		assert_eq!(store.get_dt_uploads_with_status(TransferStatus::Paused).unwrap().len(), 2);
		assert_eq!(store.get_active_sessions().unwrap().len(), 1);
		store.resume_session(session);
		assert_eq!(store.get_dt_uploads_with_status(TransferStatus::Ongoing).unwrap().len(), 2);

		store.update_session(session);
		let batches = store.cancel_session(session);
		assert_eq!(batches.len(), 2);
		assert!(store.get_dt_uploads().unwrap().is_empty());
		let s = store.get_session(session).unwrap().unwrap();
		assert_eq!(s.status, TransferStatus::Cancelled);
		assert_eq!(s.total_items, 1);
		assert!(store.get_active_sessions().unwrap().is_empty());
		assert_eq!(store.get_completed_sessions(10).unwrap().len(), 1);
	}

	#[test]
	fn test_session_items() {
		let (_dir, store) = open_store();
		let a = store.create_session("/ws", "ref", 1, "e", "").unwrap();
		let b = store.create_session("/ws", "ref", 1, "e", "").unwrap();
		store.save_session_item(a, &json!({"path": "/x"})).unwrap();
		store.save_session_item(b, &json!({"path": "/y"})).unwrap();
		store.save_session_item(a, &json!({"path": "/z"})).unwrap();
		let items = store.get_session_items(a).unwrap();
		assert_eq!(items, vec![json!({"path": "/x"}), json!({"path": "/z"})]);
	}

	#[test]
	fn test_update_remote_parent_path_dt() {
		let (_dir, store) = open_store();
		let mut child = DocPair::new(Path::new("/local/folder/file"), false);
		let mut other = DocPair::new(Path::new("/local/other/file"), false);
		store.plan_direct_transfer_item(&mut child).unwrap();
		store.plan_direct_transfer_item(&mut other).unwrap();
		store.update_remote_parent_path_dt(Path::new("/local/folder"), "/ws/folder", "folder-uid");
		let child = store.get_doc_pair(child.id).unwrap().unwrap();
		assert_eq!(child.remote_parent_path, "/ws/folder");
		assert_eq!(child.remote_parent_ref, "folder-uid");
		let other = store.get_doc_pair(other.id).unwrap().unwrap();
		assert!(other.remote_parent_path.is_empty());
		store.remove_doc_pair(other.id);
		assert!(store.get_doc_pair(other.id).unwrap().is_none());
	}

	#[test]
	fn test_reopen_keeps_rows() {
		let dir = TempDir::new().unwrap();
		let path = dir.path().join("db.redb");
		let uid = {
			let store = TransferStore::open(&path).unwrap();
			let mut upload = Upload::new(Path::new("/f"), Batch::new("b"), 1, 1);
			store.save_upload(&mut upload).unwrap()
		};
		let store = TransferStore::open(&path).unwrap();
		assert!(store.get_upload(UploadLookup::Uid(uid)).unwrap().is_some());
		let mut upload = Upload::new(Path::new("/g"), Batch::new("b"), 1, 1);
		assert!(store.save_upload(&mut upload).unwrap() > uid);
	}
}

// vim: ts=4
