//! Direct-Transfer sessions
//!
//! A session groups the items of one Direct-Transfer request. Its counters
//! and status are derived from the uploads: completed uploads bump
//! `uploaded_items`, cancelled items shrink `total_items`.

use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::TransferError;
use crate::logging::*;
use crate::remote::RemoteRepository;
use crate::store::{TransferStore, UploadLookup};
use crate::types::{DocPair, DuplicateBehavior, Nature, Session};

/// One local entry to push
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedItem {
	pub path: PathBuf,
	pub folderish: bool,
	pub size: u64,
}

impl PlannedItem {
	pub fn file(path: &Path, size: u64) -> Self {
		PlannedItem { path: path.to_path_buf(), folderish: false, size }
	}

	pub fn folder(path: &Path) -> Self {
		PlannedItem { path: path.to_path_buf(), folderish: true, size: 0 }
	}
}

pub struct SessionManager {
	store: Arc<TransferStore>,
	remote: Arc<dyn RemoteRepository>,
}

impl SessionManager {
	pub fn new(store: Arc<TransferStore>, remote: Arc<dyn RemoteRepository>) -> Self {
		SessionManager { store, remote }
	}

	/// Create a session for `items` and plan a doc pair for each
	///
	/// Items nested in a planned folder get their remote parent once that
	/// folder is created remotely; the others go straight under `remote_path`.
	/// Returns the session UID and the doc pair ids, in item order.
	pub fn plan(
		&self,
		remote_path: &str,
		remote_ref: &str,
		engine: &str,
		description: &str,
		items: &[PlannedItem],
		duplicate_behavior: DuplicateBehavior,
	) -> Result<(u64, Vec<u64>), TransferError> {
		let session =
			self.store.create_session(remote_path, remote_ref, items.len() as u64, engine, description)?;
		let folders: Vec<&Path> =
			items.iter().filter(|i| i.folderish).map(|i| i.path.as_path()).collect();
		let mut pairs = Vec::with_capacity(items.len());
		for item in items {
			let mut pair = DocPair::new(&item.path, item.folderish);
			pair.size = item.size;
			pair.session = Some(session);
			pair.duplicate_behavior = duplicate_behavior;
			let nested = item.path.parent().map_or(false, |parent| folders.contains(&parent));
			if !nested {
				pair.remote_parent_path = remote_path.to_string();
				pair.remote_parent_ref = remote_ref.to_string();
			}
			let id = self.store.plan_direct_transfer_item(&mut pair)?;
			self.store.save_session_item(
				session,
				&json!({"path": item.path, "folderish": item.folderish, "doc_pair": id}),
			)?;
			pairs.push(id);
		}
		info!("Planned session {} with {} item(s) into {}", session, items.len(), remote_path);
		Ok((session, pairs))
	}

	pub fn get(&self, uid: u64) -> Result<Option<Session>, TransferError> {
		Ok(self.store.get_session(uid)?)
	}

	/// Count one completed upload
	pub fn update(&self, uid: u64) -> Option<Session> {
		self.store.update_session(uid)
	}

	/// Drop one pending item from its session
	pub async fn cancel_item(&self, doc_pair: u64) -> Result<Option<Session>, TransferError> {
		let pair = match self.store.get_doc_pair(doc_pair)? {
			Some(pair) => pair,
			None => return Ok(None),
		};
		if let Some(upload) = self.store.get_dt_upload(UploadLookup::DocPair(doc_pair))? {
			if let Err(e) = self.remote.batch_delete(&upload.batch.batch_id, None).await {
				debug!("Cannot delete batch {}: {}", upload.batch.batch_id, e);
			}
		}
		self.store.remove_transfer(Nature::Upload, Some(doc_pair), None, true);
		self.store.remove_doc_pair(doc_pair);
		Ok(pair.session.and_then(|uid| self.store.decrease_session_counts(uid)))
	}

	pub fn pause(&self, uid: u64) -> Option<Session> {
		self.store.pause_session(uid)
	}

	pub fn resume(&self, uid: u64) -> Option<Session> {
		self.store.resume_session(uid)
	}

	/// Cancel the session and drop its batches remotely (best effort)
	pub async fn cancel(&self, uid: u64) {
		let batches = self.store.cancel_session(uid);
		for batch in batches {
			if let Err(e) = self.remote.batch_delete(&batch.batch_id, None).await {
				debug!("Cannot delete batch {} of session {}: {}", batch.batch_id, uid, e);
			}
		}
	}

	pub fn active(&self) -> Result<Vec<Session>, TransferError> {
		Ok(self.store.get_active_sessions()?)
	}

	pub fn completed(&self, limit: usize) -> Result<Vec<Session>, TransferError> {
		Ok(self.store.get_completed_sessions(limit)?)
	}
}


// vim: ts=4
