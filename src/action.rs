//! Per-worker current activity
//!
//! Each worker owns one Action slot describing what it is doing right now
//! (downloading, uploading, verifying...). Reporters observe the slots to
//! render progress; pipelines drive them through an [`ActionGuard`] that
//! finishes the Action when dropped.

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use crate::error::TransferError;

/// Identifier of the worker owning an Action slot
pub type WorkerId = u64;

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(1);

tokio::task_local! {
	static CURRENT_WORKER: WorkerId;
}

thread_local! {
	static THREAD_WORKER: WorkerId = new_worker_id();
}

/// Allocate a fresh worker identifier
pub fn new_worker_id() -> WorkerId {
	NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed)
}

/// Worker identifier of the caller
///
/// Inside [`run_as_worker`] this is the scoped identifier, so the slot follows
/// the task across runtime threads. Elsewhere each OS thread gets its own.
pub fn current_worker() -> WorkerId {
	CURRENT_WORKER.try_with(|id| *id).unwrap_or_else(|_| THREAD_WORKER.with(|id| *id))
}

/// Run `fut` with `worker` installed as the current worker
pub async fn run_as_worker<F: Future>(worker: WorkerId, fut: F) -> F::Output {
	CURRENT_WORKER.scope(worker, fut).await
}

/// What an Action is doing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ActionKind {
	Idle,
	Download,
	Upload,
	Linking,
	Verification,
	Other(String),
}

impl fmt::Display for ActionKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ActionKind::Idle => f.write_str("Idle"),
			ActionKind::Download => f.write_str("Download"),
			ActionKind::Upload => f.write_str("Upload"),
			ActionKind::Linking => f.write_str("Linking"),
			ActionKind::Verification => f.write_str("Verification"),
			ActionKind::Other(name) => f.write_str(name),
		}
	}
}

/// Observer notified of Action lifecycle changes
pub trait ActionReporter: Send + Sync {
	fn action_started(&self, _action: &ActionSnapshot) {}
	fn action_progressing(&self, _action: &ActionSnapshot) {}
	fn action_finished(&self, _action: &ActionSnapshot) {}
}

/// Callback invoked by the pipelines after each chunk or buffer
///
/// Returning an error aborts the transfer at that boundary; the Direct-Edit
/// worker uses this as its stop sensor.
pub trait ProgressSink: Send + Sync {
	fn on_progress(&self, _action: &ActionSnapshot) -> Result<(), TransferError> {
		Ok(())
	}
}

impl<T: Fn(&ActionSnapshot) -> Result<(), TransferError> + Send + Sync> ProgressSink for T {
	fn on_progress(&self, action: &ActionSnapshot) -> Result<(), TransferError> {
		self(action)
	}
}

/// Transient per-worker activity
#[derive(Clone)]
pub struct Action {
	pub kind: ActionKind,
	pub path: Option<PathBuf>,
	/// Total bytes, negative when unknown
	pub size: i64,
	progress: f64,
	pub chunk_size: u64,
	pub chunk_transfer_start: Option<Instant>,
	pub chunk_transfer_end: Option<Instant>,
	pub transferred_chunks: u64,
	/// Set once the transfer reached its size, even for empty files
	pub uploaded: bool,
	pub is_direct_transfer: bool,
	pub finished: bool,
	reporter: Option<Arc<dyn ActionReporter>>,
}

impl fmt::Debug for Action {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Action")
			.field("kind", &self.kind)
			.field("path", &self.path)
			.field("size", &self.size)
			.field("progress", &self.progress)
			.field("uploaded", &self.uploaded)
			.finish()
	}
}

impl Action {
	pub fn new(kind: ActionKind) -> Self {
		Action {
			kind,
			path: None,
			size: -1,
			progress: 0.0,
			chunk_size: 0,
			chunk_transfer_start: None,
			chunk_transfer_end: None,
			transferred_chunks: 0,
			uploaded: false,
			is_direct_transfer: false,
			finished: false,
			reporter: None,
		}
	}

	/// Action bound to a file transfer of `size` bytes
	pub fn file(kind: ActionKind, path: &Path, size: u64) -> Self {
		Action { path: Some(path.to_path_buf()), size: size as i64, ..Action::new(kind) }
	}

	pub fn idle() -> Self {
		Action::new(ActionKind::Idle)
	}

	pub fn with_reporter(mut self, reporter: Arc<dyn ActionReporter>) -> Self {
		self.reporter = Some(reporter);
		self
	}

	pub fn progress(&self) -> f64 {
		self.progress
	}

	pub fn set_progress(&mut self, value: f64) {
		self.progress = value;
		if self.size >= 0 && value >= self.size as f64 {
			self.uploaded = true;
		}
		if let Some(reporter) = &self.reporter {
			reporter.action_progressing(&self.snapshot());
		}
	}

	pub fn add_progress(&mut self, delta: f64) {
		let value = self.progress + delta;
		self.set_progress(value);
	}

	pub fn is_empty(&self) -> bool {
		self.size == 0
	}

	/// Progress in percent, clamped to [0, 100]
	pub fn percent(&self) -> f64 {
		if self.size < 0 || (self.is_empty() && !self.uploaded) {
			return 0.0;
		}
		if self.progress >= self.size as f64 {
			return 100.0;
		}
		(self.progress * 100.0 / self.size as f64).clamp(0.0, 100.0)
	}

	/// Mark the start of a chunk round-trip
	pub fn chunk_started(&mut self) {
		self.chunk_transfer_start = Some(Instant::now());
	}

	/// Mark the end of a chunk round-trip
	pub fn chunk_done(&mut self) {
		self.chunk_transfer_end = Some(Instant::now());
		self.transferred_chunks += 1;
	}

	/// Throughput of the last chunk in bytes per second
	pub fn last_chunk_speed(&self) -> Option<f64> {
		let start = self.chunk_transfer_start?;
		let end = self.chunk_transfer_end?;
		let elapsed = end.checked_duration_since(start)?.as_secs_f64();
		if elapsed <= 0.0 || self.chunk_size == 0 {
			return None;
		}
		Some(self.chunk_size as f64 / elapsed)
	}

	pub fn snapshot(&self) -> ActionSnapshot {
		ActionSnapshot {
			kind: self.kind.clone(),
			name: self
				.path
				.as_ref()
				.and_then(|p| p.file_name())
				.map(|n| n.to_string_lossy().into_owned()),
			path: self.path.clone(),
			size: self.size,
			progress: self.progress,
			percent: self.percent(),
			uploaded: self.uploaded,
			is_direct_transfer: self.is_direct_transfer,
			transferred_chunks: self.transferred_chunks,
			speed: self.last_chunk_speed(),
			finished: self.finished,
		}
	}
}

/// Read-only view of an Action, handed to reporters
#[derive(Debug, Clone, Serialize)]
pub struct ActionSnapshot {
	pub kind: ActionKind,
	pub name: Option<String>,
	pub path: Option<PathBuf>,
	pub size: i64,
	pub progress: f64,
	pub percent: f64,
	pub uploaded: bool,
	pub is_direct_transfer: bool,
	pub transferred_chunks: u64,
	pub speed: Option<f64>,
	pub finished: bool,
}

type Slot = Arc<Mutex<Action>>;

/// Mapping from worker to its current Action
#[derive(Default)]
pub struct ActionRegistry {
	slots: RwLock<HashMap<WorkerId, Slot>>,
}

impl ActionRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Install `action` as the caller's current Action, replacing any previous one
	pub fn start(&self, action: Action) -> ActionGuard<'_> {
		let worker = current_worker();
		if let Some(reporter) = &action.reporter {
			reporter.action_started(&action.snapshot());
		}
		let slot = Arc::new(Mutex::new(action));
		self.slots
			.write()
			.unwrap_or_else(|e| e.into_inner())
			.insert(worker, Arc::clone(&slot));
		ActionGuard { registry: self, worker, slot, done: false }
	}

	/// Current Action of `worker` (the caller when `None`), or an Idle placeholder
	pub fn current(&self, worker: Option<WorkerId>) -> ActionSnapshot {
		let worker = worker.unwrap_or_else(current_worker);
		let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
		match slots.get(&worker) {
			Some(slot) => slot.lock().unwrap_or_else(|e| e.into_inner()).snapshot(),
			None => Action::idle().snapshot(),
		}
	}

	/// Pop the caller's current Action
	pub fn finish(&self) {
		let worker = current_worker();
		let slot = self.slots.write().unwrap_or_else(|e| e.into_inner()).remove(&worker);
		if let Some(slot) = slot {
			Self::mark_finished(&slot);
		}
	}

	/// Snapshot of every running Action
	pub fn get_actions(&self) -> HashMap<WorkerId, ActionSnapshot> {
		let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
		slots
			.iter()
			.map(|(worker, slot)| {
				(*worker, slot.lock().unwrap_or_else(|e| e.into_inner()).snapshot())
			})
			.collect()
	}

	fn mark_finished(slot: &Slot) {
		let mut action = slot.lock().unwrap_or_else(|e| e.into_inner());
		action.finished = true;
		if let Some(reporter) = &action.reporter {
			reporter.action_finished(&action.snapshot());
		}
	}

	fn release(&self, worker: WorkerId, slot: &Slot) {
		let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
		// A newer Action may have replaced ours; leave it alone
		if slots.get(&worker).map_or(false, |current| Arc::ptr_eq(current, slot)) {
			slots.remove(&worker);
		}
		drop(slots);
		Self::mark_finished(slot);
	}
}

/// Scoped handle on the caller's current Action; finishes it on drop
pub struct ActionGuard<'a> {
	registry: &'a ActionRegistry,
	worker: WorkerId,
	slot: Slot,
	done: bool,
}

impl<'a> ActionGuard<'a> {
	/// Run `f` against the Action
	pub fn update<R>(&self, f: impl FnOnce(&mut Action) -> R) -> R {
		let mut action = self.slot.lock().unwrap_or_else(|e| e.into_inner());
		f(&mut action)
	}

	pub fn set_progress(&self, value: f64) {
		self.update(|a| a.set_progress(value));
	}

	pub fn add_progress(&self, delta: f64) {
		self.update(|a| a.add_progress(delta));
	}

	pub fn percent(&self) -> f64 {
		self.update(|a| a.percent())
	}

	pub fn uploaded(&self) -> bool {
		self.update(|a| a.uploaded)
	}

	pub fn snapshot(&self) -> ActionSnapshot {
		self.update(|a| a.snapshot())
	}

	/// Finish now instead of at drop time
	pub fn finish(mut self) {
		self.done = true;
		self.registry.release(self.worker, &self.slot);
	}
}

impl Drop for ActionGuard<'_> {
	fn drop(&mut self) {
		if !self.done {
			self.registry.release(self.worker, &self.slot);
		}
	}
}


// vim: ts=4
