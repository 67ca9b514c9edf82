//! Filesystem events of the Direct-Edit folder

use notify::event::{EventKind, ModifyKind, RenameMode};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc::UnboundedSender;

use crate::error::TransferError;
use crate::logging::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsEventKind {
	Created,
	Modified,
	Moved,
	Deleted,
}

/// One raw filesystem change; `dest_path` is set for moves only
#[derive(Debug, Clone, PartialEq)]
pub struct FsEvent {
	pub kind: FsEventKind,
	pub src_path: PathBuf,
	pub dest_path: Option<PathBuf>,
}

impl FsEvent {
	pub fn new(kind: FsEventKind, src_path: &Path) -> Self {
		FsEvent { kind, src_path: src_path.to_path_buf(), dest_path: None }
	}

	pub fn moved(src_path: &Path, dest_path: &Path) -> Self {
		FsEvent {
			kind: FsEventKind::Moved,
			src_path: src_path.to_path_buf(),
			dest_path: Some(dest_path.to_path_buf()),
		}
	}
}

/// Source of filesystem events for a folder tree
pub trait FolderWatcher: Send {
	/// Start feeding `sink` with the changes below `folder`
	fn watch(&mut self, folder: &Path, sink: UnboundedSender<FsEvent>) -> Result<(), TransferError>;

	fn unwatch(&mut self);
}

/// Default watcher, backed by the platform notification API
#[derive(Default)]
pub struct NotifyWatcher {
	watcher: Option<RecommendedWatcher>,
}

impl NotifyWatcher {
	pub fn new() -> Self {
		Self::default()
	}
}

fn translate(event: notify::Event) -> Vec<FsEvent> {
	let paths = event.paths;
	match event.kind {
		EventKind::Create(_) => paths.iter().map(|p| FsEvent::new(FsEventKind::Created, p)).collect(),
		EventKind::Remove(_) => paths.iter().map(|p| FsEvent::new(FsEventKind::Deleted, p)).collect(),
		EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if paths.len() == 2 => {
			vec![FsEvent::moved(&paths[0], &paths[1])]
		}
		EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
			paths.iter().map(|p| FsEvent::new(FsEventKind::Deleted, p)).collect()
		}
		EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
			paths.iter().map(|p| FsEvent::new(FsEventKind::Created, p)).collect()
		}
		EventKind::Modify(_) => paths.iter().map(|p| FsEvent::new(FsEventKind::Modified, p)).collect(),
		_ => Vec::new(),
	}
}

impl FolderWatcher for NotifyWatcher {
	fn watch(&mut self, folder: &Path, sink: UnboundedSender<FsEvent>) -> Result<(), TransferError> {
		let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
			Ok(event) => {
				for evt in translate(event) {
					let _ = sink.send(evt);
				}
			}
			Err(e) => warn!("Filesystem watcher error: {}", e),
		})
		.map_err(|e| TransferError::Other { message: e.to_string() })?;
		watcher
			.watch(folder, RecursiveMode::Recursive)
			.map_err(|e| TransferError::Other { message: e.to_string() })?;
		info!("Watching FS modification on {}", folder.display());
		self.watcher = Some(watcher);
		Ok(())
	}

	fn unwatch(&mut self) {
		if self.watcher.take().is_some() {
			info!("Stopping the FS observer");
		}
	}
}


// vim: ts=4
