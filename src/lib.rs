//! # nxtransfer - Resumable transfer engine for a content repository
//!
//! nxtransfer moves files between a local machine and a Nuxeo-style
//! document repository. Every transfer is persisted so it survives a
//! restart, can be paused, resumed or cancelled, and is verified against
//! the remote digest.
//!
//! ## Components
//!
//! - [`download::Downloader`]: streamed, resumable downloads with digest checks
//! - [`upload::Uploader`]: chunked uploads into batches, then linking to a document
//! - [`direct_edit::DirectEdit`]: open a remote document locally and push back saves
//! - [`session::SessionManager`]: Direct-Transfer sessions grouping many uploads
//! - [`store::TransferStore`]: the persistent transfer records
//!
//! ## Downloading a file
//!
//! ```rust,ignore
//! use nxtransfer::{ActionRegistry, DownloadRequest, Downloader, HttpRemote, Options, TransferStore};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let options = Arc::new(Options::default());
//!     let store = Arc::new(TransferStore::open(&options.database)?);
//!     let remote = Arc::new(HttpRemote::new("https://srv/nuxeo", "alice", "token", &options)?);
//!     let downloader = Downloader::new(remote, store, Arc::new(ActionRegistry::new()), options);
//!
//!     let req = DownloadRequest::new(
//!         "https://srv/nuxeo/nxfile/default/abc/file:content/a.pdf",
//!         "/tmp/a.pdf".as_ref(),
//!         "/tmp/a.pdf.nxpart".as_ref(),
//!         "d41d8cd98f00b204e9800998ecf8427e",
//!     );
//!     downloader.download(&req, None).await?;
//!     downloader.publish(&req)?;
//!     Ok(())
//! }
//! ```

pub mod action;
pub mod blocklist;
pub mod config;
pub mod constants;
pub mod direct_edit;
pub mod download;
pub mod engine;
pub mod error;
pub mod events;
pub mod integrity;
pub mod logging;
pub mod remote;
pub mod session;
pub mod store;
pub mod types;
pub mod upload;
pub mod utils;
pub mod worker;

// Re-export commonly used types and functions
pub use action::{Action, ActionKind, ActionRegistry, ActionSnapshot, ProgressSink};
pub use blocklist::BlocklistQueue;
pub use config::Options;
pub use direct_edit::{DirectEdit, DirectEditEvent, EditErrorCode};
pub use download::{DownloadRequest, Downloader};
pub use engine::{Engine, EngineRegistry};
pub use error::{RemoteError, StoreError, TransferError};
pub use events::{EventSink, StoreEvent};
pub use integrity::{DigestAlgorithm, IntegrityChecker};
pub use remote::{HttpRemote, RemoteRepository};
pub use session::{PlannedItem, SessionManager};
pub use store::TransferStore;
pub use types::{Batch, Download, Nature, Session, TransferStatus, Upload};
pub use upload::{UploadOptions, Uploader};
pub use worker::WorkerControl;

// vim: ts=4
