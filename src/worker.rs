//! Cooperative control of long-lived workers
//!
//! A worker loop calls [`WorkerControl::interact`] between units of work.
//! That is where pause is honoured and where a stop request turns into
//! [`TransferError::ThreadInterrupt`], unwinding the loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::error::TransferError;
use crate::logging::*;

const PAUSE_SPIN: Duration = Duration::from_millis(10);

/// Run/pause flags of one worker
#[derive(Debug)]
pub struct WorkerControl {
	name: String,
	running: AtomicBool,
	paused: AtomicBool,
}

impl WorkerControl {
	pub fn new(name: &str) -> Self {
		WorkerControl {
			name: name.to_string(),
			running: AtomicBool::new(false),
			paused: AtomicBool::new(false),
		}
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn start(&self) {
		debug!("Starting worker {}", self.name);
		self.running.store(true, Ordering::SeqCst);
	}

	/// Ask the worker to exit at its next `interact`
	pub fn stop(&self) {
		debug!("Stopping worker {}", self.name);
		self.running.store(false, Ordering::SeqCst);
	}

	pub fn pause(&self) {
		self.paused.store(true, Ordering::SeqCst);
	}

	pub fn resume(&self) {
		self.paused.store(false, Ordering::SeqCst);
	}

	pub fn is_paused(&self) -> bool {
		self.paused.load(Ordering::SeqCst)
	}

	pub fn is_stopping(&self) -> bool {
		!self.running.load(Ordering::SeqCst)
	}

	/// Non-blocking stop sensor, usable as a progress callback
	pub fn check(&self) -> Result<(), TransferError> {
		if self.is_stopping() {
			return Err(TransferError::ThreadInterrupt);
		}
		Ok(())
	}

	/// Wait while paused; fail once stopped
	pub async fn interact(&self) -> Result<(), TransferError> {
		while self.is_paused() && !self.is_stopping() {
			tokio::time::sleep(PAUSE_SPIN).await;
		}
		self.check()
	}
}


// vim: ts=4
