//! Store change notifications
//!
//! Subscribers are called synchronously on the thread that performed the
//! write; anything slow should hop elsewhere.

use crate::types::Nature;

/// A status or counter change committed by the transfer store
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
	/// Status of a regular transfer changed
	TransferUpdated { nature: Nature, uid: u64 },

	/// Status of a Direct-Transfer upload changed
	DirectTransferUpdated { uid: u64 },

	/// Session counters or status changed
	SessionUpdated { uid: u64, terminal: bool },
}

pub trait EventSink: Send + Sync {
	fn on_event(&self, _event: StoreEvent) {}
}

impl<T: Fn(StoreEvent) + Send + Sync> EventSink for T {
	fn on_event(&self, event: StoreEvent) {
		self(event);
	}
}

// vim: ts=4
