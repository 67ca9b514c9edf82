//! Logging prelude module for convenient access to tracing macros.
//!
//! Every module pulls its macros from here so log output stays consistent
//! between the pipelines, the store and the Direct-Edit worker.
//!
//! # Usage
//!
//! ```ignore
//! use crate::logging::*;
//!
//! info!("Download {} done", uid);
//! warn!("Batch {} is gone", batch_id);
//! ```

pub use tracing::{debug, error, info, warn};

/// Initialize the tracing subscriber with environment filter support.
///
/// By default, logs at INFO level and above are displayed. Control the log level
/// with the `RUST_LOG` environment variable:
///
/// ```bash
/// RUST_LOG=debug my-app
/// RUST_LOG=nxtransfer::upload=debug,nxtransfer::direct_edit=trace my-app
/// ```
pub fn init_tracing() {
	let _ = tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
		)
		.with_writer(std::io::stderr)
		.try_init();
}

// vim: ts=4
