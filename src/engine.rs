//! Engines: one bound (server, user) pair each
//!
//! Transfers are owned by an engine and reach the remote through its
//! repository client. The registry resolves the engine matching a
//! Direct-Edit request.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use crate::logging::*;
use crate::remote::RemoteRepository;
use crate::utils::simplify_url;

/// A configured binding to a remote server
pub struct Engine {
	pub uid: String,
	pub server_url: String,
	pub username: String,
	pub remote: Arc<dyn RemoteRepository>,
	invalid_credentials: AtomicBool,
}

impl Engine {
	pub fn new(uid: &str, server_url: &str, username: &str, remote: Arc<dyn RemoteRepository>) -> Self {
		Engine {
			uid: uid.to_string(),
			server_url: server_url.to_string(),
			username: username.to_string(),
			remote,
			invalid_credentials: AtomicBool::new(false),
		}
	}

	pub fn has_invalid_credentials(&self) -> bool {
		self.invalid_credentials.load(Ordering::SeqCst)
	}

	/// Flag the token as rejected; the engine stays offline until re-bound
	pub fn set_invalid_credentials(&self, invalid: bool) {
		if invalid {
			warn!("Engine {} has invalid credentials", self.uid);
		}
		self.invalid_credentials.store(invalid, Ordering::SeqCst);
	}

	/// Server host, used in user-facing messages
	pub fn hostname(&self) -> String {
		url::Url::parse(&self.server_url)
			.ok()
			.and_then(|u| u.host_str().map(str::to_string))
			.unwrap_or_else(|| self.server_url.clone())
	}
}

/// Every engine known to the process
#[derive(Default)]
pub struct EngineRegistry {
	engines: RwLock<Vec<Arc<Engine>>>,
}

impl EngineRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn add(&self, engine: Arc<Engine>) {
		self.engines.write().unwrap_or_else(|e| e.into_inner()).push(engine);
	}

	pub fn remove(&self, uid: &str) {
		self.engines.write().unwrap_or_else(|e| e.into_inner()).retain(|e| e.uid != uid);
	}

	pub fn by_uid(&self, uid: &str) -> Option<Arc<Engine>> {
		let engines = self.engines.read().unwrap_or_else(|e| e.into_inner());
		engines.iter().find(|e| e.uid == uid).cloned()
	}

	/// Engine bound to `url` for `user`
	///
	/// URLs are compared once simplified. The username must match exactly,
	/// then case-insensitively since some backends ignore case. Engines with
	/// rejected credentials are never returned.
	pub fn get(&self, url: &str, user: Option<&str>) -> Option<Arc<Engine>> {
		let url = simplify_url(url);
		let engines = self.engines.read().unwrap_or_else(|e| e.into_inner());
		let candidates: Vec<&Arc<Engine>> = engines
			.iter()
			.filter(|e| !e.has_invalid_credentials())
			.filter(|e| simplify_url(&e.server_url) == url)
			.collect();
		let user = match user {
			Some(user) => user,
			None => return candidates.first().map(|e| Arc::clone(e)),
		};
		if let Some(engine) = candidates.iter().find(|e| e.username == user) {
			return Some(Arc::clone(engine));
		}
		let user = user.to_lowercase();
		candidates.iter().find(|e| e.username.to_lowercase() == user).map(|e| Arc::clone(e))
	}
}


// vim: ts=4
