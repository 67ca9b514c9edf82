//! Time-delayed retry queue
//!
//! Items are pushed with a delay and only handed back once that delay has
//! elapsed. Re-pushing an item can stretch its delay with the number of
//! attempts so repeatedly failing payloads back off.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A queued payload with its retry schedule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlocklistItem<T> {
	pub payload: T,
	pub next_try: Instant,
	pub count: u32,
}

impl<T> BlocklistItem<T> {
	fn new(payload: T, delay: Duration) -> Self {
		BlocklistItem { payload, next_try: Instant::now() + delay, count: 1 }
	}

	fn increase(&mut self, delay: Duration, increase_wait: bool) {
		self.count += 1;
		let wait = if increase_wait { delay * self.count } else { delay };
		let next_try = Instant::now() + wait;
		if next_try > self.next_try {
			self.next_try = next_try;
		}
	}

	pub fn is_ready(&self, now: Instant) -> bool {
		self.next_try <= now
	}
}

/// Mutex-protected mapping from payload to its retry item
pub struct BlocklistQueue<T> {
	delay: Duration,
	items: Mutex<HashMap<T, BlocklistItem<T>>>,
}

impl<T: Eq + Hash + Clone> BlocklistQueue<T> {
	pub fn new(delay: Duration) -> Self {
		BlocklistQueue { delay, items: Mutex::new(HashMap::new()) }
	}

	pub fn delay(&self) -> Duration {
		self.delay
	}

	/// Queue `payload` for a first retry after the base delay
	pub fn push(&self, payload: T) {
		let item = BlocklistItem::new(payload.clone(), self.delay);
		self.items.lock().unwrap_or_else(|e| e.into_inner()).insert(payload, item);
	}

	/// Queue an already-seen item again, bumping its attempt count
	pub fn repush(&self, mut item: BlocklistItem<T>, increase_wait: bool) {
		item.increase(self.delay, increase_wait);
		self.items.lock().unwrap_or_else(|e| e.into_inner()).insert(item.payload.clone(), item);
	}

	/// Remove and return every item whose retry time has come
	pub fn get(&self) -> Vec<BlocklistItem<T>> {
		let now = Instant::now();
		let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
		let ready: Vec<T> = items
			.iter()
			.filter(|(_, item)| item.is_ready(now))
			.map(|(payload, _)| payload.clone())
			.collect();
		ready.into_iter().filter_map(|payload| items.remove(&payload)).collect()
	}

	pub fn remove(&self, payload: &T) -> Option<BlocklistItem<T>> {
		self.items.lock().unwrap_or_else(|e| e.into_inner()).remove(payload)
	}

	pub fn contains(&self, payload: &T) -> bool {
		self.items.lock().unwrap_or_else(|e| e.into_inner()).contains_key(payload)
	}

	/// Snapshot of the queued items without removing them
	pub fn items(&self) -> Vec<BlocklistItem<T>> {
		self.items.lock().unwrap_or_else(|e| e.into_inner()).values().cloned().collect()
	}

	pub fn len(&self) -> usize {
		self.items.lock().unwrap_or_else(|e| e.into_inner()).len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::thread::sleep;

	#[test]
	fn test_delay() {
		let queue = BlocklistQueue::new(Duration::from_millis(300));
		queue.push("a");
		assert!(queue.get().is_empty());
		assert_eq!(queue.len(), 1);
		sleep(Duration::from_millis(350));
		let ready = queue.get();
		assert_eq!(ready.len(), 1);
		assert_eq!(ready[0].payload, "a");
		assert_eq!(ready[0].count, 1);
		assert!(queue.is_empty());
	}

	#[test]
	fn test_repush_increases_count() {
		let queue = BlocklistQueue::new(Duration::from_millis(100));
		queue.push("a");
		sleep(Duration::from_millis(120));
		let item = queue.get().pop().unwrap();
		let before = Instant::now();
		queue.repush(item, true);
		let queued = queue.items().pop().unwrap();
		assert_eq!(queued.count, 2);
		assert!(queued.next_try >= before + Duration::from_millis(200));
		// Not ready after the base delay alone
		sleep(Duration::from_millis(120));
		assert!(queue.get().is_empty());
		sleep(Duration::from_millis(120));
		assert_eq!(queue.get().len(), 1);
	}

	#[test]
	fn test_repush_without_increase() {
		let queue = BlocklistQueue::new(Duration::from_millis(100));
		queue.push("b");
		sleep(Duration::from_millis(120));
		let item = queue.get().pop().unwrap();
		queue.repush(item, false);
		sleep(Duration::from_millis(120));
		let item = queue.get().pop().unwrap();
		assert_eq!(item.count, 2);
	}

	#[test]
	fn test_push_same_payload_once() {
		let queue = BlocklistQueue::new(Duration::from_secs(30));
		queue.push(1);
		queue.push(1);
		queue.push(2);
		assert_eq!(queue.len(), 2);
		assert!(queue.contains(&1));
		assert!(queue.remove(&1).is_some());
		assert!(!queue.contains(&1));
	}
}

// vim: ts=4
