use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use crate::server::ServerState;
use crate::template::Template;

/// Streams huge candidate lists through a bounded set of live
/// `ServerState`s, so memory stays proportional to the pool cap rather
/// than the input size. Slot ids grow monotonically and are never
/// reused. Single-owner: only the scheduler task touches it.
pub struct ServerPool {
	template: Arc<Template>,
	max_attempts: u32,
	todo: Vec<IpAddr>,
	cursor: usize,
	pool: HashMap<u64, ServerState>,
	next_slot: u64,
	max_pool_size: usize,
}

impl ServerPool {
	pub fn new(
		todo: Vec<IpAddr>,
		template: Arc<Template>,
		max_pool_size: usize,
		max_attempts: u32,
	) -> ServerPool {
		ServerPool {
			template,
			max_attempts,
			todo,
			cursor: 0,
			pool: HashMap::new(),
			next_slot: 0,
			max_pool_size,
		}
	}

	/// Load up to `n` pending IPs into fresh slots, bounded by the pool
	/// cap and the remaining input. Returns how many were inserted.
	pub fn load_n(&mut self, n: usize) -> usize {
		let mut inserted = 0;
		while inserted < n && !self.is_full() && self.num_pending() > 0 {
			let ip = self.todo[self.cursor];
			self.cursor += 1;
			let srv = ServerState::new(ip, &self.template, self.max_attempts);
			self.pool.insert(self.next_slot, srv);
			self.next_slot += 1;
			inserted += 1;
		}
		inserted
	}

	/// Drop a finished server. Reporting happened before this point.
	pub fn unload(&mut self, slot: u64) {
		self.pool.remove(&slot);
	}

	pub fn get_mut(&mut self, slot: u64) -> Option<&mut ServerState> {
		self.pool.get_mut(&slot)
	}

	/// Snapshot of the live slot ids, for iteration while mutating.
	pub fn slot_ids(&self) -> Vec<u64> {
		let mut ids: Vec<u64> = self.pool.keys().copied().collect();
		ids.sort_unstable();
		ids
	}

	pub fn len(&self) -> usize {
		self.pool.len()
	}

	pub fn num_pending(&self) -> usize {
		self.todo.len() - self.cursor
	}

	pub fn is_full(&self) -> bool {
		self.pool.len() >= self.max_pool_size
	}

	/// More servers can be loaded right now.
	pub fn can_grow(&self) -> bool {
		!self.is_full() && self.num_pending() > 0
	}

	/// Input exhausted and every loaded server unloaded.
	pub fn is_drained(&self) -> bool {
		self.pool.is_empty() && self.num_pending() == 0
	}
}
