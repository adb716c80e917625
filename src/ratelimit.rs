use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

const MAX_SPINS: u32 = 10;

/// State shared between the bucket handle and its refiller task.
struct Shared {
	tokens: AtomicU64,
	max_tokens: u64,
	refill_amount: u64,
}

impl Shared {
	/// CAS loop with a small spin budget, then a cooperative yield.
	/// `update` returns the desired new value, or None to bail out.
	fn update<F: Fn(u64) -> Option<u64>>(&self, update: F) -> bool {
		let mut spins = 0;
		loop {
			let old = self.tokens.load(Ordering::Acquire);
			let Some(new) = update(old) else {
				return false;
			};
			if self
				.tokens
				.compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Acquire)
				.is_ok()
			{
				return true;
			}
			spins += 1;
			if spins >= MAX_SPINS {
				std::thread::yield_now();
				spins = 0;
			}
		}
	}
}

/// Lock-free token bucket driving the global request rate.
///
/// The bucket starts full. A background refiller task adds
/// `refill_amount` tokens every `refill_interval`, derived so the
/// steady-state average equals exactly the configured rate. All hot
/// path operations are non-blocking.
pub struct TokenBucket {
	shared: Arc<Shared>,
	refill_interval: Duration,
	refiller_started: AtomicBool,
	cancel: CancellationToken,
}

impl TokenBucket {
	/// Build a bucket for `rate` requests per second with a burst window.
	///
	/// Panics on impossible parameters (rate of zero, empty burst, or a
	/// burst too small to hold a single token). These are programmer
	/// errors, not runtime conditions.
	pub fn new(rate: u64, burst: Duration) -> TokenBucket {
		assert!(rate >= 1, "ratelimit: rate must be >= 1");
		assert!(burst > Duration::ZERO, "ratelimit: burst must be > 0");

		let refill_amount = (rate as f64 * burst.as_secs_f64()).round() as u64;
		assert!(refill_amount >= 1, "ratelimit: burst too small relative to rate");
		// interval derived from the rounded amount, so avg rate is exact
		let refill_interval = Duration::from_secs_f64(refill_amount as f64 / rate as f64);
		assert!(
			refill_interval >= Duration::from_nanos(1),
			"ratelimit: computed refill interval < 1ns",
		);

		TokenBucket {
			shared: Arc::new(Shared {
				tokens: AtomicU64::new(refill_amount),
				max_tokens: refill_amount,
				refill_amount,
			}),
			refill_interval,
			refiller_started: AtomicBool::new(false),
			cancel: CancellationToken::new(),
		}
	}

	/// Take one token. Returns false when the bucket is empty.
	pub fn consume_one(&self) -> bool {
		self.shared.update(|old| old.checked_sub(1))
	}

	/// Return an unused token, saturating at the bucket capacity.
	pub fn give_back_one(&self) {
		self.shared.update(|old| {
			if old >= self.shared.max_tokens {
				None
			} else {
				Some(old + 1)
			}
		});
	}

	/// Snapshot of the tokens available right now.
	pub fn remaining(&self) -> u64 {
		self.shared.tokens.load(Ordering::Acquire)
	}

	/// Spawn the background refill task. Calling it again is a no-op.
	pub fn start_refiller(&self) {
		if self
			.refiller_started
			.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
			.is_err()
		{
			return;
		}
		let shared = Arc::clone(&self.shared);
		let interval = self.refill_interval;
		let cancel = self.cancel.clone();
		tokio::spawn(async move {
			let mut ticker =
				tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
			ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
			loop {
				tokio::select! {
					_ = cancel.cancelled() => return,
					_ = ticker.tick() => {
						shared.update(|old| {
							Some((old + shared.refill_amount).min(shared.max_tokens))
						});
					}
				}
			}
		});
	}

	/// Stop the refiller. Safe to call any number of times.
	pub fn stop_refiller(&self) {
		self.cancel.cancel();
	}
}

impl Drop for TokenBucket {
	fn drop(&mut self) {
		self.cancel.cancel();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_bucket_starts_full() {
		let tb = TokenBucket::new(100, Duration::from_secs(1));
		assert_eq!(tb.remaining(), 100);
	}

	#[test]
	fn test_consume_and_give_back() {
		let tb = TokenBucket::new(2, Duration::from_secs(1));
		assert!(tb.consume_one());
		assert!(tb.consume_one());
		assert!(!tb.consume_one());
		assert_eq!(tb.remaining(), 0);

		tb.give_back_one();
		assert_eq!(tb.remaining(), 1);
		// never exceeds capacity
		tb.give_back_one();
		tb.give_back_one();
		assert_eq!(tb.remaining(), 2);
	}

	#[test]
	fn test_fractional_burst() {
		// 10 rps, 500ms burst -> 5 tokens every 500ms
		let tb = TokenBucket::new(10, Duration::from_millis(500));
		assert_eq!(tb.shared.max_tokens, 5);
		assert_eq!(tb.refill_interval, Duration::from_millis(500));
	}

	#[test]
	#[should_panic]
	fn test_zero_rate_panics() {
		let _ = TokenBucket::new(0, Duration::from_secs(1));
	}

	#[test]
	#[should_panic]
	fn test_zero_burst_panics() {
		let _ = TokenBucket::new(10, Duration::ZERO);
	}

	#[test]
	#[should_panic]
	fn test_tiny_burst_panics() {
		// 1 rps over 1ms rounds to zero tokens
		let _ = TokenBucket::new(1, Duration::from_millis(1));
	}

	#[tokio::test(start_paused = true)]
	async fn test_refiller_steady_rate() {
		let tb = TokenBucket::new(10, Duration::from_secs(1));
		while tb.consume_one() {}
		assert_eq!(tb.remaining(), 0);

		tb.start_refiller();
		tokio::time::sleep(Duration::from_millis(1050)).await;
		assert_eq!(tb.remaining(), 10);

		// capped at max_tokens even after many intervals
		tokio::time::sleep(Duration::from_secs(5)).await;
		assert_eq!(tb.remaining(), 10);
		tb.stop_refiller();
	}

	#[tokio::test(start_paused = true)]
	async fn test_refiller_idempotent_lifecycle() {
		let tb = TokenBucket::new(5, Duration::from_secs(1));
		tb.start_refiller();
		tb.start_refiller(); // second call is a no-op

		while tb.consume_one() {}
		tokio::time::sleep(Duration::from_millis(1100)).await;
		// a duplicated refiller would have doubled this
		assert_eq!(tb.remaining(), 5);

		tb.stop_refiller();
		tb.stop_refiller();
		while tb.consume_one() {}
		tokio::time::sleep(Duration::from_secs(2)).await;
		assert_eq!(tb.remaining(), 0, "refills after stop");
	}

	#[test]
	fn test_consume_under_contention() {
		let tb = Arc::new(TokenBucket::new(1000, Duration::from_secs(1)));
		let mut handles = Vec::new();
		for _ in 0..4 {
			let tb = Arc::clone(&tb);
			handles.push(std::thread::spawn(move || {
				let mut taken = 0u64;
				while tb.consume_one() {
					taken += 1;
				}
				taken
			}));
		}
		let total: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
		assert_eq!(total, 1000, "tokens must be consumed exactly once each");
		assert_eq!(tb.remaining(), 0);
	}
}
