use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::answer::DnsAnswer;
use crate::config::Settings;
use crate::pool::ServerPool;
use crate::ratelimit::TokenBucket;
use crate::resolver::Resolve;
use crate::server::ServerState;
use crate::status::StatusReporter;
use crate::template::Template;

/// Sent by a worker once its query finished, whatever the outcome.
#[derive(Debug)]
struct WorkerResult {
	slot_id: u64,
	check_id: usize,
	answer: DnsAnswer,
	passed: bool,
}

/// Sleep applied when an iteration neither dispatched nor grew the
/// pool, to avoid spinning while queries are in flight.
const BACKPRESSURE_SLEEP: Duration = Duration::from_millis(13);

/// Run the whole candidate list through the template and report every
/// finished server to `status`. Returns once the pool is drained and
/// all workers have been reaped.
///
/// Concurrency model: this task owns the pool and every server state;
/// workers are short-lived tasks gated by a worker-slot semaphore and
/// only ever touch their own answer and the result channel.
pub async fn sanitize<R: Resolve>(
	resolver: Arc<R>,
	settings: &Settings,
	status: Arc<StatusReporter>,
) {
	let n_checks = settings.template.len();
	let max_attempts = settings.per_check_max_attempts.max(1);
	let max_threads = settings
		.max_threads
		.min(settings.server_ips.len() * n_checks)
		.max(1);
	// min interval between two queries to the same server (0 = unpaced)
	let req_interval = if settings.per_server_rps > 0.0 {
		Duration::from_secs_f64(1.0 / settings.per_server_rps)
	} else {
		Duration::ZERO
	};
	let max_failures = if settings.per_server_max_failures < 0 {
		usize::MAX
	} else {
		settings.per_server_max_failures as usize
	};

	let limiter = TokenBucket::new(settings.global_rps, Duration::from_secs(1));
	limiter.start_refiller();

	let (results_tx, results_rx) = mpsc::channel(max_threads);
	let mut sched = Scheduler {
		resolver,
		template: Arc::clone(&settings.template),
		status,
		limiter,
		slots: Arc::new(Semaphore::new(max_threads)),
		results_tx,
		results_rx,
		workers: JoinSet::new(),
		pool: ServerPool::new(
			settings.server_ips.clone(),
			Arc::clone(&settings.template),
			settings.max_pool_size.max(1),
			max_attempts,
		),
		in_flight: HashMap::new(),
		max_threads,
		max_failures,
		req_interval,
		timeout: settings.per_query_timeout,
	};
	sched.run().await;

	sched.limiter.stop_refiller();
}

struct Scheduler<R: Resolve> {
	resolver: Arc<R>,
	template: Arc<Template>,
	status: Arc<StatusReporter>,
	limiter: TokenBucket,
	slots: Arc<Semaphore>,
	results_tx: mpsc::Sender<WorkerResult>,
	results_rx: mpsc::Receiver<WorkerResult>,
	workers: JoinSet<()>,
	pool: ServerPool,
	/// slot id -> queries currently in flight; zero entries are removed
	in_flight: HashMap<u64, u32>,
	max_threads: usize,
	max_failures: usize,
	req_interval: Duration,
	timeout: Duration,
}

impl<R: Resolve> Scheduler<R> {
	async fn run(&mut self) {
		loop {
			// 1) collect finished workers (non-blocking)
			let n_results = self.drain_results();

			// 2) dispatch new queries: idle servers first; busy servers
			//    only once the pool cannot grow, so already-loaded
			//    servers never starve IPs still waiting in the queue
			let now = Instant::now();
			let slot_ids = self.pool.slot_ids();
			let n_idle = self.dispatch_pass(&slot_ids, now, false);
			let n_busy = if !self.pool.can_grow() {
				self.dispatch_pass(&slot_ids, now, true)
			} else {
				0
			};
			let scheduled = n_idle + n_busy;
			if scheduled > 0 {
				self.status.log_requests(now, n_idle, n_busy);
			}
			if n_results > 0 || scheduled > 0 {
				self.status
					.update_busy_jobs(self.max_threads - self.slots.available_permits());
			}

			// 3) termination
			if self.pool.is_drained() {
				break;
			}

			// 4) pool refill / back-pressure
			let mut grown = false;
			let free_reqs = self.limiter.remaining() as usize;
			let free_slots = self.slots.available_permits();
			if self.pool.can_grow() && free_reqs > 0 && free_slots > 0 {
				let inserted = self.pool.load_n(free_reqs.min(free_slots));
				if inserted > 0 {
					grown = true;
					self.status.debug(format_args!(
						"pool grown by {}, newsz={}",
						inserted,
						self.pool.len(),
					));
					self.status.update_pool_size(self.pool.len());
				}
			}
			if scheduled == 0 && !grown {
				tokio::time::sleep(BACKPRESSURE_SLEEP).await;
			}
		}
		// reap every outstanding worker before returning
		while self.workers.join_next().await.is_some() {}
	}

	/// Pull every already-available result off the channel and fold it
	/// into its server. Results for unloaded slots are dropped.
	fn drain_results(&mut self) -> usize {
		let mut n_results = 0;
		loop {
			let res = match self.results_rx.try_recv() {
				Ok(res) => res,
				Err(_) => return n_results,
			};
			n_results += 1;
			if let Some(n) = self.in_flight.get_mut(&res.slot_id) {
				*n -= 1;
				if *n == 0 {
					self.in_flight.remove(&res.slot_id);
				}
			}
			let slot_id = res.slot_id;
			let Some(srv) = self.pool.get_mut(slot_id) else {
				continue; // server already dropped
			};
			apply_result(srv, res, self.max_failures, &self.status);
			if srv.finished() {
				self.status.report_finished_server(srv);
				self.pool.unload(slot_id);
				self.status.update_pool_size(self.pool.len());
			}
		}
	}

	/// One dispatch sweep over the pool. `busy_pass` selects whether
	/// servers with queries in flight are eligible. Returns the number
	/// of workers spawned.
	fn dispatch_pass(&mut self, slot_ids: &[u64], now: Instant, busy_pass: bool) -> u64 {
		let mut scheduled = 0;
		for &slot_id in slot_ids {
			let busy = self.in_flight.get(&slot_id).copied().unwrap_or(0) > 0;
			if busy != busy_pass {
				continue;
			}
			let Some(srv) = self.pool.get_mut(slot_id) else {
				continue;
			};
			if srv.pending_checks.is_empty() || srv.next_query_at > now {
				continue;
			}
			if !self.limiter.consume_one() {
				continue; // global rate budget exhausted
			}
			let permit = match Arc::clone(&self.slots).try_acquire_owned() {
				Ok(permit) => permit,
				Err(_) => {
					// no worker slot: return the token so the budget
					// isn't burned without progress
					self.limiter.give_back_one();
					continue;
				}
			};
			let check_id = srv.pending_checks.pop_front().expect("pending check");
			srv.next_query_at = now + self.req_interval;
			*self.in_flight.entry(slot_id).or_insert(0) += 1;
			scheduled += 1;

			let resolver = Arc::clone(&self.resolver);
			let template = Arc::clone(&self.template);
			let cancel = srv.cancel.clone();
			let ip = srv.ip;
			let timeout = self.timeout;
			let results_tx = self.results_tx.clone();
			self.workers.spawn(async move {
				let _permit = permit;
				let entry = &template[check_id];
				let answer = resolver.resolve(&entry.domain, ip, timeout, cancel).await;
				let passed = entry.matches(&answer);
				let _ = results_tx
					.send(WorkerResult { slot_id, check_id, answer, passed })
					.await;
			});
		}
		scheduled
	}
}

/// Fold one worker result into its server, applying the retry and drop
/// policy. Attempts are decremented before the branch so zero means "no
/// further tries".
fn apply_result(
	srv: &mut ServerState,
	res: WorkerResult,
	max_failures: usize,
	status: &StatusReporter,
) {
	let check = &mut srv.checks[res.check_id];
	check.attempts_left = check.attempts_left.saturating_sub(1);
	check.last_answer = res.answer;

	// success
	if res.passed {
		check.passed = true;
		srv.completed_count += 1;
		status.add_done_checks(1, 0);
		return;
	}
	// transient failure with attempts left: head-of-line requeue, and
	// the extra attempt inflates the planned total
	if check.attempts_left > 0 && check.last_answer.is_worth_retrying() {
		srv.pending_checks.push_front(res.check_id);
		status.add_done_checks(1, 1);
		return;
	}
	// terminal failure
	srv.completed_count += 1;
	srv.failed_count += 1;
	if srv.failed_count >= max_failures {
		let cancelled = srv.checks.len() - srv.completed_count;
		status.add_done_checks(1, -(cancelled as i64));
		srv.disabled = true;
		srv.cancel.cancel();
	} else {
		status.add_done_checks(1, 0);
	}
}
