use std::collections::VecDeque;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use crate::server::ServerState;

/// Integer metric with current / peak / average tracking and an
/// optional theoretical maximum. Callers hold the reporter lock.
#[derive(Debug, Default, Clone)]
pub struct Gauge {
	pub max: usize,
	pub current: usize,
	pub peak: usize,
	total_sum: u64,
	n_samples: u64,
}

impl Gauge {
	pub fn with_max(max: usize) -> Gauge {
		Gauge { max, ..Gauge::default() }
	}

	pub fn log(&mut self, v: usize) {
		self.current = v;
		self.peak = self.peak.max(v);
		self.total_sum += v as u64;
		self.n_samples += 1;
	}

	pub fn avg(&self) -> usize {
		if self.n_samples == 0 {
			return 0;
		}
		((self.total_sum as f64 / self.n_samples as f64) + 0.5) as usize
	}
}

/// Cumulative idle/busy request counters plus a pruned one-second
/// sliding window used for the live RPS figure.
#[derive(Debug)]
pub struct RequestsLog {
	pub start_time: Instant,
	pub idle: u64,
	pub busy: u64,
	pub one_sec_peak: u64,
	batches: VecDeque<(Instant, u64)>,
}

impl RequestsLog {
	pub fn new() -> RequestsLog {
		RequestsLog {
			start_time: Instant::now(),
			idle: 0,
			busy: 0,
			one_sec_peak: 0,
			batches: VecDeque::new(),
		}
	}

	/// Record a dispatch batch and prune entries older than one second,
	/// so the window stays bounded even when nobody reads it.
	pub fn log(&mut self, ts: Instant, idle_delta: u64, busy_delta: u64) {
		self.idle += idle_delta;
		self.busy += busy_delta;
		let total = idle_delta + busy_delta;
		if total > 0 {
			self.batches.push_back((ts, total));
		}
		self.prune(ts);
	}

	pub fn total(&self) -> u64 {
		self.idle + self.busy
	}

	/// Requests seen over the trailing second; also feeds the peak.
	pub fn last_sec_count(&mut self) -> u64 {
		self.prune(Instant::now());
		let sum: u64 = self.batches.iter().map(|&(_, n)| n).sum();
		self.one_sec_peak = self.one_sec_peak.max(sum);
		sum
	}

	/// Drop batches that fell out of the one-second window ending at `now`.
	fn prune(&mut self, now: Instant) {
		let Some(cutoff) = now.checked_sub(Duration::from_secs(1)) else {
			return;
		};
		while matches!(self.batches.front(), Some(&(t, _)) if t <= cutoff) {
			self.batches.pop_front();
		}
	}

	/// Average RPS since start, rounded.
	pub fn one_sec_avg(&self) -> u64 {
		let elapsed_us = self.start_time.elapsed().as_micros() as u64 + 500_000;
		(0.5 + (self.total() * 1_000_000) as f64 / elapsed_us as f64) as u64
	}
}

/// Point-in-time view handed to the progress display.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
	pub total_servers: usize,
	pub valid_servers: usize,
	pub invalid_servers: usize,
	pub servers_with_failures: usize,
	pub total_checks: u64,
	pub done_checks: u64,
	pub last_sec_rps: u64,
	pub pool_current: usize,
	pub busy_current: usize,
	pub elapsed: Duration,
}

impl StatusSnapshot {
	pub fn done_servers(&self) -> usize {
		self.valid_servers + self.invalid_servers
	}

	pub fn is_finished(&self) -> bool {
		self.done_servers() == self.total_servers
	}
}

/// Everything the --debug recap table shows.
#[derive(Debug, Clone)]
pub struct DebugMetrics {
	pub busy_jobs: Gauge,
	pub pool_size: Gauge,
	pub rps_current: u64,
	pub rps_peak: u64,
	pub rps_avg: u64,
	pub reqs_idle: u64,
	pub reqs_busy: u64,
}

struct StatusInner {
	valid_servers: usize,
	invalid_servers: usize,
	servers_with_failures: usize,
	total_checks: u64,
	done_checks: u64,
	start_time: Instant,
	requests: RequestsLog,
	pool_size: Gauge,
	busy_jobs: Gauge,
	output: Option<Box<dyn Write + Send>>,
	verbose: Option<Box<dyn Write + Send>>,
	verbose_header: Option<String>,
}

/// Thread-safe run aggregator. The scheduler feeds it small deltas; the
/// progress display reads snapshots; finished servers are recorded and
/// their IPs streamed to the output sink in completion order.
pub struct StatusReporter {
	total_servers: usize,
	debug_enabled: bool,
	inner: Mutex<StatusInner>,
}

impl StatusReporter {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		total_servers: usize,
		total_checks: u64,
		max_pool_size: usize,
		max_threads: usize,
		output: Option<Box<dyn Write + Send>>,
		verbose: Option<Box<dyn Write + Send>>,
		verbose_header: Option<String>,
		debug_enabled: bool,
	) -> StatusReporter {
		StatusReporter {
			total_servers,
			debug_enabled,
			inner: Mutex::new(StatusInner {
				valid_servers: 0,
				invalid_servers: 0,
				servers_with_failures: 0,
				total_checks,
				done_checks: 0,
				start_time: Instant::now(),
				requests: RequestsLog::new(),
				pool_size: Gauge::with_max(max_pool_size),
				busy_jobs: Gauge::with_max(max_threads),
				output,
				verbose,
				verbose_header,
			}),
		}
	}

	/// Apply check-counter deltas. Retries inflate the total so the
	/// progress fraction stays meaningful; a terminal drop cancels the
	/// server's remaining planned checks (negative delta).
	pub fn add_done_checks(&self, done_delta: u64, total_delta: i64) {
		let mut inner = self.lock();
		inner.done_checks += done_delta;
		if total_delta != 0 {
			inner.total_checks =
				(inner.total_checks as i64 + total_delta).max(0) as u64;
		}
	}

	/// Record one dispatch batch, split into idle- and busy-pass counts.
	pub fn log_requests(&self, ts: Instant, idle_delta: u64, busy_delta: u64) {
		self.lock().requests.log(ts, idle_delta, busy_delta);
	}

	pub fn update_pool_size(&self, n: usize) {
		self.lock().pool_size.log(n);
	}

	pub fn update_busy_jobs(&self, n: usize) {
		self.lock().busy_jobs.log(n);
	}

	/// Tally a finished server and stream its IP to the output sink
	/// when it survived. The verbose sink gets the per-server dump,
	/// preceded once by the template header.
	pub fn report_finished_server(&self, srv: &ServerState) {
		let mut inner = self.lock();
		if srv.failed_count > 0 {
			inner.servers_with_failures += 1;
		}
		if srv.disabled {
			inner.invalid_servers += 1;
		} else {
			inner.valid_servers += 1;
			if let Some(output) = inner.output.as_mut() {
				let _ = writeln!(output, "{}", srv.ip);
				let _ = output.flush();
			}
		}
		let header = inner.verbose_header.take();
		if let Some(verbose) = inner.verbose.as_mut() {
			if let Some(header) = header {
				let _ = verbose.write_all(header.as_bytes());
			}
			let _ = verbose.write_all(srv.pretty_dump().as_bytes());
			let _ = verbose.flush();
		}
	}

	/// Diagnostic hook; a no-op unless debug mode is on.
	pub fn debug(&self, args: std::fmt::Arguments<'_>) {
		if self.debug_enabled {
			tracing::debug!("{}", args);
		}
	}

	pub fn snapshot(&self) -> StatusSnapshot {
		let mut inner = self.lock();
		let last_sec_rps = inner.requests.last_sec_count();
		StatusSnapshot {
			total_servers: self.total_servers,
			valid_servers: inner.valid_servers,
			invalid_servers: inner.invalid_servers,
			servers_with_failures: inner.servers_with_failures,
			total_checks: inner.total_checks,
			done_checks: inner.done_checks,
			last_sec_rps,
			pool_current: inner.pool_size.current,
			busy_current: inner.busy_jobs.current,
			elapsed: inner.start_time.elapsed(),
		}
	}

	/// Gauge and request-log figures for the --debug recap table.
	pub fn metrics(&self) -> DebugMetrics {
		let mut inner = self.lock();
		let rps_current = inner.requests.last_sec_count();
		DebugMetrics {
			rps_current,
			rps_peak: inner.requests.one_sec_peak,
			rps_avg: inner.requests.one_sec_avg(),
			reqs_idle: inner.requests.idle,
			reqs_busy: inner.requests.busy,
			busy_jobs: inner.busy_jobs.clone(),
			pool_size: inner.pool_size.clone(),
		}
	}

	fn lock(&self) -> std::sync::MutexGuard<'_, StatusInner> {
		self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
	}
}

/// Growable in-memory sink that stays readable after the run; used to
/// hold back the template-validation dump until we know whether to show
/// it.
#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
	pub fn new() -> SharedBuffer {
		SharedBuffer::default()
	}

	pub fn contents(&self) -> String {
		String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
	}
}

impl Write for SharedBuffer {
	fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
		self.0.lock().unwrap().extend_from_slice(buf);
		Ok(buf.len())
	}

	fn flush(&mut self) -> std::io::Result<()> {
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::template::Template;

	fn reporter_with_output() -> (StatusReporter, SharedBuffer) {
		let buf = SharedBuffer::new();
		let reporter = StatusReporter::new(
			2, 4, 8, 4,
			Some(Box::new(buf.clone())),
			None, None, false,
		);
		(reporter, buf)
	}

	#[test]
	fn test_gauge() {
		let mut g = Gauge::with_max(10);
		g.log(3);
		g.log(7);
		g.log(2);
		assert_eq!(g.current, 2);
		assert_eq!(g.peak, 7);
		assert_eq!(g.avg(), 4);
		assert_eq!(g.max, 10);
	}

	#[tokio::test(start_paused = true)]
	async fn test_requests_log_sliding_window() {
		let mut log = RequestsLog::new();
		log.log(Instant::now(), 3, 1);
		tokio::time::advance(Duration::from_millis(600)).await;
		log.log(Instant::now(), 2, 0);
		assert_eq!(log.last_sec_count(), 6);

		tokio::time::advance(Duration::from_millis(600)).await;
		// first batch is now out of the window
		assert_eq!(log.last_sec_count(), 2);
		assert_eq!(log.one_sec_peak, 6);
		assert_eq!(log.total(), 6);
		assert_eq!(log.idle, 5);
		assert_eq!(log.busy, 1);
	}

	#[test]
	fn test_done_checks_deltas() {
		let (reporter, _) = reporter_with_output();
		reporter.add_done_checks(1, 0); // pass
		reporter.add_done_checks(1, 1); // retry inflates total
		reporter.add_done_checks(1, -2); // drop cancels remaining work
		let snap = reporter.snapshot();
		assert_eq!(snap.done_checks, 3);
		assert_eq!(snap.total_checks, 3); // 4 + 1 - 2
	}

	#[test]
	fn test_report_finished_server_output() {
		let (reporter, buf) = reporter_with_output();
		let tpl = Template::from_str("a.com NXDOMAIN\n").unwrap();

		let mut valid = ServerState::new("8.8.8.8".parse().unwrap(), &tpl, 1);
		valid.completed_count = 1;
		reporter.report_finished_server(&valid);

		let mut invalid = ServerState::new("9.9.9.9".parse().unwrap(), &tpl, 1);
		invalid.disabled = true;
		invalid.failed_count = 1;
		reporter.report_finished_server(&invalid);

		assert_eq!(buf.contents(), "8.8.8.8\n");
		let snap = reporter.snapshot();
		assert_eq!(snap.valid_servers, 1);
		assert_eq!(snap.invalid_servers, 1);
		assert_eq!(snap.servers_with_failures, 1);
		assert!(snap.is_finished());
	}

	#[test]
	fn test_verbose_header_printed_once() {
		let buf = SharedBuffer::new();
		let reporter = StatusReporter::new(
			2, 2, 8, 4,
			None,
			Some(Box::new(buf.clone())),
			Some("HEADER\n".to_string()),
			false,
		);
		let tpl = Template::from_str("a.com NXDOMAIN\n").unwrap();
		let srv = ServerState::new("8.8.8.8".parse().unwrap(), &tpl, 1);
		reporter.report_finished_server(&srv);
		reporter.report_finished_server(&srv);
		assert_eq!(buf.contents().matches("HEADER").count(), 1);
		assert_eq!(buf.contents().matches("SERVER 8.8.8.8").count(), 2);
	}
}
