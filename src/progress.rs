use std::io::{self, IsTerminal, Write};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::status::{StatusReporter, StatusSnapshot};

const REDRAW_INTERVAL: Duration = Duration::from_millis(250);

/// Single-line progress display on stderr, redrawn from reporter
/// snapshots. Does nothing when stderr is not a terminal, so piped runs
/// stay clean.
pub struct Progress {
	title: &'static str,
	cancel: CancellationToken,
	handle: Option<JoinHandle<()>>,
}

impl Progress {
	pub fn spawn(title: &'static str, status: Arc<StatusReporter>) -> Progress {
		if !io::stderr().is_terminal() {
			return Progress { title, cancel: CancellationToken::new(), handle: None };
		}
		let cancel = CancellationToken::new();
		let loop_cancel = cancel.clone();
		let handle = tokio::spawn(async move {
			let mut ticker = tokio::time::interval(REDRAW_INTERVAL);
			loop {
				tokio::select! {
					_ = loop_cancel.cancelled() => return,
					_ = ticker.tick() => redraw(title, &status.snapshot()),
				}
			}
		});
		Progress { title, cancel, handle: Some(handle) }
	}

	/// Stop redrawing and leave the final state on its own line.
	pub async fn stop(mut self, status: &StatusReporter) {
		self.cancel.cancel();
		if let Some(handle) = self.handle.take() {
			let _ = handle.await;
			redraw(self.title, &status.snapshot());
			eprintln!();
		}
	}
}

fn redraw(title: &str, snap: &StatusSnapshot) {
	let percent = if snap.total_checks > 0 {
		snap.done_checks * 100 / snap.total_checks
	} else {
		0
	};
	let mut line = String::new();
	if !title.is_empty() {
		line.push_str(title);
		line.push(' ');
	}
	line.push_str(&format!(
		"{}% ({}/{}) | {} req/s | OK: {} KO: {} | pool: {} busy: {} | {} {}",
		percent,
		snap.done_checks,
		snap.total_checks,
		snap.last_sec_rps,
		snap.valid_servers,
		snap.invalid_servers,
		snap.pool_current,
		snap.busy_current,
		render_elapsed(snap.elapsed),
		render_eta(snap),
	));
	eprint!("\r\x1b[2K{}", line);
	let _ = io::stderr().flush();
}

fn render_elapsed(elapsed: Duration) -> String {
	let sec = elapsed.as_secs();
	const D: u64 = 86_400;
	const H: u64 = 3_600;
	const M: u64 = 60;
	match sec {
		s if s >= D => format!("{}d {}h", s / D, (s % D) / H),
		s if s >= H => format!("{}h {}m", s / H, (s % H) / M),
		s if s >= M => format!("{}m {}s", s / M, s % M),
		s => format!("{}s", s),
	}
}

/// Weighted ETA: finished servers dominate (80%) with the check
/// fraction smoothing out the tail (20%).
fn render_eta(snap: &StatusSnapshot) -> String {
	if snap.is_finished() {
		return "DONE".to_string();
	}
	let mut progress = ratio(snap.done_checks as usize, snap.total_checks as usize);
	let srv_progress = ratio(snap.done_servers(), snap.total_servers);
	if srv_progress > 0.0 {
		progress = (srv_progress * 4.0 + progress) / 5.0;
	}
	if progress < 0.001 {
		return "ETA: --".to_string();
	}
	let remain = snap.elapsed.as_secs_f64() * (1.0 / progress - 1.0);
	const D: f64 = 86_400.0;
	const H: f64 = 3_600.0;
	const M: f64 = 60.0;
	match remain {
		s if s < M => "ETA: <1m".to_string(),
		s if s < H => format!("ETA: {}m", (s / M) as u64),
		s if s < D => format!("ETA: {}h {}m", (s / H) as u64, ((s % H) / M) as u64),
		s => format!("ETA: {}d {}h", (s / D) as u64, ((s % D) / H) as u64),
	}
}

fn ratio(value: usize, total: usize) -> f64 {
	if total == 0 {
		return 0.0;
	}
	value as f64 / total as f64
}

#[cfg(test)]
mod tests {
	use super::*;

	fn snapshot(done: u64, total: u64, done_srv: usize, total_srv: usize) -> StatusSnapshot {
		StatusSnapshot {
			total_servers: total_srv,
			valid_servers: done_srv,
			invalid_servers: 0,
			servers_with_failures: 0,
			total_checks: total,
			done_checks: done,
			last_sec_rps: 0,
			pool_current: 0,
			busy_current: 0,
			elapsed: Duration::from_secs(60),
		}
	}

	#[test]
	fn test_render_elapsed() {
		assert_eq!(render_elapsed(Duration::from_secs(42)), "42s");
		assert_eq!(render_elapsed(Duration::from_secs(90)), "1m 30s");
		assert_eq!(render_elapsed(Duration::from_secs(3_700)), "1h 1m");
		assert_eq!(render_elapsed(Duration::from_secs(90_000)), "1d 1h");
	}

	#[test]
	fn test_render_eta() {
		assert_eq!(render_eta(&snapshot(10, 10, 4, 4)), "DONE");
		assert_eq!(render_eta(&snapshot(0, 10, 0, 4)), "ETA: --");
		// halfway through 4 servers after 60s: about a minute left
		let eta = render_eta(&snapshot(5, 10, 2, 4));
		assert_eq!(eta, "ETA: 1m");
	}
}
