use std::collections::VecDeque;
use std::net::IpAddr;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::answer::{DnsAnswer, Status};
use crate::template::Template;

/// Progress of one (template entry, server) pair.
#[derive(Debug, Clone)]
pub struct CheckState {
	pub last_answer: DnsAnswer,
	pub passed: bool,
	pub attempts_left: u32,
	pub max_attempts: u32,
}

/// Everything the scheduler tracks for one candidate server while it
/// lives in the pool. Owned by the scheduler task; only the cancellation
/// token ever crosses into workers (as a clone).
#[derive(Debug)]
pub struct ServerState {
	pub ip: IpAddr,
	pub disabled: bool,
	pub failed_count: usize,
	pub completed_count: usize,
	pub next_query_at: Instant,
	pub pending_checks: VecDeque<usize>,
	pub checks: Vec<CheckState>,
	pub cancel: CancellationToken,
}

impl ServerState {
	pub fn new(ip: IpAddr, template: &Template, max_attempts: u32) -> ServerState {
		let checks = template
			.iter()
			.map(|entry| CheckState {
				last_answer: DnsAnswer::skipped(&entry.domain),
				passed: false,
				attempts_left: max_attempts,
				max_attempts,
			})
			.collect::<Vec<_>>();
		ServerState {
			ip,
			disabled: false,
			failed_count: 0,
			completed_count: 0,
			next_query_at: Instant::now(),
			pending_checks: (0..checks.len()).collect(),
			checks,
			cancel: CancellationToken::new(),
		}
	}

	/// A server is done when it is disabled or every check completed.
	pub fn finished(&self) -> bool {
		self.disabled || self.completed_count == self.checks.len()
	}

	/// Human-readable per-server report for the verbose sink: a colored
	/// valid/invalid header, then one line per check with its last
	/// answer and an attempt-count suffix when more than one was needed.
	pub fn pretty_dump(&self) -> String {
		let mut out = if self.failed_count == 0 {
			format!("\x1b[1;32m[+] SERVER {} (valid)\x1b[m\n", self.ip)
		} else {
			format!("\x1b[1;31m[-] SERVER {} (invalid)\x1b[m\n", self.ip)
		};
		for check in &self.checks {
			let prefix = if check.passed {
				"\x1b[1;32m+\x1b[0;32m"
			} else if *check.last_answer.status() == Status::Skipped {
				"\x1b[1;90m!\x1b[0;90m"
			} else {
				"\x1b[1;31m-\x1b[0;31m"
			};
			let tries = check.max_attempts - check.attempts_left;
			let attempts_repr = if tries > 1 {
				let suffix = match tries {
					2 => "nd",
					3 => "rd",
					_ => "th",
				};
				format!(" \x1b[33m(on {}{} attempt)\x1b[m", tries, suffix)
			} else {
				String::new()
			};
			out.push_str(&format!(
				"    {} {}\x1b[m{}\n",
				prefix, check.last_answer, attempts_repr,
			));
		}
		out
	}
}
