use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};

use crate::template::Template;

/// Known-good resolvers used to vet the template itself before any
/// candidate is tested against it.
pub const DEFAULT_TRUSTED_SERVERS: &str = "8.8.8.8, 1.1.1.1, 9.9.9.9";

/// Built-in validation template, used when no --template is given.
/// Geo-located domains are avoided on purpose: their answers differ by
/// vantage point and would fail perfectly honest resolvers.
pub const DEFAULT_TEMPLATE: &str = "\
# <FQDN>                    <EXPECTED-RESULT>

# Multiple A records
cr.yp.to                    A=131.193.32.108 A=131.193.32.109

# These A & CNAME records are expected:
mbc.group.stanford.edu      CNAME=web.stanford.edu. A=171.67.215.200
wiki.debian.org             CNAME=wilder.debian.org. A=*

# be flexible here, some servers return NOERROR (with no records),
# some timeout, some return formerr, anyway, we just want to ensure
# here that server didn't put an IP that shouldn't exist:
invalid.com                 SERVFAIL || NOERROR || TIMEOUT || FORMERR

# invalid TLD - NXDOMAIN is expected:
dn05jq2u.fr                 NXDOMAIN

# Single A record expected:
bet365.com                  A=5.226.17*
lists.isc.org               A=149.20.*
app-c0a801fb.nip.io         A=192.168.1.251
retro.localtest.me          A=127.0.0.1

algolia.net                 A=103.254.154.6 A=149.202.84.123 A=*
";

/// One validation run, fully resolved: the candidate list, the oracle,
/// and every budget the scheduler enforces.
#[derive(Debug, Clone)]
pub struct Settings {
	pub server_ips: Vec<IpAddr>,
	pub template: Arc<Template>,
	pub max_threads: usize,
	pub max_pool_size: usize,
	pub global_rps: u64,
	pub per_server_rps: f64,
	/// negative means unlimited (never drop a server)
	pub per_server_max_failures: i64,
	pub per_check_max_attempts: u32,
	pub per_query_timeout: Duration,
}

impl Settings {
	/// Validate ranges and resolve the auto-derived knobs. `max_threads`
	/// and `max_pool_size` of zero mean "pick for me": enough in-flight
	/// queries to sustain the global rate at worst-case latency, and a
	/// pool three times the natural working set.
	#[allow(clippy::too_many_arguments)]
	pub fn build(
		server_ips: Vec<IpAddr>,
		template: Arc<Template>,
		max_threads: usize,
		max_pool_size: usize,
		global_rps: u64,
		per_server_rps: f64,
		per_server_max_failures: i64,
		per_check_max_attempts: u32,
		per_query_timeout_secs: u64,
	) -> Result<Settings> {
		if server_ips.is_empty() {
			bail!("server list is empty");
		}
		if template.is_empty() {
			bail!("template has no entries");
		}
		if global_rps < 1 {
			bail!("--global-ratelimit must be >= 1");
		}
		if per_server_rps < 0.0 {
			bail!("--ratelimit must be >= 0");
		}
		if per_check_max_attempts < 1 {
			bail!("--max-attempts must be >= 1");
		}
		if per_query_timeout_secs < 1 {
			bail!("--timeout must be >= 1");
		}
		let max_threads = if max_threads == 0 {
			(global_rps as usize * per_query_timeout_secs as usize).clamp(1, 2048)
		} else {
			max_threads
		};
		let max_pool_size = if max_pool_size == 0 {
			let working_set = (global_rps as usize).min(max_threads * 2).max(1);
			working_set * 3
		} else {
			max_pool_size
		};
		Ok(Settings {
			server_ips,
			template,
			max_threads,
			max_pool_size,
			global_rps,
			per_server_rps,
			per_server_max_failures,
			per_check_max_attempts,
			per_query_timeout: Duration::from_secs(per_query_timeout_secs),
		})
	}
}

/// Parse a server list: whitespace- and comma-separated tokens with '#'
/// line comments. Each token is either an IP literal or a path to a
/// regular file holding a nested list.
///
/// Example:
///
///	parse_server_list("8.8.8.8, 1.1.1.1")
///	parse_server_list("/tmp/srv.lst")
pub fn parse_server_list(input: &str) -> Result<Vec<IpAddr>> {
	let mut servers = Vec::new();
	collect_servers(input, &mut servers)?;
	if servers.is_empty() {
		bail!("server list is empty");
	}
	Ok(servers)
}

fn collect_servers(input: &str, servers: &mut Vec<IpAddr>) -> Result<()> {
	for raw_line in input.lines() {
		let line = raw_line.split('#').next().unwrap_or("");
		for token in line.split([',', ' ', '\t']) {
			let token = token.trim();
			if token.is_empty() {
				continue;
			}
			if let Ok(ip) = token.parse::<IpAddr>() {
				servers.push(ip);
			} else if Path::new(token).is_file() {
				let nested = std::fs::read_to_string(token)
					.map_err(|e| anyhow!("can't read {:?}: {}", token, e))?;
				collect_servers(&nested, servers)?;
			} else {
				bail!("invalid IP: {:?}", token);
			}
		}
	}
	Ok(())
}
