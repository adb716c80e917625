mod answer;
mod cli;
mod config;
mod pool;
mod progress;
mod ratelimit;
mod resolver;
mod sched;
mod server;
mod status;
mod template;

use std::fs::File;
use std::io::{self, IsTerminal, Read, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use tracing_subscriber::EnvFilter;

use crate::cli::Cli;
use crate::config::Settings;
use crate::progress::Progress;
use crate::resolver::UdpResolver;
use crate::status::{DebugMetrics, SharedBuffer, StatusReporter};
use crate::template::Template;

/// Exit code when at least one trusted server disagrees with the
/// template: the oracle itself cannot be trusted for this run.
const EXIT_TEMPLATE_VALIDATION: i32 = 3;

#[tokio::main]
async fn main() {
	let cli = match Cli::try_parse() {
		Ok(cli) => cli,
		Err(err) => {
			// help and version leave through stdout with success
			let code = if err.use_stderr() { 1 } else { 0 };
			let _ = err.print();
			std::process::exit(code);
		}
	};

	let filter = if cli.debug {
		EnvFilter::new("dnsvet=debug")
	} else {
		EnvFilter::from_default_env()
	};
	tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_writer(io::stderr)
		.init();

	match run(cli).await {
		Ok(code) => std::process::exit(code),
		Err(err) => {
			eprintln!("Error: {err:#}");
			std::process::exit(1);
		}
	}
}

async fn run(cli: Cli) -> Result<i32> {
	let template = Arc::new(match &cli.template {
		Some(path) => Template::from_file(Path::new(path)).context("--template")?,
		None => Template::from_str(config::DEFAULT_TEMPLATE)
			.expect("built-in template must parse"),
	});
	let trusted_ips =
		config::parse_server_list(&cli.trusted_list).context("--trusted-list")?;
	let untrusted_ips = config::parse_server_list(&read_list_input(&cli)?)
		.context("--list")?;

	let resolver = Arc::new(UdpResolver);

	// step 1: the template is only trusted if every known-good resolver
	// passes it; their verbose dump is held back unless they don't
	let trusted_settings = Settings::build(
		trusted_ips,
		Arc::clone(&template),
		cli.threads,
		cli.max_poolsize,
		cli.global_ratelimit,
		cli.trusted_ratelimit,
		-1, // run every check, trusted servers are never dropped
		cli.trusted_max_attempts,
		cli.trusted_timeout,
	)?;
	let dump_buffer = SharedBuffer::new();
	let trusted_status = Arc::new(new_reporter(
		&trusted_settings,
		None,
		Some(Box::new(dump_buffer.clone())),
		Some(template.pretty_dump()),
		cli.debug,
	));
	let bar = Progress::spawn("[step 1/2] Template validation", Arc::clone(&trusted_status));
	sched::sanitize(Arc::clone(&resolver), &trusted_settings, Arc::clone(&trusted_status))
		.await;
	bar.stop(&trusted_status).await;

	let trusted_snap = trusted_status.snapshot();
	if trusted_snap.servers_with_failures > 0 {
		eprint!("{}", dump_buffer.contents());
		eprintln!(
			"\n[-] Template validation error: ({}/{} trusted servers failed)",
			trusted_snap.servers_with_failures, trusted_snap.total_servers,
		);
		eprintln!("[-] Possible reasons:");
		eprintln!("    - Unreliable internet connection");
		eprintln!("    - Outdated template entries");
		eprintln!("    - Trusted server not so trustworthy");
		return Ok(EXIT_TEMPLATE_VALIDATION);
	}

	// step 2: stream the candidate set through the same template
	let settings = Settings::build(
		untrusted_ips,
		Arc::clone(&template),
		cli.threads,
		cli.max_poolsize,
		cli.global_ratelimit,
		cli.ratelimit,
		cli.max_mismatches,
		cli.max_attempts,
		cli.timeout,
	)?;
	let output: Box<dyn Write + Send> = match &cli.output {
		Some(path) => Box::new(
			File::create(path).with_context(|| format!("can't create {:?}", path))?,
		),
		None => Box::new(io::stdout()),
	};
	let verbose: Option<Box<dyn Write + Send>> = if cli.verbose {
		Some(Box::new(io::stderr()))
	} else {
		None
	};
	let verbose_header = cli.verbose.then(|| template.pretty_dump());
	let status = Arc::new(new_reporter(&settings, Some(output), verbose, verbose_header, cli.debug));
	let bar = Progress::spawn("[step 2/2] Servers sanitization", Arc::clone(&status));
	sched::sanitize(resolver, &settings, Arc::clone(&status)).await;
	bar.stop(&status).await;

	let snap = status.snapshot();
	let percent_valid = if snap.total_servers > 0 {
		snap.valid_servers as f64 / snap.total_servers as f64 * 100.0
	} else {
		0.0
	};
	eprintln!(
		"[*] Valid servers: {}/{} ({:.1}%)",
		snap.valid_servers, snap.total_servers, percent_valid,
	);
	if cli.debug {
		print_debug_metrics(&status.metrics());
	}
	Ok(0)
}

/// The candidate list comes from --list, or from stdin when piped in.
fn read_list_input(cli: &Cli) -> Result<String> {
	if let Some(list) = &cli.list {
		return Ok(list.clone());
	}
	if io::stdin().is_terminal() {
		bail!("--list is required unless servers are passed through STDIN");
	}
	let mut input = String::new();
	io::stdin().read_to_string(&mut input).context("reading STDIN")?;
	Ok(input)
}

fn new_reporter(
	settings: &Settings,
	output: Option<Box<dyn Write + Send>>,
	verbose: Option<Box<dyn Write + Send>>,
	verbose_header: Option<String>,
	debug: bool,
) -> StatusReporter {
	StatusReporter::new(
		settings.server_ips.len(),
		(settings.server_ips.len() * settings.template.len()) as u64,
		settings.max_pool_size,
		settings.max_threads,
		output,
		verbose,
		verbose_header,
		debug,
	)
}

/// Final gauges recap shown with --debug, one row per tracked metric.
fn print_debug_metrics(metrics: &DebugMetrics) {
	let mut table = Table::new();
	table.load_preset(UTF8_FULL);
	table.set_content_arrangement(ContentArrangement::Dynamic);
	table.set_header(vec!["metric", "current", "peak", "avg", "max"]);
	table.add_row(vec![
		"busy jobs".to_string(),
		metrics.busy_jobs.current.to_string(),
		metrics.busy_jobs.peak.to_string(),
		metrics.busy_jobs.avg().to_string(),
		metrics.busy_jobs.max.to_string(),
	]);
	table.add_row(vec![
		"pool size".to_string(),
		metrics.pool_size.current.to_string(),
		metrics.pool_size.peak.to_string(),
		metrics.pool_size.avg().to_string(),
		metrics.pool_size.max.to_string(),
	]);
	table.add_row(vec![
		"req/s".to_string(),
		metrics.rps_current.to_string(),
		metrics.rps_peak.to_string(),
		metrics.rps_avg.to_string(),
		"-".to_string(),
	]);
	table.add_row(vec![
		"requests".to_string(),
		(metrics.reqs_idle + metrics.reqs_busy).to_string(),
		format!("idle: {}", metrics.reqs_idle),
		format!("busy: {}", metrics.reqs_busy),
		"-".to_string(),
	]);
	eprintln!("{table}");
}
