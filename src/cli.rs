use clap::Parser;

/// Template-driven DNS resolver validator
#[derive(Parser, Debug)]
#[command(name = "dnsvet")]
#[command(version)]
#[command(about = "Validate DNS resolver lists against a template of expected answers")]
pub struct Cli {
	/// DNS servers to vet: a file path, a comma separated list, or STDIN
	#[arg(short = 'l', long = "list")]
	pub list: Option<String>,

	/// File to write surviving servers to (defaults to STDOUT)
	#[arg(short = 'o', long = "output")]
	pub output: Option<String>,

	/// Custom validation template file (defaults to the built-in one)
	#[arg(long = "template")]
	pub template: Option<String>,

	/// Global max requests per second
	#[arg(long = "global-ratelimit", default_value = "500")]
	pub global_ratelimit: u64,

	/// Max concurrent in-flight queries (0 = auto) [experts only]
	#[arg(long = "threads", default_value = "0")]
	pub threads: usize,

	/// Max servers loaded in memory (0 = auto) [experts only]
	#[arg(long = "max-poolsize", default_value = "0")]
	pub max_poolsize: usize,

	/// Timeout in seconds for DNS queries
	#[arg(short = 't', long = "timeout", default_value = "4")]
	pub timeout: u64,

	/// Max requests per second per DNS server (0 = unpaced)
	#[arg(long = "ratelimit", default_value = "2.0")]
	pub ratelimit: f64,

	/// Max attempts before marking a mismatching check as failed
	#[arg(long = "max-attempts", default_value = "2")]
	pub max_attempts: u32,

	/// Max allowed mismatching checks per server (negative = unlimited)
	#[arg(long = "max-mismatches", default_value = "0", allow_hyphen_values = true)]
	pub max_mismatches: i64,

	/// List of TRUSTED servers used to vet the template itself
	#[arg(long = "trusted-list", default_value = crate::config::DEFAULT_TRUSTED_SERVERS)]
	pub trusted_list: String,

	/// Timeout in seconds for TRUSTED server queries
	#[arg(long = "trusted-timeout", default_value = "2")]
	pub trusted_timeout: u64,

	/// Max requests per second per TRUSTED server
	#[arg(long = "trusted-ratelimit", default_value = "10.0")]
	pub trusted_ratelimit: f64,

	/// Max attempts per check for TRUSTED servers
	#[arg(long = "trusted-max-attempts", default_value = "2")]
	pub trusted_max_attempts: u32,

	/// Show per-server check details on STDERR
	#[arg(long = "verbose")]
	pub verbose: bool,

	/// Show debugging information on STDERR
	#[arg(long = "debug")]
	pub debug: bool,
}
