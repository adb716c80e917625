use std::fmt;

/// Outcome of a single DNS query, as seen by the matcher.
///
/// The first block mirrors upstream rcodes; the second block covers
/// transport-level failures. `Rcode` carries any upstream rcode outside
/// the common set (e.g. REFUSED), `Other` carries unclassified errors
/// and renders as "ERROR - <msg>".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
	NoError,
	NxDomain,
	ServFail,
	FormErr,
	NotImp,
	Timeout,
	ConnRefused,
	HostUnreach,
	NetUnreach,
	Skipped,
	Rcode(String),
	Other(String),
}

impl Status {
	/// Parse one of the template grammar's status words.
	/// Transport statuses and SKIPPED are not valid in templates.
	pub fn from_template_word(word: &str) -> Option<Status> {
		match word {
			"NOERROR" => Some(Status::NoError),
			"NXDOMAIN" => Some(Status::NxDomain),
			"SERVFAIL" => Some(Status::ServFail),
			"FORMERR" => Some(Status::FormErr),
			"NOTIMP" => Some(Status::NotImp),
			"TIMEOUT" => Some(Status::Timeout),
			_ => None,
		}
	}

	/// Status equivalence used by the matcher. Strict equality, with one
	/// relaxation: many resolvers time out instead of returning SERVFAIL
	/// for valid TLDs without records, so TIMEOUT and SERVFAIL are
	/// mutually acceptable.
	pub fn matches(&self, other: &Status) -> bool {
		if self == other {
			return true;
		}
		matches!(
			(self, other),
			(Status::Timeout, Status::ServFail) | (Status::ServFail, Status::Timeout)
		)
	}
}

impl fmt::Display for Status {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Status::NoError => f.write_str("NOERROR"),
			Status::NxDomain => f.write_str("NXDOMAIN"),
			Status::ServFail => f.write_str("SERVFAIL"),
			Status::FormErr => f.write_str("FORMERR"),
			Status::NotImp => f.write_str("NOTIMP"),
			Status::Timeout => f.write_str("TIMEOUT"),
			Status::ConnRefused => f.write_str("ECONNREFUSED"),
			Status::HostUnreach => f.write_str("EHOSTUNREACH"),
			Status::NetUnreach => f.write_str("ENETUNREACH"),
			Status::Skipped => f.write_str("SKIPPED"),
			Status::Rcode(name) => f.write_str(name),
			Status::Other(msg) => write!(f, "ERROR - {}", msg),
		}
	}
}

/// Status plus record sets. Shared between real answers and template
/// expectation alternatives (where the record strings are glob patterns).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnswerData {
	pub status: Status,
	pub a: Vec<String>,
	pub cname: Vec<String>,
}

impl AnswerData {
	pub fn status_only(status: Status) -> AnswerData {
		AnswerData { status, a: Vec::new(), cname: Vec::new() }
	}

	/// Record-centric rendering: "A=1.2.3.4 CNAME=x.y" when any record is
	/// present, the bare status word otherwise.
	pub fn render(&self) -> String {
		if self.a.is_empty() && self.cname.is_empty() {
			return self.status.to_string();
		}
		let mut records = Vec::with_capacity(self.a.len() + self.cname.len());
		for a in &self.a {
			records.push(format!("A={}", a));
		}
		for cname in &self.cname {
			records.push(format!("CNAME={}", cname));
		}
		records.join(" ")
	}
}

/// One resolver's answer to one query. Constructed by the resolver
/// adapter, immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsAnswer {
	pub domain: String,
	pub data: AnswerData,
	pub truncated: bool,
}

impl DnsAnswer {
	pub fn new(domain: &str, status: Status) -> DnsAnswer {
		DnsAnswer {
			domain: domain.to_string(),
			data: AnswerData::status_only(status),
			truncated: false,
		}
	}

	/// Placeholder answer for a check that never ran.
	pub fn skipped(domain: &str) -> DnsAnswer {
		DnsAnswer::new(domain, Status::Skipped)
	}

	pub fn status(&self) -> &Status {
		&self.data.status
	}

	/// Transient outcomes worth another attempt: timeouts, SERVFAIL, and
	/// truncated NOERROR answers (the record set may be incomplete).
	pub fn is_worth_retrying(&self) -> bool {
		match self.data.status {
			Status::Timeout | Status::ServFail => true,
			Status::NoError => self.truncated,
			_ => false,
		}
	}
}

impl fmt::Display for DnsAnswer {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{} {}", self.domain, self.data.render())?;
		if self.truncated {
			f.write_str(" [TC=1]")?;
		}
		Ok(())
	}
}
