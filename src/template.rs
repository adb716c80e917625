use std::ops::Deref;
use std::path::Path;

use thiserror::Error;

use crate::answer::{AnswerData, DnsAnswer, Status};

#[derive(Debug, Error)]
pub enum TemplateError {
	#[error("can't find any entry")]
	EmptyDocument,
	#[error("line {line}: {reason}")]
	LineSyntax { line: usize, reason: String },
	#[error("can't open {path:?}")]
	FileOpen {
		path: String,
		#[source]
		source: std::io::Error,
	},
}

/// One template line: a domain plus the ordered alternatives a correct
/// resolver may answer with. The first matching alternative wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateEntry {
	pub domain: String,
	pub valid_answers: Vec<AnswerData>,
}

impl TemplateEntry {
	/// Parse an entry from a comment-stripped, trimmed, non-empty line.
	pub fn parse(line: &str) -> Result<TemplateEntry, String> {
		let domain = match line.split_whitespace().next() {
			Some(d) => d.to_string(),
			None => return Err("empty entry".into()),
		};
		let remainder = &line[domain.len()..];
		if remainder.trim().is_empty() {
			return Err(
				"must have a domain and at least one A|CNAME record \
				 or a status word".into(),
			);
		}
		let mut valid_answers = Vec::new();
		for alt in remainder.split("||") {
			valid_answers.push(parse_alternative(alt.trim())?);
		}
		Ok(TemplateEntry { domain, valid_answers })
	}

	pub fn render(&self) -> String {
		let alts: Vec<String> = self.valid_answers.iter().map(|a| a.render()).collect();
		format!("{} {}", self.domain, alts.join(" || "))
	}

	/// True when at least one alternative accepts the answer: equivalent
	/// status, and both record sets match pattern-for-record under some
	/// permutation.
	pub fn matches(&self, answer: &DnsAnswer) -> bool {
		if self.domain != answer.domain {
			return false;
		}
		self.valid_answers.iter().any(|choice| {
			choice.status.matches(answer.status())
				&& match_records(&choice.a, &answer.data.a)
				&& match_records(&choice.cname, &answer.data.cname)
		})
	}
}

/// Parse one `||`-separated alternative: either a lone status word, or a
/// list of `A=`/`CNAME=` record patterns implying NOERROR.
fn parse_alternative(alt: &str) -> Result<AnswerData, String> {
	let tokens: Vec<&str> = alt.split_whitespace().collect();
	if tokens.is_empty() {
		return Err("empty alternative".into());
	}
	if tokens.len() == 1 {
		if let Some(status) = Status::from_template_word(tokens[0]) {
			return Ok(AnswerData::status_only(status));
		}
	}
	let mut data = AnswerData::status_only(Status::NoError);
	for token in &tokens {
		if let Some(pattern) = token.strip_prefix("A=") {
			data.a.push(pattern.to_string());
		} else if let Some(pattern) = token.strip_prefix("CNAME=") {
			data.cname.push(pattern.to_lowercase());
		} else {
			return Err(format!("invalid record: {:?}", token));
		}
	}
	data.a.sort();
	data.cname.sort();
	Ok(data)
}

/// Ordered list of template entries; input order is preserved so runs are
/// reproducible and the verbose report lines up with the template file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
	entries: Vec<TemplateEntry>,
}

impl Template {
	/// Parse a template from its text form. Lines lose everything after
	/// the first '#'; blank lines are skipped.
	pub fn from_str(content: &str) -> Result<Template, TemplateError> {
		let mut entries = Vec::new();
		for (idx, raw) in content.lines().enumerate() {
			let line = raw.split('#').next().unwrap_or("").trim();
			if line.is_empty() {
				continue;
			}
			let entry = TemplateEntry::parse(line).map_err(|reason| {
				TemplateError::LineSyntax { line: idx + 1, reason }
			})?;
			entries.push(entry);
		}
		if entries.is_empty() {
			return Err(TemplateError::EmptyDocument);
		}
		Ok(Template { entries })
	}

	pub fn from_file(path: &Path) -> Result<Template, TemplateError> {
		let content = std::fs::read_to_string(path).map_err(|source| {
			TemplateError::FileOpen { path: path.display().to_string(), source }
		})?;
		Template::from_str(&content)
	}

	pub fn render(&self) -> String {
		let mut out = String::new();
		for entry in &self.entries {
			out.push_str(&entry.render());
			out.push('\n');
		}
		out
	}

	/// Multi-line summary printed once at the top of the verbose sink.
	pub fn pretty_dump(&self) -> String {
		let mut out = String::from("\x1b[1;34m[*] VALIDATION TEMPLATE:\x1b[m\n");
		for entry in &self.entries {
			out.push_str("    \x1b[34m* ");
			out.push_str(&entry.render());
			out.push_str("\x1b[m\n");
		}
		out
	}
}

impl Deref for Template {
	type Target = [TemplateEntry];

	fn deref(&self) -> &[TemplateEntry] {
		&self.entries
	}
}

/// True iff every pattern matches exactly one value, one-to-one, in some
/// order. Tries permutations of the values lexicographically and
/// short-circuits on the first fit; record sets are tiny in practice.
pub fn match_records(patterns: &[String], values: &[String]) -> bool {
	if patterns.len() != values.len() {
		return false;
	}
	if patterns.is_empty() {
		return true;
	}
	let mut perm: Vec<usize> = (0..values.len()).collect();
	loop {
		if patterns
			.iter()
			.zip(perm.iter())
			.all(|(pattern, &v)| glob_match(pattern, &values[v]))
		{
			return true;
		}
		if !next_permutation(&mut perm) {
			return false;
		}
	}
}

/// Advance `p` to its next lexicographic permutation in place.
/// Returns false once `p` is the last (descending) permutation.
pub fn next_permutation(p: &mut [usize]) -> bool {
	if p.len() < 2 {
		return false;
	}
	// largest k with p[k] < p[k+1]
	let mut k = p.len() - 2;
	while p[k] >= p[k + 1] {
		if k == 0 {
			return false;
		}
		k -= 1;
	}
	// largest l > k with p[k] < p[l]
	let mut l = p.len() - 1;
	while p[k] >= p[l] {
		l -= 1;
	}
	p.swap(k, l);
	p[k + 1..].reverse();
	true
}

/// Glob match with '*' as the only wildcard. The value is lowercased, the
/// pattern is not. Without '*' this is plain equality; with it, the fixed
/// segments must appear in order, the first anchored to the start and the
/// last to the end.
pub fn glob_match(pattern: &str, value: &str) -> bool {
	let value = value.to_lowercase();
	if !pattern.contains('*') {
		return pattern == value;
	}
	let parts: Vec<&str> = pattern.split('*').collect();
	let mut rest = value.as_str();

	let first = parts[0];
	if !first.is_empty() {
		match rest.strip_prefix(first) {
			Some(stripped) => rest = stripped,
			None => return false,
		}
	}
	for part in &parts[1..parts.len() - 1] {
		if part.is_empty() {
			continue; // consecutive '*'
		}
		match rest.find(part) {
			Some(idx) => rest = &rest[idx + part.len()..],
			None => return false,
		}
	}
	let last = parts[parts.len() - 1];
	last.is_empty() || rest.ends_with(last)
}
