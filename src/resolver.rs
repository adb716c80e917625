use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use hickory_proto::op::{Edns, Message, MessageType, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, RecordType};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::answer::{DnsAnswer, Status};

/// EDNS0 advertised UDP payload size. 1232 avoids IP fragmentation on
/// virtually every path (DNS flag day 2020 value).
const EDNS_UDP_PAYLOAD: u16 = 1232;

const DNS_PORT: u16 = 53;

/// Narrow seam between the scheduler and the network, so tests can
/// substitute a scripted resolver. One method, no retries, no template
/// knowledge: every outcome, including failures, is folded into the
/// returned answer.
pub trait Resolve: Send + Sync + 'static {
	fn resolve(
		&self,
		domain: &str,
		server_ip: IpAddr,
		timeout: Duration,
		cancel: CancellationToken,
	) -> impl Future<Output = DnsAnswer> + Send;
}

/// Real resolver adapter: one UDP A query per call, one throwaway
/// socket per query so concurrent workers can't steal each other's
/// responses.
#[derive(Debug, Default, Clone, Copy)]
pub struct UdpResolver;

impl Resolve for UdpResolver {
	fn resolve(
		&self,
		domain: &str,
		server_ip: IpAddr,
		timeout: Duration,
		cancel: CancellationToken,
	) -> impl Future<Output = DnsAnswer> + Send {
		async move {
			tokio::select! {
				// cancellation first: a dropped server must not keep
				// queries on the wire
				biased;
				_ = cancel.cancelled() => {
					DnsAnswer::new(domain, Status::Other("cancelled".into()))
				}
				answer = query_once(domain, server_ip, timeout) => answer,
			}
		}
	}
}

async fn query_once(domain: &str, server_ip: IpAddr, timeout: Duration) -> DnsAnswer {
	let (query_bytes, txid) = match build_query(domain) {
		Ok(built) => built,
		Err(msg) => return DnsAnswer::new(domain, Status::Other(msg)),
	};
	match tokio::time::timeout(timeout, exchange(&query_bytes, txid, server_ip)).await {
		Ok(Ok(response)) => answer_from_response(domain, &response),
		Ok(Err(err)) => DnsAnswer::new(domain, classify_io_error(&err)),
		Err(_elapsed) => DnsAnswer::new(domain, Status::Timeout),
	}
}

/// Build the wire-format A query with a random transaction id and an
/// EDNS0 OPT advertising our receive buffer.
fn build_query(domain: &str) -> Result<(Vec<u8>, u16), String> {
	let mut name = Name::from_ascii(domain)
		.map_err(|e| format!("invalid domain name {:?}: {}", domain, e))?;
	name.set_fqdn(true);

	let txid: u16 = rand::random();
	let mut message = Message::new();
	message.set_id(txid);
	message.set_recursion_desired(true);
	message.add_query(Query::query(name, RecordType::A));

	let mut edns = Edns::new();
	edns.set_max_payload(EDNS_UDP_PAYLOAD);
	edns.set_version(0);
	message.set_edns(edns);

	let bytes = message
		.to_vec()
		.map_err(|e| format!("failed to serialize query: {}", e))?;
	Ok((bytes, txid))
}

/// Send the query and wait for the matching response. Datagrams with a
/// foreign transaction id or unparseable contents are skipped; the
/// outer timeout bounds the whole exchange.
async fn exchange(query_bytes: &[u8], txid: u16, server_ip: IpAddr) -> io::Result<Message> {
	let bind_addr: SocketAddr = if server_ip.is_ipv4() {
		"0.0.0.0:0".parse().unwrap()
	} else {
		"[::]:0".parse().unwrap()
	};
	let socket = UdpSocket::bind(bind_addr).await?;
	socket.send_to(query_bytes, SocketAddr::new(server_ip, DNS_PORT)).await?;

	let mut buf = vec![0u8; 4096];
	loop {
		let (len, _src) = socket.recv_from(&mut buf).await?;
		let message = match Message::from_vec(&buf[..len]) {
			Ok(m) => m,
			Err(_) => continue,
		};
		if message.id() != txid || message.message_type() != MessageType::Response {
			continue;
		}
		return Ok(message);
	}
}

/// Fold a parsed response into an answer: rcode name as status, sorted
/// A / CNAME records from the answer section, TC flag preserved.
fn answer_from_response(domain: &str, response: &Message) -> DnsAnswer {
	let mut answer = DnsAnswer::new(domain, status_from_rcode(response.response_code()));
	answer.truncated = response.truncated();
	if *answer.status() != Status::NoError {
		return answer;
	}
	for record in response.answers() {
		match record.data() {
			Some(RData::A(a)) => answer.data.a.push(a.0.to_string()),
			Some(RData::CNAME(cname)) => answer.data.cname.push(cname.0.to_string()),
			_ => {}
		}
	}
	answer.data.a.sort();
	answer.data.cname.sort();
	answer
}

fn status_from_rcode(rcode: ResponseCode) -> Status {
	match rcode {
		ResponseCode::NoError => Status::NoError,
		ResponseCode::NXDomain => Status::NxDomain,
		ResponseCode::ServFail => Status::ServFail,
		ResponseCode::FormErr => Status::FormErr,
		ResponseCode::NotImp => Status::NotImp,
		other => Status::Rcode(other.to_string()),
	}
}

/// Classify transport failures by structured error kind; anything
/// unrecognized keeps its message under the ERROR umbrella status.
fn classify_io_error(err: &io::Error) -> Status {
	match err.kind() {
		io::ErrorKind::ConnectionRefused => Status::ConnRefused,
		io::ErrorKind::HostUnreachable => Status::HostUnreach,
		io::ErrorKind::NetworkUnreachable => Status::NetUnreach,
		io::ErrorKind::TimedOut => Status::Timeout,
		_ => Status::Other(err.to_string()),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_build_query_shape() {
		let (bytes, txid) = build_query("example.com").unwrap();
		assert!(bytes.len() >= 12);
		// txid occupies the first two bytes, big-endian
		assert_eq!(bytes[0], (txid >> 8) as u8);
		assert_eq!(bytes[1], (txid & 0xff) as u8);

		let message = Message::from_vec(&bytes).unwrap();
		assert_eq!(message.queries().len(), 1);
		assert_eq!(message.queries()[0].query_type(), RecordType::A);
		assert!(message.queries()[0].name().is_fqdn());
		assert_eq!(message.extensions().as_ref().unwrap().max_payload(), 1232);
	}

	#[test]
	fn test_build_query_invalid_domain() {
		let err = build_query("exa mple").unwrap_err();
		assert!(err.contains("invalid domain name"));
	}

	#[test]
	fn test_answer_from_response() {
		let (bytes, _) = build_query("example.com").unwrap();
		let mut response = Message::from_vec(&bytes).unwrap();
		response.set_message_type(MessageType::Response);
		response.set_truncated(true);

		let answer = answer_from_response("example.com", &response);
		assert_eq!(*answer.status(), Status::NoError);
		assert!(answer.truncated);
		assert!(answer.data.a.is_empty());
	}

	#[test]
	fn test_answer_from_error_rcode() {
		let (bytes, _) = build_query("example.com").unwrap();
		let mut response = Message::from_vec(&bytes).unwrap();
		response.set_message_type(MessageType::Response);
		response.set_response_code(ResponseCode::NXDomain);

		let answer = answer_from_response("example.com", &response);
		assert_eq!(*answer.status(), Status::NxDomain);
	}

	#[test]
	fn test_classify_io_error() {
		let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
		assert_eq!(classify_io_error(&refused), Status::ConnRefused);
		let unreach = io::Error::from(io::ErrorKind::NetworkUnreachable);
		assert_eq!(classify_io_error(&unreach), Status::NetUnreach);
		let other = io::Error::new(io::ErrorKind::Other, "boom");
		match classify_io_error(&other) {
			Status::Other(msg) => assert!(msg.contains("boom")),
			status => panic!("unexpected status: {status:?}"),
		}
	}

	#[tokio::test]
	async fn test_cancellation_wins() {
		let cancel = CancellationToken::new();
		cancel.cancel();
		// 192.0.2.0/24 is TEST-NET-1: nothing will ever answer, so only
		// cancellation can end this quickly
		let answer = UdpResolver
			.resolve(
				"example.com",
				"192.0.2.1".parse().unwrap(),
				Duration::from_secs(30),
				cancel,
			)
			.await;
		match answer.status() {
			Status::Other(msg) => assert!(msg.contains("cancelled")),
			status => panic!("unexpected status: {status:?}"),
		}
	}
}
