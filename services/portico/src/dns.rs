//! DNS probe resolver.
//!
//! The control API resolves one query through whatever [`Resolver`] is
//! currently installed in the [`ResolverSlot`]. An empty slot means DNS is
//! disabled, which callers report as "resolver unavailable" rather than as
//! a failure.

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, Record, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use serde::Serialize;
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::debug;

/// Default per-nameserver timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

const MAX_RESPONSE: usize = 4096;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("invalid record type `{0}`")]
    InvalidRecordType(String),

    #[error("invalid name `{0}`")]
    InvalidName(String),

    #[error("exchange failed: {0}")]
    Exchange(String),

    #[error("query timed out")]
    Timeout,
}

/// Anything that answers a DNS message.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn exchange(&self, query: &Message) -> Result<Message, ResolveError>;
}

/// Plain UDP upstream. Nameservers are tried in order; the first answer
/// wins.
#[derive(Debug, Clone)]
pub struct UdpResolver {
    nameservers: Vec<SocketAddr>,
    timeout: Duration,
}

impl UdpResolver {
    pub fn new(nameservers: Vec<SocketAddr>, timeout: Duration) -> Self {
        Self {
            nameservers,
            timeout,
        }
    }

    async fn exchange_one(&self, server: SocketAddr, wire: &[u8], id: u16) -> Result<Message, ResolveError> {
        let bind: SocketAddr = if server.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(bind)
            .await
            .map_err(|e| ResolveError::Exchange(e.to_string()))?;
        socket
            .send_to(wire, server)
            .await
            .map_err(|e| ResolveError::Exchange(e.to_string()))?;

        let mut buf = vec![0u8; MAX_RESPONSE];
        let exchange = async {
            loop {
                let (n, from) = socket
                    .recv_from(&mut buf)
                    .await
                    .map_err(|e| ResolveError::Exchange(e.to_string()))?;
                if from != server {
                    continue;
                }
                let response = Message::from_vec(&buf[..n])
                    .map_err(|e| ResolveError::Exchange(format!("malformed response: {e}")))?;
                if response.id() == id {
                    return Ok(response);
                }
            }
        };
        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| ResolveError::Timeout)?
    }
}

#[async_trait]
impl Resolver for UdpResolver {
    async fn exchange(&self, query: &Message) -> Result<Message, ResolveError> {
        let wire = query
            .to_vec()
            .map_err(|e| ResolveError::Exchange(format!("encode query: {e}")))?;

        let mut last = ResolveError::Exchange("no nameserver configured".to_string());
        for server in &self.nameservers {
            match self.exchange_one(*server, &wire, query.id()).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    debug!(nameserver = %server, error = %e, "Nameserver failed");
                    last = e;
                }
            }
        }
        Err(last)
    }
}

/// Currently installed resolver, if any.
#[derive(Default)]
pub struct ResolverSlot {
    current: ArcSwapOption<Box<dyn Resolver>>,
}

impl ResolverSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, resolver: Option<Box<dyn Resolver>>) {
        self.current.store(resolver.map(Arc::new));
    }

    pub fn get(&self) -> Option<Arc<Box<dyn Resolver>>> {
        self.current.load_full()
    }

    pub fn is_available(&self) -> bool {
        self.current.load().is_some()
    }
}

/// Parse a record type name such as `A`, `aaaa` or `TXT`.
pub fn parse_record_type(name: &str) -> Result<RecordType, ResolveError> {
    let upper = name.trim().to_ascii_uppercase();
    match RecordType::from_str(&upper) {
        Ok(RecordType::Unknown(_)) | Err(_) => Err(ResolveError::InvalidRecordType(name.to_string())),
        Ok(record_type) => Ok(record_type),
    }
}

/// Build a recursive query for `name` / `record_type`.
pub fn build_query(name: &str, record_type: RecordType) -> Result<Message, ResolveError> {
    let mut fqdn = Name::from_str(name).map_err(|_| ResolveError::InvalidName(name.to_string()))?;
    fqdn.set_fqdn(true);

    let mut message = Message::new();
    message
        .set_id(query_id())
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(fqdn, record_type));
    Ok(message)
}

/// A fresh random message id. Replies are matched on it, so it must not be
/// guessable by an off-path sender; a v4 uuid is 122 bits of OS randomness.
fn query_id() -> u16 {
    let [hi, lo, ..] = uuid::Uuid::new_v4().into_bytes();
    u16::from_be_bytes([hi, lo])
}

/// Question section entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DnsQuestion {
    pub name: String,
    #[serde(rename = "type")]
    pub qtype: u16,
    #[serde(rename = "class")]
    pub qclass: u16,
}

/// Answer or authority section entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DnsRecord {
    pub name: String,
    #[serde(rename = "type")]
    pub rtype: u16,
    #[serde(rename = "TTL")]
    pub ttl: u32,
    pub data: String,
}

impl From<&Record> for DnsRecord {
    fn from(record: &Record) -> Self {
        Self {
            name: record.name().to_string(),
            rtype: u16::from(record.record_type()),
            ttl: record.ttl(),
            data: record.data().map(|d| d.to_string()).unwrap_or_default(),
        }
    }
}

/// Decoded probe response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DnsResponse {
    #[serde(rename = "Status")]
    pub status: u16,
    #[serde(rename = "Question")]
    pub question: Vec<DnsQuestion>,
    #[serde(rename = "TC")]
    pub truncated: bool,
    #[serde(rename = "RD")]
    pub recursion_desired: bool,
    #[serde(rename = "RA")]
    pub recursion_available: bool,
    #[serde(rename = "AD")]
    pub authentic_data: bool,
    #[serde(rename = "CD")]
    pub checking_disabled: bool,
    #[serde(rename = "Answer")]
    pub answer: Vec<DnsRecord>,
    #[serde(rename = "Authority")]
    pub authority: Vec<DnsRecord>,
}

impl From<&Message> for DnsResponse {
    fn from(message: &Message) -> Self {
        Self {
            status: u16::from(message.response_code()),
            question: message
                .queries()
                .iter()
                .map(|q| DnsQuestion {
                    name: q.name().to_string(),
                    qtype: u16::from(q.query_type()),
                    qclass: u16::from(q.query_class()),
                })
                .collect(),
            truncated: message.truncated(),
            recursion_desired: message.recursion_desired(),
            recursion_available: message.recursion_available(),
            authentic_data: message.authentic_data(),
            checking_disabled: message.checking_disabled(),
            answer: message.answers().iter().map(DnsRecord::from).collect(),
            authority: message.name_servers().iter().map(DnsRecord::from).collect(),
        }
    }
}

/// Resolve one name through `resolver` and decode the answer.
pub async fn probe(resolver: &dyn Resolver, name: &str, record_type: &str) -> Result<DnsResponse, ResolveError> {
    let record_type = parse_record_type(record_type)?;
    let query = build_query(name, record_type)?;
    let response = resolver.exchange(&query).await?;
    Ok(DnsResponse::from(&response))
}


#[cfg(test)]
mod tests {
    use super::testing::{answer, StaticResolver};
    use super::*;
    use rstest::rstest;
    use std::collections::HashSet;
    use std::net::Ipv4Addr;

    #[rstest]
    #[case("A", RecordType::A)]
    #[case("aaaa", RecordType::AAAA)]
    #[case(" TXT ", RecordType::TXT)]
    fn test_parse_record_type(#[case] input: &str, #[case] expected: RecordType) {
        assert_eq!(parse_record_type(input).unwrap(), expected);
    }

    #[rstest]
    #[case("")]
    #[case("NOPE")]
    fn test_parse_record_type_rejects(#[case] input: &str) {
        assert!(matches!(
            parse_record_type(input),
            Err(ResolveError::InvalidRecordType(_))
        ));
    }

    #[tokio::test]
    async fn test_probe_decodes_answer() {
        let resolver = StaticResolver(Ipv4Addr::new(1, 2, 3, 4));
        let response = probe(&resolver, "example.com", "A").await.unwrap();

        assert_eq!(response.status, 0);
        assert!(response.recursion_desired);
        assert_eq!(response.question[0].name, "example.com.");
        assert_eq!(response.question[0].qtype, 1);
        assert_eq!(response.question[0].qclass, 1);
        assert_eq!(response.answer[0].ttl, 300);
        assert_eq!(response.answer[0].data, "1.2.3.4");
        assert!(response.authority.is_empty());
    }

    #[tokio::test]
    async fn test_udp_resolver_exchanges_with_nameserver() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            let (n, peer) = server.recv_from(&mut buf).await.unwrap();
            let query = Message::from_vec(&buf[..n]).unwrap();
            let reply = answer(&query, Ipv4Addr::new(9, 9, 9, 9)).to_vec().unwrap();
            server.send_to(&reply, peer).await.unwrap();
        });

        let resolver = UdpResolver::new(vec![server_addr], Duration::from_secs(2));
        let response = probe(&resolver, "portico.test", "A").await.unwrap();
        assert_eq!(response.answer[0].data, "9.9.9.9");
    }

    #[tokio::test]
    async fn test_udp_resolver_times_out() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let resolver = UdpResolver::new(vec![silent.local_addr().unwrap()], Duration::from_millis(50));
        let err = probe(&resolver, "portico.test", "A").await.unwrap_err();
        assert!(matches!(err, ResolveError::Timeout));
    }

    #[test]
    fn test_slot_availability() {
        let slot = ResolverSlot::new();
        assert!(!slot.is_available());
        slot.set(Some(Box::new(StaticResolver(Ipv4Addr::LOCALHOST))));
        assert!(slot.is_available());
        slot.set(None);
        assert!(slot.get().is_none());
    }

    #[test]
    fn test_query_ids_vary() {
        let ids: HashSet<u16> = (0..8)
            .map(|_| build_query("example.com", RecordType::A).unwrap().id())
            .collect();
        assert!(ids.len() > 1);
    }
}
