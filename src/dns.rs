// src/dns.rs

//! DNS observation for flow labelling.
//!
//! Queries seen leaving a target are remembered for a short while so the
//! matching response can be attributed to the name that was actually asked
//! for, even when the answer section only carries a CNAME target.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use dns_parser::{Packet as DnsPacket, RData};
use log::{debug, trace};

pub const DNS_PORT: u16 = 53;
pub const PENDING_TIMEOUT: Duration = Duration::from_secs(10);
pub const CACHE_TTL: Duration = Duration::from_secs(10 * 60);

/// Upper bound on compression pointers followed while decoding one name.
pub const MAX_POINTER_JUMPS: usize = 32;
const MAX_NAME_LEN: usize = 255;
const HEADER_LEN: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsMessage {
    pub id: u16,
    pub is_response: bool,
    pub questions: Vec<String>,
    /// `(owner name, address)` for every A record in the answer section
    pub a_records: Vec<(String, Ipv4Addr)>,
}

/// Decodes a DNS message, falling back to a header and question-only decode
/// when the full message cannot be parsed (for example a truncated answer).
pub fn parse_message(payload: &[u8]) -> Option<DnsMessage> {
    match DnsPacket::parse(payload) {
        Ok(packet) => {
            let a_records = packet
                .answers
                .iter()
                .filter_map(|answer| match &answer.data {
                    RData::A(record) => Some((answer.name.to_string(), record.0)),
                    _ => None,
                })
                .collect();
            Some(DnsMessage {
                id: packet.header.id,
                is_response: !packet.header.query,
                questions: packet.questions.iter().map(|q| q.qname.to_string()).collect(),
                a_records,
            })
        }
        Err(e) => {
            trace!("dns-parser rejected message ({}), decoding header only", e);
            parse_header_and_question(payload)
        }
    }
}

fn parse_header_and_question(payload: &[u8]) -> Option<DnsMessage> {
    if payload.len() < HEADER_LEN {
        return None;
    }
    let id = u16::from_be_bytes([payload[0], payload[1]]);
    let is_response = payload[2] & 0x80 != 0;
    let qdcount = u16::from_be_bytes([payload[4], payload[5]]);

    let mut questions = Vec::new();
    if qdcount > 0 {
        if let Some((name, _)) = decode_name(payload, HEADER_LEN) {
            questions.push(name);
        }
    }

    Some(DnsMessage {
        id,
        is_response,
        questions,
        a_records: Vec::new(),
    })
}

/// Decodes a possibly-compressed domain name starting at `offset`.
///
/// Returns the dotted name and the offset just past the name in the original
/// position. Every compression pointer must jump strictly before the previous
/// jump target, which together with [`MAX_POINTER_JUMPS`] rules out loops.
///
/// # Examples
///
/// ```
/// use packet_forge::dns::decode_name;
///
/// let mut msg = vec![0u8; 12];
/// msg.extend_from_slice(b"\x07example\x03com\x00");
/// msg.extend_from_slice(b"\x03www\xc0\x0c");
///
/// assert_eq!(decode_name(&msg, 12), Some(("example.com".to_string(), 25)));
/// assert_eq!(decode_name(&msg, 25), Some(("www.example.com".to_string(), 31)));
/// ```
pub fn decode_name(message: &[u8], offset: usize) -> Option<(String, usize)> {
    let mut labels: Vec<String> = Vec::new();
    let mut pos = offset;
    let mut end: Option<usize> = None;
    let mut bound = offset;
    let mut jumps = 0;
    let mut name_len = 0;

    loop {
        let len = *message.get(pos)? as usize;
        match len & 0xc0 {
            0xc0 => {
                let low = *message.get(pos + 1)? as usize;
                let target = ((len & 0x3f) << 8) | low;
                if target >= bound.min(pos) {
                    return None;
                }
                jumps += 1;
                if jumps > MAX_POINTER_JUMPS {
                    return None;
                }
                end.get_or_insert(pos + 2);
                bound = target;
                pos = target;
            }
            0x00 => {
                if len == 0 {
                    end.get_or_insert(pos + 1);
                    break;
                }
                let label = message.get(pos + 1..pos + 1 + len)?;
                name_len += len + 1;
                if name_len > MAX_NAME_LEN {
                    return None;
                }
                labels.push(String::from_utf8_lossy(label).into_owned());
                pos += 1 + len;
            }
            _ => return None,
        }
    }

    Some((labels.join("."), end?))
}

struct Pending {
    name: Option<String>,
    at: Instant,
}

struct CachedName {
    name: String,
    at: Instant,
}

/// Tracks in-flight queries and the resulting `ip -> name` associations.
#[derive(Default)]
pub struct DnsTracker {
    pending: HashMap<(Ipv4Addr, Ipv4Addr, u16), Pending>,
    cache: HashMap<Ipv4Addr, CachedName>,
}

impl DnsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one UDP payload seen between `src` and `dst`.
    pub fn observe(
        &mut self,
        src: Ipv4Addr,
        dst: Ipv4Addr,
        src_port: u16,
        dst_port: u16,
        payload: &[u8],
        now: Instant,
    ) {
        if src_port != DNS_PORT && dst_port != DNS_PORT {
            return;
        }
        let Some(message) = parse_message(payload) else {
            return;
        };

        if dst_port == DNS_PORT && !message.is_response {
            trace!("DNS query {} from {} for {:?}", message.id, src, message.questions);
            self.pending.insert(
                (src, dst, message.id),
                Pending {
                    name: message.questions.first().cloned(),
                    at: now,
                },
            );
            return;
        }

        if src_port == DNS_PORT && message.is_response {
            let asked = self
                .pending
                .remove(&(dst, src, message.id))
                .filter(|p| now.saturating_duration_since(p.at) < PENDING_TIMEOUT)
                .and_then(|p| p.name);
            for (owner, ip) in &message.a_records {
                let name = asked
                    .clone()
                    .or_else(|| message.questions.first().cloned())
                    .unwrap_or_else(|| owner.clone());
                debug!("DNS {} -> {}", ip, name);
                self.cache.insert(*ip, CachedName { name, at: now });
            }
        }
    }

    /// Records a name learned some other way (TLS SNI).
    pub fn insert_name(&mut self, ip: Ipv4Addr, name: &str, now: Instant) {
        self.cache.insert(
            ip,
            CachedName {
                name: name.to_string(),
                at: now,
            },
        );
    }

    pub fn lookup(&self, ip: Ipv4Addr, now: Instant) -> Option<&str> {
        self.cache
            .get(&ip)
            .filter(|c| now.saturating_duration_since(c.at) < CACHE_TTL)
            .map(|c| c.name.as_str())
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn sweep(&mut self, now: Instant) {
        self.pending
            .retain(|_, p| now.saturating_duration_since(p.at) < PENDING_TIMEOUT);
        self.cache
            .retain(|_, c| now.saturating_duration_since(c.at) < CACHE_TTL);
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.cache.clear();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    fn encode_name(name: &str) -> Vec<u8> {
        let mut out = Vec::new();
        for label in name.split('.') {
            out.push(label.len() as u8);
            out.extend_from_slice(label.as_bytes());
        }
        out.push(0);
        out
    }

    pub(crate) fn query(id: u16, name: &str) -> Vec<u8> {
        let mut msg = Vec::new();
        msg.extend_from_slice(&id.to_be_bytes());
        msg.extend_from_slice(&[0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
        msg.extend_from_slice(&encode_name(name));
        msg.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);
        msg
    }

    /// Response with a CNAME-free answer whose owner name is a pointer to the question.
    pub(crate) fn response(id: u16, name: &str, ip: Ipv4Addr) -> Vec<u8> {
        let mut msg = Vec::new();
        msg.extend_from_slice(&id.to_be_bytes());
        msg.extend_from_slice(&[0x81, 0x80, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00]);
        msg.extend_from_slice(&encode_name(name));
        msg.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);
        msg.extend_from_slice(&[0xc0, 0x0c, 0x00, 0x01, 0x00, 0x01]);
        msg.extend_from_slice(&300u32.to_be_bytes());
        msg.extend_from_slice(&[0x00, 0x04]);
        msg.extend_from_slice(&ip.octets());
        msg
    }

    #[test]
    fn test_parse_query_and_response() {
        let q = parse_message(&query(0x1234, "example.com")).unwrap();
        assert_eq!(q.id, 0x1234);
        assert!(!q.is_response);
        assert_eq!(q.questions, vec!["example.com".to_string()]);

        let r = parse_message(&response(0x1234, "example.com", Ipv4Addr::new(93, 184, 216, 34))).unwrap();
        assert!(r.is_response);
        assert_eq!(
            r.a_records,
            vec![("example.com".to_string(), Ipv4Addr::new(93, 184, 216, 34))]
        );
    }

    #[test]
    fn test_decode_multiple_backward_jumps() {
        let mut msg = vec![0u8; 12];
        msg.extend_from_slice(b"\x03com\x00"); // 12
        msg.extend_from_slice(b"\x07example\xc0\x0c"); // 17
        msg.extend_from_slice(b"\x03www\xc0\x11"); // 27
        msg.extend_from_slice(b"\xc0\x1b"); // 33

        assert_eq!(decode_name(&msg, 33), Some(("www.example.com".to_string(), 35)));
        assert_eq!(decode_name(&msg, 27), Some(("www.example.com".to_string(), 33)));
    }

    #[test]
    fn test_decode_rejects_loops() {
        // pointer to itself
        let mut msg = vec![0u8; 12];
        msg.extend_from_slice(b"\xc0\x0c");
        assert_eq!(decode_name(&msg, 12), None);

        // label then pointer back to the start of the same name
        let mut msg = vec![0u8; 12];
        msg.extend_from_slice(b"\x01a\xc0\x0c");
        assert_eq!(decode_name(&msg, 12), None);

        // forward pointer
        let mut msg = vec![0u8; 12];
        msg.extend_from_slice(b"\xc0\x20");
        msg.resize(40, 0);
        assert_eq!(decode_name(&msg, 12), None);
    }

    #[test]
    fn test_decode_truncated() {
        let msg = b"\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x07exam";
        assert_eq!(decode_name(msg, 12), None);
    }

    #[test]
    fn test_tracker_correlates_query_and_response() {
        let client = Ipv4Addr::new(192, 168, 1, 20);
        let resolver = Ipv4Addr::new(8, 8, 8, 8);
        let answer = Ipv4Addr::new(93, 184, 216, 34);
        let now = Instant::now();

        let mut tracker = DnsTracker::new();
        tracker.observe(client, resolver, 40000, 53, &query(7, "example.com"), now);
        assert_eq!(tracker.pending_len(), 1);

        tracker.observe(resolver, client, 53, 40000, &response(7, "example.com", answer), now);
        assert_eq!(tracker.pending_len(), 0);
        assert_eq!(tracker.lookup(answer, now), Some("example.com"));
        assert_eq!(tracker.lookup(answer, now + CACHE_TTL), None);
    }

    #[test]
    fn test_late_response_is_not_correlated() {
        let client = Ipv4Addr::new(192, 168, 1, 20);
        let resolver = Ipv4Addr::new(8, 8, 8, 8);
        let answer = Ipv4Addr::new(10, 1, 1, 1);
        let now = Instant::now();

        let mut tracker = DnsTracker::new();
        tracker.observe(client, resolver, 40000, 53, &query(9, "asked.test"), now);
        tracker.observe(resolver, client, 53, 40000, &response(9, "other.test", answer), now);
        assert_eq!(tracker.lookup(answer, now), Some("asked.test"));

        let late = now + PENDING_TIMEOUT;
        tracker.observe(client, resolver, 40000, 53, &query(9, "asked.test"), now);
        tracker.observe(resolver, client, 53, 40000, &response(9, "other.test", answer), late);
        assert_eq!(tracker.pending_len(), 0);
        assert_eq!(tracker.lookup(answer, late), Some("other.test"));
    }

    #[test]
    fn test_tracker_sweep() {
        let now = Instant::now();
        let mut tracker = DnsTracker::new();
        tracker.observe(
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(10, 0, 0, 1),
            5000,
            53,
            &query(1, "a.test"),
            now,
        );
        tracker.insert_name(Ipv4Addr::new(1, 1, 1, 1), "one.test", now);

        tracker.sweep(now + PENDING_TIMEOUT);
        assert_eq!(tracker.pending_len(), 0);
        assert_eq!(tracker.lookup(Ipv4Addr::new(1, 1, 1, 1), now + PENDING_TIMEOUT), Some("one.test"));

        tracker.sweep(now + CACHE_TTL);
        assert_eq!(tracker.lookup(Ipv4Addr::new(1, 1, 1, 1), now), None);
    }
}
