//! DNS resolver.
//!
//! A 32-entry domain→IP cache, the standard label encoding, and query/answer
//! codecs for A records. The transport is a thin UDP client; until a stack
//! is wired up, resolving a non-cached name fails deterministically with
//! [`NetError::NotReady`] — nothing is ever fabricated.

use alloc::string::String;
use alloc::vec::Vec;

use palmyra_core::kdebug;

use crate::net::device::NetError;
use crate::net::wire::{Ipv4Address, read_be16, write_be16};

/// Cache capacity.
pub const CACHE_SIZE: usize = 32;
/// Fixed transaction id used on queries.
pub const TRANSACTION_ID: u16 = 0x1234;
/// DNS header length.
pub const HEADER_LEN: usize = 12;
/// Record type A.
pub const TYPE_A: u16 = 1;
/// Class IN.
pub const CLASS_IN: u16 = 1;

/// One cached resolution.
#[derive(Debug, Clone)]
struct CacheEntry {
    domain: String,
    address: Ipv4Address,
}

/// Resolver state.
pub struct Dns {
    cache: Vec<CacheEntry>,
    server: Option<Ipv4Address>,
}

impl Dns {
    /// Creates an empty resolver with no server configured.
    #[must_use]
    pub fn new() -> Self {
        Self {
            cache: Vec::new(),
            server: None,
        }
    }

    /// Configures the upstream server.
    pub fn set_server(&mut self, server: Ipv4Address) {
        self.server = Some(server);
    }

    /// The configured upstream server.
    #[must_use]
    pub fn server(&self) -> Option<Ipv4Address> {
        self.server
    }

    /// Looks up a cached resolution.
    #[must_use]
    pub fn lookup(&self, domain: &str) -> Option<Ipv4Address> {
        self.cache
            .iter()
            .find(|e| e.domain.eq_ignore_ascii_case(domain))
            .map(|e| e.address)
    }

    /// Caches a resolution, evicting the oldest entry when full.
    pub fn insert(&mut self, domain: &str, address: Ipv4Address) {
        if let Some(entry) = self
            .cache
            .iter_mut()
            .find(|e| e.domain.eq_ignore_ascii_case(domain))
        {
            entry.address = address;
            return;
        }
        if self.cache.len() == CACHE_SIZE {
            self.cache.remove(0);
        }
        self.cache.push(CacheEntry {
            domain: String::from(domain),
            address,
        });
    }

    /// Number of cached entries.
    #[must_use]
    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// Resolves `domain`.
    ///
    /// Cache hits return immediately. A miss requires wired-up UDP
    /// transport, which this resolver does not yet drive itself; failing
    /// closed is deliberate.
    ///
    /// # Errors
    ///
    /// [`NetError::NotReady`] on any non-cached name.
    pub fn resolve(&self, domain: &str) -> Result<Ipv4Address, NetError> {
        if let Some(address) = self.lookup(domain) {
            return Ok(address);
        }
        kdebug!("dns: no transport, failing resolution of {}", domain);
        Err(NetError::NotReady)
    }
}

impl Default for Dns {
    fn default() -> Self {
        Self::new()
    }
}

/// Encodes a domain name into DNS label format:
/// `"google.com"` → `[6]google[3]com[0]`.
#[must_use]
pub fn encode_name(domain: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(domain.len() + 2);
    for label in domain.split('.') {
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
    out
}

/// Builds an A-record query for `domain`.
#[must_use]
pub fn build_query(domain: &str) -> Vec<u8> {
    let name = encode_name(domain);
    let mut query = Vec::with_capacity(HEADER_LEN + name.len() + 4);
    query.resize(HEADER_LEN, 0);
    write_be16(&mut query, 0, TRANSACTION_ID);
    write_be16(&mut query, 2, 0x0100); // standard query, recursion desired
    write_be16(&mut query, 4, 1); // one question
    query.extend_from_slice(&name);
    let qtype_offset = query.len();
    query.resize(qtype_offset + 4, 0);
    write_be16(&mut query, qtype_offset, TYPE_A);
    write_be16(&mut query, qtype_offset + 2, CLASS_IN);
    query
}

/// Extracts the first A-record address from a response to our query.
///
/// Handles the common compression case (a name pointer in the answer
/// section). Returns `None` on malformed or answerless responses.
#[must_use]
pub fn parse_response(response: &[u8]) -> Option<Ipv4Address> {
    if response.len() < HEADER_LEN || read_be16(response, 0) != TRANSACTION_ID {
        return None;
    }
    let answer_count = read_be16(response, 6);
    if answer_count == 0 {
        return None;
    }

    // Skip the question section.
    let question_count = read_be16(response, 4);
    let mut offset = HEADER_LEN;
    for _ in 0..question_count {
        offset = skip_name(response, offset)?;
        offset += 4; // qtype + qclass
    }

    // Walk answers until an A/IN record with a 4-byte RDATA shows up.
    for _ in 0..answer_count {
        offset = skip_name(response, offset)?;
        if offset + 10 > response.len() {
            return None;
        }
        let rtype = read_be16(response, offset);
        let rclass = read_be16(response, offset + 2);
        let rdlength = usize::from(read_be16(response, offset + 8));
        offset += 10;
        if offset + rdlength > response.len() {
            return None;
        }
        if rtype == TYPE_A && rclass == CLASS_IN && rdlength == 4 {
            return Some(Ipv4Address([
                response[offset],
                response[offset + 1],
                response[offset + 2],
                response[offset + 3],
            ]));
        }
        offset += rdlength;
    }
    None
}

/// Advances past a (possibly compressed) encoded name.
fn skip_name(bytes: &[u8], mut offset: usize) -> Option<usize> {
    loop {
        let len = *bytes.get(offset)?;
        if len == 0 {
            return Some(offset + 1);
        }
        if len & 0xC0 == 0xC0 {
            // Compression pointer: two bytes, ends the name.
            return Some(offset + 2);
        }
        offset += 1 + usize::from(len);
    }
}
