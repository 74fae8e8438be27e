//! DNS wire format codec (RFC 1035).
//!
//! Decoding is defensive: every section is bounds-checked against the
//! buffer and compression pointers are followed in a loop that records
//! each visited target, so a pointer chain that loops back fails with
//! [`DnsError::CompressionCycle`] instead of spinning. Encoding always
//! writes full labels and never emits compression pointers.

use crate::error::DnsError;
use std::collections::HashSet;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

// DNS wire format constants
pub const HEADER_SIZE: usize = 12;
const FLAG_QR: u16 = 0x8000; // Query/Response flag
const FLAG_AA: u16 = 0x0400; // Authoritative answer
const FLAG_TC: u16 = 0x0200; // Truncated
const FLAG_RD: u16 = 0x0100; // Recursion desired
const FLAG_RA: u16 = 0x0080; // Recursion available
const FLAG_RCODE_MASK: u16 = 0x000F; // Response code mask
const OPCODE_SHIFT: u16 = 11;
const OPCODE_MASK: u16 = 0x000F;

// RFC 1035: labels are 1-63 octets, whole names at most 255 octets encoded
const MAX_LABEL_LEN: usize = 63;
const MAX_NAME_LEN: usize = 255;
const POINTER_TAG: u8 = 0xC0;
const POINTER_OFFSET_MASK: u16 = 0x3FFF;

// Fixed part of a resource record after its name: TYPE, CLASS, TTL, RDLENGTH
const RR_FIXED_LEN: usize = 10;

// DNS record type values (RFC 1035 + extensions)
const TYPE_A: u16 = 1;
const TYPE_NS: u16 = 2;
const TYPE_CNAME: u16 = 5;
const TYPE_SOA: u16 = 6;
const TYPE_PTR: u16 = 12;
const TYPE_MX: u16 = 15;
const TYPE_TXT: u16 = 16;
const TYPE_AAAA: u16 = 28;
const TYPE_ANY: u16 = 255;

// DNS class values
const CLASS_IN: u16 = 1;
const CLASS_CH: u16 = 3;
const CLASS_HS: u16 = 4;
const CLASS_ANY: u16 = 255;

/// Standard query opcode
pub const OPCODE_QUERY: u8 = 0;

/// DNS response codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    NoError,
    FormErr,
    ServFail,
    NxDomain,
    NotImp,
    Refused,
    Other(u8),
}

impl ResponseCode {
    /// Create from the low four bits of the flags word
    pub fn from_u16(value: u16) -> Self {
        match value & FLAG_RCODE_MASK {
            0 => ResponseCode::NoError,
            1 => ResponseCode::FormErr,
            2 => ResponseCode::ServFail,
            3 => ResponseCode::NxDomain,
            4 => ResponseCode::NotImp,
            5 => ResponseCode::Refused,
            other => ResponseCode::Other(other as u8),
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            ResponseCode::NoError => 0,
            ResponseCode::FormErr => 1,
            ResponseCode::ServFail => 2,
            ResponseCode::NxDomain => 3,
            ResponseCode::NotImp => 4,
            ResponseCode::Refused => 5,
            ResponseCode::Other(v) => u16::from(v) & FLAG_RCODE_MASK,
        }
    }
}

/// DNS record types. Unknown values pass through as `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(clippy::upper_case_acronyms)]
pub enum RecordType {
    A,
    NS,
    CNAME,
    SOA,
    PTR,
    MX,
    TXT,
    AAAA,
    ANY,
    Other(u16),
}

impl RecordType {
    /// Create from raw type value
    pub fn from_u16(value: u16) -> Self {
        match value {
            TYPE_A => RecordType::A,
            TYPE_NS => RecordType::NS,
            TYPE_CNAME => RecordType::CNAME,
            TYPE_SOA => RecordType::SOA,
            TYPE_PTR => RecordType::PTR,
            TYPE_MX => RecordType::MX,
            TYPE_TXT => RecordType::TXT,
            TYPE_AAAA => RecordType::AAAA,
            TYPE_ANY => RecordType::ANY,
            other => RecordType::Other(other),
        }
    }

    /// Convert to raw type value
    pub fn to_u16(self) -> u16 {
        match self {
            RecordType::A => TYPE_A,
            RecordType::NS => TYPE_NS,
            RecordType::CNAME => TYPE_CNAME,
            RecordType::SOA => TYPE_SOA,
            RecordType::PTR => TYPE_PTR,
            RecordType::MX => TYPE_MX,
            RecordType::TXT => TYPE_TXT,
            RecordType::AAAA => TYPE_AAAA,
            RecordType::ANY => TYPE_ANY,
            RecordType::Other(v) => v,
        }
    }

    /// Types the record cache retains
    pub fn is_cacheable(self) -> bool {
        matches!(
            self,
            RecordType::A | RecordType::NS | RecordType::CNAME | RecordType::AAAA
        )
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordType::A => write!(f, "A"),
            RecordType::NS => write!(f, "NS"),
            RecordType::CNAME => write!(f, "CNAME"),
            RecordType::SOA => write!(f, "SOA"),
            RecordType::PTR => write!(f, "PTR"),
            RecordType::MX => write!(f, "MX"),
            RecordType::TXT => write!(f, "TXT"),
            RecordType::AAAA => write!(f, "AAAA"),
            RecordType::ANY => write!(f, "ANY"),
            RecordType::Other(v) => write!(f, "TYPE{}", v),
        }
    }
}

/// DNS record classes. Unknown values pass through as `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(clippy::upper_case_acronyms)]
pub enum RecordClass {
    IN,
    CH,
    HS,
    ANY,
    Other(u16),
}

impl RecordClass {
    pub fn from_u16(value: u16) -> Self {
        match value {
            CLASS_IN => RecordClass::IN,
            CLASS_CH => RecordClass::CH,
            CLASS_HS => RecordClass::HS,
            CLASS_ANY => RecordClass::ANY,
            other => RecordClass::Other(other),
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            RecordClass::IN => CLASS_IN,
            RecordClass::CH => CLASS_CH,
            RecordClass::HS => CLASS_HS,
            RecordClass::ANY => CLASS_ANY,
            RecordClass::Other(v) => v,
        }
    }
}

/// Header flags word (QR, opcode, AA, TC, RD, RA, rcode)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags(u16);

impl Flags {
    pub fn from_bits(bits: u16) -> Self {
        Flags(bits)
    }

    pub fn bits(self) -> u16 {
        self.0
    }

    pub fn is_response(self) -> bool {
        self.0 & FLAG_QR != 0
    }

    pub fn opcode(self) -> u8 {
        ((self.0 >> OPCODE_SHIFT) & OPCODE_MASK) as u8
    }

    pub fn is_authoritative(self) -> bool {
        self.0 & FLAG_AA != 0
    }

    pub fn is_truncated(self) -> bool {
        self.0 & FLAG_TC != 0
    }

    pub fn recursion_desired(self) -> bool {
        self.0 & FLAG_RD != 0
    }

    pub fn recursion_available(self) -> bool {
        self.0 & FLAG_RA != 0
    }

    pub fn response_code(self) -> ResponseCode {
        ResponseCode::from_u16(self.0)
    }

    pub fn with_response_code(self, rcode: ResponseCode) -> Self {
        Flags((self.0 & !FLAG_RCODE_MASK) | rcode.to_u16())
    }

    pub fn with_truncated(self, truncated: bool) -> Self {
        if truncated {
            Flags(self.0 | FLAG_TC)
        } else {
            Flags(self.0 & !FLAG_TC)
        }
    }
}

/// A domain name as an ordered list of ASCII labels.
///
/// Equality is exact; use [`Name::eq_ignore_case`] or [`Name::to_lowercase`]
/// for lookups. Length limits are checked when the name is encoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Name {
    labels: Vec<String>,
}

impl Name {
    /// The root name (no labels)
    pub fn root() -> Self {
        Name { labels: Vec::new() }
    }

    pub fn from_labels(labels: Vec<String>) -> Self {
        Name { labels }
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn is_root(&self) -> bool {
        self.labels.is_empty()
    }

    /// Normalized form used as a cache key: lowercase, dotted, no trailing dot
    pub fn to_lowercase(&self) -> String {
        self.to_string().to_ascii_lowercase()
    }

    pub fn eq_ignore_case(&self, other: &Name) -> bool {
        self.labels.len() == other.labels.len()
            && self
                .labels
                .iter()
                .zip(&other.labels)
                .all(|(a, b)| a.eq_ignore_ascii_case(b))
    }

    /// Encoded size including length octets and the root terminator
    fn encoded_len(&self) -> usize {
        self.labels.iter().map(|l| l.len() + 1).sum::<usize>() + 1
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.labels.is_empty() {
            return write!(f, ".");
        }
        write!(f, "{}", self.labels.join("."))
    }
}

impl FromStr for Name {
    type Err = DnsError;

    /// Parse a dotted name; a single trailing dot is accepted
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.strip_suffix('.').unwrap_or(s);
        if trimmed.is_empty() {
            return Ok(Name::root());
        }
        let mut labels = Vec::new();
        for label in trimmed.split('.') {
            if label.is_empty() {
                return Err(DnsError::UnencodableName(format!("empty label in {s}")));
            }
            if !label.is_ascii() {
                return Err(DnsError::UnencodableName(format!("non-ASCII label in {s}")));
            }
            labels.push(label.to_string());
        }
        Ok(Name { labels })
    }
}

/// The thing being asked
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub name: Name,
    pub qtype: RecordType,
    pub qclass: RecordClass,
}

impl Question {
    pub fn new(name: Name, qtype: RecordType) -> Self {
        Question {
            name,
            qtype,
            qclass: RecordClass::IN,
        }
    }
}

/// A resource record with opaque rdata.
///
/// Names embedded in NS, CNAME, PTR, MX and SOA rdata are stored expanded
/// (no compression pointers) so the bytes stay valid outside the message
/// they were decoded from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRecord {
    pub name: Name,
    pub rtype: RecordType,
    pub rclass: RecordClass,
    pub ttl: u32,
    pub rdata: Vec<u8>,
}

impl ResourceRecord {
    /// Address carried by an A record
    pub fn ipv4(&self) -> Option<Ipv4Addr> {
        if self.rtype != RecordType::A {
            return None;
        }
        let octets: [u8; 4] = self.rdata.as_slice().try_into().ok()?;
        Some(Ipv4Addr::from(octets))
    }

    /// Address carried by an AAAA record
    pub fn ipv6(&self) -> Option<Ipv6Addr> {
        if self.rtype != RecordType::AAAA {
            return None;
        }
        let octets: [u8; 16] = self.rdata.as_slice().try_into().ok()?;
        Some(Ipv6Addr::from(octets))
    }

    /// Target name of an NS, CNAME or PTR record
    pub fn target_name(&self) -> Option<Name> {
        match self.rtype {
            RecordType::NS | RecordType::CNAME | RecordType::PTR => {
                let (name, end) = read_name(&self.rdata, 0).ok()?;
                (end == self.rdata.len()).then_some(name)
            }
            _ => None,
        }
    }
}

/// A complete DNS message
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    pub id: u16,
    pub flags: Flags,
    pub questions: Vec<Question>,
    pub answers: Vec<ResourceRecord>,
    pub authorities: Vec<ResourceRecord>,
    pub additionals: Vec<ResourceRecord>,
}

impl Message {
    /// Build a standard query for a single question
    pub fn query(id: u16, question: Question, recursion_desired: bool) -> Self {
        let flags = if recursion_desired { FLAG_RD } else { 0 };
        Message {
            id,
            flags: Flags(flags),
            questions: vec![question],
            ..Default::default()
        }
    }

    /// Build a NOERROR response echoing the query's id and first question,
    /// with one answer per record.
    pub fn response_to(query: &Message, answers: Vec<ResourceRecord>) -> Self {
        let mut flags = FLAG_QR | FLAG_RA;
        flags |= u16::from(query.flags.opcode()) << OPCODE_SHIFT;
        if query.flags.recursion_desired() {
            flags |= FLAG_RD;
        }
        Message {
            id: query.id,
            flags: Flags(flags),
            questions: query.questions.iter().take(1).cloned().collect(),
            answers,
            ..Default::default()
        }
    }

    pub fn first_question(&self) -> Option<&Question> {
        self.questions.first()
    }

    pub fn is_response(&self) -> bool {
        self.flags.is_response()
    }

    pub fn response_code(&self) -> ResponseCode {
        self.flags.response_code()
    }

    /// Decode a message from raw bytes
    pub fn decode(buf: &[u8]) -> Result<Message, DnsError> {
        if buf.len() < HEADER_SIZE {
            return Err(DnsError::malformed("packet too short for DNS header"));
        }

        let mut reader = Reader::new(buf);
        let id = reader.u16()?;
        let flags = Flags(reader.u16()?);
        let qdcount = reader.u16()?;
        let ancount = reader.u16()?;
        let nscount = reader.u16()?;
        let arcount = reader.u16()?;

        let mut questions = Vec::with_capacity(usize::from(qdcount).min(16));
        for _ in 0..qdcount {
            let name = reader.name()?;
            let qtype = RecordType::from_u16(reader.u16()?);
            let qclass = RecordClass::from_u16(reader.u16()?);
            questions.push(Question {
                name,
                qtype,
                qclass,
            });
        }

        let answers = reader.records(ancount)?;
        let authorities = reader.records(nscount)?;
        let additionals = reader.records(arcount)?;

        Ok(Message {
            id,
            flags,
            questions,
            answers,
            authorities,
            additionals,
        })
    }

    /// Encode the message to wire bytes without name compression
    pub fn encode(&self) -> Result<Vec<u8>, DnsError> {
        let mut buf = Vec::with_capacity(512);
        buf.extend_from_slice(&self.id.to_be_bytes());
        buf.extend_from_slice(&self.flags.bits().to_be_bytes());
        for count in [
            self.questions.len(),
            self.answers.len(),
            self.authorities.len(),
            self.additionals.len(),
        ] {
            let count = u16::try_from(count)
                .map_err(|_| DnsError::malformed("section has more than 65535 entries"))?;
            buf.extend_from_slice(&count.to_be_bytes());
        }

        for question in &self.questions {
            write_name(&mut buf, &question.name)?;
            buf.extend_from_slice(&question.qtype.to_u16().to_be_bytes());
            buf.extend_from_slice(&question.qclass.to_u16().to_be_bytes());
        }

        for record in self
            .answers
            .iter()
            .chain(&self.authorities)
            .chain(&self.additionals)
        {
            write_name(&mut buf, &record.name)?;
            buf.extend_from_slice(&record.rtype.to_u16().to_be_bytes());
            buf.extend_from_slice(&record.rclass.to_u16().to_be_bytes());
            buf.extend_from_slice(&record.ttl.to_be_bytes());
            let rdlength = u16::try_from(record.rdata.len())
                .map_err(|_| DnsError::malformed("rdata longer than 65535 bytes"))?;
            buf.extend_from_slice(&rdlength.to_be_bytes());
            buf.extend_from_slice(&record.rdata);
        }

        Ok(buf)
    }
}

/// Bounds-checked cursor over a message buffer
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8], DnsError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| DnsError::malformed("section extends beyond packet"))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u16(&mut self) -> Result<u16, DnsError> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, DnsError> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn name(&mut self) -> Result<Name, DnsError> {
        let (name, end) = read_name(self.buf, self.pos)?;
        self.pos = end;
        Ok(name)
    }

    fn records(&mut self, count: u16) -> Result<Vec<ResourceRecord>, DnsError> {
        let mut records = Vec::with_capacity(usize::from(count).min(64));
        for _ in 0..count {
            records.push(self.record()?);
        }
        Ok(records)
    }

    fn record(&mut self) -> Result<ResourceRecord, DnsError> {
        let name = self.name()?;
        if self.buf.len().saturating_sub(self.pos) < RR_FIXED_LEN {
            return Err(DnsError::malformed("record header extends beyond packet"));
        }
        let rtype = RecordType::from_u16(self.u16()?);
        let rclass = RecordClass::from_u16(self.u16()?);
        let ttl = self.u32()?;
        let rdlength = usize::from(self.u16()?);
        let start = self.pos;
        let raw = self.bytes(rdlength)?;
        let rdata = expand_rdata(self.buf, start, raw, rtype)?;

        Ok(ResourceRecord {
            name,
            rtype,
            rclass,
            ttl,
            rdata,
        })
    }
}

/// Decode a name starting at `start`, returning it together with the
/// offset just past the name in the original byte stream.
///
/// Pointers are followed iteratively; each target offset may be visited
/// once per name.
fn read_name(buf: &[u8], start: usize) -> Result<(Name, usize), DnsError> {
    let mut labels = Vec::new();
    let mut visited = HashSet::new();
    let mut pos = start;
    let mut end: Option<usize> = None;
    let mut total_len: usize = 1; // root terminator

    loop {
        let len = *buf
            .get(pos)
            .ok_or_else(|| DnsError::malformed("name extends beyond packet"))?;

        if len & POINTER_TAG == POINTER_TAG {
            let low = *buf
                .get(pos + 1)
                .ok_or_else(|| DnsError::malformed("compression pointer extends beyond packet"))?;
            let target = usize::from(u16::from_be_bytes([len, low]) & POINTER_OFFSET_MASK);
            if !visited.insert(target) {
                return Err(DnsError::CompressionCycle { offset: target });
            }
            end.get_or_insert(pos + 2);
            pos = target;
            continue;
        }

        if len & POINTER_TAG != 0 {
            return Err(DnsError::malformed(format!(
                "reserved label type 0x{:02x}",
                len & POINTER_TAG
            )));
        }

        if len == 0 {
            end.get_or_insert(pos + 1);
            break;
        }

        let len = usize::from(len);
        let label = buf
            .get(pos + 1..pos + 1 + len)
            .ok_or_else(|| DnsError::malformed("label extends beyond packet"))?;

        total_len += len + 1;
        if total_len > MAX_NAME_LEN {
            return Err(DnsError::malformed("name exceeds 255 octets"));
        }
        if !label.is_ascii() {
            return Err(DnsError::malformed("non-ASCII octet in label"));
        }
        // ASCII is valid UTF-8
        labels.push(String::from_utf8_lossy(label).into_owned());
        pos += 1 + len;
    }

    Ok((Name { labels }, end.unwrap_or(pos + 1)))
}

/// Copy rdata, expanding names for the types that embed them
fn expand_rdata(
    buf: &[u8],
    start: usize,
    raw: &[u8],
    rtype: RecordType,
) -> Result<Vec<u8>, DnsError> {
    let end = start + raw.len();
    let mut out = Vec::with_capacity(raw.len());
    let mut pos = start;

    // (number of embedded names, fixed bytes before them, fixed bytes after)
    let (names, prefix, suffix) = match rtype {
        RecordType::NS | RecordType::CNAME | RecordType::PTR => (1, 0, 0),
        RecordType::MX => (1, 2, 0),
        RecordType::SOA => (2, 0, 20),
        _ => return Ok(raw.to_vec()),
    };

    if pos + prefix > end {
        return Err(DnsError::malformed(format!("{rtype} rdata too short")));
    }
    out.extend_from_slice(&buf[pos..pos + prefix]);
    pos += prefix;

    for _ in 0..names {
        let (name, next) = read_name(buf, pos)?;
        if next > end {
            return Err(DnsError::malformed(format!("{rtype} rdata name overruns rdlength")));
        }
        write_name(&mut out, &name)?;
        pos = next;
    }

    if pos + suffix != end {
        return Err(DnsError::malformed(format!("{rtype} rdata length mismatch")));
    }
    out.extend_from_slice(&buf[pos..end]);
    Ok(out)
}

/// Write a name as full labels
fn write_name(buf: &mut Vec<u8>, name: &Name) -> Result<(), DnsError> {
    if name.encoded_len() > MAX_NAME_LEN {
        return Err(DnsError::UnencodableName(format!(
            "{} encodes to more than {} octets",
            name, MAX_NAME_LEN
        )));
    }
    for label in name.labels() {
        if label.is_empty() || label.len() > MAX_LABEL_LEN {
            return Err(DnsError::UnencodableName(format!(
                "label of {} octets in {}",
                label.len(),
                name
            )));
        }
        buf.push(label.len() as u8);
        buf.extend_from_slice(label.as_bytes());
    }
    buf.push(0);
    Ok(())
}

// ==================== Helper for building DNS packets (tests) ====================

/// DNS packet builder for testing
#[cfg(test)]
pub mod builder {
    use super::*;

    pub fn name(domain: &str) -> Name {
        domain.parse().unwrap()
    }

    pub fn a_record(domain: &str, ip: Ipv4Addr, ttl: u32) -> ResourceRecord {
        ResourceRecord {
            name: name(domain),
            rtype: RecordType::A,
            rclass: RecordClass::IN,
            ttl,
            rdata: ip.octets().to_vec(),
        }
    }

    pub fn name_record(domain: &str, rtype: RecordType, target: &str, ttl: u32) -> ResourceRecord {
        let mut rdata = Vec::new();
        write_name(&mut rdata, &name(target)).unwrap();
        ResourceRecord {
            name: name(domain),
            rtype,
            rclass: RecordClass::IN,
            ttl,
            rdata,
        }
    }

    /// Build a DNS query packet with RD set
    pub fn build_query(domain: &str, qtype: RecordType, id: u16) -> Vec<u8> {
        Message::query(id, Question::new(name(domain), qtype), true)
            .encode()
            .unwrap()
    }

    /// Build a DNS response packet with one A record
    pub fn build_response(domain: &str, ip: Ipv4Addr, id: u16, ttl: u32) -> Vec<u8> {
        let query = Message::query(id, Question::new(name(domain), RecordType::A), true);
        Message::response_to(&query, vec![a_record(domain, ip, ttl)])
            .encode()
            .unwrap()
    }

    /// Header with the given counts, as raw bytes
    pub fn header(id: u16, flags: u16, counts: [u16; 4]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE);
        buf.extend_from_slice(&id.to_be_bytes());
        buf.extend_from_slice(&flags.to_be_bytes());
        for count in counts {
            buf.extend_from_slice(&count.to_be_bytes());
        }
        buf
    }
}
