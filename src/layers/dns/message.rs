//! DNS wire format (RFC 1035).
//!
//! Unpacking follows compression pointers, also inside the record data of the types that
//! allow them, so re-packed messages never contain pointers.

use crate::error::DnsError;
use std::collections::HashSet;
use std::net::{Ipv4Addr, Ipv6Addr};

pub mod types {
    pub const A: u16 = 1;
    pub const NS: u16 = 2;
    pub const CNAME: u16 = 5;
    pub const SOA: u16 = 6;
    pub const PTR: u16 = 12;
    pub const MX: u16 = 15;
    pub const TXT: u16 = 16;
    pub const AAAA: u16 = 28;
    pub const HTTPS: u16 = 65;
}

pub mod classes {
    pub const IN: u16 = 1;
}

pub mod response_codes {
    pub const NOERROR: u8 = 0;
    pub const FORMERR: u8 = 1;
    pub const SERVFAIL: u8 = 2;
    pub const NXDOMAIN: u8 = 3;
    pub const NOTIMP: u8 = 4;
    pub const REFUSED: u8 = 5;
}

const HEADER_LEN: usize = 12;
const POINTER: u8 = 0xC0;
const MAX_LABEL: usize = 63;

pub const DEFAULT_TTL: u32 = 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub name: String,
    pub qtype: u16,
    pub class: u16,
}

impl Question {
    pub fn new(name: impl Into<String>, qtype: u16) -> Self {
        Self {
            name: name.into(),
            qtype,
            class: classes::IN,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRecord {
    pub name: String,
    pub rtype: u16,
    pub class: u16,
    pub ttl: u32,
    pub data: Vec<u8>,
}

impl ResourceRecord {
    pub fn a(name: impl Into<String>, ip: Ipv4Addr) -> Self {
        Self::record(name, types::A, ip.octets().to_vec())
    }

    pub fn aaaa(name: impl Into<String>, ip: Ipv6Addr) -> Self {
        Self::record(name, types::AAAA, ip.octets().to_vec())
    }

    pub fn cname(alias: impl Into<String>, canonical: &str) -> Result<Self, DnsError> {
        Ok(Self::record(alias, types::CNAME, pack_name(canonical)?))
    }

    pub fn txt(name: impl Into<String>, text: &str) -> Self {
        Self::record(name, types::TXT, text.as_bytes().to_vec())
    }

    fn record(name: impl Into<String>, rtype: u16, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            rtype,
            class: classes::IN,
            ttl: DEFAULT_TTL,
            data,
        }
    }

    pub fn ipv4_address(&self) -> Option<Ipv4Addr> {
        <[u8; 4]>::try_from(self.data.as_slice()).ok().map(Ipv4Addr::from)
    }

    pub fn ipv6_address(&self) -> Option<Ipv6Addr> {
        <[u8; 16]>::try_from(self.data.as_slice()).ok().map(Ipv6Addr::from)
    }

    /// The record data as a domain name, for NS, CNAME and PTR records.
    pub fn domain_name(&self) -> Result<String, DnsError> {
        let (name, len) = unpack_name(&self.data, 0)?;
        if len != self.data.len() {
            return Err(DnsError::Truncated { needed: len });
        }
        Ok(name)
    }
}

/// A DNS query or response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsMessage {
    pub id: u16,
    pub query: bool,
    pub op_code: u8,
    pub authoritative_answer: bool,
    pub truncation: bool,
    pub recursion_desired: bool,
    pub recursion_available: bool,
    /// Must be zero, but is carried as-is.
    pub reserved: u8,
    pub response_code: u8,
    pub questions: Vec<Question>,
    pub answers: Vec<ResourceRecord>,
    pub authorities: Vec<ResourceRecord>,
    pub additionals: Vec<ResourceRecord>,
}

impl DnsMessage {
    /// A recursive query for a single question.
    pub fn query(id: u16, question: Question) -> Self {
        Self {
            id,
            query: true,
            op_code: 0,
            authoritative_answer: false,
            truncation: false,
            recursion_desired: true,
            recursion_available: false,
            reserved: 0,
            response_code: response_codes::NOERROR,
            questions: vec![question],
            answers: Vec::new(),
            authorities: Vec::new(),
            additionals: Vec::new(),
        }
    }

    /// The question, if there is exactly one. Servers practically never accept more.
    pub fn question(&self) -> Option<&Question> {
        match self.questions.as_slice() {
            [question] => Some(question),
            _ => None,
        }
    }

    /// An error response to this query.
    pub fn fail(&self, response_code: u8) -> Result<Self, DnsError> {
        if response_code == response_codes::NOERROR {
            return Err(DnsError::NotAnError);
        }
        Ok(Self {
            response_code,
            recursion_available: false,
            ..self.response(Vec::new())
        })
    }

    /// A successful response to this query.
    pub fn succeed(&self, answers: Vec<ResourceRecord>) -> Self {
        Self {
            recursion_available: true,
            ..self.response(answers)
        }
    }

    fn response(&self, answers: Vec<ResourceRecord>) -> Self {
        Self {
            id: self.id,
            query: false,
            op_code: self.op_code,
            authoritative_answer: false,
            truncation: false,
            recursion_desired: self.recursion_desired,
            recursion_available: false,
            reserved: 0,
            response_code: response_codes::NOERROR,
            questions: self.questions.clone(),
            answers,
            authorities: Vec::new(),
            additionals: Vec::new(),
        }
    }

    /// Parses a message that spans exactly the whole buffer.
    pub fn unpack(buf: &[u8]) -> Result<Self, DnsError> {
        let (len, message) = Self::unpack_from(buf, 0)?;
        if len != buf.len() {
            return Err(DnsError::Truncated { needed: len });
        }
        Ok(message)
    }

    /// Parses a message starting at `offset`, returning its end offset along with it.
    pub fn unpack_from(buf: &[u8], offset: usize) -> Result<(usize, Self), DnsError> {
        let header: Vec<u16> = (0..6)
            .map(|i| read_u16(buf, offset + 2 * i))
            .collect::<Result<_, _>>()?;
        let flags = header[1];
        let mut message = Self {
            id: header[0],
            query: flags & (1 << 15) == 0,
            op_code: ((flags >> 11) & 0b1111) as u8,
            authoritative_answer: flags & (1 << 10) != 0,
            truncation: flags & (1 << 9) != 0,
            recursion_desired: flags & (1 << 8) != 0,
            recursion_available: flags & (1 << 7) != 0,
            reserved: ((flags >> 4) & 0b111) as u8,
            response_code: (flags & 0b1111) as u8,
            questions: Vec::new(),
            answers: Vec::new(),
            authorities: Vec::new(),
            additionals: Vec::new(),
        };
        let mut offset = offset + HEADER_LEN;

        for index in 0..header[2] {
            let question = (|| -> Result<Question, DnsError> {
                let (name, len) = unpack_name(buf, offset)?;
                let qtype = read_u16(buf, offset + len)?;
                let class = read_u16(buf, offset + len + 2)?;
                offset += len + 4;
                Ok(Question { name, qtype, class })
            })()
            .map_err(|e| in_section("question", index, e))?;
            message.questions.push(question);
        }
        message.answers = unpack_records(buf, &mut offset, "answer", header[3])?;
        message.authorities = unpack_records(buf, &mut offset, "authority", header[4])?;
        message.additionals = unpack_records(buf, &mut offset, "additional", header[5])?;
        Ok((offset, message))
    }

    pub fn packed(&self) -> Result<Vec<u8>, DnsError> {
        let mut flags: u16 = 0;
        if !self.query {
            flags |= 1 << 15;
        }
        flags |= u16::from(check_bounds("op_code", self.op_code, 0b1111)?) << 11;
        if self.authoritative_answer {
            flags |= 1 << 10;
        }
        if self.truncation {
            flags |= 1 << 9;
        }
        if self.recursion_desired {
            flags |= 1 << 8;
        }
        if self.recursion_available {
            flags |= 1 << 7;
        }
        flags |= u16::from(check_bounds("reserved", self.reserved, 0b111)?) << 4;
        flags |= u16::from(check_bounds("response_code", self.response_code, 0b1111)?);

        let mut data = Vec::with_capacity(HEADER_LEN);
        for value in [
            self.id,
            flags,
            section_len(self.questions.len())?,
            section_len(self.answers.len())?,
            section_len(self.authorities.len())?,
            section_len(self.additionals.len())?,
        ] {
            data.extend_from_slice(&value.to_be_bytes());
        }
        for question in &self.questions {
            data.extend_from_slice(&pack_name(&question.name)?);
            data.extend_from_slice(&question.qtype.to_be_bytes());
            data.extend_from_slice(&question.class.to_be_bytes());
        }
        for record in self
            .answers
            .iter()
            .chain(&self.authorities)
            .chain(&self.additionals)
        {
            data.extend_from_slice(&pack_name(&record.name)?);
            data.extend_from_slice(&record.rtype.to_be_bytes());
            data.extend_from_slice(&record.class.to_be_bytes());
            data.extend_from_slice(&record.ttl.to_be_bytes());
            data.extend_from_slice(&section_len(record.data.len())?.to_be_bytes());
            data.extend_from_slice(&record.data);
        }
        Ok(data)
    }
}

fn check_bounds(field: &'static str, value: u8, max: u8) -> Result<u8, DnsError> {
    if value > max {
        return Err(DnsError::OutOfBounds {
            field,
            value: u32::from(value),
        });
    }
    Ok(value)
}

fn section_len(len: usize) -> Result<u16, DnsError> {
    u16::try_from(len).map_err(|_| DnsError::OutOfBounds {
        field: "section length",
        value: u32::try_from(len).unwrap_or(u32::MAX),
    })
}

fn in_section(section: &'static str, index: u16, source: DnsError) -> DnsError {
    DnsError::Record {
        section,
        index: usize::from(index),
        source: Box::new(source),
    }
}

fn read_u16(buf: &[u8], offset: usize) -> Result<u16, DnsError> {
    buf.get(offset..offset + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or(DnsError::Truncated { needed: offset + 2 })
}

fn read_u32(buf: &[u8], offset: usize) -> Result<u32, DnsError> {
    buf.get(offset..offset + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or(DnsError::Truncated { needed: offset + 4 })
}

fn unpack_records(
    buf: &[u8],
    offset: &mut usize,
    section: &'static str,
    count: u16,
) -> Result<Vec<ResourceRecord>, DnsError> {
    let mut records = Vec::with_capacity(usize::from(count));
    for index in 0..count {
        let record = unpack_record(buf, offset).map_err(|e| in_section(section, index, e))?;
        records.push(record);
    }
    Ok(records)
}

fn unpack_record(buf: &[u8], offset: &mut usize) -> Result<ResourceRecord, DnsError> {
    let (name, len) = unpack_name(buf, *offset)?;
    let at = *offset + len;
    let rtype = read_u16(buf, at)?;
    let class = read_u16(buf, at + 2)?;
    let ttl = read_u32(buf, at + 4)?;
    let data_len = usize::from(read_u16(buf, at + 8)?);
    let start = at + 10;
    let end = start + data_len;
    if buf.len() < end {
        return Err(DnsError::Truncated { needed: end });
    }
    let data = decompress_record_data(buf, rtype, start, end)?;
    *offset = end;
    Ok(ResourceRecord {
        name,
        rtype,
        class,
        ttl,
        data,
    })
}

/// Record data of types that may embed compressed names, with the names expanded.
fn decompress_record_data(
    buf: &[u8],
    rtype: u16,
    start: usize,
    end: usize,
) -> Result<Vec<u8>, DnsError> {
    let (prefix, names) = match rtype {
        types::NS | types::CNAME | types::PTR => (0, 1),
        types::MX => (2, 1),
        types::SOA => (0, 2),
        _ => return Ok(buf[start..end].to_vec()),
    };
    let mut data = Vec::with_capacity(end - start);
    let mut offset = start + prefix;
    if offset > end {
        return Err(DnsError::Truncated { needed: offset });
    }
    data.extend_from_slice(&buf[start..offset]);
    for _ in 0..names {
        let (name, len) = unpack_name(&buf[..end], offset)?;
        data.extend_from_slice(&pack_name(&name)?);
        offset += len;
    }
    data.extend_from_slice(&buf[offset..end]);
    Ok(data)
}

/// Reads the name at `offset`. Returns the name and how many bytes it occupies there,
/// which for a compressed name ends after the first pointer.
pub fn unpack_name(buf: &[u8], offset: usize) -> Result<(String, usize), DnsError> {
    let start = offset;
    let mut offset = offset;
    let mut consumed = None;
    let mut visited = HashSet::new();
    let mut labels = Vec::new();
    loop {
        let size = *buf
            .get(offset)
            .ok_or(DnsError::Truncated { needed: offset + 1 })?;
        if size & POINTER == POINTER {
            let low = *buf
                .get(offset + 1)
                .ok_or(DnsError::Truncated { needed: offset + 2 })?;
            consumed.get_or_insert(offset + 2 - start);
            let target = (usize::from(size & !POINTER) << 8) | usize::from(low);
            if !visited.insert(target) {
                return Err(DnsError::NameLoop);
            }
            offset = target;
            continue;
        }
        if usize::from(size) > MAX_LABEL {
            return Err(DnsError::LabelLength(size));
        }
        if size == 0 {
            offset += 1;
            break;
        }
        let end = offset + 1 + usize::from(size);
        let label = buf
            .get(offset + 1..end)
            .ok_or(DnsError::LabelTruncated(size))?;
        let label = std::str::from_utf8(label).map_err(|_| {
            DnsError::Name(format!("illegal characters at offset {}", offset + 1))
        })?;
        labels.push(label.to_string());
        offset = end;
    }
    Ok((labels.join("."), consumed.unwrap_or(offset - start)))
}

pub fn pack_name(name: &str) -> Result<Vec<u8>, DnsError> {
    let mut buf = Vec::with_capacity(name.len() + 2);
    let name = name.strip_suffix('.').unwrap_or(name);
    if !name.is_empty() {
        for label in name.split('.') {
            if label.is_empty() {
                return Err(DnsError::Name(format!("'{}' contains empty labels", name)));
            }
            if label.len() > MAX_LABEL {
                return Err(DnsError::Name(format!("'{}' label exceeds 63 bytes", name)));
            }
            buf.push(label.len() as u8);
            buf.extend_from_slice(label.as_bytes());
        }
    }
    buf.push(0);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn example_response() -> DnsMessage {
        let query = DnsMessage::query(42, Question::new("dns.google", types::A));
        query.succeed(vec![
            ResourceRecord::a("dns.google", Ipv4Addr::new(8, 8, 8, 8)),
            ResourceRecord::a("dns.google", Ipv4Addr::new(8, 8, 4, 4)),
        ])
    }

    #[test]
    fn packs_a_query() {
        let query = DnsMessage::query(0x1234, Question::new("example.com", types::AAAA));
        assert_eq!(
            query.packed().unwrap(),
            b"\x12\x34\x01\x00\x00\x01\x00\x00\x00\x00\x00\x00\x07example\x03com\x00\x00\x1c\x00\x01"
        );
    }

    #[test]
    fn response_survives_the_wire() {
        let response = example_response();
        let unpacked = DnsMessage::unpack(&response.packed().unwrap()).unwrap();
        assert_eq!(unpacked, response);
        assert!(!unpacked.query);
        assert!(unpacked.recursion_available);
        assert_eq!(unpacked.answers[1].ipv4_address(), Some(Ipv4Addr::new(8, 8, 4, 4)));
    }

    #[test]
    fn follows_compression_pointers() {
        let mut wire = DnsMessage::query(1, Question::new("www.example.com", types::CNAME))
            .succeed(Vec::new())
            .packed()
            .unwrap();
        wire[7] = 1;
        // answer: name -> question name at 12, CNAME data "cdn" + pointer to "example.com" at 16
        wire.extend_from_slice(&[0xC0, 12]);
        wire.extend_from_slice(&types::CNAME.to_be_bytes());
        wire.extend_from_slice(&classes::IN.to_be_bytes());
        wire.extend_from_slice(&300u32.to_be_bytes());
        wire.extend_from_slice(&6u16.to_be_bytes());
        wire.extend_from_slice(b"\x03cdn\xC0\x10");

        let message = DnsMessage::unpack(&wire).unwrap();
        let answer = &message.answers[0];
        assert_eq!(answer.name, "www.example.com");
        assert_eq!(answer.ttl, 300);
        assert_eq!(answer.domain_name().unwrap(), "cdn.example.com");
        assert_eq!(answer.data, pack_name("cdn.example.com").unwrap());
    }

    #[test]
    fn rejects_pointer_loops() {
        let mut wire = DnsMessage::query(1, Question::new("a", types::A))
            .packed()
            .unwrap();
        wire.truncate(HEADER_LEN);
        wire.extend_from_slice(&[0xC0, 12, 0, 1, 0, 1]);
        assert_eq!(
            DnsMessage::unpack(&wire).unwrap_err().to_string(),
            "question #0: unpack encountered domain name loop"
        );
    }

    #[test]
    fn reports_where_parsing_failed() {
        let err = DnsMessage::unpack(b"Not a DNS packet").unwrap_err();
        assert_eq!(
            err.to_string(),
            "question #0: unpack encountered a label of length 99"
        );
        assert_eq!(
            DnsMessage::unpack(b"\x00\x01").unwrap_err(),
            DnsError::Truncated { needed: 4 }
        );

        let mut wire = example_response().packed().unwrap();
        wire.push(0);
        assert_eq!(
            DnsMessage::unpack(&wire).unwrap_err(),
            DnsError::Truncated {
                needed: wire.len() - 1
            }
        );
    }

    #[test]
    fn fail_and_succeed_build_responses() {
        let query = DnsMessage::query(7, Question::new("example.com", types::A));
        assert_eq!(query.fail(response_codes::NOERROR), Err(DnsError::NotAnError));
        let failed = query.fail(response_codes::SERVFAIL).unwrap();
        assert_eq!(failed.id, 7);
        assert_eq!(failed.response_code, response_codes::SERVFAIL);
        assert!(failed.recursion_desired);
        assert!(!failed.recursion_available);
        assert_eq!(failed.question(), query.question());

        let mut bad = query.clone();
        bad.op_code = 16;
        assert_eq!(
            bad.packed().unwrap_err().to_string(),
            "DNS message's op_code 16 is out of bounds"
        );
    }

    #[test]
    fn names_are_validated() {
        assert_eq!(pack_name("").unwrap(), b"\x00");
        assert_eq!(pack_name("example.com.").unwrap(), pack_name("example.com").unwrap());
        assert!(pack_name("a..b").is_err());
        assert!(pack_name(&"x".repeat(64)).is_err());
    }
}
