//! DNS wire-format messages with the multicast DNS extensions
//!
//! Implements the RFC 1035 message layout (header, question section, and
//! the answer/authority/additional record sections) plus the RFC 6762
//! reinterpretation of the class field: the high bit of a question class
//! requests a unicast response, and the high bit of a record class marks
//! the record as cache-flushing.
//!
//! The decoder consumes untrusted bytes. Every failure mode maps to one of
//! four local errors (`Truncated`, `MalformedName`, `MalformedRecord`,
//! `HeaderCountMismatch`); none of them are fatal to the caller.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{Ipv4Addr, Ipv6Addr};

use derive_more::{Display, Error};
use serde_derive::{Deserialize, Serialize};

use crate::mdns::buffer::{BufferError, PacketBuffer, VectorPacketBuffer};

/// The well-known mDNS service port. Queries arriving from any other source
/// port are legacy one-shot queries.
pub const MDNS_PORT: u16 = 5353;

/// The IN class, the only class carried by mDNS traffic.
pub const CLASS_IN: u16 = 1;

/// High bit of the class field: unicast-response on questions, cache-flush
/// on records.
pub const CLASS_MDNS_FLAG: u16 = 0x8000;

/// Record TTLs in legacy unicast responses are capped at this value
/// (RFC 6762 section 6.7).
pub const MAX_LEGACY_TTL: u32 = 10;

/// Smallest possible wire size of a question entry.
const MIN_QUESTION_LEN: usize = 5;

/// Smallest possible wire size of a resource record entry.
const MIN_RECORD_LEN: usize = 11;

#[derive(Debug, Display, Error, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    #[display(fmt = "message shorter than its declared structure")]
    Truncated,
    #[display(fmt = "malformed or cyclic domain name")]
    MalformedName,
    #[display(fmt = "record data inconsistent with its declared type")]
    MalformedRecord,
    #[display(fmt = "section counts cannot fit the message")]
    HeaderCountMismatch,
}

impl From<BufferError> for ProtocolError {
    fn from(err: BufferError) -> ProtocolError {
        match err {
            BufferError::EndOfBuffer => ProtocolError::Truncated,
            BufferError::InvalidPointer
            | BufferError::PointerBudgetExceeded
            | BufferError::IllegalLabel
            | BufferError::NameTooLong => ProtocolError::MalformedName,
            BufferError::UnsupportedWrite => ProtocolError::MalformedRecord,
        }
    }
}

type Result<T> = std::result::Result<T, ProtocolError>;

/// `RecordType` identifies the type of a record or question.
///
/// Types the responder understands natively get their own variant; anything
/// else is retained as `Unknown` with the on-the-wire type number so that
/// unfamiliar records survive a decode/encode cycle untouched.
#[derive(PartialEq, Eq, Debug, Clone, Hash, Copy, Serialize, Deserialize)]
pub enum RecordType {
    Unknown(u16),
    A,    // 1
    Ptr,  // 12
    Txt,  // 16
    Aaaa, // 28
    Srv,  // 33
    Nsec, // 47
    Any,  // 255
}

impl RecordType {
    pub fn to_num(&self) -> u16 {
        match *self {
            RecordType::Unknown(x) => x,
            RecordType::A => 1,
            RecordType::Ptr => 12,
            RecordType::Txt => 16,
            RecordType::Aaaa => 28,
            RecordType::Srv => 33,
            RecordType::Nsec => 47,
            RecordType::Any => 255,
        }
    }

    pub fn from_num(num: u16) -> RecordType {
        match num {
            1 => RecordType::A,
            12 => RecordType::Ptr,
            16 => RecordType::Txt,
            28 => RecordType::Aaaa,
            33 => RecordType::Srv,
            47 => RecordType::Nsec,
            255 => RecordType::Any,
            _ => RecordType::Unknown(num),
        }
    }
}

/// TTL wrapper that is invisible to equality, ordering and hashing.
///
/// Two records that differ only in TTL describe the same data; re-observing
/// one refreshes the cache entry rather than duplicating it, and the cache
/// relies on this comparison behavior.
#[derive(Copy, Clone, Debug, Eq, Serialize, Deserialize)]
pub struct TransientTtl(pub u32);

impl PartialEq<TransientTtl> for TransientTtl {
    fn eq(&self, _: &TransientTtl) -> bool {
        true
    }
}

impl PartialOrd<TransientTtl> for TransientTtl {
    fn partial_cmp(&self, other: &TransientTtl) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TransientTtl {
    fn cmp(&self, _: &TransientTtl) -> Ordering {
        Ordering::Equal
    }
}

impl Hash for TransientTtl {
    fn hash<H>(&self, _: &mut H)
    where
        H: Hasher,
    {
        // purposely left empty
    }
}

/// Type-tagged record payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RData {
    A {
        addr: Ipv4Addr,
    },
    Aaaa {
        addr: Ipv6Addr,
    },
    Ptr {
        target: String,
    },
    Srv {
        priority: u16,
        weight: u16,
        port: u16,
        target: String,
    },
    Txt {
        data: Vec<u8>,
    },
    Nsec {
        next_name: String,
        type_bitmap: Vec<u8>,
    },
    Unknown {
        qtype: u16,
        data: Vec<u8>,
    },
}

impl RData {
    pub fn rtype(&self) -> RecordType {
        match *self {
            RData::A { .. } => RecordType::A,
            RData::Aaaa { .. } => RecordType::Aaaa,
            RData::Ptr { .. } => RecordType::Ptr,
            RData::Srv { .. } => RecordType::Srv,
            RData::Txt { .. } => RecordType::Txt,
            RData::Nsec { .. } => RecordType::Nsec,
            RData::Unknown { qtype, .. } => RecordType::Unknown(qtype),
        }
    }
}

/// A single resource record as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DnsRecord {
    pub name: String,
    pub cache_flush: bool,
    pub ttl: TransientTtl,
    pub rdata: RData,
}

impl DnsRecord {
    pub fn new(name: &str, ttl: u32, rdata: RData) -> DnsRecord {
        DnsRecord {
            name: name.to_lowercase(),
            cache_flush: false,
            ttl: TransientTtl(ttl),
            rdata,
        }
    }

    pub fn rtype(&self) -> RecordType {
        self.rdata.rtype()
    }

    /// True when both records describe the same data, ignoring TTL and the
    /// cache-flush bit. This is the identity the cache and known-answer
    /// suppression operate on.
    pub fn same_data(&self, other: &DnsRecord) -> bool {
        self.name.eq_ignore_ascii_case(&other.name) && self.rdata == other.rdata
    }

    pub fn read<T: PacketBuffer>(buffer: &mut T) -> Result<DnsRecord> {
        let mut name = String::new();
        buffer.read_qname(&mut name)?;

        let qtype_num = buffer.read_u16()?;
        let qtype = RecordType::from_num(qtype_num);
        let class = buffer.read_u16()?;
        let ttl = buffer.read_u32()?;
        let data_len = buffer.read_u16()? as usize;

        let cache_flush = (class & CLASS_MDNS_FLAG) != 0;
        let rdata_end = buffer.pos() + data_len;
        if rdata_end > buffer.len() {
            return Err(ProtocolError::Truncated);
        }

        let rdata = match qtype {
            RecordType::A => {
                if data_len != 4 {
                    return Err(ProtocolError::MalformedRecord);
                }
                let raw_addr = buffer.read_u32()?;
                RData::A {
                    addr: Ipv4Addr::from(raw_addr),
                }
            }
            RecordType::Aaaa => {
                if data_len != 16 {
                    return Err(ProtocolError::MalformedRecord);
                }
                let mut octets = [0u8; 16];
                let pos = buffer.pos();
                octets.copy_from_slice(buffer.get_range(pos, 16)?);
                buffer.step(16)?;
                RData::Aaaa {
                    addr: Ipv6Addr::from(octets),
                }
            }
            RecordType::Ptr => {
                let mut target = String::new();
                buffer.read_qname(&mut target)?;
                if buffer.pos() != rdata_end {
                    return Err(ProtocolError::MalformedRecord);
                }
                RData::Ptr { target }
            }
            RecordType::Srv => {
                if data_len < 7 {
                    return Err(ProtocolError::MalformedRecord);
                }
                let priority = buffer.read_u16()?;
                let weight = buffer.read_u16()?;
                let port = buffer.read_u16()?;
                let mut target = String::new();
                buffer.read_qname(&mut target)?;
                if buffer.pos() != rdata_end {
                    return Err(ProtocolError::MalformedRecord);
                }
                RData::Srv {
                    priority,
                    weight,
                    port,
                    target,
                }
            }
            RecordType::Txt => {
                let pos = buffer.pos();
                let data = buffer.get_range(pos, data_len)?.to_vec();
                buffer.step(data_len)?;
                RData::Txt { data }
            }
            RecordType::Nsec => {
                let mut next_name = String::new();
                buffer.read_qname(&mut next_name)?;
                if buffer.pos() > rdata_end {
                    return Err(ProtocolError::MalformedRecord);
                }
                let pos = buffer.pos();
                let type_bitmap = buffer.get_range(pos, rdata_end - pos)?.to_vec();
                buffer.step(rdata_end - pos)?;
                RData::Nsec {
                    next_name,
                    type_bitmap,
                }
            }
            RecordType::Any | RecordType::Unknown(_) => {
                let pos = buffer.pos();
                let data = buffer.get_range(pos, data_len)?.to_vec();
                buffer.step(data_len)?;
                RData::Unknown {
                    qtype: qtype_num,
                    data,
                }
            }
        };

        Ok(DnsRecord {
            name,
            cache_flush,
            ttl: TransientTtl(ttl),
            rdata,
        })
    }

    pub fn write<T: PacketBuffer>(&self, buffer: &mut T) -> Result<usize> {
        let start_pos = buffer.pos();

        buffer.write_qname(&self.name)?;
        buffer.write_u16(self.rtype().to_num())?;

        let mut class = CLASS_IN;
        if self.cache_flush {
            class |= CLASS_MDNS_FLAG;
        }
        buffer.write_u16(class)?;
        buffer.write_u32(self.ttl.0)?;

        let len_pos = buffer.pos();
        buffer.write_u16(0)?;

        match self.rdata {
            RData::A { ref addr } => {
                for octet in &addr.octets() {
                    buffer.write_u8(*octet)?;
                }
            }
            RData::Aaaa { ref addr } => {
                for octet in &addr.octets() {
                    buffer.write_u8(*octet)?;
                }
            }
            RData::Ptr { ref target } => {
                buffer.write_qname(target)?;
            }
            RData::Srv {
                priority,
                weight,
                port,
                ref target,
            } => {
                buffer.write_u16(priority)?;
                buffer.write_u16(weight)?;
                buffer.write_u16(port)?;
                buffer.write_qname(target)?;
            }
            RData::Txt { ref data } => {
                for b in data {
                    buffer.write_u8(*b)?;
                }
            }
            RData::Nsec {
                ref next_name,
                ref type_bitmap,
            } => {
                buffer.write_qname(next_name)?;
                for b in type_bitmap {
                    buffer.write_u8(*b)?;
                }
            }
            RData::Unknown { ref data, .. } => {
                for b in data {
                    buffer.write_u8(*b)?;
                }
            }
        }

        let size = buffer.pos() - (len_pos + 2);
        buffer.set_u16(len_pos, size as u16)?;

        Ok(buffer.pos() - start_pos)
    }
}

/// Representation of a DNS header
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DnsHeader {
    pub id: u16, // 16 bits

    pub recursion_desired: bool,    // 1 bit
    pub truncated_message: bool,    // 1 bit
    pub authoritative_answer: bool, // 1 bit
    pub opcode: u8,                 // 4 bits
    pub response: bool,             // 1 bit

    pub rescode: u8,               // 4 bits
    pub checking_disabled: bool,   // 1 bit
    pub authed_data: bool,         // 1 bit
    pub z: bool,                   // 1 bit
    pub recursion_available: bool, // 1 bit

    pub questions: u16,             // 16 bits
    pub answers: u16,               // 16 bits
    pub authoritative_entries: u16, // 16 bits
    pub resource_entries: u16,      // 16 bits
}

impl DnsHeader {
    pub fn new() -> DnsHeader {
        DnsHeader::default()
    }

    pub fn binary_len(&self) -> usize {
        12
    }

    pub fn write<T: PacketBuffer>(&self, buffer: &mut T) -> Result<()> {
        buffer.write_u16(self.id)?;

        buffer.write_u8(
            (self.recursion_desired as u8)
                | ((self.truncated_message as u8) << 1)
                | ((self.authoritative_answer as u8) << 2)
                | (self.opcode << 3)
                | ((self.response as u8) << 7),
        )?;

        buffer.write_u8(
            (self.rescode & 0x0F)
                | ((self.checking_disabled as u8) << 4)
                | ((self.authed_data as u8) << 5)
                | ((self.z as u8) << 6)
                | ((self.recursion_available as u8) << 7),
        )?;

        buffer.write_u16(self.questions)?;
        buffer.write_u16(self.answers)?;
        buffer.write_u16(self.authoritative_entries)?;
        buffer.write_u16(self.resource_entries)?;

        Ok(())
    }

    pub fn read<T: PacketBuffer>(&mut self, buffer: &mut T) -> Result<()> {
        self.id = buffer.read_u16()?;

        let flags = buffer.read_u16()?;
        let a = (flags >> 8) as u8;
        let b = (flags & 0xFF) as u8;
        self.recursion_desired = (a & (1 << 0)) > 0;
        self.truncated_message = (a & (1 << 1)) > 0;
        self.authoritative_answer = (a & (1 << 2)) > 0;
        self.opcode = (a >> 3) & 0x0F;
        self.response = (a & (1 << 7)) > 0;

        self.rescode = b & 0x0F;
        self.checking_disabled = (b & (1 << 4)) > 0;
        self.authed_data = (b & (1 << 5)) > 0;
        self.z = (b & (1 << 6)) > 0;
        self.recursion_available = (b & (1 << 7)) > 0;

        self.questions = buffer.read_u16()?;
        self.answers = buffer.read_u16()?;
        self.authoritative_entries = buffer.read_u16()?;
        self.resource_entries = buffer.read_u16()?;

        Ok(())
    }
}

impl fmt::Display for DnsHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "DnsHeader:")?;
        writeln!(f, "\tid: {0}", self.id)?;
        writeln!(f, "\tresponse: {0}", self.response)?;
        writeln!(f, "\topcode: {0}", self.opcode)?;
        writeln!(f, "\tauthoritative: {0}", self.authoritative_answer)?;
        writeln!(f, "\ttruncated: {0}", self.truncated_message)?;
        writeln!(f, "\trescode: {0}", self.rescode)?;
        writeln!(f, "\tquestions: {0}", self.questions)?;
        writeln!(f, "\tanswers: {0}", self.answers)?;
        writeln!(f, "\tauthorities: {0}", self.authoritative_entries)?;
        writeln!(f, "\tadditionals: {0}", self.resource_entries)?;

        Ok(())
    }
}

/// Representation of a DNS question
///
/// The `unicast_response` flag is the mDNS reinterpretation of the class
/// high bit: the querier asks for a direct reply instead of a multicast one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuestion {
    pub name: String,
    pub qtype: RecordType,
    pub unicast_response: bool,
}

impl DnsQuestion {
    pub fn new(name: String, qtype: RecordType) -> DnsQuestion {
        DnsQuestion {
            name: name.to_lowercase(),
            qtype,
            unicast_response: false,
        }
    }

    pub fn binary_len(&self) -> usize {
        self.name
            .split('.')
            .map(|x| x.len() + 1)
            .fold(1, |x, y| x + y)
            + 4
    }

    pub fn write<T: PacketBuffer>(&self, buffer: &mut T) -> Result<()> {
        buffer.write_qname(&self.name)?;
        buffer.write_u16(self.qtype.to_num())?;

        let mut class = CLASS_IN;
        if self.unicast_response {
            class |= CLASS_MDNS_FLAG;
        }
        buffer.write_u16(class)?;

        Ok(())
    }

    pub fn read<T: PacketBuffer>(&mut self, buffer: &mut T) -> Result<()> {
        buffer.read_qname(&mut self.name)?;
        self.qtype = RecordType::from_num(buffer.read_u16()?);
        let class = buffer.read_u16()?;
        self.unicast_response = (class & CLASS_MDNS_FLAG) != 0;

        Ok(())
    }
}

/// Representation of a complete DNS packet
///
/// A packet can be read and written in a single operation. Decoding is
/// count-driven: exactly the number of entries declared in the header are
/// parsed from each section, and declared counts that cannot possibly fit
/// the remaining bytes are rejected up front.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DnsPacket {
    pub header: DnsHeader,
    pub questions: Vec<DnsQuestion>,
    pub answers: Vec<DnsRecord>,
    pub authorities: Vec<DnsRecord>,
    pub resources: Vec<DnsRecord>,
}

impl DnsPacket {
    pub fn new() -> DnsPacket {
        DnsPacket::default()
    }

    /// Iterate over every record in the answer, authority and additional
    /// sections, in that order.
    pub fn records(&self) -> impl Iterator<Item = &DnsRecord> {
        self.answers
            .iter()
            .chain(self.authorities.iter())
            .chain(self.resources.iter())
    }

    pub fn from_buffer<T: PacketBuffer>(buffer: &mut T) -> Result<DnsPacket> {
        let mut result = DnsPacket::new();
        result.header.read(buffer)?;

        let record_count = result.header.answers as usize
            + result.header.authoritative_entries as usize
            + result.header.resource_entries as usize;
        let min_len = result.header.questions as usize * MIN_QUESTION_LEN
            + record_count * MIN_RECORD_LEN;
        if min_len > buffer.remaining() {
            return Err(ProtocolError::HeaderCountMismatch);
        }

        for _ in 0..result.header.questions {
            let mut question = DnsQuestion::new("".to_string(), RecordType::Unknown(0));
            question.read(buffer)?;
            result.questions.push(question);
        }

        for _ in 0..result.header.answers {
            let rec = DnsRecord::read(buffer)?;
            result.answers.push(rec);
        }
        for _ in 0..result.header.authoritative_entries {
            let rec = DnsRecord::read(buffer)?;
            result.authorities.push(rec);
        }
        for _ in 0..result.header.resource_entries {
            let rec = DnsRecord::read(buffer)?;
            result.resources.push(rec);
        }

        Ok(result)
    }

    /// Serialize the packet, truncating at `max_size`.
    ///
    /// Header counts always reflect the records actually written; when
    /// records are dropped to honor `max_size` the TC bit is set.
    pub fn write<T: PacketBuffer>(&mut self, buffer: &mut T, max_size: usize) -> Result<()> {
        let mut test_buffer = VectorPacketBuffer::new();

        let mut size = self.header.binary_len();
        for question in &self.questions {
            size += question.binary_len();
            question.write(&mut test_buffer)?;
        }

        self.header.answers = 0;
        self.header.authoritative_entries = 0;
        self.header.resource_entries = 0;

        let mut record_count = self.answers.len() + self.authorities.len() + self.resources.len();

        for (i, rec) in self
            .answers
            .iter()
            .chain(self.authorities.iter())
            .chain(self.resources.iter())
            .enumerate()
        {
            size += rec.write(&mut test_buffer)?;
            if size > max_size {
                record_count = i;
                self.header.truncated_message = true;
                break;
            } else if i < self.answers.len() {
                self.header.answers += 1;
            } else if i < self.answers.len() + self.authorities.len() {
                self.header.authoritative_entries += 1;
            } else {
                self.header.resource_entries += 1;
            }
        }

        self.header.questions = self.questions.len() as u16;

        self.header.write(buffer)?;

        for question in &self.questions {
            question.write(buffer)?;
        }

        for rec in self
            .answers
            .iter()
            .chain(self.authorities.iter())
            .chain(self.resources.iter())
            .take(record_count)
        {
            rec.write(buffer)?;
        }

        Ok(())
    }
}
