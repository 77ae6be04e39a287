//! Low-level packet buffers for reading and writing DNS wire data
//!
//! Inbound datagrams are parsed through `SlicePacketBuffer`, which borrows
//! the received bytes and never copies or grows. Outbound packets are built
//! in a `VectorPacketBuffer`, which supports opportunistic name compression
//! through a label lookup table.
//!
//! Domain name decoding is iterative and operates on an explicit budget
//! (maximum pointer hops, maximum encoded name length), so a crafted packet
//! with cyclic or forward compression pointers fails deterministically
//! instead of looping or recursing.

use std::collections::BTreeMap;

use derive_more::{Display, Error};

/// Compression pointers may only chain this many times within one name.
pub const MAX_POINTER_HOPS: usize = 16;

/// Maximum encoded length of a domain name, including the root label.
pub const MAX_NAME_LEN: usize = 255;

/// Maximum length of a single label.
pub const MAX_LABEL_LEN: usize = 63;

#[derive(Debug, Display, Error, Clone, Copy, PartialEq, Eq)]
pub enum BufferError {
    #[display(fmt = "read or write past the end of the buffer")]
    EndOfBuffer,
    #[display(fmt = "compression pointer outside the preceding message data")]
    InvalidPointer,
    #[display(fmt = "compression pointer chain exceeds hop budget")]
    PointerBudgetExceeded,
    #[display(fmt = "reserved label type or oversized label")]
    IllegalLabel,
    #[display(fmt = "encoded name exceeds 255 bytes")]
    NameTooLong,
    #[display(fmt = "buffer does not support writes")]
    UnsupportedWrite,
}

type Result<T> = std::result::Result<T, BufferError>;

/// Common interface for the byte buffers DNS packets are read from and
/// written to.
pub trait PacketBuffer {
    fn read(&mut self) -> Result<u8>;
    fn get(&mut self, pos: usize) -> Result<u8>;
    fn get_range(&mut self, start: usize, len: usize) -> Result<&[u8]>;
    fn write(&mut self, val: u8) -> Result<()>;
    fn set(&mut self, pos: usize, val: u8) -> Result<()>;
    fn pos(&self) -> usize;
    fn seek(&mut self, pos: usize) -> Result<()>;
    fn step(&mut self, steps: usize) -> Result<()>;
    fn len(&self) -> usize;
    fn find_label(&self, label: &str) -> Option<usize>;
    fn save_label(&mut self, label: &str, pos: usize);

    fn remaining(&self) -> usize {
        self.len().saturating_sub(self.pos())
    }

    fn write_u8(&mut self, val: u8) -> Result<()> {
        self.write(val)
    }

    fn write_u16(&mut self, val: u16) -> Result<()> {
        self.write((val >> 8) as u8)?;
        self.write((val & 0xFF) as u8)
    }

    fn write_u32(&mut self, val: u32) -> Result<()> {
        self.write_u16((val >> 16) as u16)?;
        self.write_u16((val & 0xFFFF) as u16)
    }

    fn set_u16(&mut self, pos: usize, val: u16) -> Result<()> {
        self.set(pos, (val >> 8) as u8)?;
        self.set(pos + 1, (val & 0xFF) as u8)
    }

    fn read_u16(&mut self) -> Result<u16> {
        let hi = self.read()? as u16;
        let lo = self.read()? as u16;
        Ok((hi << 8) | lo)
    }

    fn read_u32(&mut self) -> Result<u32> {
        let hi = self.read_u16()? as u32;
        let lo = self.read_u16()? as u32;
        Ok((hi << 16) | lo)
    }

    /// Read a domain name, following compression pointers.
    ///
    /// Pointers must target earlier message data; a pointer at or past its
    /// own position, a chain longer than `MAX_POINTER_HOPS`, or an expanded
    /// name longer than `MAX_NAME_LEN` is an error. Labels are folded to
    /// lower case since DNS names compare case-insensitively.
    fn read_qname(&mut self, outstr: &mut String) -> Result<()> {
        let mut pos = self.pos();
        let mut jumped = false;
        let mut hops = 0;
        let mut encoded_len = 1;
        let mut delim = "";

        loop {
            let len = self.get(pos)?;

            match len & 0xC0 {
                0xC0 => {
                    if hops == MAX_POINTER_HOPS {
                        return Err(BufferError::PointerBudgetExceeded);
                    }

                    let b2 = self.get(pos + 1)? as usize;
                    let offset = (((len & 0x3F) as usize) << 8) | b2;
                    if offset >= pos {
                        return Err(BufferError::InvalidPointer);
                    }

                    if !jumped {
                        self.seek(pos + 2)?;
                        jumped = true;
                    }

                    pos = offset;
                    hops += 1;
                    continue;
                }
                0x00 => {}
                // 0x40 and 0x80 are reserved label types
                _ => return Err(BufferError::IllegalLabel),
            }

            pos += 1;

            if len == 0 {
                break;
            }

            encoded_len += 1 + len as usize;
            if encoded_len > MAX_NAME_LEN {
                return Err(BufferError::NameTooLong);
            }

            outstr.push_str(delim);
            let label = self.get_range(pos, len as usize)?;
            outstr.push_str(&String::from_utf8_lossy(label).to_lowercase());
            delim = ".";

            pos += len as usize;
        }

        if !jumped {
            self.seek(pos)?;
        }

        Ok(())
    }

    /// Write a domain name, compressing against previously written labels
    /// where the buffer keeps a label table.
    fn write_qname(&mut self, qname: &str) -> Result<()> {
        if qname.is_empty() {
            return self.write_u8(0);
        }

        let labels = qname.split('.').collect::<Vec<&str>>();

        let mut encoded_len = 1;
        for label in &labels {
            if label.is_empty() || label.len() > MAX_LABEL_LEN {
                return Err(BufferError::IllegalLabel);
            }
            encoded_len += 1 + label.len();
        }
        if encoded_len > MAX_NAME_LEN {
            return Err(BufferError::NameTooLong);
        }

        let mut jumped = false;
        for (i, label) in labels.iter().enumerate() {
            let suffix = labels[i..].join(".");
            if let Some(prev_pos) = self.find_label(&suffix) {
                self.write_u16((prev_pos as u16) | 0xC000)?;
                jumped = true;
                break;
            }

            let pos = self.pos();
            // offsets beyond 14 bits cannot be expressed as pointers
            if pos < 0x3FFF {
                self.save_label(&suffix, pos);
            }

            self.write_u8(label.len() as u8)?;
            for b in label.as_bytes() {
                self.write_u8(*b)?;
            }
        }

        if !jumped {
            self.write_u8(0)?;
        }

        Ok(())
    }
}

/// Read-only buffer borrowing a received datagram.
pub struct SlicePacketBuffer<'a> {
    pub buf: &'a [u8],
    pub pos: usize,
}

impl<'a> SlicePacketBuffer<'a> {
    pub fn new(buf: &'a [u8]) -> SlicePacketBuffer<'a> {
        SlicePacketBuffer { buf, pos: 0 }
    }
}

impl<'a> PacketBuffer for SlicePacketBuffer<'a> {
    fn read(&mut self) -> Result<u8> {
        if self.pos >= self.buf.len() {
            return Err(BufferError::EndOfBuffer);
        }
        let res = self.buf[self.pos];
        self.pos += 1;
        Ok(res)
    }

    fn get(&mut self, pos: usize) -> Result<u8> {
        if pos >= self.buf.len() {
            return Err(BufferError::EndOfBuffer);
        }
        Ok(self.buf[pos])
    }

    fn get_range(&mut self, start: usize, len: usize) -> Result<&[u8]> {
        if start + len > self.buf.len() {
            return Err(BufferError::EndOfBuffer);
        }
        Ok(&self.buf[start..start + len])
    }

    fn write(&mut self, _: u8) -> Result<()> {
        Err(BufferError::UnsupportedWrite)
    }

    fn set(&mut self, _: usize, _: u8) -> Result<()> {
        Err(BufferError::UnsupportedWrite)
    }

    fn pos(&self) -> usize {
        self.pos
    }

    fn seek(&mut self, pos: usize) -> Result<()> {
        if pos > self.buf.len() {
            return Err(BufferError::EndOfBuffer);
        }
        self.pos = pos;
        Ok(())
    }

    fn step(&mut self, steps: usize) -> Result<()> {
        if self.pos + steps > self.buf.len() {
            return Err(BufferError::EndOfBuffer);
        }
        self.pos += steps;
        Ok(())
    }

    fn len(&self) -> usize {
        self.buf.len()
    }

    fn find_label(&self, _: &str) -> Option<usize> {
        None
    }

    fn save_label(&mut self, _: &str, _: usize) {}
}

/// Growable buffer for building outbound packets, with a label table for
/// name compression.
#[derive(Default)]
pub struct VectorPacketBuffer {
    pub buffer: Vec<u8>,
    pub pos: usize,
    label_lookup: BTreeMap<String, usize>,
}

impl VectorPacketBuffer {
    pub fn new() -> VectorPacketBuffer {
        VectorPacketBuffer {
            buffer: Vec::new(),
            pos: 0,
            label_lookup: BTreeMap::new(),
        }
    }
}

impl PacketBuffer for VectorPacketBuffer {
    fn read(&mut self) -> Result<u8> {
        if self.pos >= self.buffer.len() {
            return Err(BufferError::EndOfBuffer);
        }
        let res = self.buffer[self.pos];
        self.pos += 1;
        Ok(res)
    }

    fn get(&mut self, pos: usize) -> Result<u8> {
        if pos >= self.buffer.len() {
            return Err(BufferError::EndOfBuffer);
        }
        Ok(self.buffer[pos])
    }

    fn get_range(&mut self, start: usize, len: usize) -> Result<&[u8]> {
        if start + len > self.buffer.len() {
            return Err(BufferError::EndOfBuffer);
        }
        Ok(&self.buffer[start..start + len])
    }

    fn write(&mut self, val: u8) -> Result<()> {
        self.buffer.push(val);
        self.pos += 1;
        Ok(())
    }

    fn set(&mut self, pos: usize, val: u8) -> Result<()> {
        if pos >= self.buffer.len() {
            return Err(BufferError::EndOfBuffer);
        }
        self.buffer[pos] = val;
        Ok(())
    }

    fn pos(&self) -> usize {
        self.pos
    }

    fn seek(&mut self, pos: usize) -> Result<()> {
        if pos > self.buffer.len() {
            return Err(BufferError::EndOfBuffer);
        }
        self.pos = pos;
        Ok(())
    }

    fn step(&mut self, steps: usize) -> Result<()> {
        if self.pos + steps > self.buffer.len() {
            return Err(BufferError::EndOfBuffer);
        }
        self.pos += steps;
        Ok(())
    }

    fn len(&self) -> usize {
        self.buffer.len()
    }

    fn find_label(&self, label: &str) -> Option<usize> {
        self.label_lookup.get(label).cloned()
    }

    fn save_label(&mut self, label: &str, pos: usize) {
        self.label_lookup.insert(label.to_string(), pos);
    }
}
