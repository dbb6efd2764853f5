//! TLV Store and BER-TLV helpers.
//!
//! ref. EMV Book 3, Annex B Rules for BER-TLV Data Objects

use iso7816_tlv::ber::{Tag, Tlv, Value};
use log::trace;
use std::convert::TryFrom;
use thiserror::Error;
use zeroize::Zeroizing;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TlvError {
    #[error("data ends inside a TLV header or value")]
    Truncated,

    #[error("tag longer than 4 bytes")]
    TagTooLong,

    #[error("unsupported length encoding {0:#04X}")]
    InvalidLength(u8),

    #[error("{0} trailing bytes after data object")]
    TrailingBytes(usize),

    #[error("malformed BER-TLV data")]
    Malformed,
}

/// BER-TLV tag from its leading byte(s), e.g. `0x9F02`.
pub type TagId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub tag: TagId,
    pub constructed: bool,
    /// Bytes taken by tag and length fields.
    pub header_len: usize,
    pub value_len: usize,
}

impl Header {
    pub fn total_len(&self) -> usize {
        self.header_len + self.value_len
    }
}

/// Reads a tag field, returning the tag, its constructed bit and the number of bytes read.
pub fn read_tag(buf: &[u8]) -> Result<(TagId, bool, usize), TlvError> {
    let first = *buf.first().ok_or(TlvError::Truncated)?;
    let constructed = first & 0x20 != 0;
    let mut tag = first as TagId;
    let mut consumed = 1;

    if first & 0x1F == 0x1F {
        loop {
            let b = *buf.get(consumed).ok_or(TlvError::Truncated)?;
            consumed += 1;
            if consumed > 4 {
                return Err(TlvError::TagTooLong);
            }
            tag = (tag << 8) | b as TagId;
            if b & 0x80 == 0 {
                break;
            }
        }
    }

    Ok((tag, constructed, consumed))
}

/// Reads a length field, returning the length and the number of bytes read.
pub fn read_length(buf: &[u8]) -> Result<(usize, usize), TlvError> {
    let first = *buf.first().ok_or(TlvError::Truncated)?;
    if first & 0x80 == 0 {
        return Ok((first as usize, 1));
    }

    let count = (first & 0x7F) as usize;
    if count == 0 || count > 3 {
        return Err(TlvError::InvalidLength(first));
    }
    if buf.len() < 1 + count {
        return Err(TlvError::Truncated);
    }

    let length = buf[1..1 + count]
        .iter()
        .fold(0usize, |acc, &b| (acc << 8) | b as usize);

    Ok((length, 1 + count))
}

pub fn read_header(buf: &[u8]) -> Result<Header, TlvError> {
    let (tag, constructed, tag_len) = read_tag(buf)?;
    let (value_len, length_len) = read_length(&buf[tag_len..])?;
    let header = Header {
        tag,
        constructed,
        header_len: tag_len + length_len,
        value_len,
    };

    if buf.len() < header.total_len() {
        return Err(TlvError::Truncated);
    }

    Ok(header)
}

pub fn tag_to_bytes(tag: TagId) -> Vec<u8> {
    let bytes = tag.to_be_bytes();
    let skip = bytes.iter().take(3).take_while(|&&b| b == 0).count();
    bytes[skip..].to_vec()
}

pub fn encode_length(length: usize) -> Vec<u8> {
    match length {
        0..=0x7F => vec![length as u8],
        0x80..=0xFF => vec![0x81, length as u8],
        _ => vec![0x82, (length >> 8) as u8, length as u8],
    }
}

/// Encodes a primitive data object.
pub fn encode(tag: TagId, value: &[u8]) -> Vec<u8> {
    let mut output = tag_to_bytes(tag);
    output.extend_from_slice(&encode_length(value.len()));
    output.extend_from_slice(value);
    output
}

/// Splits a single data object covering `buf` exactly into its header and value.
pub fn unwrap_single(buf: &[u8]) -> Result<(Header, &[u8]), TlvError> {
    let header = read_header(buf)?;
    if buf.len() != header.total_len() {
        return Err(TlvError::TrailingBytes(buf.len() - header.total_len()));
    }

    Ok((header, &buf[header.header_len..]))
}

/// Iterates the top level data objects of `buf`. `00` padding between
/// objects is skipped.
pub fn iter(buf: &[u8]) -> TlvIter<'_> {
    TlvIter { buf, offset: 0 }
}

pub struct TlvIter<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> Iterator for TlvIter<'a> {
    /// Header, value and the offset of the object within the iterated buffer.
    type Item = Result<(Header, &'a [u8], usize), TlvError>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.buf.get(self.offset) == Some(&0x00) {
            self.offset += 1;
        }
        if self.offset >= self.buf.len() {
            return None;
        }

        let start = self.offset;
        match read_header(&self.buf[start..]) {
            Ok(header) => {
                self.offset += header.total_len();
                let value = &self.buf[start + header.header_len..start + header.total_len()];
                Some(Ok((header, value, start)))
            }
            Err(err) => {
                self.offset = self.buf.len();
                Some(Err(err))
            }
        }
    }
}

fn tag_id(tag: &Tag) -> TagId {
    tag.to_bytes()
        .iter()
        .fold(0, |acc, &b| (acc << 8) | b as TagId)
}

/// Insertion ordered, duplicate tolerant association list of tag to value.
/// Lookups return the first match. Values are zeroized when dropped.
#[derive(Debug, Default, Clone)]
pub struct TlvStore {
    items: Vec<(TagId, Zeroizing<Vec<u8>>)>,
}

impl TlvStore {
    pub fn new() -> TlvStore {
        TlvStore { items: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn find(&self, tag: TagId) -> Option<&[u8]> {
        self.items
            .iter()
            .find(|(t, _)| *t == tag)
            .map(|(_, v)| v.as_slice())
    }

    pub fn contains(&self, tag: TagId) -> bool {
        self.find(tag).is_some()
    }

    pub fn push(&mut self, tag: TagId, value: Vec<u8>) {
        self.items.push((tag, Zeroizing::new(value)));
    }

    /// Replaces the value of the first match or appends a new entry.
    pub fn set(&mut self, tag: TagId, value: Vec<u8>) {
        match self.items.iter_mut().find(|(t, _)| *t == tag) {
            Some((_, v)) => *v = Zeroizing::new(value),
            None => self.push(tag, value),
        }
    }

    /// Moves all entries of `other` to the end of this store, leaving `other` empty.
    pub fn append(&mut self, other: &mut TlvStore) {
        self.items.append(&mut other.items);
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (TagId, &[u8])> {
        self.items.iter().map(|(t, v)| (*t, v.as_slice()))
    }

    /// First tag that occurs more than once.
    pub fn find_duplicate(&self) -> Option<TagId> {
        self.items
            .iter()
            .enumerate()
            .find(|(i, (tag, _))| self.items[..*i].iter().any(|(t, _)| t == tag))
            .map(|(_, (tag, _))| *tag)
    }

    /// Parses BER-TLV encoded data and stores every primitive data object.
    /// Constructed objects are descended into and not stored themselves.
    pub fn extend_from_ber(&mut self, data: &[u8]) -> Result<(), TlvError> {
        let mut read_buffer = data;

        while !read_buffer.is_empty() {
            let (tlv_data, leftover_buffer) = Tlv::parse(read_buffer);

            let tlv_data = match tlv_data {
                Ok(tlv) => tlv,
                Err(err) => {
                    trace!("Could not parse as TLV! error:{:?}", err);
                    return Err(TlvError::Malformed);
                }
            };
            read_buffer = leftover_buffer;

            self.store_tlv(&tlv_data);
        }

        Ok(())
    }

    fn store_tlv(&mut self, tlv: &Tlv) {
        match tlv.value() {
            Value::Constructed(children) => {
                for child in children {
                    self.store_tlv(child);
                }
            }
            Value::Primitive(v) => self.push(tag_id(tlv.tag()), v.to_vec()),
        }
    }

    /// BER-TLV encoding of all entries in store order.
    pub fn to_ber(&self) -> Result<Vec<u8>, TlvError> {
        let mut output = Vec::new();
        for (tag, value) in self.iter() {
            let tag = Tag::try_from(hex::encode_upper(tag_to_bytes(tag)).as_str())
                .map_err(|_| TlvError::Malformed)?;
            let tlv = Tlv::new(tag, Value::Primitive(value.to_vec()))
                .map_err(|_| TlvError::Malformed)?;
            output.extend_from_slice(&tlv.to_vec());
        }

        Ok(output)
    }
}
