use crate::tags;
use crate::tlv::{self, TagId, TlvError, TlvStore};
use log::{debug, trace};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataObject {
    pub tag: TagId,
    pub length: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataObjectList {
    data_objects: Vec<DataObject>,
}

impl fmt::Display for DataObjectList {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for data_object in &self.data_objects {
            write!(
                f,
                "{:02X} - {} ({}b); ",
                data_object.tag,
                tags::tag_name(data_object.tag),
                data_object.length
            )?;
        }

        Ok(())
    }
}

// EMV Book 3, 5.4 Rules for Using a Data Object List (DOL)
impl DataObjectList {
    pub fn parse(dol: &[u8]) -> Result<DataObjectList, TlvError> {
        let mut data_objects = Vec::new();
        let mut i = 0;

        while i < dol.len() {
            let (tag, _, tag_len) = tlv::read_tag(&dol[i..])?;
            i += tag_len;
            let (length, length_len) = tlv::read_length(&dol[i..])?;
            i += length_len;

            data_objects.push(DataObject { tag, length });
        }

        Ok(DataObjectList { data_objects })
    }

    pub fn has_tag(&self, tag: TagId) -> bool {
        self.data_objects.iter().any(|d| d.tag == tag)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DataObject> {
        self.data_objects.iter()
    }

    /// Length of the data built from this list.
    pub fn data_len(&self) -> usize {
        self.data_objects.iter().map(|d| d.length).sum()
    }

    /// Concatenates the values of the listed tags. Each tag is looked up from
    /// `sources` in order, the first store holding it wins.
    pub fn build(&self, sources: &[&TlvStore]) -> Vec<u8> {
        let mut output: Vec<u8> = Vec::with_capacity(self.data_len());

        for data_object in &self.data_objects {
            match sources.iter().find_map(|store| store.find(data_object.tag)) {
                Some(value) => {
                    trace!(
                        "DOL {:02X} ({}b) from {} byte value",
                        data_object.tag,
                        data_object.length,
                        value.len()
                    );
                    output.extend_from_slice(&format_value(
                        data_object.tag,
                        value,
                        data_object.length,
                    ));
                }
                None => {
                    debug!(
                        "tag {:02X} has no value, filling with zeros",
                        data_object.tag
                    );
                    output.resize(output.len() + data_object.length, 0x00);
                }
            }
        }

        output
    }
}

/// Fits `value` into a slot of `length` bytes.
///
/// Numeric (n) values keep their rightmost bytes and are left padded with
/// zeros. Everything else keeps the leftmost bytes and is right padded with zeros.
pub fn format_value(tag: TagId, value: &[u8], length: usize) -> Vec<u8> {
    let mut output = Vec::with_capacity(length);

    if tags::is_numeric(tag) {
        if value.len() >= length {
            output.extend_from_slice(&value[value.len() - length..]);
        } else {
            output.resize(length - value.len(), 0x00);
            output.extend_from_slice(value);
        }
    } else if value.len() >= length {
        output.extend_from_slice(&value[..length]);
    } else {
        output.extend_from_slice(value);
        output.resize(length, 0x00);
    }

    output
}
