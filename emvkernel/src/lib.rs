//! EMV contact payment kernel: application selection, offline data
//! authentication, processing restrictions, terminal risk management and the
//! first GENERATE AC.

macro_rules! get_bit {
    ($byte:expr, $bit:expr) => {
        if $byte & (1 << $bit) != 0 {
            true
        } else {
            false
        }
    };
}

macro_rules! set_bit {
    ($byte:expr, $bit:expr, $bit_value:expr) => {
        if $bit_value == true {
            $byte |= 1 << $bit;
        } else {
            $byte &= !(1 << $bit);
        }
    };
}

pub mod atr;
pub mod bcdutil;
pub mod capk;
pub mod config;
pub mod dol;
pub mod engine;
pub mod error;
pub mod oda;
pub mod risk;
pub mod rsa;
pub mod tags;
pub mod tal;
pub mod tlv;
pub mod ttl;
pub mod tvr;

#[cfg(test)]
mod testutil;

pub use crate::capk::CapkTable;
pub use crate::config::Settings;
pub use crate::engine::Context;
pub use crate::error::{InternalError, KernelError, Outcome, Soft};
pub use crate::tal::CryptogramType;
pub use crate::ttl::{ApduInterface, Ttl};

// PCI SSC PAN truncation rules ref. https://d30000001huxdea4.my.salesforce-sites.com/faq/articles/Frequently_Asked_Question/What-are-acceptable-formats-for-truncation-of-primary-account-numbers
pub fn get_truncated_pan(pan: &str) -> String {
    let uncensored_bin_prefix_length = if pan.len() > 15 { 8 } else { 6 };

    pan.chars()
        .enumerate()
        .map(|(i, c)| {
            if i >= uncensored_bin_prefix_length && i + 4 < pan.len() {
                '*'
            } else {
                c
            }
        })
        .collect()
}
