//! Kernel settings.
//!
//! Settings are read from a YAML file, falling back to the defaults built
//! into the library when no file is given.

use crate::tlv::{self, TagId, TlvStore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use thiserror::Error;

static DEFAULT_SETTINGS: &str = include_str!("config/settings.yaml");

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not parse configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid hex value for {key}: {source}")]
    Hex {
        key: String,
        source: hex::FromHexError,
    },

    #[error("invalid tag {0}")]
    InvalidTag(String),

    #[error("invalid AID {0}, must be 5 to 16 bytes")]
    InvalidAid(String),

    #[error("invalid public key {0}")]
    InvalidKey(String),
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SupportedAidEntry {
    pub aid: String,
    #[serde(default)]
    pub partial_selection: bool,
}

/// Terminal supported application, ref. EMV Book 1, 12.3.1
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupportedAid {
    pub aid: Vec<u8>,
    /// Whether the card may answer with a longer DF Name sharing this AID as prefix.
    pub partial_selection: bool,
}

fn default_use_random() -> bool {
    true
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Settings {
    pub censor_sensitive_fields: bool,
    #[serde(default = "default_use_random")]
    pub use_random: bool,
    #[serde(default)]
    pub supported_aids: Vec<SupportedAidEntry>,
    #[serde(default)]
    pub config_tags: BTreeMap<String, String>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            censor_sensitive_fields: true,
            use_random: true,
            supported_aids: Vec::new(),
            config_tags: BTreeMap::new(),
        }
    }
}

impl Settings {
    pub fn from_yaml(yaml: &str) -> Result<Settings, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn load(settings_file: Option<&str>) -> Result<Settings, ConfigError> {
        match settings_file {
            Some(file) => Settings::from_yaml(&fs::read_to_string(file)?),
            None => Settings::from_yaml(DEFAULT_SETTINGS),
        }
    }

    pub fn supported_aids(&self) -> Result<Vec<SupportedAid>, ConfigError> {
        self.supported_aids
            .iter()
            .map(|entry| {
                let aid = decode_hex(&entry.aid, &entry.aid)?;
                if !(5..=16).contains(&aid.len()) {
                    return Err(ConfigError::InvalidAid(entry.aid.clone()));
                }

                Ok(SupportedAid {
                    aid,
                    partial_selection: entry.partial_selection,
                })
            })
            .collect()
    }

    /// Configuration TLV Store, in tag order.
    pub fn config_store(&self) -> Result<TlvStore, ConfigError> {
        let mut store = TlvStore::new();

        for (tag_name, tag_value) in &self.config_tags {
            let tag_bytes = decode_hex(tag_name, tag_name)?;
            let tag = parse_tag(&tag_bytes).ok_or_else(|| ConfigError::InvalidTag(tag_name.clone()))?;
            store.push(tag, decode_hex(tag_name, tag_value)?);
        }

        Ok(store)
    }
}

fn parse_tag(tag_bytes: &[u8]) -> Option<TagId> {
    match tlv::read_tag(tag_bytes) {
        Ok((tag, _, length)) if length == tag_bytes.len() => Some(tag),
        _ => None,
    }
}

pub(crate) fn decode_hex(key: &str, value: &str) -> Result<Vec<u8>, ConfigError> {
    hex::decode(value).map_err(|source| ConfigError::Hex {
        key: key.to_string(),
        source,
    })
}
