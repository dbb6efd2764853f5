use crate::config::{decode_hex, ConfigError};
use crate::rsa::RsaPublicKey;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;

static DEFAULT_CA_PUBLIC_KEYS: &str = include_str!("config/scheme_ca_public_keys.yaml");

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CertificateEntry {
    pub modulus: String,
    pub exponent: String,
    /// MMYY
    #[serde(default)]
    pub expiry: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CertificateAuthority {
    pub issuer: String,
    pub certificates: BTreeMap<String, CertificateEntry>,
}

/// Certification Authority Public Key, ref. EMV Book 2, 11.2.2
#[derive(Debug, Clone)]
pub struct CaPublicKey {
    pub rid: [u8; 5],
    pub index: u8,
    pub issuer: String,
    pub key: RsaPublicKey,
    pub expiry: Option<[u8; 2]>,
}

/// Read-only table of CA keys, looked up by RID and index.
#[derive(Debug, Clone, Default)]
pub struct CapkTable {
    keys: Vec<CaPublicKey>,
}

impl CapkTable {
    pub fn new(keys: Vec<CaPublicKey>) -> CapkTable {
        CapkTable { keys }
    }

    pub fn from_yaml(yaml: &str) -> Result<CapkTable, ConfigError> {
        let authorities: BTreeMap<String, CertificateAuthority> = serde_yaml::from_str(yaml)?;
        let mut keys = Vec::new();

        for (rid_hex, ca) in &authorities {
            let rid: [u8; 5] = decode_hex(rid_hex, rid_hex)?
                .try_into()
                .map_err(|_| ConfigError::InvalidKey(rid_hex.clone()))?;

            for (index_hex, certificate) in &ca.certificates {
                let index = match decode_hex(index_hex, index_hex)?[..] {
                    [index] => index,
                    _ => return Err(ConfigError::InvalidKey(format!("{}/{}", rid_hex, index_hex))),
                };

                let modulus = decode_hex(index_hex, &certificate.modulus)?;
                let exponent = decode_hex(index_hex, &certificate.exponent)?;
                let key_name = format!("{}/{}", rid_hex, index_hex);
                if modulus.is_empty()
                    || modulus.len() > 248
                    || !matches!(exponent[..], [0x03] | [0x01, 0x00, 0x01])
                {
                    return Err(ConfigError::InvalidKey(key_name));
                }

                let expiry = match &certificate.expiry {
                    Some(mmyy) => Some(
                        decode_hex(index_hex, mmyy)?
                            .try_into()
                            .map_err(|_| ConfigError::InvalidKey(key_name.clone()))?,
                    ),
                    None => None,
                };

                keys.push(CaPublicKey {
                    rid,
                    index,
                    issuer: ca.issuer.clone(),
                    key: RsaPublicKey::new(&modulus, &exponent),
                    expiry,
                });
            }
        }

        debug!("Loaded {} CA public keys", keys.len());

        Ok(CapkTable { keys })
    }

    pub fn load(capk_file: Option<&str>) -> Result<CapkTable, ConfigError> {
        match capk_file {
            Some(file) => CapkTable::from_yaml(&fs::read_to_string(file)?),
            None => CapkTable::from_yaml(DEFAULT_CA_PUBLIC_KEYS),
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn find(&self, rid: &[u8], index: u8) -> Option<&CaPublicKey> {
        let key = self
            .keys
            .iter()
            .find(|k| k.rid[..] == *rid && k.index == index);

        if key.is_none() {
            warn!("No CA key defined! rid:{:02X?}, index:{:02X}", rid, index);
        }

        key
    }
}
