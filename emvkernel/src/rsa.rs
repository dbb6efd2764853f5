//! RSA certificate recovery, ref. EMV Book 2, 5 Static Data Authentication
//! and 6 Offline Dynamic Data Authentication.
//!
//! Every artifact is recovered the same way: the RSA public key operation
//! yields a fixed layout plaintext framed by a `6A` header and a `BC`
//! trailer. Structural fields are always validated and a mismatch is a
//! [`CertificateError`]. The embedded SHA-1 hash can only be checked when
//! the caller supplies every hashed input. A recovery that could not be
//! fully checked is returned as [`Recovery::Unverified`].

use crate::bcdutil;
use hexplay::HexViewBuilder;
use log::{debug, trace, warn};
use openssl::bn::BigNum;
use openssl::rsa::{Padding, Rsa};
use openssl::sha;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

const HEADER: u8 = 0x6A;
const TRAILER: u8 = 0xBC;
const HASH_ALGORITHM_SHA1: u8 = 0x01;
const PK_ALGORITHM_RSA: u8 = 0x01;
const SHA1_LENGTH: usize = 20;

const FORMAT_ISSUER_CERTIFICATE: u8 = 0x02;
const FORMAT_SIGNED_STATIC_DATA: u8 = 0x03;
const FORMAT_ICC_CERTIFICATE: u8 = 0x04;
const FORMAT_SIGNED_DYNAMIC_DATA: u8 = 0x05;

/// Recovery failures. All of them mean the certificate was not produced
/// with the private counterpart of the verifying key.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CertificateError {
    #[error("invalid public key")]
    InvalidKey,

    #[error("data length {0} does not match key length {1}")]
    LengthMismatch(usize, usize),

    #[error("RSA operation failed")]
    Decryption,

    #[error("recovered data header incorrect")]
    Header,

    #[error("recovered data trailer incorrect")]
    Trailer,

    #[error("unexpected data format {0:02X}")]
    Format(u8),

    #[error("unsupported hash algorithm {0:02X}")]
    HashAlgorithm(u8),

    #[error("unsupported public key algorithm {0:02X}")]
    PkAlgorithm(u8),

    #[error("declared key or data lengths inconsistent")]
    KeyLength,

    #[error("hash result mismatch")]
    HashMismatch,

    #[error("issuer identifier or PAN mismatch")]
    IdentifierMismatch,

    #[error("certificate expired")]
    Expired,

    #[error("invalid date")]
    InvalidDate,
}

/// Successful recovery. `Unverified` means the structure was valid but
/// optional inputs needed to recompute the hash were not supplied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recovery<T> {
    Validated(T),
    Unverified(T),
}

impl<T> Recovery<T> {
    pub fn is_validated(&self) -> bool {
        matches!(self, Recovery::Validated(_))
    }

    pub fn get(&self) -> &T {
        match self {
            Recovery::Validated(v) | Recovery::Unverified(v) => v,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct RsaPublicKey {
    pub modulus: Vec<u8>,
    pub exponent: Vec<u8>,
}

impl RsaPublicKey {
    pub fn new(modulus: &[u8], exponent: &[u8]) -> RsaPublicKey {
        RsaPublicKey {
            modulus: modulus.to_vec(),
            exponent: exponent.to_vec(),
        }
    }

    pub fn get_key_byte_size(&self) -> usize {
        self.modulus.len()
    }

    /// Raw public key operation without padding.
    pub fn public_decrypt(
        &self,
        cipher_data: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, CertificateError> {
        if cipher_data.len() != self.modulus.len() {
            warn!("Data length discrepancy");
            return Err(CertificateError::LengthMismatch(
                cipher_data.len(),
                self.modulus.len(),
            ));
        }

        let rsa = BigNum::from_slice(&self.modulus)
            .and_then(|n| Ok((n, BigNum::from_slice(&self.exponent)?)))
            .and_then(|(n, e)| Rsa::from_public_components(n, e))
            .map_err(|_| CertificateError::InvalidKey)?;

        let mut decrypt_output = Zeroizing::new(vec![0u8; rsa.size() as usize]);
        let length = match rsa.public_decrypt(cipher_data, &mut decrypt_output[..], Padding::NONE) {
            Ok(length) => length,
            Err(_) => {
                warn!("Could not decrypt data");
                return Err(CertificateError::Decryption);
            }
        };
        decrypt_output.truncate(length);

        trace!("Decrypt result ({} bytes)", decrypt_output.len());

        if decrypt_output.len() != self.modulus.len() {
            warn!("Data length discrepancy");
            return Err(CertificateError::LengthMismatch(
                decrypt_output.len(),
                self.modulus.len(),
            ));
        }
        if decrypt_output[0] != HEADER {
            warn!("Data header incorrect");
            return Err(CertificateError::Header);
        }
        if decrypt_output[decrypt_output.len() - 1] != TRAILER {
            warn!("Data trailer incorrect");
            return Err(CertificateError::Trailer);
        }

        Ok(decrypt_output)
    }
}

/// Issuer Public Key recovered from the Issuer Public Key Certificate (90).
#[derive(Debug, Clone, Zeroize, ZeroizeOnDrop)]
pub struct IssuerPublicKey {
    /// Leftmost 3-8 digits of the PAN, padded with 'F'.
    pub issuer_identifier: [u8; 4],
    /// MMYY
    pub expiry: [u8; 2],
    pub serial: [u8; 3],
    pub hash_algorithm: u8,
    pub pk_algorithm: u8,
    pub hash: [u8; SHA1_LENGTH],
    /// Complete only when the recovery was validated.
    pub key: RsaPublicKey,
}

/// ICC Public Key recovered from the ICC Public Key Certificate (9F46).
#[derive(Debug, Clone, Zeroize, ZeroizeOnDrop)]
pub struct IccPublicKey {
    /// PAN padded with 'F'.
    pub pan: [u8; 10],
    /// MMYY
    pub expiry: [u8; 2],
    pub serial: [u8; 3],
    pub hash_algorithm: u8,
    pub pk_algorithm: u8,
    pub hash: [u8; SHA1_LENGTH],
    /// Complete only when the recovery was validated.
    pub key: RsaPublicKey,
}

/// Signed Static Application Data (93) contents.
#[derive(Debug, Clone, Zeroize, ZeroizeOnDrop)]
pub struct SignedStaticData {
    pub hash_algorithm: u8,
    pub data_authentication_code: [u8; 2],
    pub hash: [u8; SHA1_LENGTH],
}

/// Signed Dynamic Application Data (9F4B) contents.
#[derive(Debug, Clone, Zeroize, ZeroizeOnDrop)]
pub struct SignedDynamicData {
    pub hash_algorithm: u8,
    /// ICC Dynamic Data, starting with the ICC Dynamic Number length and value.
    pub dynamic_data: Vec<u8>,
    pub hash: [u8; SHA1_LENGTH],
}

fn check_format(data: &[u8], expected: u8) -> Result<(), CertificateError> {
    if data[1] != expected {
        warn!("Unexpected data format {:02X}, expected {:02X}", data[1], expected);
        return Err(CertificateError::Format(data[1]));
    }

    Ok(())
}

fn check_algorithms(hash_algorithm: u8, pk_algorithm: Option<u8>) -> Result<(), CertificateError> {
    if hash_algorithm != HASH_ALGORITHM_SHA1 {
        warn!("Unsupported hash algorithm {:02X}", hash_algorithm);
        return Err(CertificateError::HashAlgorithm(hash_algorithm));
    }
    match pk_algorithm {
        Some(pk_algorithm) if pk_algorithm != PK_ALGORITHM_RSA => {
            warn!("Unsupported public key algorithm {:02X}", pk_algorithm);
            Err(CertificateError::PkAlgorithm(pk_algorithm))
        }
        _ => Ok(()),
    }
}

fn embedded_hash(data: &[u8]) -> [u8; SHA1_LENGTH] {
    let mut hash = [0u8; SHA1_LENGTH];
    hash.copy_from_slice(&data[data.len() - 1 - SHA1_LENGTH..data.len() - 1]);
    hash
}

/// SHA-1 over the recovered data from the format byte up to the embedded
/// hash, followed by `extra` inputs in order.
fn check_hash(data: &[u8], extra: &[&[u8]]) -> Result<(), CertificateError> {
    let mut hasher = sha::Sha1::new();
    hasher.update(&data[1..data.len() - 1 - SHA1_LENGTH]);
    for input in extra {
        hasher.update(input);
    }
    let calculated = hasher.finish();
    let expected = embedded_hash(data);

    if calculated != expected {
        warn!(
            "Hash mismatch! calculated:{:02X?}, recovered:{:02X?}",
            &calculated[..],
            &expected[..]
        );
        return Err(CertificateError::HashMismatch);
    }

    Ok(())
}

/// Nibble level match of a certificate identifier field against the PAN.
///
/// A `FF` byte in `identifier` is ignored. A byte with low nibble `F` only
/// compares the high nibble.
pub fn match_pan(identifier: &[u8], pan: &[u8]) -> bool {
    identifier.iter().enumerate().all(|(i, &id)| {
        if id == 0xFF {
            return true;
        }
        let pan_byte = match pan.get(i) {
            Some(&b) => b,
            None => return false,
        };
        if id & 0x0F == 0x0F {
            id >> 4 == pan_byte >> 4
        } else {
            id == pan_byte
        }
    })
}

fn mmyy_to_year_month(mmyy: &[u8]) -> Result<(u32, u32), CertificateError> {
    if mmyy.len() != 2 {
        return Err(CertificateError::InvalidDate);
    }
    let bcd = |b: &[u8]| bcdutil::bcd_to_u64(b).map_err(|_| CertificateError::InvalidDate);
    let month = bcd(&mmyy[0..1])? as u32;
    let yy = bcd(&mmyy[1..2])? as u32;
    if !(1..=12).contains(&month) {
        return Err(CertificateError::InvalidDate);
    }

    Ok((pivot_year(yy), month))
}

fn pivot_year(yy: u32) -> u32 {
    if yy < 50 {
        2000 + yy
    } else {
        1900 + yy
    }
}

/// A certificate is valid through the last day of its expiry month.
/// `transaction_date` is a YYMMDD Transaction Date (9A).
pub fn is_certificate_expired(mmyy: &[u8], transaction_date: &[u8]) -> Result<bool, CertificateError> {
    let (year, month) = mmyy_to_year_month(mmyy)?;

    if transaction_date.len() != 3 {
        return Err(CertificateError::InvalidDate);
    }
    let bcd = |b: &[u8]| bcdutil::bcd_to_u64(b).map_err(|_| CertificateError::InvalidDate);
    let today_year = pivot_year(bcd(&transaction_date[0..1])? as u32);
    let today_month = bcd(&transaction_date[1..2])? as u32;

    let expired = (year, month) < (today_year, today_month);
    if expired {
        warn!(
            "Certificate expiry date (MMYY) {:02X?} is before transaction date {:02X?}",
            mmyy, transaction_date
        );
    }

    Ok(expired)
}

fn check_identity_and_expiry(
    identifier: &[u8],
    expiry: &[u8],
    pan: Option<&[u8]>,
    transaction_date: Option<&[u8]>,
) -> Result<bool, CertificateError> {
    let mut complete = true;

    match pan {
        Some(pan) if !match_pan(identifier, pan) => {
            warn!("Certificate identifier does not match PAN");
            return Err(CertificateError::IdentifierMismatch);
        }
        Some(_) => (),
        None => complete = false,
    }

    match transaction_date {
        Some(date) if is_certificate_expired(expiry, date)? => return Err(CertificateError::Expired),
        Some(_) => (),
        None => complete = false,
    }

    Ok(complete)
}

/// Reassembles a public key from the leftmost digits in a certificate and
/// the remainder. `None` when the remainder is needed but absent.
fn reassemble_modulus(
    leftmost_digits: &[u8],
    key_length: usize,
    remainder: Option<&[u8]>,
) -> Result<Option<Vec<u8>>, CertificateError> {
    if key_length <= leftmost_digits.len() {
        if leftmost_digits[key_length..].iter().any(|&b| b != 0xBB) {
            warn!("Public key padding incorrect");
            return Err(CertificateError::KeyLength);
        }
        return Ok(Some(leftmost_digits[..key_length].to_vec()));
    }

    match remainder {
        Some(remainder) if remainder.len() == key_length - leftmost_digits.len() => {
            let mut modulus = Vec::with_capacity(key_length);
            modulus.extend_from_slice(leftmost_digits);
            modulus.extend_from_slice(remainder);
            Ok(Some(modulus))
        }
        Some(remainder) => {
            warn!(
                "Public key remainder length {} does not match declared key length {}",
                remainder.len(),
                key_length
            );
            Err(CertificateError::KeyLength)
        }
        None => Ok(None),
    }
}

/// Recovers the Issuer Public Key with the CA key, ref. EMV Book 2, 5.3.
///
/// The hash is verified when `remainder` (if the key needs one) and
/// `exponent` are supplied. The issuer identifier is checked against
/// `pan` and expiry against `transaction_date` when given.
pub fn recover_issuer_public_key(
    ca_public_key: &RsaPublicKey,
    certificate: &[u8],
    remainder: Option<&[u8]>,
    exponent: Option<&[u8]>,
    pan: Option<&[u8]>,
    transaction_date: Option<&[u8]>,
) -> Result<Recovery<IssuerPublicKey>, CertificateError> {
    let data = ca_public_key.public_decrypt(certificate)?;
    let n_ca = data.len();
    if n_ca < 36 + 1 {
        return Err(CertificateError::KeyLength);
    }

    check_format(&data, FORMAT_ISSUER_CERTIFICATE)?;
    let hash_algorithm = data[11];
    let pk_algorithm = data[12];
    check_algorithms(hash_algorithm, Some(pk_algorithm))?;

    let key_length = data[13] as usize;
    let exponent_length = data[14] as usize;
    if key_length == 0 || !matches!(exponent_length, 1 | 3) {
        return Err(CertificateError::KeyLength);
    }

    let mut issuer_identifier = [0u8; 4];
    issuer_identifier.copy_from_slice(&data[2..6]);
    let mut expiry = [0u8; 2];
    expiry.copy_from_slice(&data[6..8]);
    let mut serial = [0u8; 3];
    serial.copy_from_slice(&data[8..11]);

    debug!(
        "Issuer certificate: identifier:{:02X?}, expiry (MMYY):{:02X?}, serial:{:02X?}, key length:{}, exponent length:{}",
        issuer_identifier, expiry, serial, key_length, exponent_length
    );

    let leftmost_digits = &data[15..n_ca - 21];
    let modulus = reassemble_modulus(leftmost_digits, key_length, remainder)?;

    let exponent = match exponent {
        Some(exponent) if exponent.len() != exponent_length => {
            warn!("Issuer public key exponent length mismatch");
            return Err(CertificateError::KeyLength);
        }
        other => other,
    };

    let mut complete = check_identity_and_expiry(&issuer_identifier, &expiry, pan, transaction_date)?;

    let key = match (&modulus, exponent) {
        (Some(modulus), Some(exponent)) => {
            check_hash(&data, &[remainder.unwrap_or(&[]), exponent])?;
            RsaPublicKey::new(modulus, exponent)
        }
        _ => {
            complete = false;
            RsaPublicKey::new(
                modulus.as_deref().unwrap_or(leftmost_digits),
                exponent.unwrap_or(&[]),
            )
        }
    };

    let issuer_public_key = IssuerPublicKey {
        issuer_identifier,
        expiry,
        serial,
        hash_algorithm,
        pk_algorithm,
        hash: embedded_hash(&data),
        key,
    };

    Ok(if complete {
        Recovery::Validated(issuer_public_key)
    } else {
        Recovery::Unverified(issuer_public_key)
    })
}

/// Recovers the ICC Public Key with the Issuer Public Key, ref. EMV Book 2, 6.4.
///
/// `static_data` is the data to be authenticated. The hash covers it, so
/// without it the result is never validated.
pub fn recover_icc_public_key(
    issuer_public_key: &RsaPublicKey,
    certificate: &[u8],
    remainder: Option<&[u8]>,
    exponent: Option<&[u8]>,
    static_data: Option<&[u8]>,
    pan: Option<&[u8]>,
    transaction_date: Option<&[u8]>,
) -> Result<Recovery<IccPublicKey>, CertificateError> {
    let data = issuer_public_key.public_decrypt(certificate)?;
    let n_i = data.len();
    if n_i < 42 + 1 {
        return Err(CertificateError::KeyLength);
    }

    check_format(&data, FORMAT_ICC_CERTIFICATE)?;
    let hash_algorithm = data[17];
    let pk_algorithm = data[18];
    check_algorithms(hash_algorithm, Some(pk_algorithm))?;

    let key_length = data[19] as usize;
    let exponent_length = data[20] as usize;
    if key_length == 0 || !matches!(exponent_length, 1 | 3) {
        return Err(CertificateError::KeyLength);
    }

    let mut pan_field = [0u8; 10];
    pan_field.copy_from_slice(&data[2..12]);
    let mut expiry = [0u8; 2];
    expiry.copy_from_slice(&data[12..14]);
    let mut serial = [0u8; 3];
    serial.copy_from_slice(&data[14..17]);

    debug!(
        "ICC certificate: expiry (MMYY):{:02X?}, serial:{:02X?}, key length:{}, exponent length:{}",
        expiry, serial, key_length, exponent_length
    );

    let leftmost_digits = &data[21..n_i - 21];
    let modulus = reassemble_modulus(leftmost_digits, key_length, remainder)?;

    let exponent = match exponent {
        Some(exponent) if exponent.len() != exponent_length => {
            warn!("ICC public key exponent length mismatch");
            return Err(CertificateError::KeyLength);
        }
        other => other,
    };

    let mut complete = check_identity_and_expiry(&pan_field, &expiry, pan, transaction_date)?;

    let key = match (&modulus, exponent, static_data) {
        (Some(modulus), Some(exponent), Some(static_data)) => {
            check_hash(&data, &[remainder.unwrap_or(&[]), exponent, static_data])?;
            RsaPublicKey::new(modulus, exponent)
        }
        _ => {
            complete = false;
            RsaPublicKey::new(
                modulus.as_deref().unwrap_or(leftmost_digits),
                exponent.unwrap_or(&[]),
            )
        }
    };

    let icc_public_key = IccPublicKey {
        pan: pan_field,
        expiry,
        serial,
        hash_algorithm,
        pk_algorithm,
        hash: embedded_hash(&data),
        key,
    };

    Ok(if complete {
        Recovery::Validated(icc_public_key)
    } else {
        Recovery::Unverified(icc_public_key)
    })
}

/// Recovers Signed Static Application Data with the Issuer Public Key,
/// ref. EMV Book 2, 5.4.
pub fn recover_signed_static_data(
    issuer_public_key: &RsaPublicKey,
    signed_data: &[u8],
    static_data: Option<&[u8]>,
) -> Result<Recovery<SignedStaticData>, CertificateError> {
    let data = issuer_public_key.public_decrypt(signed_data)?;
    let n_i = data.len();
    if n_i < 26 {
        return Err(CertificateError::KeyLength);
    }

    check_format(&data, FORMAT_SIGNED_STATIC_DATA)?;
    let hash_algorithm = data[2];
    check_algorithms(hash_algorithm, None)?;

    if data[5..n_i - 21].iter().any(|&b| b != 0xBB) {
        warn!("Signed static application data padding incorrect");
        return Err(CertificateError::KeyLength);
    }

    let signed_static_data = SignedStaticData {
        hash_algorithm,
        data_authentication_code: [data[3], data[4]],
        hash: embedded_hash(&data),
    };

    match static_data {
        Some(static_data) => {
            if log::log_enabled!(log::Level::Trace) {
                trace!(
                    "Static data to be authenticated ({} bytes):\n{}",
                    static_data.len(),
                    HexViewBuilder::new(static_data).finish()
                );
            }
            check_hash(&data, &[static_data])?;
            Ok(Recovery::Validated(signed_static_data))
        }
        None => Ok(Recovery::Unverified(signed_static_data)),
    }
}

/// Recovers Signed Dynamic Application Data with the ICC Public Key,
/// ref. EMV Book 2, 6.5.2.
///
/// `terminal_dynamic_data` is the DDOL data for DDA, or the Unpredictable
/// Number for CDA.
pub fn recover_signed_dynamic_data(
    icc_public_key: &RsaPublicKey,
    signed_data: &[u8],
    terminal_dynamic_data: Option<&[u8]>,
) -> Result<Recovery<SignedDynamicData>, CertificateError> {
    let data = icc_public_key.public_decrypt(signed_data)?;
    let n_ic = data.len();
    if n_ic < 25 {
        return Err(CertificateError::KeyLength);
    }

    check_format(&data, FORMAT_SIGNED_DYNAMIC_DATA)?;
    let hash_algorithm = data[2];
    check_algorithms(hash_algorithm, None)?;

    let dynamic_data_length = data[3] as usize;
    if 4 + dynamic_data_length > n_ic - 21 {
        return Err(CertificateError::KeyLength);
    }
    if data[4 + dynamic_data_length..n_ic - 21]
        .iter()
        .any(|&b| b != 0xBB)
    {
        warn!("Signed dynamic application data padding incorrect");
        return Err(CertificateError::KeyLength);
    }

    let signed_dynamic_data = SignedDynamicData {
        hash_algorithm,
        dynamic_data: data[4..4 + dynamic_data_length].to_vec(),
        hash: embedded_hash(&data),
    };

    match terminal_dynamic_data {
        Some(terminal_dynamic_data) => {
            check_hash(&data, &[terminal_dynamic_data])?;
            Ok(Recovery::Validated(signed_dynamic_data))
        }
        None => Ok(Recovery::Unverified(signed_dynamic_data)),
    }
}
