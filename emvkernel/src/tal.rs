//! Terminal Application Layer: one logical card operation per function.
//!
//! Status words are checked per command and both response formats are
//! decoded into a [`TlvStore`], so callers never see format 1 layouts.
//!
//! ref. EMV Book 1, 12 Application Selection and EMV Book 3, 10 Functions Used in Transaction Processing

use crate::config::SupportedAid;
use crate::error::TransportError;
use crate::oda::Oda;
use crate::tags;
use crate::tlv::{self, TagId, TlvError, TlvStore};
use crate::ttl::{self, Response, Transport};
use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::fmt;
use thiserror::Error;

pub const PSE_NAME: &[u8] = b"1PAY.SYS.DDF01";
const MAX_SELECT_NEXT: usize = 32;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TalError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("card returned status {0:04X}")]
    Status(u16),

    #[error("malformed response: {0}")]
    Tlv(#[from] TlvError),

    #[error("unexpected response template {0:02X}")]
    Template(TagId),

    #[error("mandatory data object {0:02X} missing")]
    MissingDataObject(TagId),

    #[error("invalid AFL entry {0:02X?}")]
    InvalidAfl([u8; 4]),

    #[error("record {record} of SFI {sfi} is not a single record template")]
    Record { sfi: u8, record: u8 },

    #[error("DF name in FCI does not match the selected AID")]
    AidMismatch,
}

impl TalError {
    pub fn status(&self) -> Option<u16> {
        match self {
            TalError::Status(sw) => Some(*sw),
            _ => None,
        }
    }
}

#[repr(u8)]
#[derive(Deserialize, Serialize, Debug, Copy, Clone, PartialEq, Eq)]
pub enum CryptogramType {
    // bits 7-8 of the reference control parameter and CID
    ApplicationAuthenticationCryptogram = 0b0000_0000, // AAC, transaction declined
    AuthorisationRequestCryptogram = 0b1000_0000,      // ARQC, online authorisation requested
    TransactionCertificate = 0b0100_0000,              // TC, transaction approved
}

impl From<CryptogramType> for u8 {
    fn from(orig: CryptogramType) -> Self {
        orig as u8
    }
}

impl TryFrom<u8> for CryptogramType {
    type Error = &'static str;

    fn try_from(orig: u8) -> Result<Self, Self::Error> {
        match orig & 0b1100_0000 {
            0b0000_0000 => Ok(CryptogramType::ApplicationAuthenticationCryptogram),
            0b1000_0000 => Ok(CryptogramType::AuthorisationRequestCryptogram),
            0b0100_0000 => Ok(CryptogramType::TransactionCertificate),
            _ => Err("Unknown code!"),
        }
    }
}

/// Reference control parameter bit requesting a CDA signature.
pub const CDA_SIGNATURE_REQUESTED: u8 = 0b0001_0000;

/// Candidate application found during application selection.
#[derive(Debug, Clone)]
pub struct EmvApplication {
    pub aid: Vec<u8>,
    pub label: String,
    /// 1 is the highest priority, 0 means no priority assigned.
    pub priority: u8,
    pub confirmation_required: bool,
    /// File Control Information, or the directory entry for PSE candidates.
    pub fci: TlvStore,
}

impl fmt::Display for EmvApplication {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} ({}), priority:{}",
            self.label,
            hex::encode_upper(&self.aid),
            self.priority
        )
    }
}

impl EmvApplication {
    fn from_store(aid: Vec<u8>, fci: TlvStore) -> EmvApplication {
        // ref. EMV Book 1, Table 13 Format of Application Priority Indicator
        let priority_indicator = fci
            .find(tags::APPLICATION_PRIORITY_INDICATOR)
            .and_then(|p| p.first().copied())
            .unwrap_or(0);

        let label = fci
            .find(tags::APPLICATION_PREFERRED_NAME)
            .or_else(|| fci.find(tags::APPLICATION_LABEL))
            .map(|l| String::from_utf8_lossy(l).trim().to_string())
            .unwrap_or_else(|| "UNKNOWN".to_string());

        EmvApplication {
            aid,
            label,
            priority: priority_indicator & 0x0F,
            confirmation_required: priority_indicator & 0x80 != 0,
            fci,
        }
    }

    fn sort_key(&self) -> u8 {
        match self.priority {
            0 => 0x10,
            priority => priority,
        }
    }
}

/// Orders candidates highest priority first. Unprioritised applications
/// go last, ties keep their discovery order.
pub fn sort_candidates(candidates: &mut [EmvApplication]) {
    candidates.sort_by_key(EmvApplication::sort_key);
}

/// Application File Locator entry, ref. EMV Book 3, 10.2
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AflEntry {
    pub sfi: u8,
    pub first_record: u8,
    pub last_record: u8,
    pub oda_records: u8,
}

impl AflEntry {
    fn is_protected(&self, record: u8) -> bool {
        record - self.first_record < self.oda_records
    }
}

pub fn parse_afl(afl: &[u8]) -> Result<Vec<AflEntry>, TalError> {
    if afl.is_empty() || afl.len() % 4 != 0 {
        warn!("AFL length {} is not a multiple of 4", afl.len());
        return Err(TalError::MissingDataObject(tags::AFL));
    }

    afl.chunks_exact(4)
        .map(|chunk| {
            let raw = [chunk[0], chunk[1], chunk[2], chunk[3]];
            let entry = AflEntry {
                sfi: raw[0] >> 3,
                first_record: raw[1],
                last_record: raw[2],
                oda_records: raw[3],
            };

            if entry.sfi == 0
                || entry.sfi == 31
                || entry.first_record == 0
                || entry.last_record < entry.first_record
                || entry.oda_records as usize
                    > (entry.last_record - entry.first_record) as usize + 1
            {
                warn!("Invalid AFL entry {:02X?}", raw);
                return Err(TalError::InvalidAfl(raw));
            }

            Ok(entry)
        })
        .collect()
}

/// Number of records the AFL marks for offline data authentication.
pub fn oda_record_count(afl: &[AflEntry]) -> usize {
    afl.iter().map(|e| e.oda_records as usize).sum()
}

fn check_status(response: &Response, command: &str) -> Result<(), TalError> {
    if !response.is_success() {
        debug!(
            "{} failed: {:04X} - {}",
            command,
            response.sw,
            ttl::status_description(response.sw)
        );
        return Err(TalError::Status(response.sw));
    }

    Ok(())
}

/// Parses a SELECT response. The FCI template must span the whole response.
pub fn parse_fci(data: &[u8]) -> Result<TlvStore, TalError> {
    let (header, _) = tlv::unwrap_single(data)?;
    if header.tag != tags::FCI_TEMPLATE {
        return Err(TalError::Template(header.tag));
    }

    let mut fci = TlvStore::new();
    fci.extend_from_ber(data)?;
    if !fci.contains(tags::DF_NAME) {
        return Err(TalError::MissingDataObject(tags::DF_NAME));
    }

    Ok(fci)
}

fn is_supported(aid: &[u8], supported_aids: &[SupportedAid]) -> bool {
    supported_aids.iter().any(|supported| {
        aid == supported.aid.as_slice()
            || (supported.partial_selection && aid.starts_with(&supported.aid))
    })
}

/// Reads the Payment System Directory and lists the supported applications
/// found in it, ref. EMV Book 1, 12.3.2
pub fn select_payment_system_environment(
    transport: &mut dyn Transport,
    supported_aids: &[SupportedAid],
) -> Result<Vec<EmvApplication>, TalError> {
    debug!("Selecting Payment System Environment (PSE):");

    let response = transport.select(PSE_NAME)?;
    check_status(&response, "SELECT PSE")?;
    let fci = parse_fci(&response.data)?;

    let short_file_identifier = match fci.find(tags::SFI) {
        Some([sfi]) if (1..=10).contains(sfi) => *sfi,
        _ => {
            warn!("PSE directory SFI missing or invalid");
            return Err(TalError::MissingDataObject(tags::SFI));
        }
    };

    let mut applications = Vec::new();

    for record in 1..=u8::MAX {
        let response = transport.read_record(short_file_identifier, record)?;
        if response.sw == ttl::SW_RECORD_NOT_FOUND {
            break;
        }
        check_status(&response, "READ RECORD")?;

        let (header, value) = tlv::unwrap_single(&response.data)?;
        if header.tag != tags::RECORD_TEMPLATE {
            warn!("Expected template data");
            return Err(TalError::Record {
                sfi: short_file_identifier,
                record,
            });
        }

        for item in tlv::iter(value) {
            let (header, entry, _) = item?;
            if header.tag != tags::APPLICATION_TEMPLATE {
                trace!("Skipping directory entry {:02X}", header.tag);
                continue;
            }

            let mut directory_entry = TlvStore::new();
            directory_entry.extend_from_ber(entry)?;

            let aid = match directory_entry.find(tags::AID) {
                Some(aid) if (5..=16).contains(&aid.len()) => aid.to_vec(),
                _ => {
                    warn!("Directory entry without a valid AID");
                    continue;
                }
            };

            if !is_supported(&aid, supported_aids) {
                debug!("Skipping unsupported application {:02X?}", aid);
                continue;
            }

            let application = EmvApplication::from_store(aid, directory_entry);
            info!("PSE application: {}", application);
            applications.push(application);
        }
    }

    Ok(applications)
}

/// Probes each terminal supported AID, following partial matches with
/// SELECT next occurrence. ref. EMV Book 1, 12.3.3
///
/// `6A81` aborts the probing as the card is blocked or does not support SELECT.
pub fn probe_supported_aids(
    transport: &mut dyn Transport,
    supported_aids: &[SupportedAid],
) -> Result<Vec<EmvApplication>, TalError> {
    let mut applications = Vec::new();

    for supported in supported_aids {
        debug!("Probing AID {:02X?}", supported.aid);
        let mut response = transport.select(&supported.aid)?;

        for _ in 0..MAX_SELECT_NEXT {
            match response.sw {
                ttl::SW_FUNCTION_NOT_SUPPORTED => return Err(TalError::Status(response.sw)),
                ttl::SW_SUCCESS | ttl::SW_WARNING_SELECTED_FILE_INVALIDATED => (),
                _ => break,
            }

            let fci = match parse_fci(&response.data) {
                Ok(fci) => fci,
                Err(err) => {
                    warn!("Ignoring malformed FCI: {}", err);
                    break;
                }
            };
            let df_name = fci.find(tags::DF_NAME).unwrap_or_default().to_vec();

            let exact_match = df_name == supported.aid;
            let partial_match = !exact_match
                && supported.partial_selection
                && df_name.starts_with(&supported.aid);

            if !exact_match && !partial_match {
                debug!("DF name {:02X?} not matching", df_name);
                break;
            }

            if response.is_success() {
                let application = EmvApplication::from_store(df_name, fci);
                info!("Candidate application: {}", application);
                applications.push(application);
            } else {
                debug!("Application {:02X?} blocked", df_name);
            }

            if exact_match {
                break;
            }

            response = transport.select_next(&supported.aid)?;
        }
    }

    Ok(applications)
}

/// Final selection of a candidate. Returns the authoritative FCI.
pub fn select_application(
    transport: &mut dyn Transport,
    aid: &[u8],
) -> Result<TlvStore, TalError> {
    let response = transport.select(aid)?;
    check_status(&response, "SELECT")?;

    let fci = parse_fci(&response.data)?;
    if fci.find(tags::DF_NAME) != Some(aid) {
        warn!(
            "Selected AID {:02X?} but card reported {:02X?}",
            aid,
            fci.find(tags::DF_NAME)
        );
        return Err(TalError::AidMismatch);
    }

    Ok(fci)
}

/// Splits a response into format 1 value or format 2 data objects.
fn decode_response(data: &[u8]) -> Result<(TagId, &[u8]), TalError> {
    let (header, value) = tlv::unwrap_single(data)?;
    match header.tag {
        tags::RESPONSE_FORMAT_1 | tags::RESPONSE_FORMAT_2 => Ok((header.tag, value)),
        other => {
            warn!("Unrecognized response template {:02X}", other);
            Err(TalError::Template(other))
        }
    }
}

// ref. EMV Book 3, 6.5.8 GET PROCESSING OPTIONS Command-Response APDUs
pub fn get_processing_options(
    transport: &mut dyn Transport,
    pdol_data: &[u8],
) -> Result<TlvStore, TalError> {
    debug!("GET PROCESSING OPTIONS:");

    let command_data = tlv::encode(tags::COMMAND_TEMPLATE, pdol_data);
    let response = transport.get_processing_options(&command_data)?;
    check_status(&response, "GET PROCESSING OPTIONS")?;

    let mut output = TlvStore::new();
    match decode_response(&response.data)? {
        (tags::RESPONSE_FORMAT_1, value) => {
            if value.len() < 2 + 4 {
                return Err(TalError::MissingDataObject(tags::AFL));
            }
            output.push(tags::AIP, value[..2].to_vec());
            output.push(tags::AFL, value[2..].to_vec());
        }
        (_, value) => output.extend_from_ber(value)?,
    }

    for mandatory in [tags::AIP, tags::AFL] {
        if !output.contains(mandatory) {
            warn!("GPO response lacks {:02X}", mandatory);
            return Err(TalError::MissingDataObject(mandatory));
        }
    }

    Ok(output)
}

/// Reads every record the AFL lists. Records marked for offline data
/// authentication are captured into `oda`, ref. EMV Book 3, 10.3
///
/// A capture that does not fit leaves `oda` invalid but does not stop reading.
pub fn read_application_records(
    transport: &mut dyn Transport,
    afl: &[AflEntry],
    oda: &mut Oda,
    censor_sensitive_fields: bool,
) -> Result<TlvStore, TalError> {
    debug!("Read card Application File Locator (AFL) information:");

    let mut records = TlvStore::new();

    for entry in afl {
        for record in entry.first_record..=entry.last_record {
            let response = transport.read_record(entry.sfi, record)?;
            check_status(&response, "READ RECORD")?;
            let data = &response.data;
            let protected = entry.is_protected(record);

            let template = match tlv::unwrap_single(data) {
                Ok((header, value)) if header.tag == tags::RECORD_TEMPLATE => Some(value),
                _ => None,
            };

            let captured = match template {
                Some(value) => {
                    records.extend_from_ber(value)?;
                    if entry.sfi <= 10 {
                        value
                    } else {
                        &data[..]
                    }
                }
                None if entry.sfi <= 10 => {
                    warn!("Record {} of SFI {} not a record template", record, entry.sfi);
                    return Err(TalError::Record {
                        sfi: entry.sfi,
                        record,
                    });
                }
                None => {
                    warn!(
                        "Skipping non-template record {} of SFI {}, offline data authentication will fail",
                        record, entry.sfi
                    );
                    oda.invalidate();
                    continue;
                }
            };

            if protected {
                if let Err(err) = oda.capture(captured) {
                    warn!("Record {} of SFI {} not captured: {}", record, entry.sfi, err);
                }
            }

            if censor_sensitive_fields {
                trace!(
                    "Record {}/{} of SFI {}: {} bytes, protected:{}",
                    record,
                    entry.last_record,
                    entry.sfi,
                    data.len(),
                    protected
                );
            } else {
                trace!(
                    "Record {}/{} of SFI {}: {:02X?}, protected:{}",
                    record,
                    entry.last_record,
                    entry.sfi,
                    data,
                    protected
                );
            }
        }
    }

    Ok(records)
}

// ref. EMV Book 3, 6.5.7 GET DATA Command-Response APDUs
pub fn get_data(transport: &mut dyn Transport, tag: u16) -> Result<Vec<u8>, TalError> {
    let response = transport.get_data(tag)?;
    check_status(&response, "GET DATA")?;

    let (header, value) = tlv::unwrap_single(&response.data)?;
    if header.tag != tag as TagId {
        warn!("GET DATA {:04X} answered with {:02X}", tag, header.tag);
        return Err(TalError::MissingDataObject(tag as TagId));
    }

    Ok(value.to_vec())
}

// ref. EMV Book 3, 6.5.9 INTERNAL AUTHENTICATE Command-Response APDUs
pub fn internal_authenticate(
    transport: &mut dyn Transport,
    ddol_data: &[u8],
) -> Result<TlvStore, TalError> {
    let response = transport.internal_authenticate(ddol_data)?;
    check_status(&response, "INTERNAL AUTHENTICATE")?;

    let mut output = TlvStore::new();
    match decode_response(&response.data)? {
        (tags::RESPONSE_FORMAT_1, value) => {
            output.push(tags::SIGNED_DYNAMIC_APPLICATION_DATA, value.to_vec())
        }
        (_, value) => output.extend_from_ber(value)?,
    }

    if !output.contains(tags::SIGNED_DYNAMIC_APPLICATION_DATA) {
        return Err(TalError::MissingDataObject(tags::SIGNED_DYNAMIC_APPLICATION_DATA));
    }

    Ok(output)
}

/// GENERATE AC. With `oda` given, the bytes around the CDA signature of a
/// format 2 response are cached for its verification.
// ref. EMV Book 3, 6.5.5 GENERATE APPLICATION CRYPTOGRAM Command-Response APDUs
pub fn generate_ac(
    transport: &mut dyn Transport,
    reference_control: u8,
    cdol_data: &[u8],
    oda: Option<&mut Oda>,
) -> Result<TlvStore, TalError> {
    debug!("Generate Application Cryptogram (GENERATE AC):");

    let response = transport.genac(reference_control, cdol_data)?;
    check_status(&response, "GENERATE AC")?;

    let mut output = TlvStore::new();
    match decode_response(&response.data)? {
        (tags::RESPONSE_FORMAT_1, value) => {
            // CID, ATC, AC and optional IAD
            if value.len() < 11 {
                return Err(TalError::MissingDataObject(tags::APPLICATION_CRYPTOGRAM));
            }
            output.push(tags::CRYPTOGRAM_INFORMATION_DATA, value[..1].to_vec());
            output.push(tags::ATC, value[1..3].to_vec());
            output.push(tags::APPLICATION_CRYPTOGRAM, value[3..11].to_vec());
            if value.len() > 11 {
                output.push(tags::ISSUER_APPLICATION_DATA, value[11..].to_vec());
            }
        }
        (_, value) => {
            if let Some(oda) = oda {
                oda.capture_genac_signature(value)?;
            }
            output.extend_from_ber(value)?;
        }
    }

    for mandatory in [tags::CRYPTOGRAM_INFORMATION_DATA, tags::ATC] {
        if !output.contains(mandatory) {
            return Err(TalError::MissingDataObject(mandatory));
        }
    }

    Ok(output)
}
