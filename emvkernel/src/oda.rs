//! Offline Data Authentication, ref. EMV Book 3, 10.3.
//!
//! Holds the bytes captured for hashing while records are read and selects
//! the authentication method. Static Data Authentication is performed, the
//! dynamic methods fail closed.

use crate::capk::CapkTable;
use crate::error::{InternalError, KernelError, Soft};
use crate::rsa::{self, Recovery};
use crate::tags;
use crate::tlv::{self, TlvError, TlvStore};
use crate::tvr::{TerminalVerificationResults, TransactionStatusInformation};
use hexplay::HexViewBuilder;
use log::{debug, info, trace, warn};
use zeroize::{Zeroize, Zeroizing};

/// Space reserved for one card response.
pub const RESPONSE_BUFFER_SIZE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OdaMethod {
    Xda,
    Cda,
    Dda,
    Sda,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OdaStatus {
    #[default]
    NotPerformed,
    SdaSelected,
    Succeeded,
    Failed,
}

// Terminal Capabilities byte 3 and AIP byte 1 bit per method, in
// selection order. ref. EMV Book 4, A2 and EMV Book 3, C1
const METHOD_BITS: [(OdaMethod, u8, u8); 4] = [
    (OdaMethod::Xda, 0b0000_0100, 0b1000_0000),
    (OdaMethod::Cda, 0b0000_1000, 0b0000_0001),
    (OdaMethod::Dda, 0b0100_0000, 0b0010_0000),
    (OdaMethod::Sda, 0b1000_0000, 0b0100_0000),
];

/// First method both the terminal and the card support.
pub fn select_method(terminal_capabilities: &[u8], aip: &[u8]) -> Option<OdaMethod> {
    let terminal = *terminal_capabilities.get(2)?;
    let card = *aip.first()?;

    METHOD_BITS
        .iter()
        .find(|(_, terminal_bit, card_bit)| terminal & terminal_bit != 0 && card & card_bit != 0)
        .map(|(method, _, _)| *method)
}

/// ODA state of one transaction.
#[derive(Debug, Default)]
pub struct Oda {
    buffer: Zeroizing<Vec<u8>>,
    capacity: usize,
    invalid: bool,
    pub status: OdaStatus,
    pub method: Option<OdaMethod>,
    pub pdol_data: Zeroizing<Vec<u8>>,
    pub cdol1_data: Zeroizing<Vec<u8>>,
    /// GENERATE AC response bytes before and after Signed Dynamic Application Data.
    pub genac_prefix: Zeroizing<Vec<u8>>,
    pub genac_suffix: Zeroizing<Vec<u8>>,
}

impl Oda {
    pub fn new() -> Oda {
        Oda::default()
    }

    /// Prepares the hash buffer for the records the AFL marks for
    /// authentication. Earlier captures are erased.
    pub fn init(&mut self, oda_record_count: usize) {
        self.buffer.zeroize();
        self.capacity = (oda_record_count + 2) * RESPONSE_BUFFER_SIZE;
        self.buffer.reserve(self.capacity);
        self.invalid = false;
        self.status = OdaStatus::NotPerformed;
        self.method = None;
        self.genac_prefix.zeroize();
        self.genac_suffix.zeroize();
    }

    /// Erases all state, including the scratch buffers.
    pub fn reset(&mut self) {
        self.init(0);
        self.capacity = 0;
        self.pdol_data.zeroize();
        self.cdol1_data.zeroize();
    }

    pub fn capture(&mut self, data: &[u8]) -> Result<(), InternalError> {
        if self.buffer.len() + data.len() > self.capacity {
            warn!(
                "ODA buffer full: {} + {} bytes exceeds {}",
                self.buffer.len(),
                data.len(),
                self.capacity
            );
            self.invalid = true;
            return Err(InternalError::BufferOverflow);
        }

        self.buffer.extend_from_slice(data);
        trace!("ODA buffer {} bytes", self.buffer.len());

        Ok(())
    }

    /// Marks the captured data unusable, authentication will fail.
    pub fn invalidate(&mut self) {
        self.invalid = true;
    }

    pub fn is_valid(&self) -> bool {
        !self.invalid
    }

    pub fn captured(&self) -> &[u8] {
        &self.buffer
    }

    /// Erases the captured record data. Method and status are kept.
    pub fn clear_buffer(&mut self) {
        self.buffer.zeroize();
    }

    /// CDA signature requested and not known to have failed.
    pub fn cda_pending(&self, tvr: &TerminalVerificationResults) -> bool {
        self.method == Some(OdaMethod::Cda) && !tvr.cda_failed
    }

    /// Caches the bytes around Signed Dynamic Application Data (9F4B) inside
    /// the value of a format 2 GENERATE AC response template.
    pub fn capture_genac_signature(&mut self, template_value: &[u8]) -> Result<(), TlvError> {
        for item in tlv::iter(template_value) {
            let (header, _, offset) = item?;
            if header.tag == tags::SIGNED_DYNAMIC_APPLICATION_DATA {
                let end = offset + header.total_len();
                self.genac_prefix = Zeroizing::new(template_value[..offset].to_vec());
                self.genac_suffix = Zeroizing::new(template_value[end..].to_vec());
                debug!(
                    "GENERATE AC signature at {}..{}, {} bytes surrounding",
                    offset,
                    end,
                    self.genac_prefix.len() + self.genac_suffix.len()
                );
                return Ok(());
            }
        }

        warn!("Signed Dynamic Application Data not found in GENERATE AC response");
        Ok(())
    }

    /// Selects a method and authenticates the card with it.
    ///
    /// A missing or failed authentication is a soft result with TVR updated
    /// accordingly. Selecting a method other than SDA is an internal error.
    pub fn authenticate(
        &mut self,
        terminal_capabilities: &[u8],
        capk: &CapkTable,
        terminal: &TlvStore,
        icc: &mut TlvStore,
        tvr: &mut TerminalVerificationResults,
        tsi: &mut TransactionStatusInformation,
    ) -> Result<(), KernelError> {
        let aip = icc
            .find(tags::AIP)
            .ok_or(InternalError::InvalidState("AIP not available"))?
            .to_vec();

        let method = match select_method(terminal_capabilities, &aip) {
            Some(method) => method,
            None => {
                info!("No common offline data authentication method");
                tvr.offline_data_authentication_was_not_performed = true;
                return Err(Soft::OdaNotSupported.into());
            }
        };
        self.method = Some(method);
        info!("Offline data authentication method: {:?}", method);

        match method {
            OdaMethod::Xda => tvr.xda_selected = true,
            OdaMethod::Cda => tvr.cda_failed = true,
            OdaMethod::Dda => tvr.dda_failed = true,
            OdaMethod::Sda => return self.perform_sda(&aip, capk, terminal, icc, tvr, tsi),
        }

        self.status = OdaStatus::Failed;
        warn!("{:?} not available in this kernel", method);
        Err(InternalError::UnsupportedOdaMethod(method).into())
    }

    // ref. EMV Book 2, 5 Static Data Authentication (SDA)
    fn perform_sda(
        &mut self,
        aip: &[u8],
        capk: &CapkTable,
        terminal: &TlvStore,
        icc: &mut TlvStore,
        tvr: &mut TerminalVerificationResults,
        tsi: &mut TransactionStatusInformation,
    ) -> Result<(), KernelError> {
        self.status = OdaStatus::SdaSelected;
        tvr.sda_selected = true;
        tvr.sda_failed = true;
        tvr.icc_data_missing = true;
        tsi.offline_data_authentication_was_performed = true;

        match self.verify_static_data(aip, capk, terminal, icc, tvr) {
            Some(data_authentication_code) => {
                icc.set(tags::DATA_AUTHENTICATION_CODE, data_authentication_code.to_vec());
                tvr.sda_failed = false;
                self.status = OdaStatus::Succeeded;
                info!("Static data authentication succeeded");
                Ok(())
            }
            None => {
                self.status = OdaStatus::Failed;
                warn!("Static data authentication failed");
                Err(Soft::OdaFailed.into())
            }
        }
    }

    fn verify_static_data(
        &mut self,
        aip: &[u8],
        capk: &CapkTable,
        terminal: &TlvStore,
        icc: &TlvStore,
        tvr: &mut TerminalVerificationResults,
    ) -> Option<[u8; 2]> {
        let (capk_index, issuer_certificate, issuer_exponent, signed_static_data) = match (
            icc.find(tags::CAPK_INDEX),
            icc.find(tags::ISSUER_PK_CERTIFICATE),
            icc.find(tags::ISSUER_PK_EXPONENT),
            icc.find(tags::SIGNED_STATIC_APPLICATION_DATA),
        ) {
            (Some([index]), Some(certificate), Some(exponent), Some(ssad)) => {
                (*index, certificate, exponent, ssad)
            }
            _ => {
                warn!("Mandatory SDA data missing");
                return None;
            }
        };
        tvr.icc_data_missing = false;

        if let Some(tag_list) = icc.find(tags::SDA_TAG_LIST) {
            if tag_list != [0x82] {
                warn!("SDA tag list must only contain the AIP: {:02X?}", tag_list);
                return None;
            }
            if self.capture(aip).is_err() {
                return None;
            }
        }

        if !self.is_valid() {
            warn!("Data captured for authentication is incomplete");
            return None;
        }

        let rid = terminal.find(tags::TERMINAL_AID)?.get(..5)?;
        let ca = capk.find(rid, capk_index)?;
        let transaction_date = terminal.find(tags::TRANSACTION_DATE);

        if let (Some(expiry), Some(date)) = (ca.expiry, transaction_date) {
            if rsa::is_certificate_expired(&expiry, date).unwrap_or(true) {
                warn!("CA public key {:02X?}/{:02X} expired", rid, capk_index);
                return None;
            }
        }

        let issuer_public_key = match rsa::recover_issuer_public_key(
            &ca.key,
            issuer_certificate,
            icc.find(tags::ISSUER_PK_REMAINDER),
            Some(issuer_exponent),
            icc.find(tags::PAN),
            transaction_date,
        ) {
            Ok(Recovery::Validated(key)) => key,
            Ok(Recovery::Unverified(_)) => {
                warn!("Issuer public key could not be fully validated");
                return None;
            }
            Err(err) => {
                warn!("Issuer public key recovery failed: {}", err);
                return None;
            }
        };

        if log::log_enabled!(log::Level::Trace) {
            trace!(
                "Static data to authenticate:\n{}",
                HexViewBuilder::new(&self.buffer).finish()
            );
        }

        match rsa::recover_signed_static_data(
            &issuer_public_key.key,
            signed_static_data,
            Some(self.buffer.as_slice()),
        ) {
            Ok(Recovery::Validated(ssad)) => Some(ssad.data_authentication_code),
            Ok(Recovery::Unverified(_)) => None,
            Err(err) => {
                warn!("Signed static application data recovery failed: {}", err);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capk::CaPublicKey;
    use crate::testutil::{self, TestPki};

    const TERMINAL_SDA_ONLY: [u8; 3] = [0xE0, 0xF8, 0x80];

    fn terminal_data() -> TlvStore {
        let mut terminal = TlvStore::new();
        terminal.push(tags::TERMINAL_AID, hex::decode("A0000000031010").unwrap());
        terminal.push(tags::TRANSACTION_DATE, vec![0x24, 0x06, 0x15]);
        terminal
    }

    fn capk_for(pki: &TestPki) -> CapkTable {
        CapkTable::new(vec![CaPublicKey {
            rid: [0xA0, 0x00, 0x00, 0x00, 0x03],
            index: 0x92,
            issuer: "Test".to_string(),
            key: pki.ca_key.clone(),
            expiry: None,
        }])
    }

    fn sda_card(pki: &TestPki, static_data: &[u8]) -> TlvStore {
        let mut icc = TlvStore::new();
        icc.push(tags::AIP, vec![0x40, 0x00]);
        icc.push(tags::PAN, hex::decode("4761739001010010").unwrap());
        icc.push(tags::CAPK_INDEX, vec![0x92]);
        icc.push(
            tags::ISSUER_PK_CERTIFICATE,
            pki.issuer_certificate(&[0x47, 0x61, 0x73, 0xFF], &[0x12, 0x30]),
        );
        icc.push(tags::ISSUER_PK_REMAINDER, pki.issuer_remainder.clone());
        icc.push(tags::ISSUER_PK_EXPONENT, vec![0x03]);
        icc.push(
            tags::SIGNED_STATIC_APPLICATION_DATA,
            pki.signed_static_data(&[0xDA, 0xC1], static_data),
        );
        icc
    }

    #[test]
    fn test_method_selection() {
        assert_eq!(select_method(&[0xE0, 0xF8, 0xC8], &[0x7D, 0x00]), Some(OdaMethod::Cda));
        assert_eq!(select_method(&[0xE0, 0xF8, 0xC0], &[0x7C, 0x00]), Some(OdaMethod::Dda));
        assert_eq!(select_method(&TERMINAL_SDA_ONLY, &[0x7C, 0x00]), Some(OdaMethod::Sda));
        assert_eq!(select_method(&[0xE0, 0xF8, 0x04], &[0x80, 0x00]), Some(OdaMethod::Xda));
        assert_eq!(select_method(&[0xE0, 0xF8, 0x40], &[0x40, 0x00]), None);
        assert_eq!(select_method(&[0xE0], &[0x40, 0x00]), None);
    }

    #[test]
    fn test_capture_capacity() {
        let mut oda = Oda::new();
        oda.init(0);
        assert!(oda.capture(&[0u8; RESPONSE_BUFFER_SIZE * 2]).is_ok());
        assert_eq!(oda.capture(&[0x01]), Err(InternalError::BufferOverflow));
        assert!(!oda.is_valid());

        oda.init(1);
        assert!(oda.is_valid());
        assert!(oda.captured().is_empty());
    }

    #[test]
    fn test_no_common_method() {
        let mut oda = Oda::new();
        oda.init(0);
        let mut icc = TlvStore::new();
        icc.push(tags::AIP, vec![0x00, 0x00]);
        let mut tvr = TerminalVerificationResults::default();
        let mut tsi = TransactionStatusInformation::default();

        let result = oda.authenticate(
            &TERMINAL_SDA_ONLY,
            &CapkTable::default(),
            &terminal_data(),
            &mut icc,
            &mut tvr,
            &mut tsi,
        );

        assert_eq!(result, Err(KernelError::Continue(Soft::OdaNotSupported)));
        assert!(tvr.offline_data_authentication_was_not_performed);
        assert_eq!(oda.status, OdaStatus::NotPerformed);
    }

    #[test]
    fn test_dynamic_methods_fail_closed() {
        let mut oda = Oda::new();
        oda.init(0);
        let mut icc = TlvStore::new();
        icc.push(tags::AIP, vec![0x61, 0x00]);
        let mut tvr = TerminalVerificationResults::default();
        let mut tsi = TransactionStatusInformation::default();

        let result = oda.authenticate(
            &[0xE0, 0xF8, 0xC8],
            &CapkTable::default(),
            &terminal_data(),
            &mut icc,
            &mut tvr,
            &mut tsi,
        );

        assert_eq!(
            result,
            Err(KernelError::Internal(InternalError::UnsupportedOdaMethod(OdaMethod::Cda)))
        );
        assert!(tvr.cda_failed);
        assert!(!tvr.dda_failed);
        assert_eq!(oda.status, OdaStatus::Failed);
    }

    #[test]
    fn test_sda() {
        testutil::init_logging();
        let pki = TestPki::generate();
        let record = hex::decode("5A0847617390010100105F24032512319F0702FF00").unwrap();
        let mut static_data = record.clone();
        static_data.extend_from_slice(&[0x40, 0x00]);

        let mut icc = sda_card(&pki, &static_data);
        icc.push(tags::SDA_TAG_LIST, vec![0x82]);

        let mut oda = Oda::new();
        oda.init(1);
        oda.capture(&record).unwrap();
        let mut tvr = TerminalVerificationResults::default();
        let mut tsi = TransactionStatusInformation::default();

        let result = oda.authenticate(
            &TERMINAL_SDA_ONLY,
            &capk_for(&pki),
            &terminal_data(),
            &mut icc,
            &mut tvr,
            &mut tsi,
        );

        assert_eq!(result, Ok(()));
        assert_eq!(oda.status, OdaStatus::Succeeded);
        assert_eq!(oda.method, Some(OdaMethod::Sda));
        assert!(tvr.sda_selected);
        assert!(!tvr.sda_failed);
        assert!(!tvr.icc_data_missing);
        assert!(tsi.offline_data_authentication_was_performed);
        assert_eq!(icc.find(tags::DATA_AUTHENTICATION_CODE), Some(&[0xDA, 0xC1][..]));

        oda.clear_buffer();
        assert!(oda.captured().is_empty());
        assert_eq!(oda.status, OdaStatus::Succeeded);
    }

    #[test]
    fn test_sda_failures() {
        let pki = TestPki::generate();
        let record = hex::decode("5A0847617390010100105F2403251231").unwrap();

        let run = |icc: &mut TlvStore, oda: &mut Oda, capk: &CapkTable| {
            let mut tvr = TerminalVerificationResults::default();
            let mut tsi = TransactionStatusInformation::default();
            let result =
                oda.authenticate(&TERMINAL_SDA_ONLY, capk, &terminal_data(), icc, &mut tvr, &mut tsi);
            (result, tvr)
        };

        // static data differs from what the issuer signed
        let mut icc = sda_card(&pki, &record);
        let mut oda = Oda::new();
        oda.init(1);
        oda.capture(&record[..record.len() - 1]).unwrap();
        let (result, tvr) = run(&mut icc, &mut oda, &capk_for(&pki));
        assert_eq!(result, Err(KernelError::Continue(Soft::OdaFailed)));
        assert!(tvr.sda_failed);
        assert!(!tvr.icc_data_missing);
        assert_eq!(oda.status, OdaStatus::Failed);

        // capture invalidated while reading records
        let mut icc = sda_card(&pki, &record);
        oda.init(1);
        oda.capture(&record).unwrap();
        oda.invalidate();
        let (result, _) = run(&mut icc, &mut oda, &capk_for(&pki));
        assert_eq!(result, Err(KernelError::Continue(Soft::OdaFailed)));

        // unknown CA key
        let mut icc = sda_card(&pki, &record);
        oda.init(1);
        oda.capture(&record).unwrap();
        let (result, _) = run(&mut icc, &mut oda, &CapkTable::default());
        assert_eq!(result, Err(KernelError::Continue(Soft::OdaFailed)));

        // SDA tag list naming something else than the AIP
        let mut icc = sda_card(&pki, &record);
        icc.push(tags::SDA_TAG_LIST, vec![0x9F, 0x07]);
        oda.init(1);
        oda.capture(&record).unwrap();
        let (result, _) = run(&mut icc, &mut oda, &capk_for(&pki));
        assert_eq!(result, Err(KernelError::Continue(Soft::OdaFailed)));

        // certificate missing
        let mut icc = TlvStore::new();
        icc.push(tags::AIP, vec![0x40, 0x00]);
        icc.push(tags::CAPK_INDEX, vec![0x92]);
        oda.init(1);
        let (result, tvr) = run(&mut icc, &mut oda, &capk_for(&pki));
        assert_eq!(result, Err(KernelError::Continue(Soft::OdaFailed)));
        assert!(tvr.icc_data_missing);
        assert!(tvr.sda_failed);
    }

    #[test]
    fn test_genac_signature_capture() {
        let mut oda = Oda::new();
        let template =
            hex::decode("9F2701809F360200019F4B04CAFEBABE9F100706010A03A00000").unwrap();

        oda.capture_genac_signature(&template).unwrap();
        assert_eq!(&oda.genac_prefix[..], &hex::decode("9F2701809F36020001").unwrap()[..]);
        assert_eq!(&oda.genac_suffix[..], &hex::decode("9F100706010A03A00000").unwrap()[..]);
    }
}
