//! Transaction context and the kernel processing steps, ref. EMV Book 3, 10
//! Functions Used in Transaction Processing.

use crate::atr::Atr;
use crate::bcdutil;
use crate::capk::CapkTable;
use crate::config::{ConfigError, Settings, SupportedAid};
use crate::dol::DataObjectList;
use crate::error::{InternalError, KernelError, Outcome, Result, Soft};
use crate::get_truncated_pan;
use crate::oda::Oda;
use crate::risk::{self, OfflineLog, RandomSelection};
use crate::tags;
use crate::tal::{self, AflEntry, CryptogramType, EmvApplication, TalError};
use crate::tlv::{TagId, TlvStore};
use crate::ttl::{self, Transport};
use crate::tvr::{TerminalVerificationResults, TransactionStatusInformation};
use chrono::Utc;
use log::{debug, info, warn};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use zeroize::{Zeroize, Zeroizing};

/// POS Entry Mode for contact chip transactions.
const POS_ENTRY_MODE_ICC: u8 = 0x05;

/// Largest DOL data that still fits a short command APDU with its template.
const MAX_PDOL_DATA_LENGTH: usize = 252;
const MAX_CDOL_DATA_LENGTH: usize = 255;

fn card_error(operation: &str, err: TalError) -> KernelError {
    warn!("{} failed: {}", operation, err);
    Outcome::CardError.into()
}

/// Big endian unsigned binary value, e.g. 9F1B Terminal Floor Limit.
fn binary_value(data: &[u8]) -> Option<u64> {
    if data.is_empty() || data.len() > 8 {
        return None;
    }
    Some(data.iter().fold(0u64, |value, b| (value << 8) | *b as u64))
}

fn first_byte(data: &[u8]) -> Option<u8> {
    data.first().copied()
}

pub struct Context<'a> {
    transport: &'a mut dyn Transport,
    capk: &'a CapkTable,
    censor_sensitive_fields: bool,

    /// Terminal configuration, see [`Settings::config_tags`].
    pub config: TlvStore,
    pub supported_aids: Vec<SupportedAid>,
    /// Per transaction parameters such as amount and transaction type.
    pub params: TlvStore,
    /// Data objects produced by the terminal during the transaction.
    pub terminal: TlvStore,
    /// Data objects received from the card.
    pub icc: TlvStore,

    pub candidates: Vec<EmvApplication>,
    pub application: Option<EmvApplication>,

    pub oda: Oda,
    pub tvr: TerminalVerificationResults,
    pub tsi: TransactionStatusInformation,

    afl: Vec<AflEntry>,
    rng: ChaCha20Rng,
}

impl<'a> Context<'a> {
    pub fn new(
        transport: &'a mut dyn Transport,
        settings: &Settings,
        capk: &'a CapkTable,
    ) -> std::result::Result<Context<'a>, ConfigError> {
        let rng = if settings.use_random {
            ChaCha20Rng::from_entropy()
        } else {
            warn!("Random numbers are predictable, use_random is disabled");
            ChaCha20Rng::seed_from_u64(0)
        };

        Ok(Context {
            transport,
            capk,
            censor_sensitive_fields: settings.censor_sensitive_fields,
            config: settings.config_store()?,
            supported_aids: settings.supported_aids()?,
            params: TlvStore::new(),
            terminal: TlvStore::new(),
            icc: TlvStore::new(),
            candidates: Vec::new(),
            application: None,
            oda: Oda::new(),
            tvr: TerminalVerificationResults::default(),
            tsi: TransactionStatusInformation::default(),
            afl: Vec::new(),
            rng,
        })
    }

    pub fn set_parameter(&mut self, tag: TagId, value: Vec<u8>) {
        self.params.set(tag, value);
    }

    /// Forgets everything learned from the card and produced for it, keeping
    /// configuration, parameters and the remaining candidates.
    pub fn reset(&mut self) {
        self.icc.clear();
        self.terminal.clear();
        self.oda.reset();
        self.tvr = TerminalVerificationResults::default();
        self.tsi = TransactionStatusInformation::default();
        self.application = None;
        self.afl.clear();
    }

    /// Wipes the whole context, configuration included.
    pub fn clear(&mut self) {
        self.reset();
        self.config.clear();
        self.supported_aids.clear();
        self.params.clear();
        self.candidates.clear();
    }

    /// Value from transaction parameters, configuration or terminal data, in that order.
    fn terminal_value(&self, tag: TagId) -> Option<&[u8]> {
        [&self.params, &self.config, &self.terminal]
            .into_iter()
            .find_map(|store| store.find(tag))
    }

    fn build_dol(&self, dol: &DataObjectList) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(dol.build(&[&self.params, &self.config, &self.terminal]))
    }

    /// Makes the current TVR and TSI available to DOL building.
    fn publish_status(&mut self) {
        self.terminal.set(tags::TVR, self.tvr.into());
        self.terminal.set(tags::TSI, self.tsi.into());
    }

    fn pan_digits(&self) -> Option<String> {
        let pan = self.icc.find(tags::PAN)?;
        String::from_utf8(bcdutil::bcd_to_ascii(pan).ok()?).ok()
    }

    // ref. EMV Book 1, 8.3 Answer to Reset
    pub fn validate_atr(&self, atr: &[u8]) -> Result<()> {
        let parsed = Atr::parse(atr).and_then(|parsed| {
            parsed.validate_emv()?;
            Ok(parsed)
        });

        match parsed {
            Ok(parsed) => {
                debug!("ATR accepted, protocol T={}", parsed.protocol());
                Ok(())
            }
            Err(err) => {
                warn!("ATR {:02X?} rejected: {}", atr, err);
                Err(Outcome::CardError.into())
            }
        }
    }

    /// Lists the applications supported by both card and terminal, PSE first
    /// with AID probing as fallback. ref. EMV Book 1, 12.3 Building the Candidate List
    pub fn build_candidate_list(&mut self) -> Result<()> {
        self.candidates.clear();

        let from_pse = tal::select_payment_system_environment(&mut *self.transport, &self.supported_aids);
        let mut candidates = match from_pse {
            Ok(candidates) if !candidates.is_empty() => candidates,
            Ok(_) => {
                info!("No supported applications in PSE, probing supported AIDs");
                Vec::new()
            }
            Err(TalError::Transport(err)) => {
                warn!("Card communication failed: {}", err);
                return Err(Outcome::TryAgain.into());
            }
            Err(TalError::Status(ttl::SW_FUNCTION_NOT_SUPPORTED)) => {
                warn!("Card blocked or SELECT not supported");
                return Err(Outcome::CardBlocked.into());
            }
            Err(err) => {
                info!("{}: {}, probing supported AIDs", Soft::PseNotFound, err);
                Vec::new()
            }
        };

        if candidates.is_empty() {
            candidates = match tal::probe_supported_aids(&mut *self.transport, &self.supported_aids) {
                Ok(candidates) => candidates,
                Err(TalError::Transport(err)) => {
                    warn!("Card communication failed: {}", err);
                    return Err(Outcome::TryAgain.into());
                }
                Err(TalError::Status(ttl::SW_FUNCTION_NOT_SUPPORTED)) => {
                    warn!("Card blocked or SELECT not supported");
                    return Err(Outcome::CardBlocked.into());
                }
                Err(err) => return Err(card_error("AID probing", err)),
            };
        }

        if candidates.is_empty() {
            info!("No mutually supported applications");
            return Err(Outcome::NotAccepted.into());
        }

        tal::sort_candidates(&mut candidates);
        for candidate in &candidates {
            info!("Candidate: {}", candidate);
        }
        self.candidates = candidates;

        Ok(())
    }

    /// Final selection of candidate `index`. The candidate leaves the list
    /// whether the selection succeeds or not. ref. EMV Book 1, 12.4 Final Selection
    pub fn select_application(&mut self, index: usize) -> Result<()> {
        if index >= self.candidates.len() {
            return Err(InternalError::InvalidArgument("candidate index out of range").into());
        }

        self.reset();
        let candidate = self.candidates.remove(index);
        info!("Selecting application {}", candidate);

        match tal::select_application(&mut *self.transport, &candidate.aid) {
            Ok(fci) => {
                self.application = Some(EmvApplication { fci, ..candidate });
                Ok(())
            }
            Err(TalError::Status(ttl::SW_FUNCTION_NOT_SUPPORTED)) => Err(Outcome::CardBlocked.into()),
            Err(TalError::Transport(err)) => {
                warn!("Card communication failed: {}", err);
                Err(Outcome::TryAgain.into())
            }
            Err(err) => {
                warn!("Could not select {}: {}", candidate, err);
                if self.candidates.is_empty() {
                    Err(Outcome::NotAccepted.into())
                } else {
                    Err(Soft::TryNextCandidate.into())
                }
            }
        }
    }

    fn set_transaction_date_time(&mut self) -> Result<()> {
        let now = Utc::now().naive_utc();

        for (tag, format) in [(tags::TRANSACTION_DATE, "%y%m%d"), (tags::TRANSACTION_TIME, "%H%M%S")] {
            let value = match self.params.find(tag) {
                Some(value) => value.to_vec(),
                None => bcdutil::ascii_to_bcd_n(now.format(format).to_string().as_bytes(), 3)
                    .map_err(|_| InternalError::InvalidState("clock not representable"))?,
            };
            self.terminal.set(tag, value);
        }

        Ok(())
    }

    /// Prepares terminal data and sends GET PROCESSING OPTIONS, ref. EMV Book 3, 10.1
    pub fn initiate_application_processing(&mut self) -> Result<()> {
        let aid = match &self.application {
            Some(application) => application.aid.clone(),
            None => return Err(InternalError::InvalidState("no application selected").into()),
        };

        self.terminal.set(tags::POS_ENTRY_MODE, vec![POS_ENTRY_MODE_ICC]);
        self.terminal.set(tags::TERMINAL_AID, aid);
        self.tvr = TerminalVerificationResults::default();
        self.tsi = TransactionStatusInformation::default();

        let mut unpredictable_number = [0u8; 4];
        self.rng.fill(&mut unpredictable_number);
        self.terminal.set(tags::UNPREDICTABLE_NUMBER, unpredictable_number.to_vec());
        unpredictable_number.zeroize();

        self.set_transaction_date_time()?;
        self.publish_status();

        let pdol = self.application.as_ref().and_then(|a| a.fci.find(tags::PDOL));
        let pdol_data = match pdol {
            Some(pdol) => {
                let pdol = DataObjectList::parse(pdol).map_err(|err| {
                    warn!("Malformed PDOL: {}", err);
                    Outcome::CardError
                })?;
                debug!("PDOL: {}", pdol);
                self.build_dol(&pdol)
            }
            None => Zeroizing::new(Vec::new()),
        };
        if pdol_data.len() > MAX_PDOL_DATA_LENGTH {
            return Err(InternalError::BufferOverflow.into());
        }
        self.oda.pdol_data = pdol_data;

        let mut output = match tal::get_processing_options(&mut *self.transport, &self.oda.pdol_data) {
            Ok(output) => output,
            Err(TalError::Status(ttl::SW_CONDITIONS_NOT_SATISFIED)) => {
                info!("GET PROCESSING OPTIONS conditions of use not satisfied");
                return Err(Soft::GpoConditionsNotSatisfied.into());
            }
            Err(err) => return Err(card_error("GET PROCESSING OPTIONS", err)),
        };

        if let Some(application) = self.application.as_mut() {
            self.icc.append(&mut application.fci);
        }
        self.icc.append(&mut output);

        let afl = self.icc.find(tags::AFL).unwrap_or_default();
        self.afl = tal::parse_afl(afl).map_err(|err| card_error("AFL parsing", err))?;

        Ok(())
    }

    /// Reads the records the AFL lists, ref. EMV Book 3, 10.2
    pub fn read_application_data(&mut self) -> Result<()> {
        if self.afl.is_empty() {
            return Err(InternalError::InvalidState("AFL not available").into());
        }

        self.oda.init(tal::oda_record_count(&self.afl));
        let mut records = tal::read_application_records(
            &mut *self.transport,
            &self.afl,
            &mut self.oda,
            self.censor_sensitive_fields,
        )
        .map_err(|err| card_error("READ RECORD", err))?;

        if let Some(tag) = records.find_duplicate() {
            warn!("Data object {:02X} present in more than one record", tag);
            return Err(Outcome::CardError.into());
        }

        self.icc.append(&mut records);

        for mandatory in [
            tags::APPLICATION_EXPIRATION_DATE,
            tags::PAN,
            tags::CDOL1,
            tags::CDOL2,
        ] {
            if !self.icc.contains(mandatory) {
                warn!("Mandatory data object {:02X} missing", mandatory);
                return Err(Outcome::CardError.into());
            }
        }

        let pan = self.pan_digits().ok_or_else(|| {
            warn!("Malformed PAN");
            Outcome::CardError
        })?;
        if self.censor_sensitive_fields {
            info!("Card PAN: {}", get_truncated_pan(&pan));
        } else {
            info!("Card PAN: {}", pan);
        }

        Ok(())
    }

    /// Offline data authentication, ref. EMV Book 3, 10.3
    ///
    /// Failure or absence of authentication is a soft result, the outcome is
    /// left in TVR and TSI. The captured record data is wiped either way.
    pub fn offline_data_authentication(&mut self) -> Result<()> {
        let terminal_capabilities = self
            .terminal_value(tags::TERMINAL_CAPABILITIES)
            .filter(|capabilities| capabilities.len() == 3)
            .ok_or(InternalError::MissingConfiguration(tags::TERMINAL_CAPABILITIES))?
            .to_vec();
        if self.terminal_value(tags::DEFAULT_DDOL).is_none() {
            return Err(InternalError::MissingConfiguration(tags::DEFAULT_DDOL).into());
        }

        let result = self.oda.authenticate(
            &terminal_capabilities,
            self.capk,
            &self.terminal,
            &mut self.icc,
            &mut self.tvr,
            &mut self.tsi,
        );
        self.oda.clear_buffer();
        self.publish_status();

        if let Err(KernelError::Continue(soft)) = &result {
            info!("Continuing without offline data authentication: {}", soft);
        }
        result
    }

    /// `None` when the card has no Issuer Country Code.
    fn is_domestic(&self) -> Option<bool> {
        let issuer = self.icc.find(tags::ISSUER_COUNTRY_CODE)?;
        Some(self.terminal_value(tags::TERMINAL_COUNTRY_CODE) == Some(issuer))
    }

    // ref. EMV Book 3, 10.4.2 Application Usage Control
    fn is_service_allowed(&self, auc: &[u8]) -> bool {
        let b1 = auc.first().copied().unwrap_or(0);
        let b2 = auc.get(1).copied().unwrap_or(0);
        let domestic = self.is_domestic();

        let terminal_type = self.terminal_value(tags::TERMINAL_TYPE).and_then(first_byte).unwrap_or(0);
        let cash_capable = self
            .terminal_value(tags::ADDITIONAL_TERMINAL_CAPABILITIES)
            .and_then(first_byte)
            .map_or(false, |b| get_bit!(b, 7));
        let atm = matches!(terminal_type, 0x14 | 0x15 | 0x16) && cash_capable;

        if atm && !get_bit!(b1, 1) {
            info!("Application not valid at ATMs");
            return false;
        }
        if !atm && !get_bit!(b1, 0) {
            info!("Application not valid at terminals other than ATMs");
            return false;
        }

        // the domestic and international checks need the issuer country
        let domestic = match domestic {
            Some(domestic) => domestic,
            None => {
                debug!("Usage control {:02X?}: atm:{}, no issuer country code", auc, atm);
                return true;
            }
        };

        let transaction_type = self.terminal_value(tags::TRANSACTION_TYPE).and_then(first_byte).unwrap_or(0x00);
        let service_allowed = match transaction_type {
            0x01 => {
                if domestic {
                    get_bit!(b1, 7)
                } else {
                    get_bit!(b1, 6)
                }
            }
            0x00 | 0x09 => {
                if domestic {
                    get_bit!(b1, 5) || get_bit!(b1, 3)
                } else {
                    get_bit!(b1, 4) || get_bit!(b1, 2)
                }
            }
            _ => true,
        };

        let amount_other = self
            .terminal_value(tags::AMOUNT_OTHER)
            .and_then(|amount| bcdutil::bcd_to_u64(amount).ok())
            .unwrap_or(0);
        let cashback_allowed = if transaction_type == 0x09 || amount_other > 0 {
            if domestic {
                get_bit!(b2, 7)
            } else {
                get_bit!(b2, 6)
            }
        } else {
            true
        };

        debug!(
            "Usage control {:02X?}: domestic:{}, atm:{}, type:{:02X}, service:{}, cashback:{}",
            auc, domestic, atm, transaction_type, service_allowed, cashback_allowed
        );

        service_allowed && cashback_allowed
    }

    /// Application version, usage control and date checks, ref. EMV Book 3, 10.4
    pub fn processing_restrictions(&mut self) -> Result<()> {
        let today = self
            .terminal
            .find(tags::TRANSACTION_DATE)
            .and_then(|date| bcdutil::bcd_to_date(date).ok())
            .ok_or(InternalError::MissingParameter(tags::TRANSACTION_DATE))?;

        let different_versions = matches!(
            (
                self.icc.find(tags::ICC_APPLICATION_VERSION),
                self.terminal_value(tags::TERMINAL_APPLICATION_VERSION),
            ),
            (Some(icc), Some(terminal)) if icc != terminal
        );
        self.tvr.icc_and_terminal_have_different_application_versions = different_versions;

        let service_not_allowed = match self.icc.find(tags::APPLICATION_USAGE_CONTROL) {
            Some(auc) => !self.is_service_allowed(auc),
            None => false,
        };
        self.tvr.requested_service_not_allowed_for_card_product = service_not_allowed;

        // unparseable dates count as failed checks
        let card_date = |tag| {
            self.icc
                .find(tag)
                .map(|date| bcdutil::bcd_to_date(date).ok())
        };
        let not_yet_effective = match card_date(tags::APPLICATION_EFFECTIVE_DATE) {
            Some(Some(effective)) => effective > today,
            Some(None) => true,
            None => false,
        };
        let expired = match card_date(tags::APPLICATION_EXPIRATION_DATE) {
            Some(Some(expiration)) => expiration < today,
            Some(None) => true,
            None => false,
        };
        self.tvr.application_not_yet_effective = not_yet_effective;
        self.tvr.expired_application = expired;

        debug!(
            "Processing restrictions: versions differ:{}, service not allowed:{}, not yet effective:{}, expired:{}",
            different_versions, service_not_allowed, not_yet_effective, expired
        );

        self.publish_status();
        Ok(())
    }

    fn random_selection(&self) -> Option<RandomSelection> {
        let threshold = self
            .config
            .find(tags::RANDOM_SELECTION_THRESHOLD)
            .and_then(binary_value)?;
        let target_percentage = self
            .config
            .find(tags::RANDOM_SELECTION_TARGET_PERCENTAGE)
            .and_then(first_byte)?;
        let max_target_percentage = self
            .config
            .find(tags::RANDOM_SELECTION_MAX_TARGET_PERCENTAGE)
            .and_then(first_byte)?;

        Some(RandomSelection {
            threshold,
            target_percentage,
            max_target_percentage,
        })
    }

    fn get_atc(&mut self, tag: TagId) -> Option<u16> {
        match tal::get_data(&mut *self.transport, tag as u16) {
            Ok(value) => match value[..] {
                [b1, b2] => Some(u16::from_be_bytes([b1, b2])),
                _ => {
                    warn!("Malformed {:02X}", tag);
                    None
                }
            },
            Err(err) => {
                warn!("GET DATA {:02X} failed: {}", tag, err);
                None
            }
        }
    }

    // ref. EMV Book 3, 10.6.3 Velocity Checking
    fn check_velocity(&mut self) {
        let limits = (
            self.icc
                .find(tags::LOWER_CONSECUTIVE_OFFLINE_LIMIT)
                .and_then(first_byte),
            self.icc
                .find(tags::UPPER_CONSECUTIVE_OFFLINE_LIMIT)
                .and_then(first_byte),
        );
        let (lower_limit, upper_limit) = match limits {
            (Some(lower), Some(upper)) => (lower, upper),
            _ => {
                debug!("Card does not support velocity checking");
                return;
            }
        };

        let atc = self.get_atc(tags::ATC);
        let last_online_atc = self.get_atc(tags::LAST_ONLINE_ATC);

        match (atc, last_online_atc) {
            (Some(atc), Some(last_online_atc)) => {
                let velocity = risk::check_velocity(atc, last_online_atc, lower_limit, upper_limit);
                self.tvr.lower_consecutive_offline_limit_exceeded = velocity.lower_limit_exceeded;
                self.tvr.upper_consecutive_offline_limit_exceeded = velocity.upper_limit_exceeded;
                self.tvr.new_card = velocity.new_card;
            }
            _ => {
                self.tvr.lower_consecutive_offline_limit_exceeded = true;
                self.tvr.upper_consecutive_offline_limit_exceeded = true;
            }
        }
    }

    /// Floor limit, random selection and velocity checks, ref. EMV Book 3, 10.6
    ///
    /// `offline_log` holds approved offline transactions, whose amounts count
    /// towards the floor limit for the same PAN.
    pub fn terminal_risk_management(&mut self, offline_log: Option<&OfflineLog>) -> Result<()> {
        let floor_limit = self
            .terminal_value(tags::TERMINAL_FLOOR_LIMIT)
            .and_then(binary_value)
            .ok_or(InternalError::MissingConfiguration(tags::TERMINAL_FLOOR_LIMIT))?;
        let amount = self
            .terminal_value(tags::AMOUNT_AUTHORISED)
            .and_then(|amount| bcdutil::bcd_to_u64(amount).ok())
            .ok_or(InternalError::MissingParameter(tags::AMOUNT_AUTHORISED))?;

        let logged_amount = match (offline_log, self.pan_digits()) {
            (Some(log), Some(pan)) => log.total_for(&pan),
            _ => 0,
        };
        let total = amount.saturating_add(logged_amount);

        self.tvr.transaction_exceeds_floor_limit = total >= floor_limit;
        if self.tvr.transaction_exceeds_floor_limit {
            info!("Floor limit {} reached, amount:{}, logged:{}", floor_limit, amount, logged_amount);
        } else {
            match self.random_selection() {
                Some(selection) => {
                    let draw = risk::draw_percentage(&mut self.rng);
                    self.tvr.transaction_selected_randomly_for_online_processing =
                        selection.is_selected(amount, floor_limit, draw);
                }
                None => debug!("Random transaction selection not configured"),
            }
        }

        self.check_velocity();

        self.tsi.terminal_risk_management_was_performed = true;
        self.publish_status();
        Ok(())
    }

    /// Cryptogram the terminal would request by its own analysis, ref. EMV
    /// Book 3, 10.7. Advisory only, the first GENERATE AC asks for AAC.
    pub fn terminal_action_analysis(&self) -> CryptogramType {
        let action_code = |store: &TlvStore, tag: TagId, default: u8| {
            store
                .find(tag)
                .map(<[u8]>::to_vec)
                .unwrap_or_else(|| vec![default; 5])
        };

        let iac_denial = action_code(&self.icc, tags::IAC_DENIAL, 0x00);
        let tac_denial = action_code(&self.config, tags::TAC_DENIAL, 0x00);
        if self.tvr.action_code_matches(&iac_denial, &tac_denial) {
            debug!("Denial action codes match");
            return CryptogramType::ApplicationAuthenticationCryptogram;
        }

        // ref. EMV Book 4, A1 Terminal Type
        let online_capable = self
            .terminal_value(tags::TERMINAL_TYPE)
            .and_then(first_byte)
            .map_or(false, |terminal_type| matches!(terminal_type & 0x0F, 1 | 2 | 4 | 5));

        if online_capable {
            let iac_online = action_code(&self.icc, tags::IAC_ONLINE, 0xFF);
            let tac_online = action_code(&self.config, tags::TAC_ONLINE, 0x00);
            if self.tvr.action_code_matches(&iac_online, &tac_online) {
                debug!("Online action codes match");
                return CryptogramType::AuthorisationRequestCryptogram;
            }
        } else {
            let iac_default = action_code(&self.icc, tags::IAC_DEFAULT, 0xFF);
            let tac_default = action_code(&self.config, tags::TAC_DEFAULT, 0x00);
            if self.tvr.action_code_matches(&iac_default, &tac_default) {
                debug!("Default action codes match");
                return CryptogramType::ApplicationAuthenticationCryptogram;
            }
        }

        CryptogramType::TransactionCertificate
    }

    /// First GENERATE AC, always requesting AAC. ref. EMV Book 3, 10.8
    pub fn card_action_analysis(&mut self) -> Result<CryptogramType> {
        self.publish_status();

        let cdol1 = self.icc.find(tags::CDOL1).ok_or_else(|| {
            warn!("CDOL1 not available");
            Outcome::CardError
        })?;
        let cdol1 = DataObjectList::parse(cdol1).map_err(|err| {
            warn!("Malformed CDOL1: {}", err);
            Outcome::CardError
        })?;
        debug!("CDOL1: {}", cdol1);

        let cdol1_data = self.build_dol(&cdol1);
        if cdol1_data.len() > MAX_CDOL_DATA_LENGTH {
            return Err(InternalError::BufferOverflow.into());
        }

        let cda = self.oda.cda_pending(&self.tvr);
        let mut reference_control: u8 = CryptogramType::ApplicationAuthenticationCryptogram.into();
        if cda {
            reference_control |= tal::CDA_SIGNATURE_REQUESTED;
        }

        let oda = if cda { Some(&mut self.oda) } else { None };
        let mut output = tal::generate_ac(&mut *self.transport, reference_control, &cdol1_data, oda)
            .map_err(|err| card_error("GENERATE AC", err))?;
        self.oda.cdol1_data = cdol1_data;

        let cryptogram = output
            .find(tags::CRYPTOGRAM_INFORMATION_DATA)
            .and_then(first_byte)
            .and_then(|cid| CryptogramType::try_from(cid).ok())
            .ok_or_else(|| {
                warn!("Unknown Cryptogram Information Data");
                Outcome::CardError
            })?;
        self.icc.append(&mut output);

        info!("Card responded with {:?}", cryptogram);
        Ok(cryptogram)
    }

    /// Runs a transaction from card insertion to the first GENERATE AC.
    pub fn process(&mut self, atr: &[u8], offline_log: Option<&OfflineLog>) -> Result<CryptogramType> {
        self.validate_atr(atr)?;
        self.build_candidate_list()?;

        let mut processing_options_rejected = false;
        loop {
            if self.candidates.is_empty() {
                return Err(if processing_options_rejected {
                    Outcome::GpoNotAccepted.into()
                } else {
                    Outcome::NotAccepted.into()
                });
            }

            match self.select_application(0) {
                Ok(()) => (),
                Err(KernelError::Continue(_)) => continue,
                Err(KernelError::Outcome(Outcome::NotAccepted)) if processing_options_rejected => {
                    return Err(Outcome::GpoNotAccepted.into())
                }
                Err(err) => return Err(err),
            }

            match self.initiate_application_processing() {
                Ok(()) => break,
                Err(KernelError::Continue(Soft::GpoConditionsNotSatisfied)) => {
                    processing_options_rejected = true;
                }
                Err(err) => return Err(err),
            }
        }

        self.read_application_data()?;

        match self.offline_data_authentication() {
            Err(err) if err.is_fatal() => return Err(err),
            _ => (),
        }

        self.processing_restrictions()?;
        self.terminal_risk_management(offline_log)?;

        let advised = self.terminal_action_analysis();
        info!("Terminal action analysis result: {:?}", advised);

        self.card_action_analysis()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capk::CaPublicKey;
    use crate::oda::{OdaMethod, OdaStatus};
    use crate::testutil::{self, BrokenConnection, DummySmartCardConnection, TestPki};
    use crate::tlv;
    use crate::ttl::Ttl;

    const ATR: &str = "3B6500002063CB6600";
    const SELECT_AID: &str = "00A4040007A000000003101000";
    const FCI: &str = "6F118407A0000000031010A5065004564953419000";
    const GPO_NO_PDOL: &str = "80A8000002830000";
    const GENAC_AAC: &str = "800B00000111223344556677889000";

    // PAN, expiration date, CDOL1 (amount, date), CDOL2, CA index 92 and issuer exponent 3
    const APPLICATION_RECORD: &str =
        "70225A0847617390010100105F24033012318C059F02069A038D028A028F01929F320103";

    fn settings() -> Settings {
        let mut settings = Settings::load(None).unwrap();
        settings.use_random = false;
        settings
    }

    fn ok(data: &[u8]) -> Vec<u8> {
        [data, &[0x90, 0x00][..]].concat()
    }

    fn genac_command(amount: &str) -> Vec<u8> {
        hex::decode(format!("80AE000009{}24061500", amount)).unwrap()
    }

    fn card(gpo_response: &str, records: &[(&str, Vec<u8>)], amount: &str) -> DummySmartCardConnection {
        let connection = DummySmartCardConnection::new(&[
            (SELECT_AID, FCI),
            (SELECT_AID, FCI),
            (GPO_NO_PDOL, gpo_response),
        ]);
        for (command, record) in records {
            connection.push(&hex::decode(command).unwrap(), &ok(record));
        }
        connection.push(&genac_command(amount), &hex::decode(GENAC_AAC).unwrap());
        connection
    }

    fn set_parameters(context: &mut Context, amount: &str) {
        context.set_parameter(tags::AMOUNT_AUTHORISED, hex::decode(amount).unwrap());
        context.set_parameter(tags::TRANSACTION_DATE, vec![0x24, 0x06, 0x15]);
        context.set_parameter(tags::TRANSACTION_TYPE, vec![0x00]);
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

    #[test]
    fn test_transaction_without_pdol() {
        testutil::init_logging();
        let amount = "000000001000";
        let connection = card(
            "8006000008010100 9000",
            &[("00B2010C00", hex::decode(APPLICATION_RECORD).unwrap())],
            amount,
        );
        let mut ttl = Ttl::new(&connection, false);
        let capk = CapkTable::default();
        let mut context = Context::new(&mut ttl, &settings(), &capk).unwrap();
        set_parameters(&mut context, amount);

        let result = context.process(&hex::decode(ATR).unwrap(), None);

        assert_eq!(result, Ok(CryptogramType::ApplicationAuthenticationCryptogram));
        assert!(connection.sent().contains(&hex::decode(GPO_NO_PDOL).unwrap()));
        assert!(connection.is_exhausted());

        assert!(context.tvr.offline_data_authentication_was_not_performed);
        assert!(context.tsi.terminal_risk_management_was_performed);
        assert_eq!(context.icc.find(tags::ATC), Some(&[0x00, 0x01][..]));
        assert_eq!(context.terminal.find(tags::POS_ENTRY_MODE), Some(&[0x05][..]));
        assert_eq!(
            context.terminal.find(tags::TERMINAL_AID),
            Some(&hex::decode("A0000000031010").unwrap()[..])
        );
        assert_eq!(context.terminal.find(tags::UNPREDICTABLE_NUMBER).map(<[u8]>::len), Some(4));
        assert!(context.terminal.contains(tags::TRANSACTION_TIME));
    }

    fn sda_transaction(protected_record: &[u8]) -> (TerminalVerificationResults, OdaStatus, bool) {
        let pki = TestPki::generate();
        let signed_record = hex::decode("70059F0702FF00").unwrap();
        let issuer_certificate = pki.issuer_certificate(&[0x47, 0x61, 0x73, 0xFF], &[0x12, 0x30]);
        let ssad = pki.signed_static_data(&[0xDA, 0xC1], &signed_record);

        let amount = "000000001000";
        let connection = card(
            "800A400008010300780101019000",
            &[
                ("00B2010C00", hex::decode(APPLICATION_RECORD).unwrap()),
                (
                    "00B2020C00",
                    tlv::encode(
                        tags::RECORD_TEMPLATE,
                        &[
                            tlv::encode(tags::ISSUER_PK_CERTIFICATE, &issuer_certificate),
                            tlv::encode(tags::ISSUER_PK_REMAINDER, &pki.issuer_remainder),
                        ]
                        .concat(),
                    ),
                ),
                (
                    "00B2030C00",
                    tlv::encode(
                        tags::RECORD_TEMPLATE,
                        &tlv::encode(tags::SIGNED_STATIC_APPLICATION_DATA, &ssad),
                    ),
                ),
                ("00B2017C00", protected_record.to_vec()),
            ],
            amount,
        );
        let mut ttl = Ttl::new(&connection, false);
        let capk = capk_for(&pki);
        let mut context = Context::new(&mut ttl, &settings(), &capk).unwrap();
        set_parameters(&mut context, amount);

        let result = context.process(&hex::decode(ATR).unwrap(), None);
        assert_eq!(result, Ok(CryptogramType::ApplicationAuthenticationCryptogram));

        let dac_stored = context.icc.find(tags::DATA_AUTHENTICATION_CODE) == Some(&[0xDA, 0xC1][..]);
        (context.tvr, context.oda.status, dac_stored)
    }

    #[test]
    fn test_sda_transaction() {
        testutil::init_logging();
        let (tvr, status, dac_stored) = sda_transaction(&hex::decode("70059F0702FF00").unwrap());

        assert_eq!(status, OdaStatus::Succeeded);
        assert!(dac_stored);
        assert!(!tvr.sda_failed);
        assert!(!tvr.offline_data_authentication_was_not_performed);
    }

    #[test]
    fn test_sda_fails_on_untemplated_protected_record() {
        testutil::init_logging();
        let (tvr, status, dac_stored) = sda_transaction(&hex::decode("9F0702FF00").unwrap());

        assert_eq!(status, OdaStatus::Failed);
        assert!(!dac_stored);
        assert!(tvr.sda_failed);
    }

    fn floor_limit_transaction(amount: &str) -> TerminalVerificationResults {
        let connection = card(
            "8006000008010100 9000",
            &[("00B2010C00", hex::decode(APPLICATION_RECORD).unwrap())],
            amount,
        );
        let mut ttl = Ttl::new(&connection, false);
        let capk = CapkTable::default();
        let mut context = Context::new(&mut ttl, &settings(), &capk).unwrap();
        set_parameters(&mut context, amount);

        context.process(&hex::decode(ATR).unwrap(), None).unwrap();
        context.tvr
    }

    #[test]
    fn test_floor_limit_boundary() {
        testutil::init_logging();
        // floor limit 9F1B is 10000
        assert!(floor_limit_transaction("000000010000").transaction_exceeds_floor_limit);
        assert!(!floor_limit_transaction("000000009999").transaction_exceeds_floor_limit);
    }

    fn dynamic_oda_transaction(terminal_capabilities: &str) -> (Result<CryptogramType>, TerminalVerificationResults) {
        let amount = "000000001000";
        // AIP announces SDA, DDA and CDA
        let connection = card(
            "8006610008010100 9000",
            &[("00B2010C00", hex::decode(APPLICATION_RECORD).unwrap())],
            amount,
        );
        let mut ttl = Ttl::new(&connection, false);
        let capk = CapkTable::default();
        let mut settings = settings();
        settings
            .config_tags
            .insert("9F33".to_string(), terminal_capabilities.to_string());
        let mut context = Context::new(&mut ttl, &settings, &capk).unwrap();
        set_parameters(&mut context, amount);

        let result = context.process(&hex::decode(ATR).unwrap(), None);
        (result, context.tvr)
    }

    #[test]
    fn test_dynamic_authentication_fails_closed() {
        testutil::init_logging();

        let (result, tvr) = dynamic_oda_transaction("E0F8C8");
        assert_eq!(
            result,
            Err(InternalError::UnsupportedOdaMethod(OdaMethod::Cda).into())
        );
        assert!(tvr.cda_failed);

        let (result, tvr) = dynamic_oda_transaction("E0F8C0");
        assert_eq!(
            result,
            Err(InternalError::UnsupportedOdaMethod(OdaMethod::Dda).into())
        );
        assert!(tvr.dda_failed);
        assert!(!tvr.cda_failed);
    }

    #[test]
    fn test_processing_options_not_accepted() {
        testutil::init_logging();
        let connection = DummySmartCardConnection::new(&[
            (SELECT_AID, FCI),
            (SELECT_AID, FCI),
            (GPO_NO_PDOL, "6985"),
        ]);
        let mut ttl = Ttl::new(&connection, false);
        let capk = CapkTable::default();
        let mut context = Context::new(&mut ttl, &settings(), &capk).unwrap();
        set_parameters(&mut context, "000000001000");

        assert_eq!(
            context.process(&hex::decode(ATR).unwrap(), None),
            Err(Outcome::GpoNotAccepted.into())
        );
        assert!(context.candidates.is_empty());
    }

    #[test]
    fn test_candidate_list() {
        testutil::init_logging();

        // blocked PSE
        let connection = DummySmartCardConnection::new(&[("00A404000E315041592E5359532E444446303100", "6A81")]);
        let mut ttl = Ttl::new(&connection, false);
        let capk = CapkTable::default();
        let mut context = Context::new(&mut ttl, &settings(), &capk).unwrap();
        assert_eq!(context.build_candidate_list(), Err(Outcome::CardBlocked.into()));

        // nothing answers
        let connection = DummySmartCardConnection::new(&[]);
        let mut ttl = Ttl::new(&connection, false);
        let mut context = Context::new(&mut ttl, &settings(), &capk).unwrap();
        assert_eq!(context.build_candidate_list(), Err(Outcome::NotAccepted.into()));

        // removed card
        let mut ttl = Ttl::new(&BrokenConnection, false);
        let mut context = Context::new(&mut ttl, &settings(), &capk).unwrap();
        assert_eq!(context.build_candidate_list(), Err(Outcome::TryAgain.into()));

        // probing after missing PSE
        let connection = DummySmartCardConnection::new(&[(SELECT_AID, FCI)]);
        let mut ttl = Ttl::new(&connection, false);
        let mut context = Context::new(&mut ttl, &settings(), &capk).unwrap();
        assert_eq!(context.build_candidate_list(), Ok(()));
        assert_eq!(context.candidates.len(), 1);
        assert_eq!(context.candidates[0].label, "VISA");

        assert_eq!(
            context.select_application(1),
            Err(InternalError::InvalidArgument("candidate index out of range").into())
        );
        // the final SELECT is unscripted and the list runs out
        assert_eq!(context.select_application(0), Err(Outcome::NotAccepted.into()));
    }

    #[test]
    fn test_invalid_atr() {
        let connection = DummySmartCardConnection::new(&[]);
        let mut ttl = Ttl::new(&connection, false);
        let capk = CapkTable::default();
        let mut context = Context::new(&mut ttl, &settings(), &capk).unwrap();

        assert_eq!(
            context.process(&[0x3B, 0x65, 0x00], None),
            Err(Outcome::CardError.into())
        );
        assert!(connection.sent().is_empty());
    }

    fn risk_context<'a>(ttl: &'a mut Ttl<'_>, capk: &'a CapkTable, amount: &str) -> Context<'a> {
        let mut context = Context::new(ttl, &settings(), capk).unwrap();
        set_parameters(&mut context, amount);
        context.icc.push(tags::PAN, hex::decode("4761739001010010").unwrap());
        context
    }

    #[test]
    fn test_velocity_checking() {
        testutil::init_logging();
        let capk = CapkTable::default();

        let connection = DummySmartCardConnection::new(&[
            ("80CA9F3600", "9F360200109000"),
            ("80CA9F1300", "9F130200089000"),
        ]);
        let mut ttl = Ttl::new(&connection, false);
        let mut context = risk_context(&mut ttl, &capk, "000000001000");
        context.icc.push(tags::LOWER_CONSECUTIVE_OFFLINE_LIMIT, vec![0x08]);
        context.icc.push(tags::UPPER_CONSECUTIVE_OFFLINE_LIMIT, vec![0x0A]);
        context.terminal_risk_management(None).unwrap();
        assert!(!context.tvr.lower_consecutive_offline_limit_exceeded);
        assert!(!context.tvr.upper_consecutive_offline_limit_exceeded);
        assert!(!context.tvr.new_card);

        // last online ATC not available
        let connection = DummySmartCardConnection::new(&[("80CA9F3600", "9F360200109000")]);
        let mut ttl = Ttl::new(&connection, false);
        let mut context = risk_context(&mut ttl, &capk, "000000001000");
        context.icc.push(tags::LOWER_CONSECUTIVE_OFFLINE_LIMIT, vec![0x08]);
        context.icc.push(tags::UPPER_CONSECUTIVE_OFFLINE_LIMIT, vec![0x0A]);
        context.terminal_risk_management(None).unwrap();
        assert!(context.tvr.lower_consecutive_offline_limit_exceeded);
        assert!(context.tvr.upper_consecutive_offline_limit_exceeded);
        assert_eq!(context.terminal.find(tags::TSI), Some(&[0x08, 0x00][..]));

        // ATC behind the last online ATC
        let connection = DummySmartCardConnection::new(&[
            ("80CA9F3600", "9F360200059000"),
            ("80CA9F1300", "9F130200089000"),
        ]);
        let mut ttl = Ttl::new(&connection, false);
        let mut context = risk_context(&mut ttl, &capk, "000000001000");
        context.icc.push(tags::LOWER_CONSECUTIVE_OFFLINE_LIMIT, vec![0x02]);
        context.icc.push(tags::UPPER_CONSECUTIVE_OFFLINE_LIMIT, vec![0x04]);
        context.terminal_risk_management(None).unwrap();
        assert!(context.tvr.lower_consecutive_offline_limit_exceeded);
        assert!(context.tvr.upper_consecutive_offline_limit_exceeded);
    }

    #[test]
    fn test_offline_log_counts_towards_floor_limit() {
        let capk = CapkTable::default();
        let connection = DummySmartCardConnection::new(&[]);
        let mut ttl = Ttl::new(&connection, false);
        let mut context = risk_context(&mut ttl, &capk, "000000001000");

        let log = OfflineLog::from_yaml(
            r#"
transactions:
  - pan: "4761739001010010"
    amount: 9000
"#,
        )
        .unwrap();

        context.terminal_risk_management(Some(&log)).unwrap();
        assert!(context.tvr.transaction_exceeds_floor_limit);
        assert!(!context.tvr.transaction_selected_randomly_for_online_processing);
        // velocity checking is not supported by the card
        assert!(connection.sent().is_empty());
        assert!(!context.tvr.lower_consecutive_offline_limit_exceeded);
        assert!(!context.tvr.upper_consecutive_offline_limit_exceeded);
    }

    #[test]
    fn test_risk_management_requires_amount() {
        let capk = CapkTable::default();
        let connection = DummySmartCardConnection::new(&[]);
        let mut ttl = Ttl::new(&connection, false);
        let mut context = Context::new(&mut ttl, &settings(), &capk).unwrap();

        assert_eq!(
            context.terminal_risk_management(None),
            Err(InternalError::MissingParameter(tags::AMOUNT_AUTHORISED).into())
        );

        context.clear();
        context.set_parameter(tags::AMOUNT_AUTHORISED, vec![0x00, 0x00, 0x00, 0x00, 0x10, 0x00]);
        assert_eq!(
            context.terminal_risk_management(None),
            Err(InternalError::MissingConfiguration(tags::TERMINAL_FLOOR_LIMIT).into())
        );
    }

    #[test]
    fn test_processing_restrictions() {
        let capk = CapkTable::default();
        let connection = DummySmartCardConnection::new(&[]);
        let mut ttl = Ttl::new(&connection, false);
        let mut context = Context::new(&mut ttl, &settings(), &capk).unwrap();
        context.terminal.set(tags::TRANSACTION_DATE, vec![0x24, 0x06, 0x15]);

        context.icc.push(tags::ICC_APPLICATION_VERSION, vec![0x00, 0x02]);
        context.icc.push(tags::APPLICATION_EXPIRATION_DATE, vec![0x24, 0x06, 0x15]);
        context.icc.push(tags::APPLICATION_EFFECTIVE_DATE, vec![0x24, 0x06, 0x15]);
        // international goods and services only
        context.icc.push(tags::APPLICATION_USAGE_CONTROL, vec![0x15, 0x00]);
        context.processing_restrictions().unwrap();
        assert_eq!(context.tvr, TerminalVerificationResults::default());

        context.icc.clear();
        context.icc.push(tags::ICC_APPLICATION_VERSION, vec![0x00, 0x01]);
        context.icc.push(tags::APPLICATION_EXPIRATION_DATE, vec![0x24, 0x06, 0x14]);
        context.icc.push(tags::APPLICATION_EFFECTIVE_DATE, vec![0x24, 0x13, 0x01]);
        context.icc.push(tags::ISSUER_COUNTRY_CODE, vec![0x02, 0x46]);
        context.icc.push(tags::APPLICATION_USAGE_CONTROL, vec![0x15, 0x00]);
        context.processing_restrictions().unwrap();
        assert!(context.tvr.icc_and_terminal_have_different_application_versions);
        assert!(context.tvr.expired_application);
        assert!(context.tvr.application_not_yet_effective);
        assert!(context.tvr.requested_service_not_allowed_for_card_product);
    }

    #[test]
    fn test_usage_control_without_issuer_country() {
        let capk = CapkTable::default();
        let connection = DummySmartCardConnection::new(&[]);
        let mut ttl = Ttl::new(&connection, false);
        let mut context = Context::new(&mut ttl, &settings(), &capk).unwrap();
        context.terminal.set(tags::TRANSACTION_DATE, vec![0x24, 0x06, 0x15]);
        context.set_parameter(tags::TRANSACTION_TYPE, vec![0x00]);

        // domestic goods and services, valid at terminals other than ATMs
        context.icc.push(tags::APPLICATION_USAGE_CONTROL, vec![0x29, 0x00]);
        context.processing_restrictions().unwrap();
        assert!(!context.tvr.requested_service_not_allowed_for_card_product);

        // cashback is not checked either
        context.set_parameter(tags::TRANSACTION_TYPE, vec![0x09]);
        context.processing_restrictions().unwrap();
        assert!(!context.tvr.requested_service_not_allowed_for_card_product);

        // ATM usage is still checked
        context.icc.clear();
        context.icc.push(tags::APPLICATION_USAGE_CONTROL, vec![0x02, 0x00]);
        context.processing_restrictions().unwrap();
        assert!(context.tvr.requested_service_not_allowed_for_card_product);

        // with the issuer country the international card is restricted
        context.set_parameter(tags::TRANSACTION_TYPE, vec![0x00]);
        context.icc.clear();
        context.icc.push(tags::APPLICATION_USAGE_CONTROL, vec![0x29, 0x00]);
        context.icc.push(tags::ISSUER_COUNTRY_CODE, vec![0x08, 0x40]);
        context.processing_restrictions().unwrap();
        assert!(context.tvr.requested_service_not_allowed_for_card_product);
    }

    #[test]
    fn test_terminal_action_analysis() {
        let capk = CapkTable::default();
        let connection = DummySmartCardConnection::new(&[]);
        let mut ttl = Ttl::new(&connection, false);
        let mut context = Context::new(&mut ttl, &settings(), &capk).unwrap();

        assert_eq!(
            context.terminal_action_analysis(),
            CryptogramType::TransactionCertificate
        );

        context.tvr.transaction_exceeds_floor_limit = true;
        assert_eq!(
            context.terminal_action_analysis(),
            CryptogramType::AuthorisationRequestCryptogram
        );

        // offline only terminal
        context.config.set(tags::TERMINAL_TYPE, vec![0x23]);
        assert_eq!(
            context.terminal_action_analysis(),
            CryptogramType::ApplicationAuthenticationCryptogram
        );

        context.config.set(tags::TERMINAL_TYPE, vec![0x22]);
        context.tvr.transaction_exceeds_floor_limit = false;
        context.tvr.requested_service_not_allowed_for_card_product = true;
        assert_eq!(
            context.terminal_action_analysis(),
            CryptogramType::ApplicationAuthenticationCryptogram
        );
    }
}
