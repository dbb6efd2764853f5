//! EMV data element tags used by the kernel, with the metadata the kernel
//! needs for DOL formatting and log censoring.
//!
//! ref. EMV Book 3, Annex A1 Data Elements Dictionary

pub const APPLICATION_TEMPLATE: u32 = 0x61;
pub const FCI_TEMPLATE: u32 = 0x6F;
pub const RECORD_TEMPLATE: u32 = 0x70;
pub const RESPONSE_FORMAT_2: u32 = 0x77;
pub const RESPONSE_FORMAT_1: u32 = 0x80;
pub const COMMAND_TEMPLATE: u32 = 0x83;

pub const AID: u32 = 0x4F;
pub const APPLICATION_LABEL: u32 = 0x50;
pub const PAN: u32 = 0x5A;
pub const AIP: u32 = 0x82;
pub const DF_NAME: u32 = 0x84;
pub const APPLICATION_PRIORITY_INDICATOR: u32 = 0x87;
pub const SFI: u32 = 0x88;
pub const CDOL1: u32 = 0x8C;
pub const CDOL2: u32 = 0x8D;
pub const CAPK_INDEX: u32 = 0x8F;
pub const ISSUER_PK_CERTIFICATE: u32 = 0x90;
pub const ISSUER_PK_REMAINDER: u32 = 0x92;
pub const SIGNED_STATIC_APPLICATION_DATA: u32 = 0x93;
pub const AFL: u32 = 0x94;
pub const TVR: u32 = 0x95;
pub const TRANSACTION_DATE: u32 = 0x9A;
pub const TSI: u32 = 0x9B;
pub const TRANSACTION_TYPE: u32 = 0x9C;

pub const LANGUAGE_PREFERENCE: u32 = 0x5F2D;
pub const APPLICATION_EXPIRATION_DATE: u32 = 0x5F24;
pub const APPLICATION_EFFECTIVE_DATE: u32 = 0x5F25;
pub const ISSUER_COUNTRY_CODE: u32 = 0x5F28;
pub const TRANSACTION_CURRENCY_CODE: u32 = 0x5F2A;
pub const PAN_SEQUENCE_NUMBER: u32 = 0x5F34;

pub const AMOUNT_AUTHORISED: u32 = 0x9F02;
pub const AMOUNT_OTHER: u32 = 0x9F03;
pub const TERMINAL_AID: u32 = 0x9F06;
pub const APPLICATION_USAGE_CONTROL: u32 = 0x9F07;
pub const ICC_APPLICATION_VERSION: u32 = 0x9F08;
pub const TERMINAL_APPLICATION_VERSION: u32 = 0x9F09;
pub const IAC_DEFAULT: u32 = 0x9F0D;
pub const IAC_DENIAL: u32 = 0x9F0E;
pub const IAC_ONLINE: u32 = 0x9F0F;
pub const ISSUER_APPLICATION_DATA: u32 = 0x9F10;
pub const APPLICATION_PREFERRED_NAME: u32 = 0x9F12;
pub const LAST_ONLINE_ATC: u32 = 0x9F13;
pub const LOWER_CONSECUTIVE_OFFLINE_LIMIT: u32 = 0x9F14;
pub const TERMINAL_COUNTRY_CODE: u32 = 0x9F1A;
pub const TERMINAL_FLOOR_LIMIT: u32 = 0x9F1B;
pub const TRANSACTION_TIME: u32 = 0x9F21;
pub const UPPER_CONSECUTIVE_OFFLINE_LIMIT: u32 = 0x9F23;
pub const APPLICATION_CRYPTOGRAM: u32 = 0x9F26;
pub const CRYPTOGRAM_INFORMATION_DATA: u32 = 0x9F27;
pub const ISSUER_PK_EXPONENT: u32 = 0x9F32;
pub const TERMINAL_CAPABILITIES: u32 = 0x9F33;
pub const TERMINAL_TYPE: u32 = 0x9F35;
pub const ATC: u32 = 0x9F36;
pub const UNPREDICTABLE_NUMBER: u32 = 0x9F37;
pub const PDOL: u32 = 0x9F38;
pub const POS_ENTRY_MODE: u32 = 0x9F39;
pub const ADDITIONAL_TERMINAL_CAPABILITIES: u32 = 0x9F40;
pub const DATA_AUTHENTICATION_CODE: u32 = 0x9F45;
pub const ICC_PK_CERTIFICATE: u32 = 0x9F46;
pub const ICC_PK_EXPONENT: u32 = 0x9F47;
pub const ICC_PK_REMAINDER: u32 = 0x9F48;
pub const DDOL: u32 = 0x9F49;
pub const SDA_TAG_LIST: u32 = 0x9F4A;
pub const SIGNED_DYNAMIC_APPLICATION_DATA: u32 = 0x9F4B;
pub const ICC_DYNAMIC_NUMBER: u32 = 0x9F4C;

pub const FCI_PROPRIETARY_TEMPLATE: u32 = 0xA5;
pub const FCI_ISSUER_DISCRETIONARY_DATA: u32 = 0xBF0C;

// Kernel proprietary configuration, private class. EMV defines these
// values without assigning a tag.
pub const DEFAULT_DDOL: u32 = 0xDF01;
pub const RANDOM_SELECTION_THRESHOLD: u32 = 0xDF02;
pub const RANDOM_SELECTION_TARGET_PERCENTAGE: u32 = 0xDF03;
pub const RANDOM_SELECTION_MAX_TARGET_PERCENTAGE: u32 = 0xDF04;
pub const TAC_DEFAULT: u32 = 0xDF05;
pub const TAC_DENIAL: u32 = 0xDF06;
pub const TAC_ONLINE: u32 = 0xDF07;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FieldFormat {
    /// n: BCD, right justified, left padded with zero
    Numeric,
    /// cn: BCD, left justified, right padded with 'F'
    CompressedNumeric,
    Alphanumeric,
    Binary,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FieldSensitivity {
    Public,
    PrimaryAccountNumber,
    Sensitive,
}

#[derive(Debug, Copy, Clone)]
pub struct EmvTag {
    pub tag: u32,
    pub name: &'static str,
    pub format: FieldFormat,
    pub sensitivity: FieldSensitivity,
}

macro_rules! emv_tag {
    ($tag:expr, $name:expr, $format:ident) => {
        EmvTag {
            tag: $tag,
            name: $name,
            format: FieldFormat::$format,
            sensitivity: FieldSensitivity::Public,
        }
    };
    ($tag:expr, $name:expr, $format:ident, $sensitivity:ident) => {
        EmvTag {
            tag: $tag,
            name: $name,
            format: FieldFormat::$format,
            sensitivity: FieldSensitivity::$sensitivity,
        }
    };
}

static EMV_TAGS: &[EmvTag] = &[
    emv_tag!(AID, "Application Identifier (AID) - card", Binary),
    emv_tag!(APPLICATION_LABEL, "Application Label", Alphanumeric),
    emv_tag!(0x57, "Track 2 Equivalent Data", Binary, Sensitive),
    emv_tag!(PAN, "Application Primary Account Number (PAN)", CompressedNumeric, PrimaryAccountNumber),
    emv_tag!(0x5F20, "Cardholder Name", Alphanumeric, Sensitive),
    emv_tag!(APPLICATION_EXPIRATION_DATE, "Application Expiration Date", Numeric),
    emv_tag!(APPLICATION_EFFECTIVE_DATE, "Application Effective Date", Numeric),
    emv_tag!(ISSUER_COUNTRY_CODE, "Issuer Country Code", Numeric),
    emv_tag!(TRANSACTION_CURRENCY_CODE, "Transaction Currency Code", Numeric),
    emv_tag!(LANGUAGE_PREFERENCE, "Language Preference", Alphanumeric),
    emv_tag!(0x5F30, "Service Code", Numeric),
    emv_tag!(PAN_SEQUENCE_NUMBER, "Application PAN Sequence Number", Numeric),
    emv_tag!(0x5F36, "Transaction Currency Exponent", Numeric),
    emv_tag!(AIP, "Application Interchange Profile", Binary),
    emv_tag!(DF_NAME, "Dedicated File (DF) Name", Binary),
    emv_tag!(APPLICATION_PRIORITY_INDICATOR, "Application Priority Indicator", Binary),
    emv_tag!(SFI, "Short File Identifier (SFI)", Binary),
    emv_tag!(0x8A, "Authorisation Response Code", Alphanumeric),
    emv_tag!(CDOL1, "Card Risk Management Data Object List 1 (CDOL1)", Binary),
    emv_tag!(CDOL2, "Card Risk Management Data Object List 2 (CDOL2)", Binary),
    emv_tag!(0x8E, "Cardholder Verification Method (CVM) List", Binary),
    emv_tag!(CAPK_INDEX, "Certification Authority Public Key Index", Binary),
    emv_tag!(ISSUER_PK_CERTIFICATE, "Issuer Public Key Certificate", Binary),
    emv_tag!(ISSUER_PK_REMAINDER, "Issuer Public Key Remainder", Binary),
    emv_tag!(SIGNED_STATIC_APPLICATION_DATA, "Signed Static Application Data", Binary),
    emv_tag!(AFL, "Application File Locator (AFL)", Binary),
    emv_tag!(TVR, "Terminal Verification Results", Binary),
    emv_tag!(TRANSACTION_DATE, "Transaction Date", Numeric),
    emv_tag!(TSI, "Transaction Status Information", Binary),
    emv_tag!(TRANSACTION_TYPE, "Transaction Type", Numeric),
    emv_tag!(0x9F01, "Acquirer Identifier", Numeric),
    emv_tag!(AMOUNT_AUTHORISED, "Amount, Authorised (Numeric)", Numeric),
    emv_tag!(AMOUNT_OTHER, "Amount, Other (Numeric)", Numeric),
    emv_tag!(TERMINAL_AID, "Application Identifier (AID) - terminal", Binary),
    emv_tag!(APPLICATION_USAGE_CONTROL, "Application Usage Control", Binary),
    emv_tag!(ICC_APPLICATION_VERSION, "Application Version Number - card", Binary),
    emv_tag!(TERMINAL_APPLICATION_VERSION, "Application Version Number - terminal", Binary),
    emv_tag!(IAC_DEFAULT, "Issuer Action Code - Default", Binary),
    emv_tag!(IAC_DENIAL, "Issuer Action Code - Denial", Binary),
    emv_tag!(IAC_ONLINE, "Issuer Action Code - Online", Binary),
    emv_tag!(ISSUER_APPLICATION_DATA, "Issuer Application Data", Binary),
    emv_tag!(0x9F11, "Issuer Code Table Index", Numeric),
    emv_tag!(APPLICATION_PREFERRED_NAME, "Application Preferred Name", Alphanumeric),
    emv_tag!(LAST_ONLINE_ATC, "Last Online Application Transaction Counter (ATC) Register", Binary),
    emv_tag!(LOWER_CONSECUTIVE_OFFLINE_LIMIT, "Lower Consecutive Offline Limit", Binary),
    emv_tag!(0x9F15, "Merchant Category Code", Numeric),
    emv_tag!(TERMINAL_COUNTRY_CODE, "Terminal Country Code", Numeric),
    emv_tag!(TERMINAL_FLOOR_LIMIT, "Terminal Floor Limit", Binary),
    emv_tag!(0x9F1F, "Track 1 Discretionary Data", Alphanumeric, Sensitive),
    emv_tag!(TRANSACTION_TIME, "Transaction Time", Numeric),
    emv_tag!(UPPER_CONSECUTIVE_OFFLINE_LIMIT, "Upper Consecutive Offline Limit", Binary),
    emv_tag!(APPLICATION_CRYPTOGRAM, "Application Cryptogram", Binary),
    emv_tag!(CRYPTOGRAM_INFORMATION_DATA, "Cryptogram Information Data", Binary),
    emv_tag!(ISSUER_PK_EXPONENT, "Issuer Public Key Exponent", Binary),
    emv_tag!(TERMINAL_CAPABILITIES, "Terminal Capabilities", Binary),
    emv_tag!(0x9F34, "Cardholder Verification Method (CVM) Results", Binary),
    emv_tag!(TERMINAL_TYPE, "Terminal Type", Numeric),
    emv_tag!(ATC, "Application Transaction Counter (ATC)", Binary),
    emv_tag!(UNPREDICTABLE_NUMBER, "Unpredictable Number", Binary),
    emv_tag!(PDOL, "Processing Options Data Object List (PDOL)", Binary),
    emv_tag!(POS_ENTRY_MODE, "Point-of-Service (POS) Entry Mode", Numeric),
    emv_tag!(ADDITIONAL_TERMINAL_CAPABILITIES, "Additional Terminal Capabilities", Binary),
    emv_tag!(0x9F41, "Transaction Sequence Counter", Numeric),
    emv_tag!(0x9F42, "Application Currency Code", Numeric),
    emv_tag!(0x9F44, "Application Currency Exponent", Numeric),
    emv_tag!(DATA_AUTHENTICATION_CODE, "Data Authentication Code", Binary),
    emv_tag!(ICC_PK_CERTIFICATE, "ICC Public Key Certificate", Binary),
    emv_tag!(ICC_PK_EXPONENT, "ICC Public Key Exponent", Binary),
    emv_tag!(ICC_PK_REMAINDER, "ICC Public Key Remainder", Binary),
    emv_tag!(DDOL, "Dynamic Data Authentication Data Object List (DDOL)", Binary),
    emv_tag!(SDA_TAG_LIST, "Static Data Authentication Tag List", Binary),
    emv_tag!(SIGNED_DYNAMIC_APPLICATION_DATA, "Signed Dynamic Application Data", Binary),
    emv_tag!(ICC_DYNAMIC_NUMBER, "ICC Dynamic Number", Binary),
    emv_tag!(FCI_ISSUER_DISCRETIONARY_DATA, "File Control Information (FCI) Issuer Discretionary Data", Binary),
    emv_tag!(DEFAULT_DDOL, "Default DDOL", Binary),
    emv_tag!(RANDOM_SELECTION_THRESHOLD, "Threshold Value for Biased Random Selection", Binary),
    emv_tag!(RANDOM_SELECTION_TARGET_PERCENTAGE, "Target Percentage for Random Selection", Binary),
    emv_tag!(RANDOM_SELECTION_MAX_TARGET_PERCENTAGE, "Maximum Target Percentage for Biased Random Selection", Binary),
    emv_tag!(TAC_DEFAULT, "Terminal Action Code - Default", Binary),
    emv_tag!(TAC_DENIAL, "Terminal Action Code - Denial", Binary),
    emv_tag!(TAC_ONLINE, "Terminal Action Code - Online", Binary),
];

pub fn get_emv_tag(tag: u32) -> Option<&'static EmvTag> {
    EMV_TAGS.iter().find(|t| t.tag == tag)
}

pub fn tag_name(tag: u32) -> &'static str {
    get_emv_tag(tag).map(|t| t.name).unwrap_or("Unknown tag")
}

/// Numeric ('n') data elements get special treatment when formatting DOL data.
pub fn is_numeric(tag: u32) -> bool {
    matches!(get_emv_tag(tag), Some(t) if t.format == FieldFormat::Numeric)
}

pub fn is_sensitive(tag: u32) -> bool {
    matches!(get_emv_tag(tag), Some(t) if t.sensitivity != FieldSensitivity::Public)
}
