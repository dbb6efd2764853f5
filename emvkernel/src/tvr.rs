use serde::{Deserialize, Serialize};

// EMV Book 3, C5 Terminal Verification Results (TVR)
#[derive(Serialize, Deserialize, Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct TerminalVerificationResults {
    //TVR byte 1
    pub offline_data_authentication_was_not_performed: bool,
    pub sda_failed: bool,
    pub icc_data_missing: bool,
    pub card_appears_on_terminal_exception_file: bool,
    pub dda_failed: bool,
    pub cda_failed: bool,
    pub sda_selected: bool,
    pub xda_selected: bool,

    // TVR byte 2
    pub icc_and_terminal_have_different_application_versions: bool,
    pub expired_application: bool,
    pub application_not_yet_effective: bool,
    pub requested_service_not_allowed_for_card_product: bool,
    pub new_card: bool,
    //RFU
    //RFU
    //RFU

    //TVR byte 3 is left zero, CVM processing is not part of the kernel

    //TVR byte 4
    pub transaction_exceeds_floor_limit: bool,
    pub lower_consecutive_offline_limit_exceeded: bool,
    pub upper_consecutive_offline_limit_exceeded: bool,
    pub transaction_selected_randomly_for_online_processing: bool,
    pub merchant_forced_transaction_online: bool,
    //RFU
    //RFU
    //RFU

    //TVR byte 5
    pub default_tdol_used: bool,
    pub issuer_authentication_failed: bool,
    pub script_processing_failed_before_final_generate_ac: bool,
    pub script_processing_failed_after_final_generate_ac: bool,
    //RFU
    //RFU
    //RFU
    //RFU
}

impl TerminalVerificationResults {
    /// True when any TVR bit is also set in the issuer or terminal action code.
    pub fn action_code_matches(&self, iac: &[u8], tac: &[u8]) -> bool {
        let tvr: Vec<u8> = (*self).into();

        tvr.iter().enumerate().any(|(i, b)| {
            let iac = iac.get(i).copied().unwrap_or(0);
            let tac = tac.get(i).copied().unwrap_or(0);
            b & (iac | tac) != 0
        })
    }
}

impl From<&[u8]> for TerminalVerificationResults {
    fn from(data: &[u8]) -> Self {
        let byte = |i: usize| data.get(i).copied().unwrap_or(0);
        let (b1, b2, b4, b5) = (byte(0), byte(1), byte(3), byte(4));

        TerminalVerificationResults {
            offline_data_authentication_was_not_performed: get_bit!(b1, 7),
            sda_failed: get_bit!(b1, 6),
            icc_data_missing: get_bit!(b1, 5),
            card_appears_on_terminal_exception_file: get_bit!(b1, 4),
            dda_failed: get_bit!(b1, 3),
            cda_failed: get_bit!(b1, 2),
            sda_selected: get_bit!(b1, 1),
            xda_selected: get_bit!(b1, 0),
            icc_and_terminal_have_different_application_versions: get_bit!(b2, 7),
            expired_application: get_bit!(b2, 6),
            application_not_yet_effective: get_bit!(b2, 5),
            requested_service_not_allowed_for_card_product: get_bit!(b2, 4),
            new_card: get_bit!(b2, 3),
            transaction_exceeds_floor_limit: get_bit!(b4, 7),
            lower_consecutive_offline_limit_exceeded: get_bit!(b4, 6),
            upper_consecutive_offline_limit_exceeded: get_bit!(b4, 5),
            transaction_selected_randomly_for_online_processing: get_bit!(b4, 4),
            merchant_forced_transaction_online: get_bit!(b4, 3),
            default_tdol_used: get_bit!(b5, 7),
            issuer_authentication_failed: get_bit!(b5, 6),
            script_processing_failed_before_final_generate_ac: get_bit!(b5, 5),
            script_processing_failed_after_final_generate_ac: get_bit!(b5, 4),
        }
    }
}

impl From<TerminalVerificationResults> for Vec<u8> {
    fn from(tvr: TerminalVerificationResults) -> Self {
        let mut b1: u8 = 0b0000_0000;
        let mut b2: u8 = 0b0000_0000;
        let b3: u8 = 0b0000_0000;
        let mut b4: u8 = 0b0000_0000;
        let mut b5: u8 = 0b0000_0000;

        set_bit!(b1, 7, tvr.offline_data_authentication_was_not_performed);
        set_bit!(b1, 6, tvr.sda_failed);
        set_bit!(b1, 5, tvr.icc_data_missing);
        set_bit!(b1, 4, tvr.card_appears_on_terminal_exception_file);
        set_bit!(b1, 3, tvr.dda_failed);
        set_bit!(b1, 2, tvr.cda_failed);
        set_bit!(b1, 1, tvr.sda_selected);
        set_bit!(b1, 0, tvr.xda_selected);

        set_bit!(
            b2,
            7,
            tvr.icc_and_terminal_have_different_application_versions
        );
        set_bit!(b2, 6, tvr.expired_application);
        set_bit!(b2, 5, tvr.application_not_yet_effective);
        set_bit!(b2, 4, tvr.requested_service_not_allowed_for_card_product);
        set_bit!(b2, 3, tvr.new_card);

        set_bit!(b4, 7, tvr.transaction_exceeds_floor_limit);
        set_bit!(b4, 6, tvr.lower_consecutive_offline_limit_exceeded);
        set_bit!(b4, 5, tvr.upper_consecutive_offline_limit_exceeded);
        set_bit!(
            b4,
            4,
            tvr.transaction_selected_randomly_for_online_processing
        );
        set_bit!(b4, 3, tvr.merchant_forced_transaction_online);

        set_bit!(b5, 7, tvr.default_tdol_used);
        set_bit!(b5, 6, tvr.issuer_authentication_failed);
        set_bit!(b5, 5, tvr.script_processing_failed_before_final_generate_ac);
        set_bit!(b5, 4, tvr.script_processing_failed_after_final_generate_ac);

        vec![b1, b2, b3, b4, b5]
    }
}

// EMV Book 3, C6 Transaction Status Information (TSI)
#[derive(Serialize, Deserialize, Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct TransactionStatusInformation {
    //TSI byte 1
    pub offline_data_authentication_was_performed: bool,
    pub cardholder_verification_was_performed: bool,
    pub card_risk_management_was_performed: bool,
    pub issuer_authentication_was_performed: bool,
    pub terminal_risk_management_was_performed: bool,
    pub script_processing_was_performed: bool,
    //RFU
    //RFU

    //TSI byte 2 - RFU
}

impl From<TransactionStatusInformation> for Vec<u8> {
    fn from(tsi: TransactionStatusInformation) -> Self {
        let mut b1: u8 = 0b0000_0000;
        let b2: u8 = 0b0000_0000;

        set_bit!(b1, 7, tsi.offline_data_authentication_was_performed);
        set_bit!(b1, 6, tsi.cardholder_verification_was_performed);
        set_bit!(b1, 5, tsi.card_risk_management_was_performed);
        set_bit!(b1, 4, tsi.issuer_authentication_was_performed);
        set_bit!(b1, 3, tsi.terminal_risk_management_was_performed);
        set_bit!(b1, 2, tsi.script_processing_was_performed);

        vec![b1, b2]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tvr_bits() {
        let mut tvr = TerminalVerificationResults::default();
        tvr.sda_selected = true;
        tvr.sda_failed = true;
        tvr.transaction_exceeds_floor_limit = true;
        tvr.new_card = true;

        let bytes: Vec<u8> = tvr.into();
        assert_eq!(bytes, vec![0x42, 0x08, 0x00, 0x80, 0x00]);
        assert_eq!(TerminalVerificationResults::from(&bytes[..]), tvr);
    }

    #[test]
    fn test_action_code_matches() {
        let mut tvr = TerminalVerificationResults::default();
        tvr.transaction_exceeds_floor_limit = true;

        assert!(tvr.action_code_matches(&[0, 0, 0, 0x80, 0], &[0; 5]));
        assert!(tvr.action_code_matches(&[0; 5], &[0, 0, 0, 0x80, 0]));
        assert!(!tvr.action_code_matches(&[0xFF, 0xFF, 0xFF, 0x7F, 0xFF], &[0; 5]));
    }

    #[test]
    fn test_tsi_bits() {
        let tsi = TransactionStatusInformation {
            offline_data_authentication_was_performed: true,
            terminal_risk_management_was_performed: true,
            ..Default::default()
        };

        let bytes: Vec<u8> = tsi.into();
        assert_eq!(bytes, vec![0x88, 0x00]);
    }
}
