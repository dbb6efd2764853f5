//! Terminal Transport Layer: EMV card commands over a raw APDU interface.
//!
//! ref. EMV Book 1, 9 Transmission Protocols and EMV Book 3, 6 Commands

use crate::error::TransportError;
use hexplay::HexViewBuilder;
use log::{debug, trace};

pub const SW_SUCCESS: u16 = 0x9000;
pub const SW_WARNING_SELECTED_FILE_INVALIDATED: u16 = 0x6283;
pub const SW_CONDITIONS_NOT_SATISFIED: u16 = 0x6985;
pub const SW_FUNCTION_NOT_SUPPORTED: u16 = 0x6A81;
pub const SW_FILE_NOT_FOUND: u16 = 0x6A82;
pub const SW_RECORD_NOT_FOUND: u16 = 0x6A83;

/// Raw APDU exchange with a card reader. The response carries SW1 SW2 as
/// its last two bytes.
pub trait ApduInterface {
    fn send_apdu(&self, apdu: &[u8]) -> Result<Vec<u8>, TransportError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub data: Vec<u8>,
    pub sw: u16,
}

impl Response {
    pub fn is_success(&self) -> bool {
        self.sw == SW_SUCCESS
    }
}

/// Card commands used by the kernel. Each returns the response data and the status word.
pub trait Transport {
    fn select(&mut self, name: &[u8]) -> Result<Response, TransportError>;
    fn select_next(&mut self, name: &[u8]) -> Result<Response, TransportError>;
    fn get_processing_options(&mut self, data: &[u8]) -> Result<Response, TransportError>;
    fn read_record(&mut self, sfi: u8, record: u8) -> Result<Response, TransportError>;
    fn get_data(&mut self, tag: u16) -> Result<Response, TransportError>;
    fn internal_authenticate(&mut self, data: &[u8]) -> Result<Response, TransportError>;
    fn genac(&mut self, reference_control: u8, data: &[u8]) -> Result<Response, TransportError>;
}

pub fn status_description(sw: u16) -> &'static str {
    match sw {
        SW_SUCCESS => "Process completed",
        SW_WARNING_SELECTED_FILE_INVALIDATED => "Selected file invalidated",
        0x6700 => "Wrong length",
        0x6981 => "Command incompatible with file structure",
        0x6983 => "Authentication method blocked",
        0x6984 => "Referenced data invalidated",
        SW_CONDITIONS_NOT_SATISFIED => "Conditions of use not satisfied",
        SW_FUNCTION_NOT_SUPPORTED => "Function not supported",
        SW_FILE_NOT_FOUND => "File or application not found",
        SW_RECORD_NOT_FOUND => "Record not found",
        0x6D00 => "Instruction code not supported or invalid",
        0x6E00 => "Class not supported",
        _ => match sw >> 8 {
            0x61 => "Response bytes still available",
            0x62 | 0x63 => "Warning",
            0x6C => "Wrong length Le",
            _ => "Unknown status",
        },
    }
}

pub struct Ttl<'a> {
    interface: &'a dyn ApduInterface,
    censor_sensitive_fields: bool,
}

impl<'a> Ttl<'a> {
    pub fn new(interface: &'a dyn ApduInterface, censor_sensitive_fields: bool) -> Ttl<'a> {
        Ttl {
            interface,
            censor_sensitive_fields,
        }
    }

    /// Sends a case 1-4 command, following `61xx` with GET RESPONSE and
    /// re-issuing the command with the corrected Le on `6Cxx`.
    pub fn send_apdu(&self, apdu: &[u8]) -> Result<Response, TransportError> {
        let mut response_data: Vec<u8> = Vec::new();
        let mut apdu_command = apdu.to_vec();

        let sw = loop {
            if self.censor_sensitive_fields {
                debug!(
                    "Sending APDU: {:02X?}... ({} bytes)",
                    &apdu_command[..apdu_command.len().min(5)],
                    apdu_command.len()
                );
            } else {
                debug!(
                    "Sending APDU:\n{}",
                    HexViewBuilder::new(&apdu_command).finish()
                );
            }

            let apdu_response = self.interface.send_apdu(&apdu_command)?;
            if apdu_response.len() < 2 {
                return Err(TransportError::ShortResponse(apdu_response.len()));
            }

            let (data, trailer) = apdu_response.split_at(apdu_response.len() - 2);
            response_data.extend_from_slice(data);
            let sw = u16::from_be_bytes([trailer[0], trailer[1]]);

            debug!("APDU response status: {:04X} - {}", sw, status_description(sw));

            const SW1_BYTES_AVAILABLE: u8 = 0x61;
            const SW1_WRONG_LENGTH: u8 = 0x6C;

            match trailer[0] {
                SW1_BYTES_AVAILABLE => {
                    // 00 means 256 or more bytes, query the maximum
                    let available_data_length = trailer[1];
                    apdu_command = vec![0x00, 0xC0, 0x00, 0x00, available_data_length];
                }
                SW1_WRONG_LENGTH if trailer[1] != 0x00 => {
                    trace!("Re-issuing command with Le {:02X}", trailer[1]);
                    apdu_command = apdu.to_vec();
                    match apdu_command.len() {
                        4 => apdu_command.push(trailer[1]),
                        n => apdu_command[n - 1] = trailer[1],
                    }
                }
                _ => break sw,
            }
        };

        if self.censor_sensitive_fields {
            debug!("APDU response({} bytes)", response_data.len());
        } else {
            debug!(
                "APDU response({} bytes):\n{}",
                response_data.len(),
                HexViewBuilder::new(&response_data).finish()
            );
        }

        Ok(Response {
            data: response_data,
            sw,
        })
    }

    //ref. EMV Book 1, 11.3.2 Command message
    fn select_command(name: &[u8], p2_selection_options: u8) -> Vec<u8> {
        let p1_reference_control_parameter: u8 = 0b0000_0100; // "Select by name"

        let mut select_command = vec![
            0x00,
            0xA4,
            p1_reference_control_parameter,
            p2_selection_options,
        ];
        select_command.push(name.len() as u8); // lc
        select_command.extend_from_slice(name); // data
        select_command.push(0x00); // le
        select_command
    }

    fn case_4_command(header: [u8; 4], data: &[u8]) -> Vec<u8> {
        let mut command = header.to_vec();
        command.push(data.len() as u8);
        command.extend_from_slice(data);
        command.push(0x00);
        command
    }
}

impl Transport for Ttl<'_> {
    fn select(&mut self, name: &[u8]) -> Result<Response, TransportError> {
        self.send_apdu(&Ttl::select_command(name, 0b0000_0000)) // "First or only occurrence"
    }

    fn select_next(&mut self, name: &[u8]) -> Result<Response, TransportError> {
        self.send_apdu(&Ttl::select_command(name, 0b0000_0010)) // "Next occurrence"
    }

    //ref. EMV Book 3, 6.5.8 GET PROCESSING OPTIONS Command-Response APDUs
    fn get_processing_options(&mut self, data: &[u8]) -> Result<Response, TransportError> {
        self.send_apdu(&Ttl::case_4_command([0x80, 0xA8, 0x00, 0x00], data))
    }

    //ref. EMV Book 3, 6.5.11 READ RECORD Command-Response APDUs
    fn read_record(&mut self, sfi: u8, record: u8) -> Result<Response, TransportError> {
        let p2_reference_control = (sfi << 3) | 0b0000_0100; // "P1 is a record number"
        self.send_apdu(&[0x00, 0xB2, record, p2_reference_control, 0x00])
    }

    //ref. EMV Book 3, 6.5.7 GET DATA Command-Response APDUs
    fn get_data(&mut self, tag: u16) -> Result<Response, TransportError> {
        let [p1, p2] = tag.to_be_bytes();
        self.send_apdu(&[0x80, 0xCA, p1, p2, 0x00])
    }

    //ref. EMV Book 3, 6.5.9 INTERNAL AUTHENTICATE Command-Response APDUs
    fn internal_authenticate(&mut self, data: &[u8]) -> Result<Response, TransportError> {
        self.send_apdu(&Ttl::case_4_command([0x00, 0x88, 0x00, 0x00], data))
    }

    //ref. EMV Book 3, 6.5.5 GENERATE APPLICATION CRYPTOGRAM Command-Response APDUs
    fn genac(&mut self, reference_control: u8, data: &[u8]) -> Result<Response, TransportError> {
        self.send_apdu(&Ttl::case_4_command([0x80, 0xAE, reference_control, 0x00], data))
    }
}
