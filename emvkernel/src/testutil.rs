//! Test doubles shared by the unit tests: a scripted card, logging setup
//! and a throwaway certificate hierarchy.

use crate::error::TransportError;
use crate::rsa::RsaPublicKey;
use crate::ttl::ApduInterface;
use log::{warn, LevelFilter};
use log4rs::{
    append::console::ConsoleAppender,
    config::{Appender, Root},
};
use openssl::bn::BigNum;
use openssl::pkey::Private;
use openssl::rsa::{Padding, Rsa};
use openssl::sha;
use std::cell::RefCell;
use std::sync::Once;

static LOGGING: Once = Once::new();

pub fn init_logging() {
    LOGGING.call_once(|| {
        let stdout: ConsoleAppender = ConsoleAppender::builder().build();
        let config = log4rs::config::Config::builder()
            .appender(Appender::builder().build("stdout", Box::new(stdout)))
            .build(Root::builder().appender("stdout").build(LevelFilter::Trace))
            .unwrap();
        log4rs::init_config(config).unwrap();
    });
}

fn to_raw_vec(s: &str) -> Vec<u8> {
    hex::decode(s.replace(' ', "")).unwrap()
}

struct ApduRequestResponse {
    req: Vec<u8>,
    res: Vec<u8>,
    used: bool,
}

/// Card answering from a script of request/response pairs. Each pair
/// answers once, so a repeated command gets the next matching response.
/// Unscripted commands get `6A82`.
pub struct DummySmartCardConnection {
    script: RefCell<Vec<ApduRequestResponse>>,
    log: RefCell<Vec<Vec<u8>>>,
}

impl DummySmartCardConnection {
    pub fn new(script: &[(&str, &str)]) -> DummySmartCardConnection {
        DummySmartCardConnection {
            script: RefCell::new(
                script
                    .iter()
                    .map(|(req, res)| ApduRequestResponse {
                        req: to_raw_vec(req),
                        res: to_raw_vec(res),
                        used: false,
                    })
                    .collect(),
            ),
            log: RefCell::new(Vec::new()),
        }
    }

    pub fn push(&self, req: &[u8], res: &[u8]) {
        self.script.borrow_mut().push(ApduRequestResponse {
            req: req.to_vec(),
            res: res.to_vec(),
            used: false,
        });
    }

    pub fn is_exhausted(&self) -> bool {
        self.script.borrow().iter().all(|r| r.used)
    }

    /// Commands received so far.
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.log.borrow().clone()
    }
}

impl ApduInterface for DummySmartCardConnection {
    fn send_apdu(&self, apdu: &[u8]) -> Result<Vec<u8>, TransportError> {
        self.log.borrow_mut().push(apdu.to_vec());

        let mut script = self.script.borrow_mut();
        match script.iter_mut().find(|r| !r.used && r.req == apdu) {
            Some(entry) => {
                entry.used = true;
                Ok(entry.res.clone())
            }
            None => {
                warn!("Unscripted APDU {:02X?}", apdu);
                Ok(vec![0x6A, 0x82]) // file not found error
            }
        }
    }
}

/// Interface that fails every exchange.
pub struct BrokenConnection;

impl ApduInterface for BrokenConnection {
    fn send_apdu(&self, _apdu: &[u8]) -> Result<Vec<u8>, TransportError> {
        Err(TransportError::Interface("card removed".to_string()))
    }
}

pub fn public_key(private_key: &Rsa<Private>) -> RsaPublicKey {
    RsaPublicKey::new(&private_key.n().to_vec(), &private_key.e().to_vec())
}

fn generate_key(bits: u32) -> Rsa<Private> {
    Rsa::generate_with_e(bits, &BigNum::from_u32(3).unwrap()).unwrap()
}

/// Fills in hash and trailer of an EMV signature plaintext: SHA-1 over
/// the format byte up to the hash, followed by `extra`.
fn seal(plaintext: &mut [u8], extra: &[&[u8]]) {
    let n = plaintext.len();
    let mut hasher = sha::Sha1::new();
    hasher.update(&plaintext[1..n - 21]);
    for input in extra {
        hasher.update(input);
    }
    plaintext[n - 21..n - 1].copy_from_slice(&hasher.finish());
    plaintext[n - 1] = 0xBC;
}

fn sign(private_key: &Rsa<Private>, plaintext: &[u8]) -> Vec<u8> {
    let mut encrypt_output = vec![0u8; private_key.size() as usize];
    let length = private_key
        .private_encrypt(plaintext, &mut encrypt_output, Padding::NONE)
        .unwrap();
    encrypt_output.truncate(length);
    encrypt_output
}

/// Signed Dynamic Application Data as a card would compute it.
pub fn sign_dynamic_data(
    icc_private_key: &Rsa<Private>,
    dynamic_data: &[u8],
    terminal_dynamic_data: &[u8],
) -> Vec<u8> {
    let n = icc_private_key.size() as usize;
    let mut plaintext = vec![0xBBu8; n];
    plaintext[0] = 0x6A;
    plaintext[1] = 0x05;
    plaintext[2] = 0x01;
    plaintext[3] = dynamic_data.len() as u8;
    plaintext[4..4 + dynamic_data.len()].copy_from_slice(dynamic_data);
    seal(&mut plaintext, &[terminal_dynamic_data]);

    sign(icc_private_key, &plaintext)
}

/// CA (1024 bit) and issuer (896 bit) keys, both with exponent 3. The
/// issuer key does not fit in its certificate and has a remainder.
pub struct TestPki {
    pub ca_private: Rsa<Private>,
    pub ca_key: RsaPublicKey,
    pub issuer_private: Rsa<Private>,
    pub issuer_key: RsaPublicKey,
    pub issuer_remainder: Vec<u8>,
}

impl TestPki {
    pub fn generate() -> TestPki {
        let ca_private = generate_key(1024);
        let issuer_private = generate_key(896);
        let ca_key = public_key(&ca_private);
        let issuer_key = public_key(&issuer_private);
        let issuer_remainder = issuer_key.modulus[ca_key.modulus.len() - 36..].to_vec();

        TestPki {
            ca_private,
            ca_key,
            issuer_private,
            issuer_key,
            issuer_remainder,
        }
    }

    pub fn issuer_certificate(&self, issuer_identifier: &[u8], expiry: &[u8]) -> Vec<u8> {
        self.issuer_certificate_with(issuer_identifier, expiry, |_| ())
    }

    /// Issuer certificate whose plaintext is modified by `tamper` after the hash is computed.
    pub fn issuer_certificate_with(
        &self,
        issuer_identifier: &[u8],
        expiry: &[u8],
        tamper: impl FnOnce(&mut Vec<u8>),
    ) -> Vec<u8> {
        let n_ca = self.ca_key.modulus.len();
        let n_i = self.issuer_key.modulus.len();

        let mut plaintext = vec![0u8; n_ca];
        plaintext[0] = 0x6A;
        plaintext[1] = 0x02;
        plaintext[2..6].copy_from_slice(issuer_identifier);
        plaintext[6..8].copy_from_slice(expiry);
        plaintext[8..11].copy_from_slice(&[0x00, 0x00, 0x01]);
        plaintext[11] = 0x01;
        plaintext[12] = 0x01;
        plaintext[13] = n_i as u8;
        plaintext[14] = 0x01;
        plaintext[15..n_ca - 21].copy_from_slice(&self.issuer_key.modulus[..n_ca - 36]);
        seal(&mut plaintext, &[&self.issuer_remainder[..], &[0x03u8][..]]);

        tamper(&mut plaintext);

        sign(&self.ca_private, &plaintext)
    }

    pub fn signed_static_data(
        &self,
        data_authentication_code: &[u8],
        static_data: &[u8],
    ) -> Vec<u8> {
        let n_i = self.issuer_key.modulus.len();

        let mut plaintext = vec![0xBBu8; n_i];
        plaintext[0] = 0x6A;
        plaintext[1] = 0x03;
        plaintext[2] = 0x01;
        plaintext[3..5].copy_from_slice(data_authentication_code);
        seal(&mut plaintext, &[static_data]);

        sign(&self.issuer_private, &plaintext)
    }

    /// ICC certificate for a fresh 512 bit ICC key, which fits without a remainder.
    pub fn icc_certificate(
        &self,
        pan: &[u8],
        expiry: &[u8],
        static_data: &[u8],
    ) -> (Vec<u8>, Rsa<Private>) {
        let icc_private = generate_key(512);
        let icc_key = public_key(&icc_private);
        let n_i = self.issuer_key.modulus.len();

        let mut plaintext = vec![0xBBu8; n_i];
        plaintext[0] = 0x6A;
        plaintext[1] = 0x04;
        plaintext[2..12].fill(0xFF);
        plaintext[2..2 + pan.len()].copy_from_slice(pan);
        plaintext[12..14].copy_from_slice(expiry);
        plaintext[14..17].copy_from_slice(&[0x00, 0x00, 0x02]);
        plaintext[17] = 0x01;
        plaintext[18] = 0x01;
        plaintext[19] = icc_key.modulus.len() as u8;
        plaintext[20] = 0x01;
        plaintext[21..21 + icc_key.modulus.len()].copy_from_slice(&icc_key.modulus);
        seal(&mut plaintext, &[&[0x03u8][..], static_data]);

        (sign(&self.issuer_private, &plaintext), icc_private)
    }
}
