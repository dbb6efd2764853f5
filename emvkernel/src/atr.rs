//! Answer to Reset parsing and the EMV Level 1 contact profile check.
//!
//! ref. EMV Book 1, 8.3 Answer to Reset and ISO/IEC 7816-3, 8.2

use log::{debug, warn};
use thiserror::Error;

const MAX_ATR_LENGTH: usize = 33;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AtrError {
    #[error("ATR truncated")]
    Truncated,

    #[error("ATR longer than 33 bytes")]
    TooLong,

    #[error("{0} unexpected bytes after ATR")]
    TrailingBytes(usize),

    #[error("invalid initial character TS {0:02X}")]
    InvalidTs(u8),

    #[error("check character TCK incorrect")]
    Checksum,

    #[error("interface byte {name} value {value:02X} outside EMV profile")]
    InterfaceByte { name: &'static str, value: u8 },

    #[error("interface byte {0} mandatory for the indicated protocol")]
    MissingInterfaceByte(&'static str),

    #[error("unsupported protocol T={0}")]
    Protocol(u8),
}

/// Initial Character TS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Convention {
    Direct,
    Inverse,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceBytes {
    pub ta: Option<u8>,
    pub tb: Option<u8>,
    pub tc: Option<u8>,
    pub td: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Atr {
    pub convention: Convention,
    /// Groups TA1..TD1, TA2..TD2 and so on.
    pub interface_bytes: Vec<InterfaceBytes>,
    pub historical_bytes: Vec<u8>,
    pub tck: Option<u8>,
}

impl Atr {
    pub fn parse(atr: &[u8]) -> Result<Atr, AtrError> {
        if atr.len() > MAX_ATR_LENGTH {
            return Err(AtrError::TooLong);
        }

        let mut bytes = atr.iter().copied();
        let mut next = || bytes.next().ok_or(AtrError::Truncated);

        let convention = match next()? {
            0x3B => Convention::Direct,
            0x3F => Convention::Inverse,
            ts => return Err(AtrError::InvalidTs(ts)),
        };

        let t0 = next()?;
        let historical_length = (t0 & 0x0F) as usize;

        let mut interface_bytes = Vec::new();
        let mut indicator = t0 >> 4;
        let mut tck_required = false;
        loop {
            let mut group = InterfaceBytes::default();
            if indicator & 0b0001 != 0 {
                group.ta = Some(next()?);
            }
            if indicator & 0b0010 != 0 {
                group.tb = Some(next()?);
            }
            if indicator & 0b0100 != 0 {
                group.tc = Some(next()?);
            }
            if indicator & 0b1000 != 0 {
                group.td = Some(next()?);
            }
            interface_bytes.push(group);

            match group.td {
                Some(td) => {
                    if td & 0x0F != 0 {
                        tck_required = true;
                    }
                    indicator = td >> 4;
                }
                None => break,
            }
        }

        let mut historical_bytes = Vec::with_capacity(historical_length);
        for _ in 0..historical_length {
            historical_bytes.push(next()?);
        }

        let tck = if tck_required { Some(next()?) } else { None };

        let consumed = 2
            + interface_bytes
                .iter()
                .map(|g| [g.ta, g.tb, g.tc, g.td].iter().flatten().count())
                .sum::<usize>()
            + historical_length
            + tck.map_or(0, |_| 1);
        if consumed != atr.len() {
            return Err(AtrError::TrailingBytes(atr.len() - consumed));
        }

        if tck.is_some() && atr[1..].iter().fold(0u8, |acc, b| acc ^ b) != 0 {
            warn!("ATR check character mismatch");
            return Err(AtrError::Checksum);
        }

        Ok(Atr {
            convention,
            interface_bytes,
            historical_bytes,
            tck,
        })
    }

    fn group(&self, i: usize) -> InterfaceBytes {
        self.interface_bytes.get(i).copied().unwrap_or_default()
    }

    /// First offered transmission protocol, T=0 when TD1 is absent.
    pub fn protocol(&self) -> u8 {
        self.group(0).td.map_or(0, |td| td & 0x0F)
    }

    /// Checks the interface bytes against the basic ATR accepted by EMV terminals.
    pub fn validate_emv(&self) -> Result<(), AtrError> {
        let out_of_profile = |name: &'static str, value: u8| {
            warn!("ATR {} = {:02X} rejected", name, value);
            Err(AtrError::InterfaceByte { name, value })
        };

        let first = self.group(0);
        let second = self.group(1);
        let third = self.group(2);

        let protocol = self.protocol();
        if protocol > 1 {
            return Err(AtrError::Protocol(protocol));
        }

        if let Some(ta1) = first.ta {
            if !(0x11..=0x13).contains(&ta1) {
                return out_of_profile("TA1", ta1);
            }
        }
        if let Some(tb1) = first.tb {
            if tb1 != 0x00 {
                return out_of_profile("TB1", tb1);
            }
        }

        if let Some(ta2) = second.ta {
            if ta2 & 0x10 != 0 {
                return out_of_profile("TA2", ta2);
            }
        }
        if let Some(tb2) = second.tb {
            return out_of_profile("TB2", tb2);
        }
        if let Some(tc2) = second.tc {
            if protocol == 0 && tc2 != 0x0A {
                return out_of_profile("TC2", tc2);
            }
        }
        if let Some(td2) = second.td {
            let next_protocol = td2 & 0x0F;
            if next_protocol != 1 && !(protocol == 0 && next_protocol == 0x0E) {
                return out_of_profile("TD2", td2);
            }
        }

        let t1_offered = protocol == 1 || second.td.map_or(false, |td2| td2 & 0x0F == 1);
        if t1_offered {
            if let Some(ta3) = third.ta {
                if !(0x10..=0xFE).contains(&ta3) {
                    return out_of_profile("TA3", ta3);
                }
            }
            match third.tb {
                Some(tb3) if tb3 >> 4 > 4 || tb3 & 0x0F > 5 => return out_of_profile("TB3", tb3),
                Some(_) => (),
                None => return Err(AtrError::MissingInterfaceByte("TB3")),
            }
            if let Some(tc3) = third.tc {
                if tc3 != 0x00 {
                    return out_of_profile("TC3", tc3);
                }
            }
        }

        debug!(
            "ATR accepted: protocol T={}, {} historical bytes",
            protocol,
            self.historical_bytes.len()
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_hex(atr: &str) -> Result<Atr, AtrError> {
        Atr::parse(&hex::decode(atr).unwrap())
    }

    #[test]
    fn test_parse_t0() {
        let atr = parse_hex("3B6500002063CB6600").unwrap();
        assert_eq!(atr.convention, Convention::Direct);
        assert_eq!(atr.protocol(), 0);
        assert_eq!(atr.interface_bytes[0].tb, Some(0x00));
        assert_eq!(atr.interface_bytes[0].tc, Some(0x00));
        assert_eq!(atr.historical_bytes.len(), 5);
        assert_eq!(atr.tck, None);
        assert!(atr.validate_emv().is_ok());
    }

    #[test]
    fn test_parse_t1() {
        // TD1=81 (T=1, TD2 follows), TD2=31 (TA3, TB3, T=1), TA3=FE, TB3=45
        let mut atr = hex::decode("3B808131FE45").unwrap();
        let tck = atr[1..].iter().fold(0u8, |acc, b| acc ^ b);
        atr.push(tck);

        let parsed = Atr::parse(&atr).unwrap();
        assert_eq!(parsed.protocol(), 1);
        assert_eq!(parsed.tck, Some(tck));
        assert!(parsed.validate_emv().is_ok());

        let last = atr.len() - 1;
        atr[last] ^= 0x01;
        assert_eq!(Atr::parse(&atr), Err(AtrError::Checksum));
    }

    #[test]
    fn test_rejections() {
        assert_eq!(parse_hex("3A00"), Err(AtrError::InvalidTs(0x3A)));
        assert_eq!(parse_hex("3B65000020"), Err(AtrError::Truncated));
        assert_eq!(parse_hex("3B0000"), Err(AtrError::TrailingBytes(1)));

        // TA1 = 96 requests a higher bit rate than the basic profile
        let atr = parse_hex("3B1096").unwrap();
        assert_eq!(
            atr.validate_emv(),
            Err(AtrError::InterfaceByte {
                name: "TA1",
                value: 0x96
            })
        );

        // TB1 must indicate no programming voltage
        let atr = parse_hex("3B2025").unwrap();
        assert!(matches!(
            atr.validate_emv(),
            Err(AtrError::InterfaceByte { name: "TB1", .. })
        ));

        // TD1 = 82 offers T=2
        let atr = parse_hex("3B80820002").unwrap();
        assert!(atr.validate_emv().is_err());
    }
}
