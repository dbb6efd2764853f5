use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BcdError {
    #[error("invalid BCD digit {0:#X}")]
    InvalidDigit(u8),

    #[error("value does not fit into {0} bytes")]
    Overflow(usize),
}

const ASCII_CHARACTER_0: u8 = 0x30;

/// Decodes `n` and `cn` formatted values. A trailing `F` nibble or `FF`
/// bytes end a `cn` value.
pub fn bcd_to_ascii(bcd_data: &[u8]) -> Result<Vec<u8>, BcdError> {
    let mut ascii_output: Vec<u8> = Vec::with_capacity(bcd_data.len() * 2);

    for (i, &byte) in bcd_data.iter().enumerate() {
        if byte == 0xFF {
            break;
        }

        let n2 = byte >> 4;
        let n1 = byte & 0xF;

        if n2 > 0x9 {
            return Err(BcdError::InvalidDigit(n2));
        }
        ascii_output.push(ASCII_CHARACTER_0 + n2);

        if n1 == 0xF {
            if bcd_data[i + 1..].iter().any(|&b| b != 0xFF) {
                return Err(BcdError::InvalidDigit(n1));
            }
            break;
        }
        if n1 > 0x9 {
            return Err(BcdError::InvalidDigit(n1));
        }
        ascii_output.push(ASCII_CHARACTER_0 + n1);
    }

    Ok(ascii_output)
}

//n = 00 00 00 01 23 45
pub fn bcd_to_u64(bcd_data: &[u8]) -> Result<u64, BcdError> {
    if bcd_data.len() > 10 {
        return Err(BcdError::Overflow(10));
    }

    let mut value: u64 = 0;
    for &byte in bcd_data {
        let (n2, n1) = (byte >> 4, byte & 0xF);
        if n2 > 0x9 {
            return Err(BcdError::InvalidDigit(n2));
        }
        if n1 > 0x9 {
            return Err(BcdError::InvalidDigit(n1));
        }
        value = value
            .checked_mul(100)
            .and_then(|v| v.checked_add((n2 * 10 + n1) as u64))
            .ok_or(BcdError::Overflow(8))?;
    }

    Ok(value)
}

pub fn u64_to_bcd_n(mut value: u64, size: usize) -> Result<Vec<u8>, BcdError> {
    let mut bcd_output = vec![0u8; size];

    for byte in bcd_output.iter_mut().rev() {
        let low = (value % 10) as u8;
        value /= 10;
        let high = (value % 10) as u8;
        value /= 10;
        *byte = (high << 4) | low;
    }

    if value != 0 {
        return Err(BcdError::Overflow(size));
    }

    Ok(bcd_output)
}

//cn = 12 34 56 78 90 12 3F FF
pub fn ascii_to_bcd_cn(ascii_data: &[u8], size: usize) -> Result<Vec<u8>, BcdError> {
    if ascii_data.len() > size * 2 {
        return Err(BcdError::Overflow(size));
    }

    let mut bcd_output: Vec<u8> = Vec::with_capacity(size);

    for pair in ascii_data.chunks(2) {
        let b1 = ascii_digit(pair[0])?;
        let b2 = match pair.get(1) {
            Some(&c) => ascii_digit(c)?,
            None => 0xF,
        };
        bcd_output.push((b1 << 4) | b2);
    }

    bcd_output.resize(size, 0xFF);

    Ok(bcd_output)
}

//n = 00 00 00 01 23 45
pub fn ascii_to_bcd_n(ascii_data: &[u8], size: usize) -> Result<Vec<u8>, BcdError> {
    if ascii_data.len() > size * 2 {
        return Err(BcdError::Overflow(size));
    }

    let mut ascii_data_aligned: Vec<u8> = Vec::with_capacity(ascii_data.len() + 1);
    if ascii_data.len() % 2 == 1 {
        ascii_data_aligned.push(ASCII_CHARACTER_0);
    }
    ascii_data_aligned.extend_from_slice(ascii_data);

    let mut bcd_output = vec![0u8; size - ascii_data_aligned.len() / 2];

    for pair in ascii_data_aligned.chunks(2) {
        bcd_output.push((ascii_digit(pair[0])? << 4) | ascii_digit(pair[1])?);
    }

    Ok(bcd_output)
}

fn ascii_digit(c: u8) -> Result<u8, BcdError> {
    match c {
        b'0'..=b'9' => Ok(c - ASCII_CHARACTER_0),
        _ => Err(BcdError::InvalidDigit(c)),
    }
}

/// YYMMDD, e.g. 9A Transaction Date or 5F24 Application Expiration Date.
/// Years are in 2000..=2099.
pub fn bcd_to_date(bcd_data: &[u8]) -> Result<chrono::NaiveDate, BcdError> {
    if bcd_data.len() != 3 {
        return Err(BcdError::Overflow(3));
    }

    let year = bcd_to_u64(&bcd_data[0..1])? as i32 + 2000;
    let month = bcd_to_u64(&bcd_data[1..2])? as u32;
    let day = bcd_to_u64(&bcd_data[2..3])? as u32;

    chrono::NaiveDate::from_ymd_opt(year, month, day).ok_or(BcdError::InvalidDigit(bcd_data[2]))
}
