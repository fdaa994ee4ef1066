//! Minimal DER encoding helpers
//!
//! Used to assemble synthetic CRLs and OCSP responses for tests. Nothing
//! here signs anything; signature fields carry placeholder bytes.

pub const TAG_INTEGER: u8 = 0x02;
pub const TAG_BIT_STRING: u8 = 0x03;
pub const TAG_OCTET_STRING: u8 = 0x04;
pub const TAG_NULL: u8 = 0x05;
pub const TAG_OID: u8 = 0x06;
pub const TAG_ENUMERATED: u8 = 0x0A;
pub const TAG_UTF8_STRING: u8 = 0x0C;
pub const TAG_SEQUENCE: u8 = 0x30;
pub const TAG_SET: u8 = 0x31;
pub const TAG_UTC_TIME: u8 = 0x17;
pub const TAG_GENERALIZED_TIME: u8 = 0x18;

pub fn tlv(tag: u8, contents: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    out.extend(length(contents.len()));
    out.extend_from_slice(contents);
    out
}

pub fn length(len: usize) -> Vec<u8> {
    if len < 0x80 {
        return vec![len as u8];
    }
    let bytes: Vec<u8> = len
        .to_be_bytes()
        .iter()
        .copied()
        .skip_while(|b| *b == 0)
        .collect();
    let mut out = vec![0x80 | bytes.len() as u8];
    out.extend(bytes);
    out
}

pub fn sequence(parts: &[Vec<u8>]) -> Vec<u8> {
    tlv(TAG_SEQUENCE, &parts.concat())
}

pub fn set(parts: &[Vec<u8>]) -> Vec<u8> {
    tlv(TAG_SET, &parts.concat())
}

pub fn octet_string(contents: &[u8]) -> Vec<u8> {
    tlv(TAG_OCTET_STRING, contents)
}

pub fn bit_string(contents: &[u8]) -> Vec<u8> {
    let mut body = vec![0u8];
    body.extend_from_slice(contents);
    tlv(TAG_BIT_STRING, &body)
}

/// Encode an unsigned big-endian integer, adding a leading zero when the
/// high bit is set.
pub fn integer(value: &[u8]) -> Vec<u8> {
    let trimmed: &[u8] = {
        let first = value.iter().position(|b| *b != 0).unwrap_or(value.len().saturating_sub(1));
        &value[first..]
    };
    let mut body = Vec::with_capacity(trimmed.len() + 1);
    if trimmed.first().map_or(true, |b| b & 0x80 != 0) {
        body.push(0);
    }
    body.extend_from_slice(trimmed);
    tlv(TAG_INTEGER, &body)
}

pub fn enumerated(value: u8) -> Vec<u8> {
    tlv(TAG_ENUMERATED, &[value])
}

pub fn null() -> Vec<u8> {
    vec![TAG_NULL, 0x00]
}

pub fn utf8_string(s: &str) -> Vec<u8> {
    tlv(TAG_UTF8_STRING, s.as_bytes())
}

pub fn utc_time(s: &str) -> Vec<u8> {
    tlv(TAG_UTC_TIME, s.as_bytes())
}

pub fn generalized_time(s: &str) -> Vec<u8> {
    tlv(TAG_GENERALIZED_TIME, s.as_bytes())
}

/// Constructed context-specific tag (`[n] EXPLICIT`)
pub fn explicit(tag_number: u8, contents: &[u8]) -> Vec<u8> {
    tlv(0xA0 | tag_number, contents)
}

/// Primitive context-specific tag (`[n] IMPLICIT` over a primitive type)
pub fn implicit_primitive(tag_number: u8, contents: &[u8]) -> Vec<u8> {
    tlv(0x80 | tag_number, contents)
}

pub fn oid(components: &[u64]) -> Vec<u8> {
    let mut body = Vec::new();
    if components.len() >= 2 {
        body.extend(base128(components[0] * 40 + components[1]));
        for &c in &components[2..] {
            body.extend(base128(c));
        }
    }
    tlv(TAG_OID, &body)
}

fn base128(mut value: u64) -> Vec<u8> {
    let mut out = vec![(value & 0x7F) as u8];
    value >>= 7;
    while value > 0 {
        out.push(((value & 0x7F) as u8) | 0x80);
        value >>= 7;
    }
    out.reverse();
    out
}

/// `Name` with a single commonName RDN
pub fn common_name(cn: &str) -> Vec<u8> {
    sequence(&[set(&[sequence(&[oid(&[2, 5, 4, 3]), utf8_string(cn)])])])
}

/// sha256WithRSAEncryption AlgorithmIdentifier
pub fn sha256_rsa_algorithm() -> Vec<u8> {
    sequence(&[oid(&[1, 2, 840, 113549, 1, 1, 11]), null()])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_and_long_lengths() {
        assert_eq!(length(5), vec![5]);
        assert_eq!(length(0x80), vec![0x81, 0x80]);
        assert_eq!(length(0x0123), vec![0x82, 0x01, 0x23]);
    }

    #[test]
    fn test_integer_sign_padding() {
        assert_eq!(integer(&[0x01]), vec![0x02, 0x01, 0x01]);
        assert_eq!(integer(&[0x80]), vec![0x02, 0x02, 0x00, 0x80]);
        assert_eq!(integer(&[0x00, 0x00, 0x05]), vec![0x02, 0x01, 0x05]);
    }

    #[test]
    fn test_oid_encoding() {
        // id-pkix-ocsp-basic
        assert_eq!(
            oid(&[1, 3, 6, 1, 5, 5, 7, 48, 1, 1]),
            vec![0x06, 0x09, 0x2B, 0x06, 0x01, 0x05, 0x05, 0x07, 0x30, 0x01, 0x01]
        );
    }
}
