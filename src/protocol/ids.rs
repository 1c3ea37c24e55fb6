//! 128-bit identifier encoding
//!
//! Identifiers travel as two big-endian 64-bit integers, least-significant
//! half first. The textual form is the canonical hyphenated UUID string.

use bytes::{Buf, BufMut};
use uuid::Uuid;

use super::codec::{need, CodecError};

/// Split an identifier into its `(lo, hi)` wire halves
pub fn split(id: &Uuid) -> (i64, i64) {
    let (hi, lo) = id.as_u64_pair();
    (lo as i64, hi as i64)
}

/// Rebuild an identifier from its `(lo, hi)` wire halves
pub fn join(lo: i64, hi: i64) -> Uuid {
    Uuid::from_u64_pair(hi as u64, lo as u64)
}

/// Write an identifier as two longs
pub fn put_id(buf: &mut impl BufMut, id: &Uuid) {
    let (lo, hi) = split(id);
    buf.put_i64(lo);
    buf.put_i64(hi);
}

/// Read an identifier written by [`put_id`]
pub fn get_id(buf: &mut impl Buf) -> Result<Uuid, CodecError> {
    need(buf, 16)?;
    let lo = buf.get_i64();
    let hi = buf.get_i64();
    Ok(join(lo, hi))
}

/// Write an optional identifier, the nil id standing in for `None`
pub fn put_opt_id(buf: &mut impl BufMut, id: Option<&Uuid>) {
    put_id(buf, id.unwrap_or(&Uuid::nil()));
}

/// Read an identifier written by [`put_opt_id`]
pub fn get_opt_id(buf: &mut impl Buf) -> Result<Option<Uuid>, CodecError> {
    let id = get_id(buf)?;
    Ok((!id.is_nil()).then_some(id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    /// Character offsets at which hyphens go back into a 32-digit hex id
    const HYPHEN_OFFSETS: [usize; 4] = [8, 12, 16, 20];

    #[derive(Debug, PartialEq, Eq)]
    enum IdError {
        BadLength(usize),
        BadDigit(char),
    }

    fn to_hex(id: &Uuid) -> String {
        let (lo, hi) = split(id);
        format!("{:016x}{:016x}", hi as u64, lo as u64)
    }

    /// Rebuild the `8-4-4-4-12` form by hand, as a check on the halves
    fn hyphenate(hex: &str) -> Result<String, IdError> {
        if hex.len() != 32 {
            return Err(IdError::BadLength(hex.len()));
        }
        if let Some(c) = hex.chars().find(|c| !c.is_ascii_hexdigit()) {
            return Err(IdError::BadDigit(c));
        }

        let hex = hex.to_ascii_lowercase();
        let mut out = String::with_capacity(36);
        let mut start = 0;
        for offset in HYPHEN_OFFSETS {
            out.push_str(&hex[start..offset]);
            out.push('-');
            start = offset;
        }
        out.push_str(&hex[start..]);
        Ok(out)
    }

    fn canonical_from_halves(lo: i64, hi: i64) -> String {
        hyphenate(&format!("{:016x}{:016x}", hi as u64, lo as u64)).unwrap()
    }

    #[test]
    fn test_halves_roundtrip() {
        for _ in 0..64 {
            let id = Uuid::new_v4();
            let (lo, hi) = split(&id);
            assert_eq!(join(lo, hi), id);
            assert_eq!(canonical_from_halves(lo, hi), id.hyphenated().to_string());
        }
    }

    #[test]
    fn test_extreme_values() {
        let max = Uuid::from_u128(u128::MAX);
        let (lo, hi) = split(&max);
        assert_eq!(lo, -1);
        assert_eq!(hi, -1);
        assert_eq!(canonical_from_halves(lo, hi), "ffffffff-ffff-ffff-ffff-ffffffffffff");
        assert_eq!(canonical_from_halves(0, 0), Uuid::nil().to_string());
    }

    #[test]
    fn test_hyphenate() {
        let id: Uuid = "67e55044-10b1-426f-9247-bb680e5fe0c8".parse().unwrap();
        let hex = to_hex(&id);
        assert_eq!(hex, "67e5504410b1426f9247bb680e5fe0c8");
        assert_eq!(hyphenate(&hex).unwrap(), id.to_string());
        assert_eq!(hyphenate("67E5504410B1426F9247BB680E5FE0C8").unwrap(), id.to_string());
    }

    #[test]
    fn test_hyphenate_rejects_bad_input() {
        assert_eq!(hyphenate("abc"), Err(IdError::BadLength(3)));
        assert_eq!(
            hyphenate("zze5504410b1426f9247bb680e5fe0c8"),
            Err(IdError::BadDigit('z'))
        );
    }

    #[test]
    fn test_wire_order_is_low_then_high() {
        let id = Uuid::from_u64_pair(0x0102030405060708, 0x1112131415161718);
        let mut buf = BytesMut::new();
        put_id(&mut buf, &id);
        assert_eq!(&buf[..8], &[0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18]);
        assert_eq!(&buf[8..], &[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]);

        let mut bytes = buf.freeze();
        assert_eq!(get_id(&mut bytes).unwrap(), id);
    }

    #[test]
    fn test_truncated_id() {
        let mut bytes = bytes::Bytes::from_static(&[0u8; 10]);
        assert!(matches!(get_id(&mut bytes), Err(CodecError::Incomplete)));
    }

    #[test]
    fn test_optional_id() {
        let mut buf = BytesMut::new();
        put_opt_id(&mut buf, None);
        let id = Uuid::new_v4();
        put_opt_id(&mut buf, Some(&id));

        let mut bytes = buf.freeze();
        assert_eq!(get_opt_id(&mut bytes).unwrap(), None);
        assert_eq!(get_opt_id(&mut bytes).unwrap(), Some(id));
    }
}
