//! LEB128 varint encode/decode helpers shared by the segment and tree
//! on-disk formats (spec §3, §4.D, §4.E).

use profilestore_core::{Error, Result};

/// Append `value` to `buf` as an unsigned LEB128 varint.
pub fn write_uvarint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Read an unsigned LEB128 varint from `buf` starting at `*pos`,
/// advancing `*pos` past it.
pub fn read_uvarint(buf: &[u8], pos: &mut usize) -> Result<u64> {
    let mut result: u64 = 0;
    let mut shift = 0;
    loop {
        let byte = *buf
            .get(*pos)
            .ok_or_else(|| Error::CorruptEntry("truncated varint".to_string()))?;
        *pos += 1;
        result |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift >= 64 {
            return Err(Error::CorruptEntry("varint too long".to_string()));
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn round_trips_small_values() {
        for v in [0u64, 1, 127, 128, 16384, u64::MAX] {
            let mut buf = Vec::new();
            write_uvarint(&mut buf, v);
            let mut pos = 0;
            assert_eq!(read_uvarint(&buf, &mut pos).unwrap(), v);
            assert_eq!(pos, buf.len());
        }
    }

    #[test]
    fn truncated_buffer_is_corrupt_entry() {
        let mut buf = Vec::new();
        write_uvarint(&mut buf, 1_000_000_000);
        buf.truncate(1);
        let mut pos = 0;
        assert!(read_uvarint(&buf, &mut pos).is_err());
    }

    proptest! {
        #[test]
        fn round_trips_arbitrary_u64(v: u64) {
            let mut buf = Vec::new();
            write_uvarint(&mut buf, v);
            let mut pos = 0;
            prop_assert_eq!(read_uvarint(&buf, &mut pos).unwrap(), v);
            prop_assert_eq!(pos, buf.len());
        }
    }
}
