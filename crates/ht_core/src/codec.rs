//! Binary codec primitives for the namespace protocol.
//!
//! Fixed-width integers are little-endian. Variable-length integers are
//! 7-bits-per-byte with high-bit continuation, least-significant group
//! first. Strings are vint-length-prefixed UTF-8; raw byte blobs carry a
//! u32 length prefix. Decoders take a shared offset cursor and never read
//! past `data.len()`.

use crate::error::{ErrorCode, Exception, Result};

/// Longest legal vint encoding for a u64 (ceil(64 / 7)).
const MAX_VINT_BYTES: usize = 10;

fn overrun(what: &str) -> Exception {
    Exception::new(
        ErrorCode::SerializationInputOverrun,
        format!("input overrun decoding {what}"),
    )
}

pub fn encode_byte(out: &mut Vec<u8>, val: u8) {
    out.push(val);
}

pub fn decode_byte(data: &[u8], offset: &mut usize) -> Result<u8> {
    let val = *data.get(*offset).ok_or_else(|| overrun("byte"))?;
    *offset += 1;
    Ok(val)
}

pub fn encode_i16(out: &mut Vec<u8>, val: u16) {
    out.extend_from_slice(&val.to_le_bytes());
}

pub fn decode_i16(data: &[u8], offset: &mut usize) -> Result<u16> {
    let end = offset.checked_add(2).filter(|end| *end <= data.len());
    let end = end.ok_or_else(|| overrun("i16"))?;
    let val = u16::from_le_bytes(data[*offset..end].try_into().unwrap());
    *offset = end;
    Ok(val)
}

pub fn encode_i32(out: &mut Vec<u8>, val: i32) {
    out.extend_from_slice(&val.to_le_bytes());
}

pub fn decode_i32(data: &[u8], offset: &mut usize) -> Result<i32> {
    let end = offset.checked_add(4).filter(|end| *end <= data.len());
    let end = end.ok_or_else(|| overrun("i32"))?;
    let val = i32::from_le_bytes(data[*offset..end].try_into().unwrap());
    *offset = end;
    Ok(val)
}

pub fn encode_i64(out: &mut Vec<u8>, val: i64) {
    out.extend_from_slice(&val.to_le_bytes());
}

pub fn decode_i64(data: &[u8], offset: &mut usize) -> Result<i64> {
    let end = offset.checked_add(8).filter(|end| *end <= data.len());
    let end = end.ok_or_else(|| overrun("i64"))?;
    let val = i64::from_le_bytes(data[*offset..end].try_into().unwrap());
    *offset = end;
    Ok(val)
}

pub fn encode_vint(out: &mut Vec<u8>, mut val: u64) {
    loop {
        let group = (val & 0x7f) as u8;
        val >>= 7;
        if val == 0 {
            out.push(group);
            return;
        }
        out.push(group | 0x80);
    }
}

pub fn decode_vint(data: &[u8], offset: &mut usize) -> Result<u64> {
    let mut val = 0u64;
    for i in 0..MAX_VINT_BYTES {
        let byte = *data
            .get(*offset + i)
            .ok_or_else(|| overrun("vint"))?;
        val |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            // The tenth byte may only carry the top single bit of a u64.
            if i == MAX_VINT_BYTES - 1 && byte > 1 {
                break;
            }
            *offset += i + 1;
            return Ok(val);
        }
    }
    Err(Exception::new(
        ErrorCode::SerializationBadVint,
        "vint continuation overflows u64",
    ))
}

pub fn encode_vstr(out: &mut Vec<u8>, val: &str) {
    encode_vint(out, val.len() as u64);
    out.extend_from_slice(val.as_bytes());
}

pub fn decode_vstr(data: &[u8], offset: &mut usize) -> Result<String> {
    let len = decode_vint(data, offset)? as usize;
    let end = offset.checked_add(len).filter(|end| *end <= data.len());
    let end = end.ok_or_else(|| overrun("vstr"))?;
    let val = std::str::from_utf8(&data[*offset..end]).map_err(|_| {
        Exception::new(ErrorCode::SerializationBadVstr, "vstr is not valid utf-8")
    })?;
    *offset = end;
    Ok(val.to_string())
}

pub fn encode_bytes32(out: &mut Vec<u8>, val: &[u8]) {
    out.extend_from_slice(&(val.len() as u32).to_le_bytes());
    out.extend_from_slice(val);
}

pub fn decode_bytes32(data: &[u8], offset: &mut usize) -> Result<Vec<u8>> {
    let len = decode_i32(data, offset)? as u32 as usize;
    let end = offset.checked_add(len).filter(|end| *end <= data.len());
    let end = end.ok_or_else(|| overrun("bytes32"))?;
    let val = data[*offset..end].to_vec();
    *offset = end;
    Ok(val)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_width_round_trip() {
        let mut buf = Vec::new();
        encode_byte(&mut buf, 0xab);
        encode_i16(&mut buf, 0x1234);
        encode_i32(&mut buf, -7);
        encode_i64(&mut buf, i64::MIN);

        let mut offset = 0;
        assert_eq!(decode_byte(&buf, &mut offset).unwrap(), 0xab);
        assert_eq!(decode_i16(&buf, &mut offset).unwrap(), 0x1234);
        assert_eq!(decode_i32(&buf, &mut offset).unwrap(), -7);
        assert_eq!(decode_i64(&buf, &mut offset).unwrap(), i64::MIN);
        assert_eq!(offset, buf.len());
    }

    #[test]
    fn fixed_width_is_little_endian() {
        let mut buf = Vec::new();
        encode_i32(&mut buf, 1);
        assert_eq!(buf, [1, 0, 0, 0]);
    }

    #[test]
    fn vint_round_trip() {
        for val in [0u64, 1, 127, 128, 300, 16_383, 16_384, u64::from(u32::MAX), u64::MAX] {
            let mut buf = Vec::new();
            encode_vint(&mut buf, val);
            let mut offset = 0;
            assert_eq!(decode_vint(&buf, &mut offset).unwrap(), val, "val={val}");
            assert_eq!(offset, buf.len());
        }
    }

    #[test]
    fn vint_single_byte_boundary() {
        let mut buf = Vec::new();
        encode_vint(&mut buf, 127);
        assert_eq!(buf, [0x7f]);
        buf.clear();
        encode_vint(&mut buf, 128);
        assert_eq!(buf, [0x80, 0x01]);
    }

    #[test]
    fn vint_rejects_unterminated_continuation() {
        let buf = [0xffu8; 11];
        let mut offset = 0;
        let err = decode_vint(&buf, &mut offset).unwrap_err();
        assert_eq!(err.code(), ErrorCode::SerializationBadVint);
    }

    #[test]
    fn vstr_round_trip() {
        let mut buf = Vec::new();
        encode_vstr(&mut buf, "/hypertable/servers");
        encode_vstr(&mut buf, "");
        let mut offset = 0;
        assert_eq!(decode_vstr(&buf, &mut offset).unwrap(), "/hypertable/servers");
        assert_eq!(decode_vstr(&buf, &mut offset).unwrap(), "");
        assert_eq!(offset, buf.len());
    }

    #[test]
    fn vstr_rejects_invalid_utf8() {
        let mut buf = Vec::new();
        encode_vint(&mut buf, 2);
        buf.extend_from_slice(&[0xff, 0xfe]);
        let mut offset = 0;
        let err = decode_vstr(&buf, &mut offset).unwrap_err();
        assert_eq!(err.code(), ErrorCode::SerializationBadVstr);
    }

    #[test]
    fn bytes32_round_trip() {
        let mut buf = Vec::new();
        encode_bytes32(&mut buf, &[0, 1, 2, 0xff]);
        let mut offset = 0;
        assert_eq!(decode_bytes32(&buf, &mut offset).unwrap(), vec![0, 1, 2, 0xff]);
        assert_eq!(offset, buf.len());
    }

    #[test]
    fn truncated_input_overruns() {
        let mut buf = Vec::new();
        encode_bytes32(&mut buf, &[1, 2, 3, 4]);
        buf.truncate(buf.len() - 1);
        let mut offset = 0;
        let err = decode_bytes32(&buf, &mut offset).unwrap_err();
        assert_eq!(err.code(), ErrorCode::SerializationInputOverrun);
    }
}
