//! Typed value codec for PLC memory
//!
//! Pure functions packing a [`TagValue`] into, or unpacking it from, a byte
//! buffer at `(byte_offset, bit_offset)`. Multi-byte values are big-endian;
//! bools occupy one bit of a byte; strings use the counted layout
//! `[max_len, actual_len, payload...]`.
//!
//! None of these functions panic on malformed input: every slice is bounds
//! checked and reported as [`CodecError::BufferTooSmall`].

use crate::model::{DataType, TagValue};
use thiserror::Error;

/// Ceiling for the counted string payload
pub const STRING_MAX_LEN: usize = 254;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    #[error("buffer too small: need {needed} bytes at offset {offset}, have {available}")]
    BufferTooSmall {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("unsupported data type: {0}")]
    UnsupportedType(String),

    #[error("cannot convert {from} to {to}")]
    Conversion {
        from: &'static str,
        to: &'static str,
    },

    #[error("value {value} out of range for {target}")]
    OutOfRange {
        value: String,
        target: &'static str,
    },
}

fn field(buf: &[u8], offset: usize, len: usize) -> Result<&[u8], CodecError> {
    offset
        .checked_add(len)
        .and_then(|end| buf.get(offset..end))
        .ok_or(CodecError::BufferTooSmall {
            offset,
            needed: len,
            available: buf.len().saturating_sub(offset),
        })
}

fn field_mut(buf: &mut [u8], offset: usize, len: usize) -> Result<&mut [u8], CodecError> {
    let available = buf.len().saturating_sub(offset);
    offset
        .checked_add(len)
        .and_then(|end| buf.get_mut(offset..end))
        .ok_or(CodecError::BufferTooSmall {
            offset,
            needed: len,
            available,
        })
}

fn check_bit(bit_offset: u8) -> Result<(), CodecError> {
    if bit_offset > 7 {
        return Err(CodecError::OutOfRange {
            value: bit_offset.to_string(),
            target: "bit offset",
        });
    }
    Ok(())
}

/// Extract bit `bit_offset` of `byte`
pub fn decode_bool(byte: u8, bit_offset: u8) -> bool {
    (byte >> (bit_offset & 7)) & 1 == 1
}

/// Set or clear bit `bit_offset` of `byte`, leaving the other seven untouched
pub fn encode_bool(byte: u8, bit_offset: u8, value: bool) -> u8 {
    let mask = 1u8 << (bit_offset & 7);
    if value {
        byte | mask
    } else {
        byte & !mask
    }
}

/// Decode one value of type `data_type` starting at `byte_offset`
pub fn decode(
    buf: &[u8],
    byte_offset: usize,
    bit_offset: u8,
    data_type: DataType,
) -> Result<TagValue, CodecError> {
    let value = match data_type {
        DataType::Bool => {
            check_bit(bit_offset)?;
            let b = field(buf, byte_offset, 1)?[0];
            TagValue::Bool(decode_bool(b, bit_offset))
        },
        DataType::Int8 => TagValue::Int8(i8::from_be_bytes(array(buf, byte_offset)?)),
        DataType::UInt8 => TagValue::UInt8(u8::from_be_bytes(array(buf, byte_offset)?)),
        DataType::Int16 => TagValue::Int16(i16::from_be_bytes(array(buf, byte_offset)?)),
        DataType::UInt16 => TagValue::UInt16(u16::from_be_bytes(array(buf, byte_offset)?)),
        DataType::Int32 => TagValue::Int32(i32::from_be_bytes(array(buf, byte_offset)?)),
        DataType::UInt32 => TagValue::UInt32(u32::from_be_bytes(array(buf, byte_offset)?)),
        DataType::Float32 => {
            TagValue::Float32(f32::from_bits(u32::from_be_bytes(array(buf, byte_offset)?)))
        },
        DataType::String => TagValue::String(decode_string(buf, byte_offset)?),
    };
    Ok(value)
}

fn array<const N: usize>(buf: &[u8], offset: usize) -> Result<[u8; N], CodecError> {
    let mut out = [0u8; N];
    out.copy_from_slice(field(buf, offset, N)?);
    Ok(out)
}

/// Counted string decode; a payload cut short by the buffer yields the prefix
fn decode_string(buf: &[u8], offset: usize) -> Result<String, CodecError> {
    let header = field(buf, offset, 2)?;
    let actual = usize::from(header[1]).min(STRING_MAX_LEN);
    let start = offset + 2;
    let available = buf.len().saturating_sub(start);
    let len = actual.min(available);
    let payload = field(buf, start, len)?;
    Ok(String::from_utf8_lossy(payload).into_owned())
}

/// Encode `value` into `buf` at `byte_offset`
///
/// For bools the byte already in `buf` is the base of the read-modify-write,
/// so callers must fill it with the device's current byte first.
pub fn encode(
    buf: &mut [u8],
    byte_offset: usize,
    bit_offset: u8,
    data_type: DataType,
    value: &TagValue,
) -> Result<(), CodecError> {
    if value.data_type() != data_type {
        return Err(CodecError::Conversion {
            from: value.data_type().as_str(),
            to: data_type.as_str(),
        });
    }

    match value {
        TagValue::Bool(v) => {
            check_bit(bit_offset)?;
            let slot = &mut field_mut(buf, byte_offset, 1)?[0];
            *slot = encode_bool(*slot, bit_offset, *v);
        },
        TagValue::Int8(v) => put(buf, byte_offset, &v.to_be_bytes())?,
        TagValue::UInt8(v) => put(buf, byte_offset, &v.to_be_bytes())?,
        TagValue::Int16(v) => put(buf, byte_offset, &v.to_be_bytes())?,
        TagValue::UInt16(v) => put(buf, byte_offset, &v.to_be_bytes())?,
        TagValue::Int32(v) => put(buf, byte_offset, &v.to_be_bytes())?,
        TagValue::UInt32(v) => put(buf, byte_offset, &v.to_be_bytes())?,
        TagValue::Float32(v) => put(buf, byte_offset, &v.to_bits().to_be_bytes())?,
        TagValue::String(s) => {
            let bytes = s.as_bytes();
            if bytes.len() > STRING_MAX_LEN {
                return Err(CodecError::OutOfRange {
                    value: format!("{} bytes", bytes.len()),
                    target: "string",
                });
            }
            let out = field_mut(buf, byte_offset, bytes.len() + 2)?;
            out[0] = STRING_MAX_LEN as u8;
            out[1] = bytes.len() as u8;
            out[2..].copy_from_slice(bytes);
        },
    }
    Ok(())
}

fn put(buf: &mut [u8], offset: usize, bytes: &[u8]) -> Result<(), CodecError> {
    field_mut(buf, offset, bytes.len())?.copy_from_slice(bytes);
    Ok(())
}

/// Encode a non-bool value into a freshly sized wire field
///
/// Strings produce only header plus payload, so the device keeps whatever
/// follows the actual length.
pub fn encode_field(data_type: DataType, value: &TagValue) -> Result<Vec<u8>, CodecError> {
    let len = match value {
        TagValue::String(s) => s.len().min(STRING_MAX_LEN) + 2,
        _ => data_type.wire_size(),
    };
    let mut buf = vec![0u8; len];
    encode(&mut buf, 0, 0, data_type, value)?;
    Ok(buf)
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_bool_bit_packing_preserves_other_bits() {
        for b in 0..=u8::MAX {
            for pos in 0..8u8 {
                for v in [false, true] {
                    let packed = encode_bool(b, pos, v);
                    assert_eq!(decode_bool(packed, pos), v);
                    let mask = !(1u8 << pos);
                    assert_eq!(packed & mask, b & mask, "byte {b:#04x} bit {pos}");
                }
            }
        }
    }

    #[test]
    fn test_bool_encode_read_modify_write() {
        let mut buf = [0b1010_0101u8];
        encode(&mut buf, 0, 1, DataType::Bool, &TagValue::Bool(true)).unwrap();
        assert_eq!(buf[0], 0b1010_0111);
        encode(&mut buf, 0, 7, DataType::Bool, &TagValue::Bool(false)).unwrap();
        assert_eq!(buf[0], 0b0010_0111);
        assert!(encode(&mut buf, 0, 8, DataType::Bool, &TagValue::Bool(true)).is_err());
    }

    #[test]
    fn test_numeric_round_trip() {
        let cases = [
            (DataType::Int8, TagValue::Int8(i8::MIN)),
            (DataType::UInt8, TagValue::UInt8(u8::MAX)),
            (DataType::Int16, TagValue::Int16(-12_345)),
            (DataType::UInt16, TagValue::UInt16(0xBEEF)),
            (DataType::Int32, TagValue::Int32(i32::MIN + 7)),
            (DataType::UInt32, TagValue::UInt32(0xDEAD_BEEF)),
            (DataType::Float32, TagValue::Float32(-3.402_823_5e38)),
            (DataType::Float32, TagValue::Float32(0.1)),
        ];
        for (dt, v) in cases {
            let mut buf = vec![0xAA; 8];
            encode(&mut buf, 2, 0, dt, &v).unwrap();
            let back = decode(&buf, 2, 0, dt).unwrap();
            match (&v, &back) {
                (TagValue::Float32(a), TagValue::Float32(b)) => {
                    assert_eq!(a.to_bits(), b.to_bits())
                },
                _ => assert_eq!(v, back),
            }
        }
    }

    #[test]
    fn test_big_endian_layout() {
        let buf = encode_field(DataType::UInt16, &TagValue::UInt16(0x1234)).unwrap();
        assert_eq!(buf, vec![0x12, 0x34]);
        let buf = encode_field(DataType::Float32, &TagValue::Float32(1.0)).unwrap();
        assert_eq!(buf, vec![0x3F, 0x80, 0x00, 0x00]);
    }

    #[test]
    fn test_string_round_trip() {
        let buf = encode_field(DataType::String, &TagValue::String("PUMP-01".into())).unwrap();
        assert_eq!(&buf[..2], &[254, 7]);
        assert_eq!(
            decode(&buf, 0, 0, DataType::String).unwrap(),
            TagValue::String("PUMP-01".into())
        );
    }

    #[test]
    fn test_string_decode_bounds() {
        // Declares 10 bytes but only 3 are present
        let buf = [254u8, 10, b'a', b'b', b'c'];
        assert_eq!(
            decode(&buf, 0, 0, DataType::String).unwrap(),
            TagValue::String("abc".into())
        );

        // Header alone cut short
        assert!(matches!(
            decode(&[254u8], 0, 0, DataType::String),
            Err(CodecError::BufferTooSmall { .. })
        ));

        // Actual length above the ceiling is clamped
        let mut buf = vec![254u8, 255];
        buf.extend(std::iter::repeat(b'x').take(256));
        match decode(&buf, 0, 0, DataType::String).unwrap() {
            TagValue::String(s) => assert_eq!(s.len(), STRING_MAX_LEN),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_buffer_too_small() {
        assert!(matches!(
            decode(&[0x01], 0, 0, DataType::Int32),
            Err(CodecError::BufferTooSmall { needed: 4, .. })
        ));
        assert!(decode(&[0x01, 0x02], usize::MAX, 0, DataType::UInt16).is_err());

        let mut buf = [0u8; 1];
        assert!(encode(&mut buf, 0, 0, DataType::UInt16, &TagValue::UInt16(1)).is_err());
    }

    #[test]
    fn test_type_mismatch_names_both_types() {
        let err = encode_field(DataType::Bool, &TagValue::String("on".into())).unwrap_err();
        assert_eq!(
            err,
            CodecError::Conversion {
                from: "string",
                to: "bool"
            }
        );
        assert_eq!(err.to_string(), "cannot convert string to bool");
    }

    #[test]
    fn test_string_too_long() {
        let long = "x".repeat(STRING_MAX_LEN + 1);
        assert!(matches!(
            encode_field(DataType::String, &TagValue::String(long)),
            Err(CodecError::OutOfRange { .. })
        ));
    }
}
