//! # MQTT Serialization Utilities
//!
//! Helpers for reading and writing MQTT-specific data types from and to byte
//! buffers, such as variable-byte integers and length-prefixed strings. Every
//! helper is bounds-checked: malformed input yields a [`CodecError`] instead of
//! a panic.

use crate::error::{CodecError, ProtocolError};

/// Reads a variable-byte integer from the buffer, advancing the cursor.
///
/// This is a common encoding scheme in MQTT for packet lengths.
pub fn read_variable_byte_integer(cursor: &mut usize, buf: &[u8]) -> Result<usize, CodecError> {
    let mut multiplier = 1;
    let mut value = 0;
    let mut i = 0;
    loop {
        let encoded_byte = *buf
            .get(*cursor + i)
            .ok_or(ProtocolError::MalformedPacket)?;
        value += (encoded_byte & 127) as usize * multiplier;
        if (encoded_byte & 128) == 0 {
            break;
        }
        multiplier *= 128;
        i += 1;
        if i >= 4 {
            return Err(ProtocolError::MalformedPacket.into());
        }
    }
    *cursor += i + 1;
    Ok(value)
}

/// Writes a variable-byte integer at the start of `buf`, returning the byte count.
pub fn write_variable_byte_integer_len(buf: &mut [u8], mut val: usize) -> Result<usize, CodecError> {
    if val > 268_435_455 {
        return Err(ProtocolError::PayloadTooLarge.into());
    }
    let mut i = 0;
    loop {
        let mut encoded_byte = (val % 128) as u8;
        val /= 128;
        if val > 0 {
            encoded_byte |= 128;
        }
        *buf.get_mut(i).ok_or(CodecError::BufferTooSmall)? = encoded_byte;
        i += 1;
        if val == 0 {
            break;
        }
    }
    Ok(i)
}

/// Reads a big-endian `u16`, advancing the cursor.
pub fn read_u16(cursor: &mut usize, buf: &[u8]) -> Result<u16, CodecError> {
    let bytes = buf
        .get(*cursor..*cursor + 2)
        .ok_or(ProtocolError::MalformedPacket)?;
    *cursor += 2;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Copies `bytes` into `buf` at the cursor, advancing it.
pub fn write_bytes(cursor: &mut usize, buf: &mut [u8], bytes: &[u8]) -> Result<(), CodecError> {
    let end = *cursor + bytes.len();
    buf.get_mut(*cursor..end)
        .ok_or(CodecError::BufferTooSmall)?
        .copy_from_slice(bytes);
    *cursor = end;
    Ok(())
}

/// Reads a UTF-8 encoded string (prefixed with a 2-byte length) from the buffer.
pub fn read_utf8_string<'a>(cursor: &mut usize, buf: &'a [u8]) -> Result<&'a str, CodecError> {
    let len = read_u16(cursor, buf)? as usize;
    let s = core::str::from_utf8(
        buf.get(*cursor..*cursor + len)
            .ok_or(ProtocolError::MalformedPacket)?,
    )
    .map_err(|_| ProtocolError::InvalidUtf8String)?;
    *cursor += len;
    Ok(s)
}

/// Writes length-prefixed binary data to the buffer, advancing the cursor.
pub fn write_binary(cursor: &mut usize, buf: &mut [u8], data: &[u8]) -> Result<(), CodecError> {
    let len = u16::try_from(data.len()).map_err(|_| ProtocolError::PayloadTooLarge)?;
    write_bytes(cursor, buf, &len.to_be_bytes())?;
    write_bytes(cursor, buf, data)
}

/// Writes a UTF-8 encoded string (prefixed with a 2-byte length) to the buffer.
pub fn write_utf8_string(cursor: &mut usize, buf: &mut [u8], s: &str) -> Result<(), CodecError> {
    write_binary(cursor, buf, s.as_bytes())
}

/// Appends the decimal form of `n` to a heapless string.
pub(crate) fn push_u32<const N: usize>(out: &mut heapless::String<N>, n: u32) -> bool {
    use core::fmt::Write;
    write!(out, "{}", n).is_ok()
}
