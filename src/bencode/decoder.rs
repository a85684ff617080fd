use super::BencodeValue;
use crate::error::{LeechError, Result};
use std::collections::BTreeMap;
use std::ops::Range;

/// Decode a complete bencoded document. Trailing bytes are an error.
pub fn decode(data: &[u8]) -> Result<BencodeValue> {
    let (value, consumed) = decode_prefix(data)?;
    if consumed != data.len() {
        return Err(LeechError::MalformedBencode(format!(
            "{} trailing bytes after document",
            data.len() - consumed
        )));
    }
    Ok(value)
}

/// Decode one bencoded value from the front of `data`, returning the value
/// and the number of bytes consumed. Needed where a bencoded dictionary is
/// followed by raw payload bytes, as in metadata exchange messages.
pub fn decode_prefix(data: &[u8]) -> Result<(BencodeValue, usize)> {
    let mut pos = 0;
    let value = decode_value(data, &mut pos)?;
    Ok((value, pos))
}

/// Byte range of the value bound to `key` in a top-level bencoded dictionary.
///
/// The range covers the value exactly as it appears in the source, so the
/// caller can hash non-canonical input byte-for-byte. Re-encoding a decoded
/// tree is not a substitute: it would normalize the very bytes whose digest
/// must match what other clients computed.
pub fn value_span(data: &[u8], key: &[u8]) -> Result<Range<usize>> {
    if data.first() != Some(&b'd') {
        return Err(LeechError::MalformedBencode(
            "Expected a dictionary".to_string(),
        ));
    }

    let mut pos = 1;
    while pos < data.len() && data[pos] != b'e' {
        let key_range = string_span(data, &mut pos)?;
        let start = pos;
        skip_value(data, &mut pos)?;
        if &data[key_range] == key {
            return Ok(start..pos);
        }
    }

    Err(LeechError::MalformedBencode(format!(
        "Key '{}' not present in dictionary",
        String::from_utf8_lossy(key)
    )))
}

fn decode_value(data: &[u8], pos: &mut usize) -> Result<BencodeValue> {
    match data.get(*pos) {
        Some(b'i') => decode_integer(data, pos),
        Some(b'l') => decode_list(data, pos),
        Some(b'd') => decode_dict(data, pos),
        Some(b'0'..=b'9') => decode_string(data, pos),
        Some(c) => Err(LeechError::MalformedBencode(format!(
            "Invalid bencode token: {}",
            *c as char
        ))),
        None => Err(LeechError::MalformedBencode(
            "Unexpected end of input".to_string(),
        )),
    }
}

fn decode_integer(data: &[u8], pos: &mut usize) -> Result<BencodeValue> {
    *pos += 1; // Skip 'i'

    let start = *pos;
    while *pos < data.len() && data[*pos] != b'e' {
        *pos += 1;
    }

    if *pos >= data.len() {
        return Err(LeechError::MalformedBencode(
            "Unterminated integer".to_string(),
        ));
    }

    let literal = &data[start..*pos];
    validate_integer(literal)?;

    let num = std::str::from_utf8(literal)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| LeechError::MalformedBencode("Invalid integer".to_string()))?;

    *pos += 1; // Skip 'e'

    Ok(BencodeValue::Integer(num))
}

/// Reject the non-canonical integer spellings: empty, `i-0e`, leading zeros.
fn validate_integer(literal: &[u8]) -> Result<()> {
    let digits = literal.strip_prefix(b"-").unwrap_or(literal);
    if digits.is_empty() {
        return Err(LeechError::MalformedBencode("Empty integer".to_string()));
    }
    if digits[0] == b'0' && (digits.len() > 1 || literal[0] == b'-') {
        return Err(LeechError::MalformedBencode(format!(
            "Invalid integer literal '{}'",
            String::from_utf8_lossy(literal)
        )));
    }
    Ok(())
}

fn decode_string(data: &[u8], pos: &mut usize) -> Result<BencodeValue> {
    let range = string_span(data, pos)?;
    Ok(BencodeValue::String(data[range].to_vec()))
}

/// Parse `<len>:<bytes>` at `pos`, returning the content range.
fn string_span(data: &[u8], pos: &mut usize) -> Result<Range<usize>> {
    let start = *pos;
    while *pos < data.len() && data[*pos].is_ascii_digit() {
        *pos += 1;
    }

    if *pos == start || data.get(*pos) != Some(&b':') {
        return Err(LeechError::MalformedBencode(
            "Invalid string length".to_string(),
        ));
    }

    let len = std::str::from_utf8(&data[start..*pos])
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .ok_or_else(|| LeechError::MalformedBencode("Invalid string length".to_string()))?;

    *pos += 1; // Skip ':'

    if *pos + len > data.len() {
        return Err(LeechError::MalformedBencode(
            "String length exceeds data".to_string(),
        ));
    }

    let range = *pos..*pos + len;
    *pos += len;
    Ok(range)
}

fn decode_list(data: &[u8], pos: &mut usize) -> Result<BencodeValue> {
    *pos += 1; // Skip 'l'

    let mut list = Vec::new();

    while *pos < data.len() && data[*pos] != b'e' {
        list.push(decode_value(data, pos)?);
    }

    if *pos >= data.len() {
        return Err(LeechError::MalformedBencode(
            "Unterminated list".to_string(),
        ));
    }

    *pos += 1; // Skip 'e'

    Ok(BencodeValue::List(list))
}

fn decode_dict(data: &[u8], pos: &mut usize) -> Result<BencodeValue> {
    *pos += 1; // Skip 'd'

    let mut dict = BTreeMap::new();

    while *pos < data.len() && data[*pos] != b'e' {
        // Keys must be byte strings
        if !data[*pos].is_ascii_digit() {
            return Err(LeechError::MalformedBencode(
                "Dictionary key must be a string".to_string(),
            ));
        }

        let key_range = string_span(data, pos)?;
        let value = decode_value(data, pos)?;
        dict.insert(data[key_range].to_vec(), value);
    }

    if *pos >= data.len() {
        return Err(LeechError::MalformedBencode(
            "Unterminated dictionary".to_string(),
        ));
    }

    *pos += 1; // Skip 'e'

    Ok(BencodeValue::Dict(dict))
}

/// Advance `pos` past the value starting there, without building a tree.
fn skip_value(data: &[u8], pos: &mut usize) -> Result<()> {
    match data.get(*pos) {
        Some(b'i') => {
            *pos += 1;
            while *pos < data.len() && data[*pos] != b'e' {
                *pos += 1;
            }
            if *pos >= data.len() {
                return Err(LeechError::MalformedBencode(
                    "Unterminated integer".to_string(),
                ));
            }
            *pos += 1;
            Ok(())
        }
        Some(b'l') | Some(b'd') => {
            let is_dict = data[*pos] == b'd';
            *pos += 1;
            while *pos < data.len() && data[*pos] != b'e' {
                if is_dict {
                    string_span(data, pos)?;
                }
                skip_value(data, pos)?;
            }
            if *pos >= data.len() {
                return Err(LeechError::MalformedBencode(
                    "Unterminated container".to_string(),
                ));
            }
            *pos += 1;
            Ok(())
        }
        Some(b'0'..=b'9') => {
            string_span(data, pos)?;
            Ok(())
        }
        _ => Err(LeechError::MalformedBencode(
            "Unexpected end of input".to_string(),
        )),
    }
}
