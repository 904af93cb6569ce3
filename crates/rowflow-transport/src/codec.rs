//! Big-endian wire encoding of row metadata and rows.
//!
//! Layout:
//!
//! ```text
//! meta   := i32 field_count, field*
//! field  := i32 type_tag, i32 name_len, name[name_len], i32 length, i32 precision
//! row    := value*                 (one per field, in meta order)
//!         | u8 marker              (zero-field meta only)
//! value  := u8 null_flag, payload? (payload only when null_flag == 0)
//! ```
//!
//! Payloads: String and BigNumber are `i32 len` + UTF-8, Integer `i64`,
//! Number `f64`, Date `i64` epoch millis, Boolean `u8`, Binary `i32 len` +
//! bytes. There is no end marker; a clean EOF where the next row would start
//! ends the stream.

use std::io::{self, Read, Write};
use std::str::FromStr;

use bigdecimal::BigDecimal;
use bytes::{BufMut, BytesMut};
use chrono::DateTime;
use rowflow_types::{FieldMeta, Row, RowMeta, Value, ValueType};

use crate::error::{Result, TransportError};

/// Upper bound on fields per row. Anything larger is treated as garbage.
pub const MAX_FIELDS: i32 = 65_536;
/// Upper bound on a single string or binary payload.
pub const MAX_PAYLOAD_LEN: i32 = 256 * 1024 * 1024;

const ROW_MARKER: u8 = 1;

/// Append the encoded metadata to `buf`.
pub fn encode_meta(meta: &RowMeta, buf: &mut BytesMut) {
    buf.put_i32(i32::try_from(meta.len()).unwrap_or(i32::MAX));
    for field in meta.fields() {
        buf.put_i32(field.value_type.tag());
        put_str(buf, &field.name);
        buf.put_i32(field.length);
        buf.put_i32(field.precision);
    }
}

/// Append one encoded row to `buf`.
///
/// # Errors
///
/// Returns [`TransportError::Layout`] if `row` does not match `meta`.
pub fn encode_row(meta: &RowMeta, row: &Row, buf: &mut BytesMut) -> Result<()> {
    meta.check_row(row).map_err(TransportError::Layout)?;
    if meta.is_empty() {
        buf.put_u8(ROW_MARKER);
        return Ok(());
    }
    for value in row.values() {
        encode_value(value, buf);
    }
    Ok(())
}

fn encode_value(value: &Value, buf: &mut BytesMut) {
    if value.is_null() {
        buf.put_u8(1);
        return;
    }
    buf.put_u8(0);
    match value {
        Value::Null => {}
        Value::String(s) => put_str(buf, s),
        Value::Integer(v) => buf.put_i64(*v),
        Value::Number(v) => buf.put_f64(*v),
        Value::Date(v) => buf.put_i64(v.and_utc().timestamp_millis()),
        Value::Boolean(v) => buf.put_u8(u8::from(*v)),
        Value::Binary(v) => {
            buf.put_i32(i32::try_from(v.len()).unwrap_or(i32::MAX));
            buf.put_slice(v);
        }
        Value::BigNumber(v) => put_str(buf, &v.to_string()),
    }
}

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_i32(i32::try_from(s.len()).unwrap_or(i32::MAX));
    buf.put_slice(s.as_bytes());
}

/// Encode and write the metadata.
///
/// # Errors
///
/// Returns an error if the write fails.
pub fn write_meta<W: Write>(out: &mut W, meta: &RowMeta) -> Result<()> {
    let mut buf = BytesMut::with_capacity(16 + meta.len() * 32);
    encode_meta(meta, &mut buf);
    out.write_all(&buf)?;
    Ok(())
}

/// Decode the metadata that opens every stream.
///
/// # Errors
///
/// Returns [`TransportError::Corrupt`] for implausible content and
/// [`TransportError::Truncated`] if the stream ends early.
pub fn read_meta<R: Read>(input: &mut R) -> Result<RowMeta> {
    let count = read_i32(input)?;
    if !(0..=MAX_FIELDS).contains(&count) {
        return Err(TransportError::Corrupt(format!(
            "field count {count} outside 0..={MAX_FIELDS}"
        )));
    }
    let mut fields = Vec::with_capacity(usize::try_from(count).unwrap_or(0));
    for _ in 0..count {
        let tag = read_i32(input)?;
        let value_type = ValueType::from_tag(tag)
            .ok_or_else(|| TransportError::Corrupt(format!("unknown type tag {tag}")))?;
        let name = read_string(input)?;
        let length = read_i32(input)?;
        let precision = read_i32(input)?;
        fields.push(FieldMeta::new(name, value_type).with_length(length, precision));
    }
    Ok(RowMeta::new(fields))
}

/// Decode the next row. `Ok(None)` is a clean end of stream.
///
/// # Errors
///
/// Returns [`TransportError::Truncated`] if EOF hits inside a row and
/// [`TransportError::Corrupt`] for undecodable payloads.
pub fn read_row<R: Read>(input: &mut R, meta: &RowMeta) -> Result<Option<Row>> {
    let Some(first) = read_leading_byte(input)? else {
        return Ok(None);
    };
    if meta.is_empty() {
        if first != ROW_MARKER {
            return Err(TransportError::Corrupt(format!("bad row marker {first}")));
        }
        return Ok(Some(Row::default()));
    }
    let mut values = Vec::with_capacity(meta.len());
    for (idx, field) in meta.fields().iter().enumerate() {
        let null_flag = if idx == 0 { first } else { read_u8(input)? };
        let value = match null_flag {
            1 => Value::Null,
            0 => read_payload(input, field.value_type)?,
            other => {
                return Err(TransportError::Corrupt(format!(
                    "bad null flag {other} for field '{}'",
                    field.name
                )))
            }
        };
        values.push(value);
    }
    Ok(Some(Row::new(values)))
}

fn read_payload<R: Read>(input: &mut R, value_type: ValueType) -> Result<Value> {
    Ok(match value_type {
        ValueType::String => Value::String(read_string(input)?),
        ValueType::Integer => Value::Integer(i64::from_be_bytes(read_array(input)?)),
        ValueType::Number => Value::Number(f64::from_be_bytes(read_array(input)?)),
        ValueType::Date => {
            let millis = i64::from_be_bytes(read_array(input)?);
            let date = DateTime::from_timestamp_millis(millis)
                .ok_or_else(|| TransportError::Corrupt(format!("date {millis} out of range")))?;
            Value::Date(date.naive_utc())
        }
        ValueType::Boolean => Value::Boolean(read_u8(input)? != 0),
        ValueType::Binary => {
            let len = read_len(input)?;
            let mut bytes = vec![0u8; len];
            input.read_exact(&mut bytes).map_err(TransportError::from_decode)?;
            Value::Binary(bytes)
        }
        ValueType::BigNumber => {
            let text = read_string(input)?;
            let number = BigDecimal::from_str(&text)
                .map_err(|e| TransportError::Corrupt(format!("big number '{text}': {e}")))?;
            Value::BigNumber(number)
        }
    })
}

fn read_leading_byte<R: Read>(input: &mut R) -> Result<Option<u8>> {
    let mut byte = [0u8; 1];
    loop {
        match input.read(&mut byte) {
            Ok(0) => return Ok(None),
            Ok(_) => return Ok(Some(byte[0])),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(TransportError::from_decode(e)),
        }
    }
}

fn read_array<R: Read, const N: usize>(input: &mut R) -> Result<[u8; N]> {
    let mut bytes = [0u8; N];
    input.read_exact(&mut bytes).map_err(TransportError::from_decode)?;
    Ok(bytes)
}

fn read_u8<R: Read>(input: &mut R) -> Result<u8> {
    Ok(read_array::<R, 1>(input)?[0])
}

fn read_i32<R: Read>(input: &mut R) -> Result<i32> {
    Ok(i32::from_be_bytes(read_array(input)?))
}

fn read_len<R: Read>(input: &mut R) -> Result<usize> {
    let len = read_i32(input)?;
    if !(0..=MAX_PAYLOAD_LEN).contains(&len) {
        return Err(TransportError::Corrupt(format!(
            "payload length {len} outside 0..={MAX_PAYLOAD_LEN}"
        )));
    }
    Ok(usize::try_from(len).unwrap_or(0))
}

fn read_string<R: Read>(input: &mut R) -> Result<String> {
    let len = read_len(input)?;
    let mut bytes = vec![0u8; len];
    input.read_exact(&mut bytes).map_err(TransportError::from_decode)?;
    String::from_utf8(bytes).map_err(|e| TransportError::Corrupt(format!("invalid UTF-8: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn every_type_meta() -> RowMeta {
        RowMeta::new(vec![
            FieldMeta::new("s", ValueType::String).with_length(20, -1),
            FieldMeta::new("i", ValueType::Integer),
            FieldMeta::new("n", ValueType::Number),
            FieldMeta::new("d", ValueType::Date),
            FieldMeta::new("b", ValueType::Boolean),
            FieldMeta::new("bin", ValueType::Binary),
            FieldMeta::new("big", ValueType::BigNumber).with_length(30, 10),
        ])
    }

    fn every_type_row() -> Row {
        let date = NaiveDate::from_ymd_opt(2024, 2, 29)
            .unwrap()
            .and_hms_milli_opt(13, 14, 15, 123)
            .unwrap();
        Row::new(vec![
            Value::String("héllo".into()),
            Value::Integer(-42),
            Value::Number(2.5),
            Value::Date(date),
            Value::Boolean(true),
            Value::Binary(vec![0, 255, 7]),
            Value::BigNumber(BigDecimal::from_str("12345678901234567890.0123456789").unwrap()),
        ])
    }

    fn encode(meta: &RowMeta, rows: &[Row]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        encode_meta(meta, &mut buf);
        for row in rows {
            encode_row(meta, row, &mut buf).unwrap();
        }
        buf.to_vec()
    }

    #[test]
    fn test_every_type_and_nulls_decode() {
        let meta = every_type_meta();
        let nulls = Row::new(vec![Value::Null; meta.len()]);
        let bytes = encode(&meta, &[every_type_row(), nulls.clone()]);

        let mut input = bytes.as_slice();
        let decoded_meta = read_meta(&mut input).unwrap();
        assert_eq!(decoded_meta, meta);
        assert_eq!(read_row(&mut input, &meta).unwrap(), Some(every_type_row()));
        assert_eq!(read_row(&mut input, &meta).unwrap(), Some(nulls));
        assert_eq!(read_row(&mut input, &meta).unwrap(), None);
    }

    #[test]
    fn test_meta_header_is_big_endian() {
        let meta = RowMeta::new(vec![FieldMeta::new("id", ValueType::Integer)]);
        let mut buf = BytesMut::new();
        encode_meta(&meta, &mut buf);
        assert_eq!(
            &buf[..],
            &[0, 0, 0, 1, 0, 0, 0, 5, 0, 0, 0, 2, b'i', b'd', 255, 255, 255, 255, 255, 255, 255, 255]
        );
    }

    #[test]
    fn test_eof_inside_row_is_truncated() {
        let meta = every_type_meta();
        let bytes = encode(&meta, &[every_type_row()]);
        let cut = &bytes[..bytes.len() - 3];
        let mut input = cut;
        read_meta(&mut input).unwrap();
        assert!(matches!(read_row(&mut input, &meta), Err(TransportError::Truncated)));
    }

    #[test]
    fn test_zero_field_rows_use_marker() {
        let meta = RowMeta::default();
        let bytes = encode(&meta, &[Row::default(), Row::default()]);
        assert_eq!(bytes, vec![0, 0, 0, 0, ROW_MARKER, ROW_MARKER]);
        let mut input = bytes.as_slice();
        let meta = read_meta(&mut input).unwrap();
        assert_eq!(read_row(&mut input, &meta).unwrap(), Some(Row::default()));
        assert_eq!(read_row(&mut input, &meta).unwrap(), Some(Row::default()));
        assert_eq!(read_row(&mut input, &meta).unwrap(), None);
    }

    #[test]
    fn test_implausible_meta_is_corrupt() {
        // First bytes of an lz4 frame read as a plain field count.
        let lz4_magic = [0x04u8, 0x22, 0x4D, 0x18];
        let err = read_meta(&mut lz4_magic.as_slice()).unwrap_err();
        assert!(matches!(err, TransportError::Corrupt(_)));

        let unknown_tag = [0u8, 0, 0, 1, 0, 0, 0, 7];
        let err = read_meta(&mut unknown_tag.as_slice()).unwrap_err();
        assert!(err.to_string().contains("unknown type tag 7"));
    }

    #[test]
    fn test_encode_rejects_mismatched_row() {
        let meta = RowMeta::new(vec![FieldMeta::new("id", ValueType::Integer)]);
        let mut buf = BytesMut::new();
        let err = encode_row(&meta, &Row::new(vec![Value::from("x")]), &mut buf).unwrap_err();
        assert!(matches!(err, TransportError::Layout(_)));
        assert!(buf.is_empty());
    }
}
