//! Typed conversion between remote Arrow scalars, DataFusion values and
//! BigQuery SQL literal text.
//!
//! Reads go `Arrow array cell -> ScalarValue` through [`to_output_value`];
//! writes go `ScalarValue -> literal text` through [`to_literal_string`]. The
//! quoting rules of the write path are keyed on the destination column type,
//! not on the textual mechanism, so a binary write protocol can reuse them.

use datafusion::arrow::array::{Array, AsArray};
use datafusion::arrow::datatypes::{
    DataType, Float32Type, Float64Type, Int16Type, Int32Type, Int64Type, Int8Type, TimeUnit,
    UInt16Type, UInt32Type, UInt64Type, UInt8Type,
};
use datafusion::arrow::temporal_conversions::{
    date32_to_datetime, timestamp_ms_to_datetime, timestamp_ns_to_datetime,
    timestamp_s_to_datetime, timestamp_us_to_datetime,
};
use datafusion::common::ScalarValue;

use crate::error::{BigQueryError, Result};

/// Literal emitted for SQL NULL regardless of destination type.
pub const NULL_LITERAL: &str = "NULL";

const HEX_TABLE: &[u8; 16] = b"0123456789ABCDEF";

/// Converts one cell of a remote Arrow column into an engine-native value.
///
/// Boolean, signed/unsigned integers, floats, strings and binaries map one to
/// one onto the matching [`ScalarValue`] variant (nulls stay typed). Any
/// other remote kind fails with [`BigQueryError::Conversion`] naming the type.
pub fn to_output_value(array: &dyn Array, row: usize) -> Result<ScalarValue> {
    if row >= array.len() {
        return Err(BigQueryError::conversion(
            array.data_type(),
            format!(
                "row {row} is out of bounds for a column of {} rows",
                array.len()
            ),
        ));
    }

    let valid = array.is_valid(row);
    let value = match array.data_type() {
        DataType::Boolean => ScalarValue::Boolean(valid.then(|| array.as_boolean().value(row))),
        DataType::Int8 => {
            ScalarValue::Int8(valid.then(|| array.as_primitive::<Int8Type>().value(row)))
        }
        DataType::Int16 => {
            ScalarValue::Int16(valid.then(|| array.as_primitive::<Int16Type>().value(row)))
        }
        DataType::Int32 => {
            ScalarValue::Int32(valid.then(|| array.as_primitive::<Int32Type>().value(row)))
        }
        DataType::Int64 => {
            ScalarValue::Int64(valid.then(|| array.as_primitive::<Int64Type>().value(row)))
        }
        DataType::UInt8 => {
            ScalarValue::UInt8(valid.then(|| array.as_primitive::<UInt8Type>().value(row)))
        }
        DataType::UInt16 => {
            ScalarValue::UInt16(valid.then(|| array.as_primitive::<UInt16Type>().value(row)))
        }
        DataType::UInt32 => {
            ScalarValue::UInt32(valid.then(|| array.as_primitive::<UInt32Type>().value(row)))
        }
        DataType::UInt64 => {
            ScalarValue::UInt64(valid.then(|| array.as_primitive::<UInt64Type>().value(row)))
        }
        DataType::Float32 => {
            ScalarValue::Float32(valid.then(|| array.as_primitive::<Float32Type>().value(row)))
        }
        DataType::Float64 => {
            ScalarValue::Float64(valid.then(|| array.as_primitive::<Float64Type>().value(row)))
        }
        DataType::Utf8 => {
            ScalarValue::Utf8(valid.then(|| array.as_string::<i32>().value(row).to_string()))
        }
        DataType::LargeUtf8 => {
            ScalarValue::LargeUtf8(valid.then(|| array.as_string::<i64>().value(row).to_string()))
        }
        DataType::Binary => {
            ScalarValue::Binary(valid.then(|| array.as_binary::<i32>().value(row).to_vec()))
        }
        DataType::LargeBinary => {
            ScalarValue::LargeBinary(valid.then(|| array.as_binary::<i64>().value(row).to_vec()))
        }
        other => {
            return Err(BigQueryError::conversion(
                other,
                "remote scalar kind has no engine mapping",
            ))
        }
    };
    Ok(value)
}

/// Renders one value as BigQuery literal text for a column of `column_type`.
///
/// - null is always `NULL`;
/// - booleans, every integer width and floats are emitted unquoted;
/// - blobs are emitted unquoted as `0x` followed by uppercase hex pairs;
/// - timestamps are formatted as naive UTC instants (any zone is dropped);
/// - everything else becomes a quote-escaped string literal.
pub fn to_literal_string(value: &ScalarValue, column_type: &DataType) -> Result<String> {
    if value.is_null() {
        return Ok(NULL_LITERAL.to_string());
    }

    match column_type {
        DataType::Boolean
        | DataType::Int8
        | DataType::Int16
        | DataType::Int32
        | DataType::Int64
        | DataType::UInt8
        | DataType::UInt16
        | DataType::UInt32
        | DataType::UInt64
        | DataType::Float32
        | DataType::Float64 => unquoted_literal(value, column_type),
        DataType::Binary
        | DataType::LargeBinary
        | DataType::BinaryView
        | DataType::FixedSizeBinary(_) => match value {
            ScalarValue::Binary(Some(bytes))
            | ScalarValue::LargeBinary(Some(bytes))
            | ScalarValue::BinaryView(Some(bytes))
            | ScalarValue::FixedSizeBinary(_, Some(bytes)) => Ok(blob_literal(bytes)),
            other => Err(literal_mismatch(other, column_type)),
        },
        DataType::Timestamp(_, _) => timestamp_literal(value, column_type),
        DataType::Date32 => match value {
            ScalarValue::Date32(Some(days)) => date32_to_datetime(*days)
                .map(|datetime| write_literal(&datetime.date().to_string()))
                .ok_or_else(|| {
                    BigQueryError::conversion(column_type, format!("date {days} is out of range"))
                }),
            other => Err(literal_mismatch(other, column_type)),
        },
        DataType::Utf8 | DataType::LargeUtf8 | DataType::Utf8View => match value {
            ScalarValue::Utf8(Some(text))
            | ScalarValue::LargeUtf8(Some(text))
            | ScalarValue::Utf8View(Some(text)) => Ok(write_literal(text)),
            other => Err(literal_mismatch(other, column_type)),
        },
        _ => Ok(write_literal(&value.to_string())),
    }
}

/// Renders blob bytes as `0x` plus two uppercase hex digits per byte.
pub fn blob_literal(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(2 + bytes.len() * 2);
    out.push_str("0x");
    for byte in bytes {
        out.push(HEX_TABLE[(byte >> 4) as usize] as char);
        out.push(HEX_TABLE[(byte & 0x0F) as usize] as char);
    }
    out
}

/// Quotes text as a single-quoted BigQuery string literal.
pub fn write_literal(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('\'');
    for ch in text.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            _ => out.push(ch),
        }
    }
    out.push('\'');
    out
}

/// Quotes an identifier with backticks.
pub fn write_identifier(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 2);
    out.push('`');
    for ch in name.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '`' => out.push_str("\\`"),
            _ => out.push(ch),
        }
    }
    out.push('`');
    out
}

fn unquoted_literal(value: &ScalarValue, column_type: &DataType) -> Result<String> {
    let text = match value {
        ScalarValue::Boolean(Some(v)) => v.to_string(),
        ScalarValue::Int8(Some(v)) => v.to_string(),
        ScalarValue::Int16(Some(v)) => v.to_string(),
        ScalarValue::Int32(Some(v)) => v.to_string(),
        ScalarValue::Int64(Some(v)) => v.to_string(),
        ScalarValue::UInt8(Some(v)) => v.to_string(),
        ScalarValue::UInt16(Some(v)) => v.to_string(),
        ScalarValue::UInt32(Some(v)) => v.to_string(),
        ScalarValue::UInt64(Some(v)) => v.to_string(),
        ScalarValue::Float32(Some(v)) if v.is_finite() => v.to_string(),
        ScalarValue::Float64(Some(v)) if v.is_finite() => v.to_string(),
        ScalarValue::Float32(Some(v)) => non_finite_literal(f64::from(*v)),
        ScalarValue::Float64(Some(v)) => non_finite_literal(*v),
        other => return Err(literal_mismatch(other, column_type)),
    };
    Ok(text)
}

// Bare `inf`/`NaN` tokens are not valid BigQuery SQL.
fn non_finite_literal(value: f64) -> String {
    let token = if value.is_nan() {
        "NaN"
    } else if value.is_sign_positive() {
        "inf"
    } else {
        "-inf"
    };
    format!("CAST('{token}' AS FLOAT64)")
}

fn timestamp_literal(value: &ScalarValue, column_type: &DataType) -> Result<String> {
    let (unit, raw) = match value {
        ScalarValue::TimestampSecond(Some(v), _) => (TimeUnit::Second, *v),
        ScalarValue::TimestampMillisecond(Some(v), _) => (TimeUnit::Millisecond, *v),
        ScalarValue::TimestampMicrosecond(Some(v), _) => (TimeUnit::Microsecond, *v),
        ScalarValue::TimestampNanosecond(Some(v), _) => (TimeUnit::Nanosecond, *v),
        other => return Err(literal_mismatch(other, column_type)),
    };
    // Decision: the stored value is already a UTC instant; formatting it
    // without the zone is the timezone-naive normalization.
    let naive = match unit {
        TimeUnit::Second => timestamp_s_to_datetime(raw),
        TimeUnit::Millisecond => timestamp_ms_to_datetime(raw),
        TimeUnit::Microsecond => timestamp_us_to_datetime(raw),
        TimeUnit::Nanosecond => timestamp_ns_to_datetime(raw),
    };
    naive
        .map(|datetime| write_literal(&datetime.to_string()))
        .ok_or_else(|| {
            BigQueryError::conversion(column_type, format!("timestamp {raw} is out of range"))
        })
}

fn literal_mismatch(value: &ScalarValue, column_type: &DataType) -> BigQueryError {
    BigQueryError::conversion(
        value.data_type(),
        format!("value cannot be written to a {column_type} column"),
    )
}
