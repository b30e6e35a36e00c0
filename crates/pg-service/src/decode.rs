//! Turning result rows into [`SqlValue`]s.

use crate::error::DriverError;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use pg_sql::SqlValue;
use serde::Serialize;
use serde_json::{Map, Value};
use std::error::Error;
use tokio_postgres::Row;
use tokio_postgres::types::{FromSql, Kind, Type};
use uuid::Uuid;

type BoxError = Box<dyn Error + Sync + Send>;

/// How `timestamp without time zone` columns are decoded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TimestampDecoding {
    /// As a UTC instant.
    #[default]
    AssumeUtc,
    /// As [`SqlValue::LocalTimestamp`].
    Naive,
}

/// How `date` columns are decoded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DateDecoding {
    /// As a timestamp at UTC midnight.
    #[default]
    UtcMidnight,
    /// As [`SqlValue::Date`].
    Date,
}

/// Decoder policy, chosen once when the service is set up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Decoders {
    pub timestamp: TimestampDecoding,
    pub date: DateDecoding,
}

impl Decoders {
    pub fn timestamp(mut self, timestamp: TimestampDecoding) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn date(mut self, date: DateDecoding) -> Self {
        self.date = date;
        self
    }

    /// Decode every column of `row`.
    pub fn decode_row(&self, row: &Row) -> Result<Vec<SqlValue>, DriverError> {
        row.columns()
            .iter()
            .enumerate()
            .map(|(idx, column)| self.decode_column(row, idx, column.type_()))
            .collect::<Result<_, tokio_postgres::Error>>()
            .map_err(DriverError::from)
    }

    fn decode_column(
        &self,
        row: &Row,
        idx: usize,
        ty: &Type,
    ) -> Result<SqlValue, tokio_postgres::Error> {
        let value = match *ty {
            Type::BOOL => row.try_get::<_, Option<bool>>(idx)?.into(),
            Type::INT2 => row.try_get::<_, Option<i16>>(idx)?.into(),
            Type::INT4 => row.try_get::<_, Option<i32>>(idx)?.into(),
            Type::INT8 => row.try_get::<_, Option<i64>>(idx)?.into(),
            Type::OID => row.try_get::<_, Option<u32>>(idx)?.into(),
            Type::FLOAT4 => row.try_get::<_, Option<f32>>(idx)?.into(),
            Type::FLOAT8 => row.try_get::<_, Option<f64>>(idx)?.into(),
            Type::NUMERIC => row
                .try_get::<_, Option<NumericText>>(idx)?
                .map_or(SqlValue::Null, |n| SqlValue::Text(n.0)),
            Type::JSON | Type::JSONB => row
                .try_get::<_, Option<Value>>(idx)?
                .map_or(SqlValue::Null, SqlValue::Json),
            Type::TIMESTAMPTZ => row.try_get::<_, Option<DateTime<Utc>>>(idx)?.into(),
            Type::TIMESTAMP => match row.try_get::<_, Option<NaiveDateTime>>(idx)? {
                None => SqlValue::Null,
                Some(ts) => match self.timestamp {
                    TimestampDecoding::AssumeUtc => SqlValue::Timestamp(ts.and_utc()),
                    TimestampDecoding::Naive => SqlValue::LocalTimestamp(ts),
                },
            },
            Type::DATE => match row.try_get::<_, Option<NaiveDate>>(idx)? {
                None => SqlValue::Null,
                Some(date) => match self.date {
                    DateDecoding::UtcMidnight => {
                        SqlValue::Timestamp(date.and_time(NaiveTime::MIN).and_utc())
                    }
                    DateDecoding::Date => SqlValue::Date(date),
                },
            },
            Type::UUID => row.try_get::<_, Option<Uuid>>(idx)?.into(),
            Type::BYTEA => row.try_get::<_, Option<Vec<u8>>>(idx)?.into(),
            _ if <String as FromSql>::accepts(ty) => row.try_get::<_, Option<String>>(idx)?.into(),
            _ => {
                let raw = row.try_get::<_, Option<RawValue>>(idx)?;
                match (raw, ty.kind()) {
                    (None, _) => SqlValue::Null,
                    // Enum labels travel as their text.
                    (Some(raw), Kind::Enum(_)) => {
                        SqlValue::Text(String::from_utf8_lossy(&raw.0).into_owned())
                    }
                    (Some(raw), _) => SqlValue::Bytes(raw.0),
                }
            }
        };
        Ok(value)
    }
}

/// The undecoded wire value of a column of any type.
struct RawValue(Vec<u8>);

impl<'a> FromSql<'a> for RawValue {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> Result<Self, BoxError> {
        Ok(RawValue(raw.to_vec()))
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }
}

/// `numeric` rendered as its exact decimal text.
struct NumericText(String);

impl<'a> FromSql<'a> for NumericText {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> Result<Self, BoxError> {
        numeric_to_string(raw).map(NumericText)
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::NUMERIC
    }
}

const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;
const NUMERIC_PINF: u16 = 0xD000;
const NUMERIC_NINF: u16 = 0xF000;

/// Binary `numeric`: ndigits, weight, sign, dscale, then base-10000 digits.
fn numeric_to_string(raw: &[u8]) -> Result<String, BoxError> {
    let word = |at: usize| -> Result<u16, BoxError> {
        raw.get(at..at + 2)
            .map(|b| u16::from_be_bytes([b[0], b[1]]))
            .ok_or_else(|| "numeric value is truncated".into())
    };

    let ndigits = usize::from(word(0)?);
    let weight = i32::from(word(2)? as i16);
    let sign = word(4)?;
    let dscale = usize::from(word(6)?);
    let digits = (0..ndigits)
        .map(|i| word(8 + 2 * i))
        .collect::<Result<Vec<_>, _>>()?;

    match sign {
        NUMERIC_NAN => return Ok("NaN".into()),
        NUMERIC_PINF => return Ok("Infinity".into()),
        NUMERIC_NINF => return Ok("-Infinity".into()),
        _ => {}
    }

    let digit_at = |position: i32| -> u16 {
        usize::try_from(position)
            .ok()
            .and_then(|p| digits.get(p).copied())
            .unwrap_or(0)
    };

    let mut out = String::new();
    if sign == NUMERIC_NEG {
        out.push('-');
    }
    if weight < 0 {
        out.push('0');
    } else {
        out.push_str(&digit_at(0).to_string());
        for position in 1..=weight {
            out.push_str(&format!("{:04}", digit_at(position)));
        }
    }

    if dscale > 0 {
        let mut fraction = String::with_capacity(dscale + 4);
        let mut position = weight + 1;
        while fraction.len() < dscale {
            fraction.push_str(&format!("{:04}", digit_at(position)));
            position += 1;
        }
        fraction.truncate(dscale);
        out.push('.');
        out.push_str(&fraction);
    }
    Ok(out)
}

/// Metadata of one result column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Field {
    pub name: String,
    pub type_oid: u32,
    pub type_name: String,
}

impl Field {
    pub fn new(name: impl Into<String>, ty: &Type) -> Self {
        Self {
            name: name.into(),
            type_oid: ty.oid(),
            type_name: ty.name().to_owned(),
        }
    }
}

/// Outcome of one statement.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub fields: Vec<Field>,
    pub rows: Vec<Vec<SqlValue>>,
    /// Rows returned, or rows affected for statements that return none.
    pub row_count: u64,
}

impl QueryResult {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Position of the column called `name`.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Value of column `name` in row `row`.
    pub fn get(&self, row: usize, name: &str) -> Option<&SqlValue> {
        let idx = self.column_index(name)?;
        self.rows.get(row)?.get(idx)
    }

    /// All values of column `name`, in row order.
    pub fn column(&self, name: &str) -> Vec<&SqlValue> {
        match self.column_index(name) {
            Some(idx) => self.rows.iter().filter_map(|row| row.get(idx)).collect(),
            None => Vec::new(),
        }
    }

    /// Rows as JSON objects keyed by column name.
    pub fn to_objects(&self) -> Vec<Map<String, Value>> {
        self.rows
            .iter()
            .map(|row| {
                self.fields
                    .iter()
                    .zip(row)
                    .map(|(field, value)| {
                        let value = serde_json::to_value(value).unwrap_or(Value::Null);
                        (field.name.clone(), value)
                    })
                    .collect()
            })
            .collect()
    }
}
