//! CSV bulk import support shared by all platforms.
//!
//! A version directory may carry `.csv` files next to its scripts. Each file is
//! loaded into the table named by the file: `table.csv`, `schema.table.csv`,
//! `01.table.csv` or `01.schema.table.csv`. The first row holds column names,
//! quoted fields are honoured and empty fields become NULL.

use rust_decimal::Decimal;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, OffsetDateTime, PrimitiveDateTime, Time};
use uuid::Uuid;

/// An error occurred while loading a CSV file
#[derive(Debug, Error)]
pub enum BulkImportError {
    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error("bulk separator `{0}` must be a single ASCII character")]
    InvalidSeparator(char),

    #[error("cannot derive a table name from `{file_name}` (expected `[sequence.][schema.]table.csv`)")]
    InvalidFileName { file_name: String },

    #[error("destination table `{table}` does not exist")]
    TableNotFound { table: String },

    #[error("column `{column}` does not exist in destination table `{table}`")]
    UnknownColumn { table: String, column: String },

    #[error("column `{column}` has unsupported data type `{data_type}`")]
    UnsupportedColumnType { column: String, data_type: String },

    #[error("row {row}, column `{column}`: `{value}` is not a valid {family}")]
    InvalidValue {
        row: usize,
        column: String,
        value: String,
        family: ColumnFamily,
    },
}

/// Destination table derived from a CSV file name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableName {
    pub schema: Option<String>,
    pub table: String,
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{}.{}", schema, self.table),
            None => write!(f, "{}", self.table),
        }
    }
}

/// Resolve the destination table for a CSV file.
///
/// A leading all-digit segment is a sequence prefix used only for ordering.
pub fn table_name_for(
    path: &Path,
    default_schema: Option<&str>,
) -> Result<TableName, BulkImportError> {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    let invalid = || BulkImportError::InvalidFileName {
        file_name: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
    };
    let mut parts: Vec<&str> = stem.split('.').collect();
    if parts.len() > 1 && parts[0].bytes().all(|b| b.is_ascii_digit()) {
        parts.remove(0);
    }
    if parts.iter().any(|p| p.trim().is_empty()) {
        return Err(invalid());
    }
    match parts.as_slice() {
        [table] => Ok(TableName {
            schema: default_schema.map(str::to_string),
            table: table.to_string(),
        }),
        [schema, table] => Ok(TableName {
            schema: Some(schema.to_string()),
            table: table.to_string(),
        }),
        _ => Err(invalid()),
    }
}

/// Parsed content of one CSV file.
#[derive(Clone, Debug, PartialEq)]
pub struct CsvData {
    pub path: PathBuf,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl CsvData {
    /// Position of `column` in the header row, compared case-insensitively.
    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.headers
            .iter()
            .position(|h| h.eq_ignore_ascii_case(column))
    }
}

pub fn read_csv(path: &Path, separator: char) -> Result<CsvData, BulkImportError> {
    if !separator.is_ascii() {
        return Err(BulkImportError::InvalidSeparator(separator));
    }
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(separator as u8)
        .has_headers(true)
        .from_path(path)?;
    let headers = reader
        .headers()?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        rows.push(
            record
                .iter()
                .map(|field| {
                    if field.is_empty() {
                        None
                    } else {
                        Some(field.to_string())
                    }
                })
                .collect(),
        );
    }
    Ok(CsvData {
        path: path.to_path_buf(),
        headers,
        rows,
    })
}

/// Native type family of a destination column.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColumnFamily {
    Boolean,
    TinyInt,
    SmallInt,
    Integer,
    BigInt,
    Real,
    Double,
    Decimal,
    Date,
    Time,
    Timestamp,
    TimestampTz,
    Uuid,
    Text,
}

impl fmt::Display for ColumnFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnFamily::Boolean => "boolean",
            ColumnFamily::TinyInt => "tinyint",
            ColumnFamily::SmallInt => "smallint",
            ColumnFamily::Integer => "integer",
            ColumnFamily::BigInt => "bigint",
            ColumnFamily::Real => "real",
            ColumnFamily::Double => "double",
            ColumnFamily::Decimal => "decimal",
            ColumnFamily::Date => "date",
            ColumnFamily::Time => "time",
            ColumnFamily::Timestamp => "timestamp",
            ColumnFamily::TimestampTz => "timestamp with time zone",
            ColumnFamily::Uuid => "uuid",
            ColumnFamily::Text => "text",
        };
        f.write_str(name)
    }
}

/// A CSV cell converted to the native type of its destination column.
/// `None` is a NULL of that type.
#[derive(Clone, Debug, PartialEq)]
pub enum CellValue {
    Boolean(Option<bool>),
    TinyInt(Option<u8>),
    SmallInt(Option<i16>),
    Integer(Option<i32>),
    BigInt(Option<i64>),
    Real(Option<f32>),
    Double(Option<f64>),
    Decimal(Option<Decimal>),
    Date(Option<Date>),
    Time(Option<Time>),
    Timestamp(Option<PrimitiveDateTime>),
    TimestampTz(Option<OffsetDateTime>),
    Uuid(Option<Uuid>),
    Text(Option<String>),
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "t" | "yes" | "y" => Some(true),
        "0" | "false" | "f" | "no" | "n" => Some(false),
        _ => None,
    }
}

fn parse_date(value: &str) -> Option<Date> {
    Date::parse(value, format_description!("[year]-[month]-[day]")).ok()
}

fn parse_time(value: &str) -> Option<Time> {
    Time::parse(
        value,
        format_description!("[hour]:[minute][optional [:[second][optional [.[subsecond]]]]]"),
    )
    .ok()
}

fn parse_timestamp(value: &str) -> Option<PrimitiveDateTime> {
    let value = value.replacen('T', " ", 1);
    PrimitiveDateTime::parse(
        &value,
        format_description!(
            "[year]-[month]-[day][optional [ [hour]:[minute][optional [:[second][optional [.[subsecond]]]]]]]"
        ),
    )
    .ok()
}

fn parse_timestamptz(value: &str) -> Option<OffsetDateTime> {
    OffsetDateTime::parse(value, &Rfc3339)
        .ok()
        .or_else(|| parse_timestamp(value).map(PrimitiveDateTime::assume_utc))
}

/// Convert one CSV cell for a column of the given family.
///
/// `row` is the 1-based data row number used in error messages.
pub fn coerce(
    family: ColumnFamily,
    column: &str,
    row: usize,
    cell: Option<&str>,
) -> Result<CellValue, BulkImportError> {
    let invalid = |value: &str| BulkImportError::InvalidValue {
        row,
        column: column.to_string(),
        value: value.to_string(),
        family,
    };
    // Text keeps surrounding whitespace, every other family is parsed trimmed.
    if family == ColumnFamily::Text {
        return Ok(CellValue::Text(cell.map(str::to_string)));
    }
    let Some(raw) = cell else {
        return Ok(null_of(family));
    };
    let value = raw.trim();
    let converted = match family {
        ColumnFamily::Boolean => parse_bool(value).map(|v| CellValue::Boolean(Some(v))),
        ColumnFamily::TinyInt => value.parse().ok().map(|v| CellValue::TinyInt(Some(v))),
        ColumnFamily::SmallInt => value.parse().ok().map(|v| CellValue::SmallInt(Some(v))),
        ColumnFamily::Integer => value.parse().ok().map(|v| CellValue::Integer(Some(v))),
        ColumnFamily::BigInt => value.parse().ok().map(|v| CellValue::BigInt(Some(v))),
        ColumnFamily::Real => value.parse().ok().map(|v| CellValue::Real(Some(v))),
        ColumnFamily::Double => value.parse().ok().map(|v| CellValue::Double(Some(v))),
        ColumnFamily::Decimal => Decimal::from_str(value)
            .or_else(|_| Decimal::from_scientific(value))
            .ok()
            .map(|v| CellValue::Decimal(Some(v))),
        ColumnFamily::Date => parse_date(value).map(|v| CellValue::Date(Some(v))),
        ColumnFamily::Time => parse_time(value).map(|v| CellValue::Time(Some(v))),
        ColumnFamily::Timestamp => parse_timestamp(value).map(|v| CellValue::Timestamp(Some(v))),
        ColumnFamily::TimestampTz => {
            parse_timestamptz(value).map(|v| CellValue::TimestampTz(Some(v)))
        }
        ColumnFamily::Uuid => Uuid::parse_str(value).ok().map(|v| CellValue::Uuid(Some(v))),
        ColumnFamily::Text => unreachable!("handled above"),
    };
    converted.ok_or_else(|| invalid(raw))
}

fn null_of(family: ColumnFamily) -> CellValue {
    match family {
        ColumnFamily::Boolean => CellValue::Boolean(None),
        ColumnFamily::TinyInt => CellValue::TinyInt(None),
        ColumnFamily::SmallInt => CellValue::SmallInt(None),
        ColumnFamily::Integer => CellValue::Integer(None),
        ColumnFamily::BigInt => CellValue::BigInt(None),
        ColumnFamily::Real => CellValue::Real(None),
        ColumnFamily::Double => CellValue::Double(None),
        ColumnFamily::Decimal => CellValue::Decimal(None),
        ColumnFamily::Date => CellValue::Date(None),
        ColumnFamily::Time => CellValue::Time(None),
        ColumnFamily::Timestamp => CellValue::Timestamp(None),
        ColumnFamily::TimestampTz => CellValue::TimestampTz(None),
        ColumnFamily::Uuid => CellValue::Uuid(None),
        ColumnFamily::Text => CellValue::Text(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;
    use time::macros::{date, datetime, time};

    #[test]
    fn table_names_from_file_names() {
        let t = |name: &str| table_name_for(Path::new(name), Some("dbo"));
        assert_eq!(
            t("Visitor.csv").unwrap(),
            TableName {
                schema: Some("dbo".into()),
                table: "Visitor".into()
            }
        );
        assert_eq!(t("sales.Visitor.csv").unwrap().to_string(), "sales.Visitor");
        assert_eq!(t("01.Visitor.csv").unwrap().to_string(), "dbo.Visitor");
        assert_eq!(t("01.sales.Visitor.csv").unwrap().to_string(), "sales.Visitor");
        assert!(matches!(
            t("01.a.b.c.csv"),
            Err(BulkImportError::InvalidFileName { .. })
        ));
        assert!(t("sales..csv").is_err());

        let no_schema = table_name_for(Path::new("02.visitor.csv"), None).unwrap();
        assert_eq!(no_schema.schema, None);
        assert_eq!(no_schema.to_string(), "visitor");
    }

    #[test]
    fn read_csv_handles_quotes_and_nulls() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("visitor.csv");
        fs::write(
            &path,
            "id, name ,note\n1,\"Doe, Jane\",\n2,,\"said \"\"hi\"\"\"\n",
        )
        .unwrap();

        let data = read_csv(&path, ',').unwrap();
        assert_eq!(data.headers, vec!["id", "name", "note"]);
        assert_eq!(
            data.rows,
            vec![
                vec![Some("1".into()), Some("Doe, Jane".into()), None],
                vec![Some("2".into()), None, Some("said \"hi\"".into())],
            ]
        );
        assert_eq!(data.column_index("NAME"), Some(1));
    }

    #[test]
    fn read_csv_custom_separator_and_ragged_rows() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("t.csv");
        fs::write(&path, "a;b\n1;2\n").unwrap();
        assert_eq!(read_csv(&path, ';').unwrap().rows.len(), 1);

        fs::write(&path, "a,b\n1,2,3\n").unwrap();
        assert!(matches!(read_csv(&path, ','), Err(BulkImportError::Csv(_))));
        assert!(matches!(
            read_csv(&path, '§'),
            Err(BulkImportError::InvalidSeparator('§'))
        ));
    }

    #[test]
    fn coerce_native_types() {
        let c = |family, value| coerce(family, "col", 1, Some(value)).unwrap();
        assert_eq!(c(ColumnFamily::Boolean, "TRUE"), CellValue::Boolean(Some(true)));
        assert_eq!(c(ColumnFamily::Boolean, "0"), CellValue::Boolean(Some(false)));
        assert_eq!(c(ColumnFamily::TinyInt, "255"), CellValue::TinyInt(Some(255)));
        assert_eq!(c(ColumnFamily::SmallInt, " -12 "), CellValue::SmallInt(Some(-12)));
        assert_eq!(c(ColumnFamily::Integer, "42"), CellValue::Integer(Some(42)));
        assert_eq!(
            c(ColumnFamily::BigInt, "9000000000"),
            CellValue::BigInt(Some(9_000_000_000))
        );
        assert_eq!(c(ColumnFamily::Double, "1.5"), CellValue::Double(Some(1.5)));
        assert_eq!(
            c(ColumnFamily::Decimal, "12.340"),
            CellValue::Decimal(Some(Decimal::new(12340, 3)))
        );
        assert_eq!(
            c(ColumnFamily::Date, "2024-02-29"),
            CellValue::Date(Some(date!(2024 - 02 - 29)))
        );
        assert_eq!(
            c(ColumnFamily::Time, "13:45:10"),
            CellValue::Time(Some(time!(13:45:10)))
        );
        assert_eq!(
            c(ColumnFamily::Timestamp, "2024-01-02T03:04:05"),
            CellValue::Timestamp(Some(datetime!(2024-01-02 03:04:05)))
        );
        assert_eq!(
            c(ColumnFamily::TimestampTz, "2024-01-02T03:04:05+02:00"),
            CellValue::TimestampTz(Some(datetime!(2024-01-02 03:04:05 +02:00)))
        );
        assert_eq!(
            c(ColumnFamily::TimestampTz, "2024-01-02 03:04:05"),
            CellValue::TimestampTz(Some(datetime!(2024-01-02 03:04:05 UTC)))
        );
        assert_eq!(
            c(ColumnFamily::Uuid, "67e55044-10b1-426f-9247-bb680e5fe0c8"),
            CellValue::Uuid(Some(
                Uuid::parse_str("67e55044-10b1-426f-9247-bb680e5fe0c8").unwrap()
            ))
        );
        assert_eq!(
            c(ColumnFamily::Text, " padded "),
            CellValue::Text(Some(" padded ".into()))
        );
    }

    #[test]
    fn coerce_nulls_keep_their_family() {
        assert_eq!(
            coerce(ColumnFamily::Integer, "id", 3, None).unwrap(),
            CellValue::Integer(None)
        );
        assert_eq!(
            coerce(ColumnFamily::Text, "name", 3, None).unwrap(),
            CellValue::Text(None)
        );
    }

    #[test]
    fn coerce_rejects_invalid_values() {
        let err = coerce(ColumnFamily::Integer, "id", 7, Some("seven")).unwrap_err();
        assert_eq!(
            err.to_string(),
            "row 7, column `id`: `seven` is not a valid integer"
        );
        assert!(coerce(ColumnFamily::TinyInt, "n", 1, Some("256")).is_err());
        assert!(coerce(ColumnFamily::Boolean, "b", 1, Some("maybe")).is_err());
        assert!(coerce(ColumnFamily::Date, "d", 1, Some("02/29/2024")).is_err());
        assert!(coerce(ColumnFamily::Uuid, "u", 1, Some("not-a-uuid")).is_err());
    }
}
