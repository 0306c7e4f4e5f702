//! CR1000X datalogger payload format
//!
//! Devices and the live uploader both publish readings in the JSON layout a
//! Campbell Scientific CR1000X logger emits: a `head` describing the station
//! and its fields, followed by `data` rows of `time` plus values in field
//! order.

use crate::{
    error::{IotSwarmError, IotSwarmResult},
    types::Record,
};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Device model reported in the payload environment
pub const DEFAULT_DEVICE_TYPE: &str = "CR1000X";

const TRANSACTION: u32 = 0;
const SIGNATURE: u32 = 111_111;

/// XML schema data types, declared in increasing rank
///
/// When a column holds mixed values the highest-ranked type wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum XsdType {
    #[serde(rename = "xsi:nil")]
    Nil,
    #[serde(rename = "xsd:string")]
    String,
    #[serde(rename = "xsd:boolean")]
    Boolean,
    #[serde(rename = "xsd:dateTime")]
    DateTime,
    #[serde(rename = "xsd:short")]
    Short,
    #[serde(rename = "xsd:int")]
    Int,
    #[serde(rename = "xsd:long")]
    Long,
    #[serde(rename = "xsd:integer")]
    Integer,
    #[serde(rename = "xsd:float")]
    Float,
    #[serde(rename = "xsd:double")]
    Double,
}

impl XsdType {
    pub fn as_str(&self) -> &'static str {
        match self {
            XsdType::Nil => "xsi:nil",
            XsdType::String => "xsd:string",
            XsdType::Boolean => "xsd:boolean",
            XsdType::DateTime => "xsd:dateTime",
            XsdType::Short => "xsd:short",
            XsdType::Int => "xsd:int",
            XsdType::Long => "xsd:long",
            XsdType::Integer => "xsd:integer",
            XsdType::Float => "xsd:float",
            XsdType::Double => "xsd:double",
        }
    }

    /// Type of a single JSON value
    pub fn of_value(value: &Value) -> Self {
        match value {
            Value::Null => XsdType::Nil,
            Value::Bool(_) => XsdType::Boolean,
            Value::String(s) => {
                if looks_like_datetime(s) {
                    XsdType::DateTime
                } else {
                    XsdType::String
                }
            }
            Value::Number(n) => {
                if let Some(v) = n.as_i64() {
                    Self::of_integer(v as i128)
                } else if let Some(v) = n.as_u64() {
                    Self::of_integer(v as i128)
                } else {
                    Self::of_float(n.as_f64().unwrap_or_default())
                }
            }
            Value::Array(items) => Self::of_values(items.iter()),
            Value::Object(_) => XsdType::String,
        }
    }

    /// Highest-ranked type across a column of values
    pub fn of_values<'a>(values: impl IntoIterator<Item = &'a Value>) -> Self {
        values
            .into_iter()
            .map(Self::of_value)
            .max()
            .unwrap_or(XsdType::Nil)
    }

    fn of_integer(v: i128) -> Self {
        // Zero ranks as int, matching the logger firmware
        if v != 0 && (i16::MIN as i128..=i16::MAX as i128).contains(&v) {
            XsdType::Short
        } else if (i32::MIN as i128..=i32::MAX as i128).contains(&v) {
            XsdType::Int
        } else if (i64::MIN as i128..=i64::MAX as i128).contains(&v) {
            XsdType::Long
        } else {
            XsdType::Integer
        }
    }

    fn of_float(v: f64) -> Self {
        let magnitude = v.abs();
        if magnitude > 0.0
            && (magnitude < f32::MIN_POSITIVE as f64 || magnitude > f32::MAX as f64)
        {
            XsdType::Double
        } else {
            XsdType::Float
        }
    }
}

fn looks_like_datetime(s: &str) -> bool {
    DateTime::parse_from_rfc3339(s).is_ok()
        || NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f").is_ok()
        || NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f").is_ok()
        || NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()
}

/// Aggregation process implied by a column name suffix
pub fn process_for_field(name: &str) -> &'static str {
    let name = name.to_lowercase();
    const SUFFIXES: [(&str, &str); 7] = [
        ("_std", "Std"),
        ("_avg", "Avg"),
        ("_max", "Max"),
        ("_min", "Min"),
        ("_mom", "Mom"),
        ("_tot", "Tot"),
        ("_cov", "Cov"),
    ];

    SUFFIXES
        .iter()
        .find(|(suffix, _)| name.ends_with(suffix))
        .map(|(_, process)| *process)
        .unwrap_or("Smp")
}

/// Serial number derived from a site id: code points joined by dashes
pub fn serial_number_for_site(site_id: &str) -> String {
    site_id
        .chars()
        .map(|c| (c as u32).to_string())
        .collect::<Vec<_>>()
        .join("-")
}

/// Field description in the payload head
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: XsdType,
    pub units: String,
    pub process: String,
    pub settable: bool,
}

impl Field {
    /// Describe a column from its name and values
    pub fn from_values<'a>(name: &str, values: impl IntoIterator<Item = &'a Value>) -> Self {
        Self {
            name: name.to_string(),
            data_type: XsdType::of_values(values),
            units: String::new(),
            process: process_for_field(name).to_string(),
            settable: false,
        }
    }
}

/// Station description in the payload head
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    pub station_name: String,
    pub table_name: String,
    pub model: String,
    pub serial_no: String,
    pub os_version: String,
    pub prog_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadHead {
    pub transaction: u32,
    pub signature: u32,
    pub environment: Environment,
    pub fields: Vec<Field>,
}

/// One reading row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadRow {
    pub time: DateTime<Utc>,
    pub vals: Vec<Value>,
}

/// A complete CR1000X message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub head: PayloadHead,
    pub data: Vec<PayloadRow>,
}

impl Payload {
    /// Station the payload belongs to
    pub fn station(&self) -> &str {
        &self.head.environment.station_name
    }

    /// Time of the newest row
    pub fn latest_time(&self) -> Option<DateTime<Utc>> {
        self.data.iter().map(|row| row.time).max()
    }

    pub fn row_count(&self) -> usize {
        self.data.len()
    }

    pub fn to_json_bytes(&self) -> IotSwarmResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Datalogger identity reported in every payload a device sends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceProfile {
    pub device_type: String,
    /// Derived from the site id when not set
    pub serial_number: Option<String>,
    pub os_version: String,
    pub program_name: String,
    pub table_name: String,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self {
            device_type: DEFAULT_DEVICE_TYPE.to_string(),
            serial_number: None,
            os_version: format!("{DEFAULT_DEVICE_TYPE}.Std.07.02"),
            program_name: format!("CPU:iotswarm-{}.CR1X", env!("CARGO_PKG_VERSION")),
            table_name: "default".to_string(),
        }
    }
}

/// Formats records into CR1000X payloads for a given device profile
#[derive(Debug, Clone, Default)]
pub struct PayloadBuilder {
    profile: DeviceProfile,
}

impl PayloadBuilder {
    pub fn new(profile: DeviceProfile) -> Self {
        Self { profile }
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    /// Build one payload holding `records` as rows, oldest first
    ///
    /// Every record must carry the same set of columns.
    pub fn build(&self, site_id: &str, records: &[Record]) -> IotSwarmResult<Payload> {
        let first = records
            .first()
            .ok_or_else(|| IotSwarmError::serialization("payload needs at least one record"))?;

        let columns: Vec<&String> = first.values.keys().collect();
        for record in records {
            let same = record.values.len() == columns.len()
                && columns.iter().all(|c| record.values.contains_key(c.as_str()));
            if !same {
                return Err(IotSwarmError::serialization(format!(
                    "each payload row must have the same columns (site {site_id}, row at {})",
                    record.timestamp
                )));
            }
        }

        let mut rows: Vec<&Record> = records.iter().collect();
        rows.sort_by_key(|r| r.timestamp);

        let fields = columns
            .iter()
            .map(|column| Field::from_values(column, rows.iter().map(|r| &r.values[column.as_str()])))
            .collect();

        let data = rows
            .iter()
            .map(|record| PayloadRow {
                time: record.timestamp,
                vals: columns
                    .iter()
                    .map(|c| record.values[c.as_str()].clone())
                    .collect(),
            })
            .collect();

        let serial_no = self
            .profile
            .serial_number
            .clone()
            .unwrap_or_else(|| serial_number_for_site(site_id));

        Ok(Payload {
            head: PayloadHead {
                transaction: TRANSACTION,
                signature: SIGNATURE,
                environment: Environment {
                    station_name: site_id.to_string(),
                    table_name: self.profile.table_name.clone(),
                    model: self.profile.device_type.clone(),
                    serial_no,
                    os_version: self.profile.os_version.clone(),
                    prog_name: self.profile.program_name.clone(),
                },
                fields,
            },
            data,
        })
    }
}
