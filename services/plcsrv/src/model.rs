//! Device and tag configuration entities plus the live tag value type

use crate::error::{PlcError, Result};
use crate::protocol::codec::{CodecError, STRING_MAX_LEN};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Highest addressable byte in a DB (21-bit byte address on the wire)
pub const MAX_BYTE_OFFSET: i64 = 0x1F_FFFF;
pub const MAX_RACK: i32 = 7;
pub const MAX_SLOT: i32 = 31;

// ============================================================================
// Device
// ============================================================================

/// Device liveness as reported by the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    #[default]
    Unknown,
    Online,
    Offline,
    Reconnecting,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Reconnecting => "reconnecting",
        }
    }

    /// Lenient parse used for stored status rows; unknown text maps to `Unknown`
    pub fn parse_lossy(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "online" => Self::Online,
            "offline" => Self::Offline,
            "reconnecting" => Self::Reconnecting,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    /// `host` or `host:port`
    pub address: String,
    #[serde(default)]
    pub rack: i32,
    #[serde(default)]
    pub slot: i32,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub status: DeviceStatus,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

impl Device {
    pub fn new(name: impl Into<String>, address: impl Into<String>, rack: i32, slot: i32) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            name: name.into(),
            address: address.into(),
            rack,
            slot,
            active: true,
            status: DeviceStatus::Unknown,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether a running session for `self` must be torn down to serve `other`
    pub fn connection_changed(&self, other: &Device) -> bool {
        self.address != other.address
            || self.rack != other.rack
            || self.slot != other.slot
            || self.name != other.name
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(PlcError::Validation("device name is required".into()));
        }
        if self.address.trim().is_empty() {
            return Err(PlcError::Validation("device address is required".into()));
        }
        if !(0..=MAX_RACK).contains(&self.rack) {
            return Err(PlcError::Validation(format!(
                "rack {} out of range 0..={}",
                self.rack, MAX_RACK
            )));
        }
        if !(0..=MAX_SLOT).contains(&self.slot) {
            return Err(PlcError::Validation(format!(
                "slot {} out of range 0..={}",
                self.slot, MAX_SLOT
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Data types
// ============================================================================

/// Declared tag data type
///
/// Canonical names are the width-explicit ones; the IEC names are accepted
/// as aliases on input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Bool,
    #[serde(alias = "sint")]
    Int8,
    #[serde(alias = "usint")]
    UInt8,
    #[serde(alias = "int")]
    Int16,
    #[serde(alias = "word")]
    UInt16,
    #[serde(alias = "dint")]
    Int32,
    #[serde(alias = "dword")]
    UInt32,
    #[serde(alias = "real")]
    Float32,
    String,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Int8 => "int8",
            Self::UInt8 => "uint8",
            Self::Int16 => "int16",
            Self::UInt16 => "uint16",
            Self::Int32 => "int32",
            Self::UInt32 => "uint32",
            Self::Float32 => "float32",
            Self::String => "string",
        }
    }

    /// Number of bytes moved on the wire for one value
    pub fn wire_size(&self) -> usize {
        match self {
            Self::Bool | Self::Int8 | Self::UInt8 => 1,
            Self::Int16 | Self::UInt16 => 2,
            Self::Int32 | Self::UInt32 | Self::Float32 => 4,
            Self::String => STRING_MAX_LEN + 2,
        }
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            Self::Int8 | Self::UInt8 | Self::Int16 | Self::UInt16 | Self::Int32 | Self::UInt32
        )
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = PlcError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "bool" => Self::Bool,
            "sint" | "int8" => Self::Int8,
            "usint" | "uint8" => Self::UInt8,
            "int" | "int16" => Self::Int16,
            "word" | "uint16" => Self::UInt16,
            "dint" | "int32" => Self::Int32,
            "dword" | "uint32" => Self::UInt32,
            "real" | "float32" => Self::Float32,
            "string" => Self::String,
            other => {
                return Err(PlcError::Validation(format!(
                    "unsupported data type '{}'",
                    other
                )))
            },
        })
    }
}

// ============================================================================
// Tag
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    #[serde(default)]
    pub id: i64,
    pub device_id: i64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub db_number: i32,
    pub byte_offset: i64,
    #[serde(default)]
    pub bit_offset: i32,
    pub data_type: DataType,
    #[serde(default = "default_scan_rate")]
    pub scan_rate_ms: i64,
    #[serde(default)]
    pub monitor_changes: bool,
    #[serde(default)]
    pub can_write: bool,
    #[serde(default = "default_true")]
    pub active: bool,
    /// Last polled value, never persisted
    #[serde(skip)]
    pub last_value: Option<TagValue>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_scan_rate() -> i64 {
    1000
}

impl Tag {
    pub fn new(
        device_id: i64,
        name: impl Into<String>,
        data_type: DataType,
        db_number: i32,
        byte_offset: i64,
        bit_offset: i32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            device_id,
            name: name.into(),
            description: String::new(),
            db_number,
            byte_offset,
            bit_offset,
            data_type,
            scan_rate_ms: default_scan_rate(),
            monitor_changes: true,
            can_write: false,
            active: true,
            last_value: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Enforce the addressing invariants before a tag reaches either store
    ///
    /// Non-bool tags get `bit_offset` normalised to 0; bool tags must address
    /// a bit in `0..=7`.
    pub fn normalize_and_validate(&mut self) -> Result<()> {
        self.name = self.name.trim().to_string();
        if self.name.is_empty() {
            return Err(PlcError::Validation("tag name is required".into()));
        }
        if !(0..=i32::from(u16::MAX)).contains(&self.db_number) {
            return Err(PlcError::Validation(format!(
                "db_number {} out of range 0..=65535",
                self.db_number
            )));
        }
        if !(0..=MAX_BYTE_OFFSET).contains(&self.byte_offset) {
            return Err(PlcError::Validation(format!(
                "byte_offset {} out of range 0..={}",
                self.byte_offset, MAX_BYTE_OFFSET
            )));
        }
        if self.bit_offset < 0 {
            return Err(PlcError::Validation(format!(
                "bit_offset {} must not be negative",
                self.bit_offset
            )));
        }
        if self.data_type == DataType::Bool {
            if self.bit_offset > 7 {
                return Err(PlcError::Validation(format!(
                    "bit_offset {} out of range 0..=7 for bool tag",
                    self.bit_offset
                )));
            }
        } else {
            self.bit_offset = 0;
        }
        if self.scan_rate_ms <= 0 {
            return Err(PlcError::Validation(format!(
                "scan_rate_ms {} must be positive",
                self.scan_rate_ms
            )));
        }
        Ok(())
    }

    /// Wire address: `(db, byte, bit)`; only valid after validation
    pub fn address(&self) -> (u16, u32, u8) {
        (
            self.db_number as u16,
            self.byte_offset as u32,
            self.bit_offset as u8,
        )
    }
}

// ============================================================================
// TagValue
// ============================================================================

/// A decoded tag value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TagValue {
    Bool(bool),
    Int8(i8),
    UInt8(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Float32(f32),
    String(String),
}

impl TagValue {
    pub fn data_type(&self) -> DataType {
        match self {
            Self::Bool(_) => DataType::Bool,
            Self::Int8(_) => DataType::Int8,
            Self::UInt8(_) => DataType::UInt8,
            Self::Int16(_) => DataType::Int16,
            Self::UInt16(_) => DataType::UInt16,
            Self::Int32(_) => DataType::Int32,
            Self::UInt32(_) => DataType::UInt32,
            Self::Float32(_) => DataType::Float32,
            Self::String(_) => DataType::String,
        }
    }

    /// Numeric view; bool maps to 0/1, strings have none
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Self::Int8(v) => Some(f64::from(*v)),
            Self::UInt8(v) => Some(f64::from(*v)),
            Self::Int16(v) => Some(f64::from(*v)),
            Self::UInt16(v) => Some(f64::from(*v)),
            Self::Int32(v) => Some(f64::from(*v)),
            Self::UInt32(v) => Some(f64::from(*v)),
            Self::Float32(v) => Some(f64::from(*v)),
            Self::String(_) => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// Convert a dynamically-typed input into `target`
    ///
    /// Floats narrowing to integers truncate toward zero; anything outside
    /// the target range is an error rather than a wrap.
    pub fn convert(
        input: &serde_json::Value,
        target: DataType,
    ) -> std::result::Result<TagValue, CodecError> {
        use serde_json::Value;

        let from = json_kind(input);
        let conversion = || CodecError::Conversion {
            from,
            to: target.as_str(),
        };

        match target {
            DataType::Bool => match input {
                Value::Bool(b) => Ok(TagValue::Bool(*b)),
                Value::Number(n) => n
                    .as_f64()
                    .map(|v| TagValue::Bool(v != 0.0))
                    .ok_or_else(conversion),
                Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                    "true" | "1" | "on" => Ok(TagValue::Bool(true)),
                    "false" | "0" | "off" => Ok(TagValue::Bool(false)),
                    _ => Err(conversion()),
                },
                _ => Err(conversion()),
            },
            DataType::Float32 => {
                let v = match input {
                    Value::Bool(b) => f64::from(u8::from(*b)),
                    Value::Number(n) => n.as_f64().ok_or_else(conversion)?,
                    Value::String(s) => s.trim().parse::<f64>().map_err(|_| conversion())?,
                    _ => return Err(conversion()),
                };
                if !v.is_finite() || v.abs() > f64::from(f32::MAX) {
                    return Err(CodecError::OutOfRange {
                        value: v.to_string(),
                        target: target.as_str(),
                    });
                }
                Ok(TagValue::Float32(v as f32))
            },
            DataType::String => {
                let s = match input {
                    Value::String(s) => s.clone(),
                    Value::Number(n) => n.to_string(),
                    Value::Bool(b) => b.to_string(),
                    _ => return Err(conversion()),
                };
                if s.len() > STRING_MAX_LEN {
                    return Err(CodecError::OutOfRange {
                        value: format!("{} bytes", s.len()),
                        target: target.as_str(),
                    });
                }
                Ok(TagValue::String(s))
            },
            _ => {
                let n = json_to_integer(input).ok_or_else(conversion)??;
                integer_to_value(n, target)
            },
        }
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    use serde_json::Value;
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Integer view of a JSON scalar
///
/// `None` means the input kind has no integer reading at all; `Some(Err)`
/// means it does but the value cannot be represented.
fn json_to_integer(
    input: &serde_json::Value,
) -> Option<std::result::Result<i128, CodecError>> {
    use serde_json::Value;

    let from_f64 = |v: f64| {
        if !v.is_finite() || v.abs() >= 1e30 {
            return Err(CodecError::OutOfRange {
                value: v.to_string(),
                target: "integer",
            });
        }
        Ok(v.trunc() as i128)
    };

    match input {
        Value::Bool(b) => Some(Ok(i128::from(*b))),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(Ok(i128::from(i)))
            } else if let Some(u) = n.as_u64() {
                Some(Ok(i128::from(u)))
            } else {
                n.as_f64().map(from_f64)
            }
        },
        Value::String(s) => {
            let s = s.trim();
            if let Ok(i) = s.parse::<i128>() {
                Some(Ok(i))
            } else {
                s.parse::<f64>().ok().map(from_f64)
            }
        },
        _ => None,
    }
}

fn integer_to_value(n: i128, target: DataType) -> std::result::Result<TagValue, CodecError> {
    let out_of_range = || CodecError::OutOfRange {
        value: n.to_string(),
        target: target.as_str(),
    };
    Ok(match target {
        DataType::Int8 => TagValue::Int8(i8::try_from(n).map_err(|_| out_of_range())?),
        DataType::UInt8 => TagValue::UInt8(u8::try_from(n).map_err(|_| out_of_range())?),
        DataType::Int16 => TagValue::Int16(i16::try_from(n).map_err(|_| out_of_range())?),
        DataType::UInt16 => TagValue::UInt16(u16::try_from(n).map_err(|_| out_of_range())?),
        DataType::Int32 => TagValue::Int32(i32::try_from(n).map_err(|_| out_of_range())?),
        DataType::UInt32 => TagValue::UInt32(u32::try_from(n).map_err(|_| out_of_range())?),
        DataType::Bool | DataType::Float32 | DataType::String => {
            return Err(CodecError::UnsupportedType(target.as_str().to_string()))
        },
    })
}

impl fmt::Display for TagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{}", v),
            Self::Int8(v) => write!(f, "{}", v),
            Self::UInt8(v) => write!(f, "{}", v),
            Self::Int16(v) => write!(f, "{}", v),
            Self::UInt16(v) => write!(f, "{}", v),
            Self::Int32(v) => write!(f, "{}", v),
            Self::UInt32(v) => write!(f, "{}", v),
            Self::Float32(v) => write!(f, "{}", v),
            Self::String(v) => f.write_str(v),
        }
    }
}
