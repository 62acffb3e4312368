//! Value types exchanged between devices, polling buffers and clients.
//!
//! Attribute values are decoded once into [`AttrData`] when they are
//! written into a polling buffer, so read paths never branch on the
//! protocol revision that produced them.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Name of the object type token for commands in admin requests.
pub const POLL_COMMAND: &str = "command";
/// Name of the object type token for attributes in admin requests.
pub const POLL_ATTRIBUTE: &str = "attribute";
/// Suffix on the object type marking a request issued by a polling worker.
pub const LOCAL_POLL_REQUEST: &str = "_l";
/// Sentinel attribute name expanding to every polled attribute.
pub const ALL_ATTR: &str = "All attributes";

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    to_ms(SystemTime::now())
}

pub fn to_ms(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DevState {
    On,
    Off,
    Close,
    Open,
    Insert,
    Extract,
    Moving,
    Standby,
    Fault,
    Init,
    Running,
    Alarm,
    Disable,
    Unknown,
}

impl std::fmt::Display for DevState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DevState::On => "ON",
            DevState::Off => "OFF",
            DevState::Close => "CLOSE",
            DevState::Open => "OPEN",
            DevState::Insert => "INSERT",
            DevState::Extract => "EXTRACT",
            DevState::Moving => "MOVING",
            DevState::Standby => "STANDBY",
            DevState::Fault => "FAULT",
            DevState::Init => "INIT",
            DevState::Running => "RUNNING",
            DevState::Alarm => "ALARM",
            DevState::Disable => "DISABLE",
            DevState::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttrQuality {
    Valid,
    Invalid,
    Alarm,
    Changing,
    Warning,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttrDataFormat {
    Scalar,
    Spectrum,
    Image,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttrWriteType {
    Read,
    ReadWithWrite,
    Write,
    ReadWrite,
}

/// Wire data type of an attribute.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttrDataType {
    DevBoolean,
    DevShort,
    DevLong,
    DevLong64,
    DevFloat,
    DevDouble,
    DevUshort,
    DevUchar,
    DevUlong,
    DevUlong64,
    DevString,
    DevState,
    DevEncoded,
}

/// Per-request directive selecting live-only, cache-only or
/// cache-with-live-fallback semantics.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DevSource {
    #[serde(rename = "DEV", alias = "DEVICE")]
    Device,
    #[serde(rename = "CACHE")]
    Cache,
    #[serde(rename = "CACHE_DEV")]
    CacheDevice,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DevEncoded {
    pub format: String,
    pub data: Vec<u8>,
}

/// Canonical attribute payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum AttrData {
    Boolean(Vec<bool>),
    Short(Vec<i16>),
    Long(Vec<i32>),
    Long64(Vec<i64>),
    Float(Vec<f32>),
    Double(Vec<f64>),
    UShort(Vec<u16>),
    UChar(Vec<u8>),
    ULong(Vec<u32>),
    ULong64(Vec<u64>),
    String(Vec<String>),
    StateScalar(DevState),
    StateArray(Vec<DevState>),
    Encoded(Vec<DevEncoded>),
    NoData,
}

impl AttrData {
    pub fn data_type(&self) -> Option<AttrDataType> {
        let t = match self {
            AttrData::Boolean(_) => AttrDataType::DevBoolean,
            AttrData::Short(_) => AttrDataType::DevShort,
            AttrData::Long(_) => AttrDataType::DevLong,
            AttrData::Long64(_) => AttrDataType::DevLong64,
            AttrData::Float(_) => AttrDataType::DevFloat,
            AttrData::Double(_) => AttrDataType::DevDouble,
            AttrData::UShort(_) => AttrDataType::DevUshort,
            AttrData::UChar(_) => AttrDataType::DevUchar,
            AttrData::ULong(_) => AttrDataType::DevUlong,
            AttrData::ULong64(_) => AttrDataType::DevUlong64,
            AttrData::String(_) => AttrDataType::DevString,
            AttrData::StateScalar(_) | AttrData::StateArray(_) => AttrDataType::DevState,
            AttrData::Encoded(_) => AttrDataType::DevEncoded,
            AttrData::NoData => return None,
        };
        Some(t)
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttrDim {
    pub dim_x: u32,
    pub dim_y: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AttributeValue {
    pub name: String,
    pub quality: AttrQuality,
    pub timestamp_ms: u64,
    pub r_dim: AttrDim,
    pub w_dim: AttrDim,
    pub data: AttrData,
}

impl AttributeValue {
    /// A valid scalar reading stamped with the current time.
    pub fn scalar(name: &str, data: AttrData) -> Self {
        Self {
            name: name.to_string(),
            quality: AttrQuality::Valid,
            timestamp_ms: now_ms(),
            r_dim: AttrDim { dim_x: 1, dim_y: 0 },
            w_dim: AttrDim::default(),
            data,
        }
    }

    /// A reading flagged invalid, which carries no data.
    pub fn invalid(name: &str) -> Self {
        Self {
            name: name.to_string(),
            quality: AttrQuality::Invalid,
            timestamp_ms: now_ms(),
            r_dim: AttrDim::default(),
            w_dim: AttrDim::default(),
            data: AttrData::NoData,
        }
    }
}

/// Command argument or result.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum CmdValue {
    #[default]
    Void,
    Boolean(bool),
    Short(i16),
    Long(i32),
    Long64(i64),
    Double(f64),
    String(String),
    State(DevState),
    LongArray(Vec<i32>),
    DoubleArray(Vec<f64>),
    StringArray(Vec<String>),
    LongStringArray(LongStringArray),
}

/// The `(long[], string[])` argument shape of the admin commands.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LongStringArray {
    #[serde(default)]
    pub lvalue: Vec<i64>,
    #[serde(default)]
    pub svalue: Vec<String>,
}

impl LongStringArray {
    pub fn new(lvalue: Vec<i64>, svalue: Vec<&str>) -> Self {
        Self {
            lvalue,
            svalue: svalue.into_iter().map(str::to_string).collect(),
        }
    }
}

/// One record of a command history read.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CmdHistory {
    pub timestamp_ms: u64,
    pub cmd_failed: bool,
    pub value: Option<CmdValue>,
    pub errors: Vec<crate::error::DevError>,
}

/// One record of an attribute history read.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AttrHistory {
    pub timestamp_ms: u64,
    pub attr_failed: bool,
    pub value: Option<AttributeValue>,
    pub errors: Vec<crate::error::DevError>,
}
