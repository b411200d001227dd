use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

/// 标签集合（按键有序）
pub type Tags = BTreeMap<String, String>;

/// 标准标签名
pub mod tags {
    pub const CHANNEL_ID: &str = "channel_id";
    pub const POINT_ID: &str = "point_id";
    pub const DATA_TYPE: &str = "data_type";
    pub const SOURCE: &str = "source";
    pub const QUALITY: &str = "quality";
    /// 时间戳来源：`source` 或 `collector`
    pub const TS_SOURCE: &str = "ts_source";
    /// modsrv 数据类别：`measurement` 或 `action`
    pub const KIND: &str = "kind";

    /// 标识一条时间序列的标签（不含质量等派生标签）
    pub const IDENTITY: [&str; 4] = [CHANNEL_ID, POINT_ID, DATA_TYPE, SOURCE];
}

/// 标准字段名
pub mod fields {
    pub const VALUE: &str = "value";
    /// 采集时源时间戳是否已超过 `stale_after_secs`（1.0 / 0.0）
    pub const STALE: &str = "stale";
}

/// 枚举解析错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct ParseVariantError {
    pub kind: &'static str,
    pub value: String,
}

/// 数据类型（四遥 + 模型）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DataType {
    /// 遥测
    #[serde(rename = "T")]
    Telemetry,
    /// 遥信
    #[serde(rename = "S")]
    Signal,
    /// 遥控
    #[serde(rename = "C")]
    Control,
    /// 遥调
    #[serde(rename = "A")]
    Adjustment,
    /// 物理模型
    #[serde(rename = "M")]
    Model,
}

impl DataType {
    pub const ALL: [DataType; 5] = [
        DataType::Telemetry,
        DataType::Signal,
        DataType::Control,
        DataType::Adjustment,
        DataType::Model,
    ];

    /// comsrv 通道键末尾的字母（T/S/C/A）
    pub fn from_channel_letter(letter: &str) -> Option<Self> {
        match letter {
            "T" => Some(DataType::Telemetry),
            "S" => Some(DataType::Signal),
            "C" => Some(DataType::Control),
            "A" => Some(DataType::Adjustment),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Telemetry => "T",
            DataType::Signal => "S",
            DataType::Control => "C",
            DataType::Adjustment => "A",
            DataType::Model => "M",
        }
    }

    /// 该类型数据落库的 measurement 名称
    pub fn measurement(&self) -> &'static str {
        match self {
            DataType::Telemetry => "telemetry",
            DataType::Signal => "signal",
            DataType::Control => "control",
            DataType::Adjustment => "adjustment",
            DataType::Model => "model",
        }
    }

    /// 产生该类型数据的源系统
    pub fn source(&self) -> Source {
        match self {
            DataType::Model => Source::Modsrv,
            _ => Source::Comsrv,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = ParseVariantError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "M" => Ok(DataType::Model),
            other => DataType::from_channel_letter(other).ok_or_else(|| ParseVariantError {
                kind: "data_type",
                value: s.to_string(),
            }),
        }
    }
}

/// 数据来源系统
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Comsrv,
    Modsrv,
}

impl Source {
    pub const ALL: [Source; 2] = [Source::Comsrv, Source::Modsrv];

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Comsrv => "comsrv",
            Source::Modsrv => "modsrv",
        }
    }

    /// 该来源可能产生的数据类型
    pub fn data_types(&self) -> &'static [DataType] {
        match self {
            Source::Comsrv => &[
                DataType::Telemetry,
                DataType::Signal,
                DataType::Control,
                DataType::Adjustment,
            ],
            Source::Modsrv => &[DataType::Model],
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = ParseVariantError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "comsrv" => Ok(Source::Comsrv),
            "modsrv" => Ok(Source::Modsrv),
            _ => Err(ParseVariantError {
                kind: "source",
                value: s.to_string(),
            }),
        }
    }
}

/// 数据质量
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Quality {
    Good,
    Bad,
}

impl Quality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Quality::Good => "GOOD",
            Quality::Bad => "BAD",
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 从键值存储读出的一条原始记录
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub key: String,
    pub fields: HashMap<String, String>,
}

impl RawRecord {
    pub fn new(key: impl Into<String>, fields: HashMap<String, String>) -> Self {
        Self {
            key: key.into(),
            fields,
        }
    }
}

/// 时序数据点
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub measurement: String,
    pub tags: Tags,
    pub fields: BTreeMap<String, f64>,
    pub timestamp: DateTime<Utc>,
}

impl DataPoint {
    pub fn new(measurement: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            measurement: measurement.into(),
            tags: Tags::new(),
            fields: BTreeMap::new(),
            timestamp,
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: f64) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    /// 主数值字段
    pub fn value(&self) -> Option<f64> {
        self.fields.get(fields::VALUE).copied()
    }

    pub fn data_type(&self) -> Option<DataType> {
        self.tag(tags::DATA_TYPE).and_then(|s| s.parse().ok())
    }

    /// 序列标识：measurement 加全部标签
    ///
    /// 同一序列键 + 同一时间戳的两次写入视为同一个点（后写覆盖）。
    pub fn series_key(&self) -> String {
        let mut key = self.measurement.clone();
        for (k, v) in &self.tags {
            key.push(',');
            key.push_str(k);
            key.push('=');
            key.push_str(v);
        }
        key
    }
}
