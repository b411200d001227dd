use chrono::{DateTime, Duration, Utc};
use hissrv_config::{CollectionConfig, MissingTimestampPolicy};
use hissrv_types::{fields, tags, DataPoint, DataType, DropReason, Quality, RawRecord};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// 大于该值的时间戳按毫秒解释
const MILLIS_THRESHOLD: f64 = 1e11;

/// modsrv 模型键的类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    Measurement,
    Action,
}

impl ModelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::Measurement => "measurement",
            ModelKind::Action => "action",
        }
    }
}

/// 已知的键形态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyShape {
    /// `comsrv:<channel_id>:<T|S|C|A>`
    Channel {
        channel_id: String,
        data_type: DataType,
    },
    /// `modsrv:model:<name>:measurement|action`
    Model { name: String, kind: ModelKind },
}

impl KeyShape {
    pub fn parse(key: &str) -> Option<Self> {
        let parts: Vec<&str> = key.split(':').collect();
        match parts.as_slice() {
            ["comsrv", channel_id, letter] if !channel_id.is_empty() => {
                DataType::from_channel_letter(letter).map(|data_type| KeyShape::Channel {
                    channel_id: channel_id.to_string(),
                    data_type,
                })
            }
            ["modsrv", "model", name, kind] if !name.is_empty() => {
                let kind = match *kind {
                    "measurement" => ModelKind::Measurement,
                    "action" => ModelKind::Action,
                    _ => return None,
                };
                Some(KeyShape::Model {
                    name: name.to_string(),
                    kind,
                })
            }
            _ => None,
        }
    }

    pub fn data_type(&self) -> DataType {
        match self {
            KeyShape::Channel { data_type, .. } => *data_type,
            KeyShape::Model { .. } => DataType::Model,
        }
    }
}

impl fmt::Display for KeyShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyShape::Channel {
                channel_id,
                data_type,
            } => write!(f, "comsrv:{}:{}", channel_id, data_type),
            KeyShape::Model { name, kind } => write!(f, "modsrv:model:{}:{}", name, kind.as_str()),
        }
    }
}

/// 单条记录的转换结果
#[derive(Debug, Clone, Default)]
pub struct Transformed {
    pub points: Vec<DataPoint>,
    pub dropped: BTreeMap<DropReason, u64>,
    /// 未使用源时间戳（缺失或无法解析）
    pub used_collection_time: bool,
}

impl Transformed {
    fn count_drop(&mut self, reason: DropReason) {
        *self.dropped.entry(reason).or_insert(0) += 1;
    }
}

/// 时间戳解析结果
#[derive(Debug, Clone, Copy, PartialEq)]
enum Stamp {
    Source(DateTime<Utc>),
    Invalid,
    Missing,
}

/// 原始记录到数据点的转换器
///
/// 纯函数：相同的输入和周期开始时间总是得到相同的输出。
#[derive(Debug, Clone)]
pub struct PointTransformer {
    timestamp_fields: Vec<String>,
    missing_timestamp: MissingTimestampPolicy,
    stale_after: Duration,
}

impl PointTransformer {
    pub fn new(config: &CollectionConfig) -> Self {
        Self {
            timestamp_fields: config.timestamp_fields.clone(),
            missing_timestamp: config.missing_timestamp,
            stale_after: Duration::seconds(config.stale_after_secs as i64),
        }
    }

    /// 转换一条记录
    pub fn transform(&self, record: &RawRecord, cycle_start: DateTime<Utc>) -> Transformed {
        let mut out = Transformed::default();
        let Some(shape) = KeyShape::parse(&record.key) else {
            out.count_drop(DropReason::UnknownKeyShape);
            return out;
        };

        // 质量标签只取决于记录本身；新鲜度随周期变化，只能作为字段写入，
        // 否则同一读数会在不同周期落入不同序列
        let (timestamp, quality, ts_source) = match self.stamp(record) {
            Stamp::Source(ts) => (ts, Quality::Good, "source"),
            Stamp::Invalid => {
                out.used_collection_time = true;
                (cycle_start, Quality::Bad, "collector")
            }
            Stamp::Missing => match self.missing_timestamp {
                MissingTimestampPolicy::Drop => {
                    out.count_drop(DropReason::MissingTimestamp);
                    return out;
                }
                MissingTimestampPolicy::CollectionTime => {
                    out.used_collection_time = true;
                    (cycle_start, Quality::Good, "collector")
                }
            },
        };

        let stale = if cycle_start - timestamp > self.stale_after {
            1.0
        } else {
            0.0
        };

        let data_type = shape.data_type();
        // 按字段名排序，保证输出稳定
        let mut names: Vec<&String> = record.fields.keys().collect();
        names.sort();

        for name in names {
            let skipped = match shape {
                KeyShape::Channel { .. } => name.starts_with('_'),
                KeyShape::Model { .. } => name.starts_with("__"),
            };
            if skipped || self.timestamp_fields.iter().any(|f| f == name) {
                continue;
            }

            let raw = &record.fields[name];
            let base = DataPoint::new(data_type.measurement(), timestamp)
                .with_tag(tags::DATA_TYPE, data_type.as_str())
                .with_tag(tags::SOURCE, data_type.source().as_str())
                .with_tag(tags::QUALITY, quality.as_str())
                .with_tag(tags::TS_SOURCE, ts_source);

            let point = match &shape {
                KeyShape::Channel { channel_id, .. } => parse_number(raw).map(|value| {
                    base.with_tag(tags::CHANNEL_ID, channel_id.as_str())
                        .with_tag(tags::POINT_ID, name.as_str())
                        .with_field(fields::VALUE, value)
                }),
                KeyShape::Model { name: model, kind } => parse_model_fields(raw).map(|values| {
                    let mut point = base
                        .with_tag(tags::CHANNEL_ID, model.as_str())
                        .with_tag(tags::POINT_ID, format!("{}.{}", model, name))
                        .with_tag(tags::KIND, kind.as_str());
                    point.fields = values;
                    point
                }),
            };

            match point {
                Some(point) => out.points.push(point.with_field(fields::STALE, stale)),
                None => out.count_drop(DropReason::UnparseableValue),
            }
        }
        out
    }

    fn stamp(&self, record: &RawRecord) -> Stamp {
        for field in &self.timestamp_fields {
            if let Some(raw) = record.fields.get(field) {
                return parse_timestamp(raw).map_or(Stamp::Invalid, Stamp::Source);
            }
        }
        Stamp::Missing
    }
}

/// 解析有限数值；空串、NaN、无穷大均视为无法解析
pub fn parse_number(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

/// 解析 Unix 时间戳（秒，可带小数；大于 1e11 按毫秒）
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let value = parse_number(raw).filter(|v| *v > 0.0)?;
    if value > MILLIS_THRESHOLD {
        DateTime::from_timestamp_millis(value as i64)
    } else {
        let secs = value.trunc() as i64;
        let nanos = ((value - value.trunc()) * 1e9).round() as u32;
        DateTime::from_timestamp(secs, nanos.min(999_999_999))
    }
}

/// modsrv 字段：单个数值，或由数值组成且包含 `value` 的 JSON 对象
fn parse_model_fields(raw: &str) -> Option<BTreeMap<String, f64>> {
    if let Some(value) = parse_number(raw) {
        return Some(BTreeMap::from([(fields::VALUE.to_string(), value)]));
    }

    let Ok(Value::Object(map)) = serde_json::from_str::<Value>(raw.trim()) else {
        return None;
    };
    let mut values = BTreeMap::new();
    for (key, v) in map {
        let number = match v {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => parse_number(&s),
            _ => None,
        }
        .filter(|n| n.is_finite())?;
        values.insert(key, number);
    }
    values.contains_key(fields::VALUE).then_some(values)
}
