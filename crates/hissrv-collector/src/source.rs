use async_trait::async_trait;
use hissrv_config::RedisConfig;
use hissrv_types::KeyPattern;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// 数据源错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("source unavailable: {0}")]
    Unavailable(String),

    #[error("key {0} is not a hash")]
    WrongType(String),

    /// 单个键的回复无法解码，只影响该键
    #[error("key {0} could not be decoded: {1}")]
    Undecodable(String, String),
}

/// 一页 SCAN 结果；`cursor == 0` 表示遍历结束
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanPage {
    pub cursor: u64,
    pub keys: Vec<String>,
}

/// 键值存储读取接口
///
/// 只做扫描和读取，不含业务逻辑。每次从游标 0 开始都是一次全新的扫描。
#[async_trait]
pub trait SourceReader: Send + Sync {
    /// 按模式扫描一页键
    async fn scan_page(&self, pattern: &str, cursor: u64, count: usize)
        -> Result<ScanPage, SourceError>;

    /// 读取 Hash 的全部字段；键不存在时返回 `None`
    async fn read_hash(&self, key: &str) -> Result<Option<HashMap<String, String>>, SourceError>;

    /// 连通性探测
    async fn ping(&self) -> Result<(), SourceError>;
}

/// Redis 数据源
///
/// 复用一个多路复用连接，连接出错后在下一次调用时重建。
pub struct RedisSource {
    client: redis::Client,
    connection: Mutex<Option<redis::aio::MultiplexedConnection>>,
    timeout: Duration,
}

impl RedisSource {
    pub fn new(config: &RedisConfig) -> Result<Self, SourceError> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| SourceError::Unavailable(format!("invalid redis url: {}", e)))?;

        info!(url = %config.url, "Redis source configured");

        Ok(Self {
            client,
            connection: Mutex::new(None),
            timeout: config.timeout(),
        })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, SourceError> {
        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }

        let conn = tokio::time::timeout(self.timeout, self.client.get_multiplexed_async_connection())
            .await
            .map_err(|_| SourceError::Unavailable("redis connect timed out".to_string()))?
            .map_err(|e| SourceError::Unavailable(e.to_string()))?;
        debug!("Redis connection established");
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn reset(&self) {
        *self.connection.lock().await = None;
    }

    /// 在超时内执行命令，连接类错误会丢弃缓存的连接
    async fn query<T: redis::FromRedisValue>(&self, cmd: redis::Cmd, key: &str) -> Result<T, SourceError> {
        let mut conn = self.connection().await?;
        let result = tokio::time::timeout(self.timeout, cmd.query_async::<_, T>(&mut conn)).await;
        match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) if err.code() == Some("WRONGTYPE") => {
                Err(SourceError::WrongType(key.to_string()))
            }
            Ok(Err(err)) if err.kind() == redis::ErrorKind::TypeError => {
                Err(SourceError::Undecodable(key.to_string(), err.to_string()))
            }
            Ok(Err(err)) => {
                if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
                    warn!(error = %err, "Redis connection lost");
                    self.reset().await;
                }
                Err(SourceError::Unavailable(err.to_string()))
            }
            Err(_) => {
                self.reset().await;
                Err(SourceError::Unavailable(format!(
                    "redis command timed out after {:?}",
                    self.timeout
                )))
            }
        }
    }
}

#[async_trait]
impl SourceReader for RedisSource {
    async fn scan_page(
        &self,
        pattern: &str,
        cursor: u64,
        count: usize,
    ) -> Result<ScanPage, SourceError> {
        let mut cmd = redis::cmd("SCAN");
        cmd.arg(cursor).arg("MATCH").arg(pattern).arg("COUNT").arg(count);
        let (cursor, keys): (u64, Vec<String>) = self.query(cmd, pattern).await?;
        Ok(ScanPage { cursor, keys })
    }

    async fn read_hash(&self, key: &str) -> Result<Option<HashMap<String, String>>, SourceError> {
        let mut cmd = redis::cmd("HGETALL");
        cmd.arg(key);
        let raw: HashMap<Vec<u8>, Vec<u8>> = self.query(cmd, key).await?;
        // 不存在的键 HGETALL 返回空表
        Ok(if raw.is_empty() { None } else { Some(decode_hash(raw)) })
    }

    async fn ping(&self) -> Result<(), SourceError> {
        let _: String = self.query(redis::cmd("PING"), "").await?;
        Ok(())
    }
}

/// 按字段做有损 UTF-8 解码；非法字节变成替换字符，随后在数值解析时被计为丢弃
fn decode_hash(raw: HashMap<Vec<u8>, Vec<u8>>) -> HashMap<String, String> {
    raw.into_iter()
        .map(|(k, v)| {
            (
                String::from_utf8_lossy(&k).into_owned(),
                String::from_utf8_lossy(&v).into_owned(),
            )
        })
        .collect()
}

#[derive(Debug, Clone)]
enum MemoryValue {
    Hash(HashMap<String, String>),
    Other,
    Undecodable,
}

/// 内存数据源
///
/// 与 Redis 的 SCAN/HGETALL 语义一致，另外可以模拟不可用、读取延迟、
/// 扫描到已消失的键以及 SCAN 重复返回键。
#[derive(Default)]
pub struct MemorySource {
    entries: RwLock<BTreeMap<String, MemoryValue>>,
    /// SCAN 能看到但读取时已不存在的键
    phantoms: RwLock<Vec<String>>,
    unavailable: AtomicBool,
    duplicate_scans: AtomicBool,
    read_delay: RwLock<Option<Duration>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_hash<I, K, V>(&self, key: &str, fields: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let fields = fields
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self.entries
            .write()
            .await
            .insert(key.to_string(), MemoryValue::Hash(fields));
    }

    /// 写入一个非 Hash 类型的键
    pub async fn insert_other(&self, key: &str) {
        self.entries
            .write()
            .await
            .insert(key.to_string(), MemoryValue::Other);
    }

    /// 写入一个读取时无法解码的键
    pub async fn insert_undecodable(&self, key: &str) {
        self.entries
            .write()
            .await
            .insert(key.to_string(), MemoryValue::Undecodable);
    }

    pub async fn remove(&self, key: &str) {
        self.entries.write().await.remove(key);
    }

    pub async fn add_phantom(&self, key: &str) {
        self.phantoms.write().await.push(key.to_string());
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// 每页额外重复返回上一页的最后一个键
    pub fn set_duplicate_scans(&self, enabled: bool) {
        self.duplicate_scans.store(enabled, Ordering::SeqCst);
    }

    pub async fn set_read_delay(&self, delay: Option<Duration>) {
        *self.read_delay.write().await = delay;
    }

    fn check_available(&self) -> Result<(), SourceError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(SourceError::Unavailable("memory source marked unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SourceReader for MemorySource {
    async fn scan_page(
        &self,
        pattern: &str,
        cursor: u64,
        count: usize,
    ) -> Result<ScanPage, SourceError> {
        self.check_available()?;
        let pattern = KeyPattern::parse(pattern)
            .map_err(|e| SourceError::Unavailable(format!("bad pattern: {}", e)))?;

        let mut keys: Vec<String> = self.entries.read().await.keys().cloned().collect();
        keys.extend(self.phantoms.read().await.iter().cloned());
        keys.sort();
        keys.dedup();

        let start = cursor as usize;
        let end = (start + count.max(1)).min(keys.len());
        let mut page: Vec<String> = keys
            .get(start..end)
            .unwrap_or_default()
            .iter()
            .filter(|k| pattern.matches(k))
            .cloned()
            .collect();
        if self.duplicate_scans.load(Ordering::SeqCst) && start > 0 {
            if let Some(prev) = keys.get(start - 1).filter(|k| pattern.matches(k)) {
                page.push(prev.clone());
            }
        }

        let next = if end >= keys.len() { 0 } else { end as u64 };
        Ok(ScanPage {
            cursor: next,
            keys: page,
        })
    }

    async fn read_hash(&self, key: &str) -> Result<Option<HashMap<String, String>>, SourceError> {
        self.check_available()?;
        let delay = *self.read_delay.read().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        match self.entries.read().await.get(key) {
            Some(MemoryValue::Hash(fields)) => Ok(Some(fields.clone())),
            Some(MemoryValue::Other) => Err(SourceError::WrongType(key.to_string())),
            Some(MemoryValue::Undecodable) => Err(SourceError::Undecodable(
                key.to_string(),
                "invalid utf-8 in hash reply".to_string(),
            )),
            None => Ok(None),
        }
    }

    async fn ping(&self) -> Result<(), SourceError> {
        self.check_available()
    }
}

/// 惰性的按页扫描
///
/// 每个实例对应一次完整的扫描；SCAN 可能重复返回同一个键，这里只交出首次出现的键。
pub struct KeyScan<'a> {
    source: &'a dyn SourceReader,
    pattern: &'a str,
    count: usize,
    cursor: u64,
    finished: bool,
    seen: HashSet<String>,
}

impl<'a> KeyScan<'a> {
    pub fn new(source: &'a dyn SourceReader, pattern: &'a str, count: usize) -> Self {
        Self {
            source,
            pattern,
            count,
            cursor: 0,
            finished: false,
            seen: HashSet::new(),
        }
    }

    /// 下一页未见过的键；扫描结束时返回 `None`
    pub async fn next_page(&mut self) -> Result<Option<Vec<String>>, SourceError> {
        if self.finished {
            return Ok(None);
        }
        let page = self.source.scan_page(self.pattern, self.cursor, self.count).await?;
        self.cursor = page.cursor;
        self.finished = page.cursor == 0;

        let seen = &mut self.seen;
        Ok(Some(
            page.keys
                .into_iter()
                .filter(|k| seen.insert(k.clone()))
                .collect(),
        ))
    }

    /// 收集剩余的全部键
    pub async fn collect_keys(mut self) -> Result<Vec<String>, SourceError> {
        let mut keys = Vec::new();
        while let Some(page) = self.next_page().await? {
            keys.extend(page);
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_scan_pages_and_dedup() {
        let source = MemorySource::new();
        for channel in 1000..1010 {
            source
                .insert_hash(&format!("comsrv:{}:T", channel), [("1", "1.0")])
                .await;
        }
        source.insert_hash("comsrv:1000:S", [("1", "0")]).await;
        source.set_duplicate_scans(true);

        let first = source.scan_page("comsrv:*:T", 0, 4).await.unwrap();
        assert_ne!(first.cursor, 0);
        assert!(first.keys.len() <= 4);

        let keys = tokio_test::assert_ok!(KeyScan::new(&source, "comsrv:*:T", 3).collect_keys().await);
        assert_eq!(keys.len(), 10);
        assert!(keys.iter().all(|k| k.ends_with(":T")));
    }

    #[tokio::test]
    async fn test_memory_read_semantics() {
        let source = MemorySource::new();
        source.insert_hash("comsrv:1:T", [("1", "2.5")]).await;
        source.insert_other("comsrv:2:T").await;
        source.add_phantom("comsrv:3:T").await;

        assert_eq!(
            source.read_hash("comsrv:1:T").await.unwrap().unwrap().get("1"),
            Some(&"2.5".to_string())
        );
        assert_eq!(
            source.read_hash("comsrv:2:T").await,
            Err(SourceError::WrongType("comsrv:2:T".into()))
        );
        assert_eq!(source.read_hash("comsrv:3:T").await, Ok(None));

        source.insert_undecodable("comsrv:4:T").await;
        assert!(matches!(
            source.read_hash("comsrv:4:T").await,
            Err(SourceError::Undecodable(key, _)) if key == "comsrv:4:T"
        ));

        source.set_unavailable(true);
        assert!(matches!(source.ping().await, Err(SourceError::Unavailable(_))));
    }

    #[test]
    fn test_decode_hash_is_lossy_per_field() {
        let raw = HashMap::from([
            (b"1".to_vec(), b"25.5".to_vec()),
            (b"2".to_vec(), vec![0xff, 0xfe, b'1']),
        ]);
        let fields = decode_hash(raw);
        assert_eq!(fields.get("1").map(String::as_str), Some("25.5"));
        assert_eq!(fields.get("2").map(String::as_str), Some("\u{fffd}\u{fffd}1"));
        assert_eq!(crate::transform::parse_number(&fields["2"]), None);
    }
}
