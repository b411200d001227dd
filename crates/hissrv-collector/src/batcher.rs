use hissrv_config::CollectionConfig;
use hissrv_timeseries::{WriteError, Writer};
use hissrv_types::DataPoint;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// 数据点批处理缓冲区
///
/// 满 `batch_size` 或距上次刷新超过 `flush_interval` 时应刷新。刷新按 `batch_size`
/// 分块写入，每块单独确认：确认成功的块立即从缓冲区移除，失败的块及其后的点原样保留。
/// 缓冲区不超过一个块时，刷新要么全部写入，要么缓冲区不变。
/// 缓冲区达到硬上限后淘汰最旧的点。
#[derive(Debug)]
pub struct Batcher {
    buffer: VecDeque<DataPoint>,
    batch_size: usize,
    max_buffered: usize,
    flush_interval: Duration,
    last_flush: Instant,
    evicted: u64,
}

impl Batcher {
    pub fn new(batch_size: usize, max_buffered: usize, flush_interval: Duration) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            buffer: VecDeque::with_capacity(batch_size),
            batch_size,
            max_buffered: max_buffered.max(batch_size),
            flush_interval,
            last_flush: Instant::now(),
            evicted: 0,
        }
    }

    pub fn from_config(config: &CollectionConfig) -> Self {
        Self::new(config.batch_size, config.max_buffered(), config.flush_interval())
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// 加入一个点；缓冲区已满时淘汰最旧的点
    pub fn add(&mut self, point: DataPoint) {
        if self.buffer.len() >= self.max_buffered {
            self.buffer.pop_front();
            self.evicted += 1;
        }
        self.buffer.push_back(point);
    }

    /// 是否达到刷新条件；空缓冲区永远不需要刷新
    pub fn should_flush(&self) -> bool {
        if self.buffer.is_empty() {
            return false;
        }
        self.buffer.len() >= self.batch_size || self.last_flush.elapsed() >= self.flush_interval
    }

    /// 取走自上次调用以来被淘汰的点数
    pub fn take_evicted(&mut self) -> u64 {
        std::mem::take(&mut self.evicted)
    }

    /// 将缓冲区全部交给写入器，返回成功写入的点数
    pub async fn flush(&mut self, writer: &Writer) -> Result<usize, WriteError> {
        if self.buffer.is_empty() {
            return Ok(0);
        }
        self.last_flush = Instant::now();

        let mut written = 0;
        while !self.buffer.is_empty() {
            let chunk_len = self.batch_size.min(self.buffer.len());
            let chunk = &self.buffer.make_contiguous()[..chunk_len];
            if let Err(err) = writer.write_batch(chunk).await {
                warn!(
                    error = %err,
                    written = written,
                    buffered = self.buffer.len(),
                    "Flush failed, keeping points buffered"
                );
                return Err(err);
            }
            self.buffer.drain(..chunk_len);
            written += chunk_len;
        }

        debug!(points = written, "Batch flushed");
        Ok(written)
    }
}
