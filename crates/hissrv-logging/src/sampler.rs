use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// 采样策略
#[derive(Debug, Clone)]
pub enum SamplingStrategy {
    /// 始终记录
    Always,

    /// 从不记录
    Never,

    /// 速率限制（每秒最多 N 条）
    RateLimit(u32),
}

/// 日志采样器
///
/// 用于逐条记录级别的告警（例如字段解析失败），避免一批坏数据刷屏。
/// 被抑制的条数可以通过 `take_suppressed` 取出后汇总输出。
pub struct LogSampler {
    strategy: SamplingStrategy,
    started: Instant,
    window: AtomicU64,
    counter: AtomicU64,
    suppressed: AtomicU64,
}

impl LogSampler {
    pub fn new(strategy: SamplingStrategy) -> Self {
        Self {
            strategy,
            started: Instant::now(),
            window: AtomicU64::new(0),
            counter: AtomicU64::new(0),
            suppressed: AtomicU64::new(0),
        }
    }

    /// 判断是否应该记录本条日志
    pub fn should_sample(&self) -> bool {
        match self.strategy {
            SamplingStrategy::Always => true,
            SamplingStrategy::Never => {
                self.suppressed.fetch_add(1, Ordering::Relaxed);
                false
            }
            SamplingStrategy::RateLimit(max_per_sec) => {
                // 每秒一个窗口，进入新窗口时重置计数
                let current = self.started.elapsed().as_secs();
                let previous = self.window.load(Ordering::Relaxed);
                if current != previous
                    && self
                        .window
                        .compare_exchange(previous, current, Ordering::Relaxed, Ordering::Relaxed)
                        .is_ok()
                {
                    self.counter.store(0, Ordering::Relaxed);
                }

                let count = self.counter.fetch_add(1, Ordering::Relaxed);
                if count < max_per_sec as u64 {
                    true
                } else {
                    self.suppressed.fetch_add(1, Ordering::Relaxed);
                    false
                }
            }
        }
    }

    /// 取出并清零被抑制的条数
    pub fn take_suppressed(&self) -> u64 {
        self.suppressed.swap(0, Ordering::Relaxed)
    }
}

impl Default for LogSampler {
    fn default() -> Self {
        Self::new(SamplingStrategy::Always)
    }
}
