use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;

/// 将五段式 cron（分 时 日 月 周）补齐为带秒的六段式
pub fn normalize_cron(expr: &str) -> String {
    let expr = expr.trim();
    if expr.split_whitespace().count() == 5 {
        format!("0 {}", expr)
    } else {
        expr.to_string()
    }
}

/// 解析 cron 表达式（接受五段或六段）
pub fn parse_cron(expr: &str) -> Result<Schedule, cron::error::Error> {
    Schedule::from_str(&normalize_cron(expr))
}

/// 计算给定时刻之后的下一次触发时间
pub fn next_cron_tick(expr: &str, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    parse_cron(expr).ok()?.after(&after).next()
}
