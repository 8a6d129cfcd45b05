//! 时间处理工具
//!
//! - **存储层/同步游标**: UTC 毫秒时间戳（i64）
//! - **快照保留策略**: 按 UTC 自然日分组
//! - **源数据**: 审阅系统的 `yyyy/MM/dd HH:mm` 与 `yyyy/MM/dd` 字符串

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

/// 一天的毫秒数
pub const DAY_MILLIS: i64 = 24 * 60 * 60 * 1000;

/// 当前 UTC 毫秒时间戳
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// 毫秒时间戳所在的 UTC 自然日；超出 chrono 可表示范围时返回 None
pub fn utc_day(ts_millis: i64) -> Option<NaiveDate> {
    DateTime::<Utc>::from_timestamp_millis(ts_millis).map(|dt| dt.date_naive())
}

/// 解析审阅历史中的 `yyyy/MM/dd HH:mm`，输出不带时区的 ISO 8601 字符串
pub fn parse_review_time(raw: &str) -> Option<String> {
    NaiveDateTime::parse_from_str(raw.trim(), "%Y/%m/%d %H:%M")
        .ok()
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%S").to_string())
}

/// `yyyy/MM/dd` → `yyyy-MM-dd`
pub fn normalize_date(raw: &str) -> String {
    raw.replace('/', "-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_utc_day_boundaries() {
        // 2024-03-01T23:59:59.999Z 与 2024-03-02T00:00:00Z
        let late = 1_709_337_599_999;
        let next = late + 1;
        assert_eq!(utc_day(late), NaiveDate::from_ymd_opt(2024, 3, 1));
        assert_eq!(utc_day(next), NaiveDate::from_ymd_opt(2024, 3, 2));
    }

    #[test]
    fn test_parse_review_time() {
        assert_eq!(
            parse_review_time("2025/09/03 14:05").as_deref(),
            Some("2025-09-03T14:05:00")
        );
        assert_eq!(parse_review_time("yesterday"), None);
    }

    #[test]
    fn test_normalize_date() {
        assert_eq!(normalize_date("2025/09/03"), "2025-09-03");
        assert!(now_millis() > 0);
    }
}
