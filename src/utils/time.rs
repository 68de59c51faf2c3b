use chrono::Utc;

/// 获取当前 UTC 时间戳（毫秒）
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// 获取当前 UTC 时间戳（秒）
pub fn epoch_seconds() -> i64 {
    Utc::now().timestamp()
}

/// 当天的计数器分片标签，UTC，格式 `yyyy:MM:dd`
pub fn counter_day() -> String {
    Utc::now().format("%Y:%m:%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_millis_is_recent() {
        // 2026-01-01 之后、2100-01-01 之前
        let now = now_millis();
        assert!(now > 1_767_225_600_000);
        assert!(now < 4_102_444_800_000);
    }

    #[test]
    fn test_counter_day_format() {
        let day = counter_day();
        assert_eq!(day.len(), 10);
        let parts: Vec<&str> = day.split(':').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), 4);
        assert_eq!(parts[1].len(), 2);
        assert_eq!(parts[2].len(), 2);
    }

    #[test]
    fn test_epoch_seconds_matches_millis() {
        let secs = epoch_seconds();
        let millis = now_millis();
        assert!((millis / 1000 - secs).abs() <= 1);
    }
}
