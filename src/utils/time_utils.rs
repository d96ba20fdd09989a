// time_utils.rs
//
// 發佈者以毫秒時間戳索引待確認消息，並以 UNIX 秒數標記消息屬性。

use chrono::{DateTime, TimeZone, Utc};
use std::time::{SystemTime, UNIX_EPOCH};

/// 獲取當前時間的毫秒時間戳
pub fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// 獲取當前 UNIX 秒數
pub fn current_unix_timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// 將毫秒時間戳轉換為 DateTime<Utc>，用於日誌輸出
pub fn timestamp_ms_to_datetime(ts: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ts).single().unwrap_or_else(Utc::now)
}
