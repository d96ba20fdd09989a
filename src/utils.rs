// utils.rs - 公共工具模組

pub mod time_utils;

pub use time_utils::{current_timestamp_ms, current_unix_timestamp_secs, timestamp_ms_to_datetime};
