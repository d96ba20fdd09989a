// 模組定義
pub mod config;
pub mod messaging;
pub mod monitor;
pub mod utils;
