// monitor/logger.rs - 日誌系統初始化

use crate::config::LogConfig;
use anyhow::{anyhow, Result};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 日誌檔案名稱前綴
pub const LOG_FILE_PREFIX: &str = "queue-wrapper.log";

/// 初始化日誌系統
///
/// `RUST_LOG` 存在時優先使用，否則採用配置中的級別。設定了 `directory` 時
/// 額外輸出到每日輪替的檔案，回傳的 guard 必須保留到程式結束。
pub fn init_logging(log_config: &LogConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_config.level.to_lowercase()));

    let (file_layer, guard) = match &log_config.directory {
        Some(directory) => {
            let appender = tracing_appender::rolling::daily(directory, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    let registry = tracing_subscriber::registry().with(filter).with(file_layer);
    let result = if log_config.format.eq_ignore_ascii_case("compact") {
        registry.with(fmt::layer().compact()).try_init()
    } else {
        registry.with(fmt::layer().pretty()).try_init()
    };
    result.map_err(|e| anyhow!("設置日誌系統失敗: {}", e))?;

    info!("日誌系統初始化完成");
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_second_initialisation_fails() {
        let dir = tempdir().unwrap();
        let config = LogConfig {
            level: "debug".into(),
            format: "compact".into(),
            directory: Some(dir.path().to_string_lossy().into_owned()),
        };

        let first = init_logging(&config);
        assert!(first.is_ok());
        assert!(first.unwrap().is_some());

        // 全局 subscriber 只能設置一次
        assert!(init_logging(&LogConfig::default()).is_err());
    }
}
