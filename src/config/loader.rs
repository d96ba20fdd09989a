use config::{Config, ConfigError, Environment as ConfigEnvironment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;

/// 選擇環境的環境變數
pub const ENVIRONMENT_VARIABLE: &str = "QUEUE_WRAPPER_ENV";

/// 覆寫配置值的環境變數前綴
pub const ENVIRONMENT_PREFIX: &str = "QUEUE_WRAPPER";

/// 環境類型枚舉
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    /// 從環境變數取得當前環境設定
    pub fn from_env() -> Self {
        match env::var(ENVIRONMENT_VARIABLE)
            .unwrap_or_else(|_| "development".into())
            .to_lowercase()
            .as_str()
        {
            "production" => Environment::Production,
            _ => Environment::Development,
        }
    }

    /// 轉換為配置文件名
    pub fn as_filename(&self) -> &'static str {
        match self {
            Environment::Development => "development.toml",
            Environment::Production => "production.toml",
        }
    }
}

/// 配置加載器
///
/// 依序疊加 `default.toml` (可選)、環境檔案與 `QUEUE_WRAPPER__` 開頭的環境變數，
/// 後者優先。
pub struct ConfigLoader;

impl ConfigLoader {
    /// 載入指定環境的配置
    pub fn load(env: Environment) -> Result<Config, ConfigError> {
        let config_dir = env::var("CONFIG_DIR").unwrap_or_else(|_| "config".into());
        Self::load_from_dir(&config_dir, env)
    }

    /// 從指定目錄載入配置
    pub fn load_from_dir(
        config_dir: impl AsRef<Path>,
        env: Environment,
    ) -> Result<Config, ConfigError> {
        let config_dir = config_dir.as_ref();

        Config::builder()
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            .add_source(File::from(config_dir.join(env.as_filename())))
            .add_source(
                ConfigEnvironment::with_prefix(ENVIRONMENT_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
    }

    /// 載入當前環境的配置
    pub fn load_current() -> Result<Config, ConfigError> {
        Self::load(Environment::from_env())
    }
}

/// 配置獲取輔助特性
pub trait ConfigExt {
    /// 從配置中獲取並反序列化指定部分
    fn get_section<'a, T: Deserialize<'a>>(&'a self, section: &str) -> Result<T, ConfigError>;
}

impl ConfigExt for Config {
    fn get_section<'a, T: Deserialize<'a>>(&'a self, section: &str) -> Result<T, ConfigError> {
        self.get(section)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_environment_from_env() {
        env::remove_var(ENVIRONMENT_VARIABLE);
        assert_eq!(Environment::from_env(), Environment::Development);

        env::set_var(ENVIRONMENT_VARIABLE, "Production");
        assert_eq!(Environment::from_env(), Environment::Production);

        env::set_var(ENVIRONMENT_VARIABLE, "staging");
        assert_eq!(Environment::from_env(), Environment::Development);

        env::remove_var(ENVIRONMENT_VARIABLE);
    }

    #[test]
    fn test_environment_as_filename() {
        assert_eq!(Environment::Development.as_filename(), "development.toml");
        assert_eq!(Environment::Production.as_filename(), "production.toml");
    }
}
