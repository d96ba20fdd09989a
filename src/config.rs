/// 配置管理模組
///
/// 本模組負責加載、驗證和管理佇列包裝器的配置。
/// 支持從開發與生產兩種環境中加載不同的配置。
pub mod loader;
pub mod manager;
pub mod types;
pub mod validation;

// 重新導出常用組件
pub use loader::{ConfigExt, ConfigLoader, Environment};
pub use manager::{get_config, init_config};
pub use types::*;
pub use validation::{validate_config, ValidationError, ValidationUtils, Validator};

#[cfg(test)]
mod tests {
    #[test]
    fn test_module_exports() {
        let _ = super::Environment::Development;
        let _ = super::ValidationUtils::not_empty("test", "field");

        fn _ensure_config_works(cfg: &super::ApplicationConfig) {
            let _ = &cfg.log;
            let _ = &cfg.queue_wrapper.consumers;
            let _ = &cfg.queue_wrapper.publishers;
        }
    }
}
