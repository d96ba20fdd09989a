use thiserror::Error;

/// 配置驗證錯誤
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("缺少必要配置項: {0}")]
    MissingField(String),

    #[error("無效的配置值: {0}")]
    InvalidValue(String),

    #[error("配置範圍錯誤: {field} 的值 {value} 不在範圍 {min}..{max} 內")]
    RangeError {
        field: String,
        value: String,
        min: String,
        max: String,
    },

    #[error("依賴錯誤: {dependent} 依賴於 {dependency} 的配置")]
    DependencyError {
        dependent: String,
        dependency: String,
    },
}

/// 配置驗證器trait
pub trait Validator {
    fn validate(&self) -> Result<(), ValidationError>;
}

/// 驗證配置區段
pub fn validate_config<T: Validator>(config: &T) -> Result<(), ValidationError> {
    config.validate()
}

/// 驗證工具函數
pub struct ValidationUtils;

impl ValidationUtils {
    /// 驗證配置值是否在閉區間內
    pub fn in_range<T>(value: T, min: T, max: T, field_name: &str) -> Result<(), ValidationError>
    where
        T: PartialOrd + ToString,
    {
        if value < min || value > max {
            return Err(ValidationError::RangeError {
                field: field_name.to_string(),
                value: value.to_string(),
                min: min.to_string(),
                max: max.to_string(),
            });
        }
        Ok(())
    }

    /// 驗證一個選項是否為某些值中的一個
    pub fn one_of<T>(value: &T, options: &[T], field_name: &str) -> Result<(), ValidationError>
    where
        T: PartialEq + ToString,
    {
        if !options.contains(value) {
            let allowed: Vec<String> = options.iter().map(ToString::to_string).collect();
            return Err(ValidationError::InvalidValue(format!(
                "{} 的值 {} 不是有效選項: {:?}",
                field_name,
                value.to_string(),
                allowed
            )));
        }
        Ok(())
    }

    /// 檢查必要的字串欄位是否有值
    pub fn not_empty(value: &str, field_name: &str) -> Result<(), ValidationError> {
        if value.trim().is_empty() {
            return Err(ValidationError::MissingField(field_name.to_string()));
        }
        Ok(())
    }

    /// 檢查兩個欄位的依賴關係
    pub fn check_dependency(
        has_dependent: bool,
        has_dependency: bool,
        dependent_name: &str,
        dependency_name: &str,
    ) -> Result<(), ValidationError> {
        if has_dependent && !has_dependency {
            return Err(ValidationError::DependencyError {
                dependent: dependent_name.to_string(),
                dependency: dependency_name.to_string(),
            });
        }
        Ok(())
    }

    /// 檢查 broker 位址使用 amqp 或 amqps
    pub fn amqp_uri(value: &str, field_name: &str) -> Result<(), ValidationError> {
        Self::not_empty(value, field_name)?;
        let scheme = value.split("://").next().unwrap_or_default().to_lowercase();
        if value.contains("://") && (scheme == "amqp" || scheme == "amqps") {
            return Ok(());
        }
        Err(ValidationError::InvalidValue(format!(
            "{} 必須以 amqp:// 或 amqps:// 開頭: {}",
            field_name, value
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_in_range_reports_bounds() {
        assert!(ValidationUtils::in_range(5u16, 1, 10, "prefetch").is_ok());

        match ValidationUtils::in_range(0u16, 1, 10, "prefetch").unwrap_err() {
            ValidationError::RangeError { field, value, min, max } => {
                assert_eq!(field, "prefetch");
                assert_eq!(value, "0");
                assert_eq!(min, "1");
                assert_eq!(max, "10");
            }
            other => panic!("Expected RangeError, got {:?}", other),
        }
    }

    #[test]
    fn test_one_of_and_not_empty() {
        assert!(ValidationUtils::one_of(&"pretty", &["pretty", "compact"], "log.format").is_ok());
        assert!(ValidationUtils::one_of(&"json", &["pretty", "compact"], "log.format").is_err());
        assert!(ValidationUtils::not_empty("   ", "uri").is_err());
    }

    #[test]
    fn test_check_dependency() {
        assert!(ValidationUtils::check_dependency(true, true, "a", "b").is_ok());
        assert!(ValidationUtils::check_dependency(false, false, "a", "b").is_ok());
        assert!(ValidationUtils::check_dependency(true, false, "a", "b").is_err());
    }

    #[rstest]
    #[case("amqps://broker:5671/vhost", true)]
    #[case("AMQP://localhost", true)]
    #[case("http://localhost", false)]
    #[case("localhost:5671", false)]
    #[case("", false)]
    fn test_amqp_uri(#[case] uri: &str, #[case] valid: bool) {
        assert_eq!(ValidationUtils::amqp_uri(uri, "uri").is_ok(), valid);
    }
}
