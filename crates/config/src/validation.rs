use crate::{ConfigError, ConfigResult};

/// Trait for configuration validation
pub trait ConfigValidator {
    fn validate(&self) -> ConfigResult<()>;
}

/// General validation utilities
pub struct ValidationUtils;

impl ValidationUtils {
    /// Validate that a string is not empty
    pub fn validate_not_empty(value: &str, field_name: &str) -> ConfigResult<()> {
        if value.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "{field_name} cannot be empty"
            )));
        }
        Ok(())
    }

    /// Validate that a port number is valid
    pub fn validate_port(port: u16, field_name: &str) -> ConfigResult<()> {
        if port == 0 {
            return Err(ConfigError::Validation(format!("{field_name} cannot be 0")));
        }
        Ok(())
    }

    /// Validate that a timeout is reasonable
    pub fn validate_timeout_seconds(timeout_seconds: u64, field_name: &str) -> ConfigResult<()> {
        if timeout_seconds == 0 {
            return Err(ConfigError::Validation(format!(
                "{field_name} must be greater than 0"
            )));
        }
        if timeout_seconds > 3600 {
            return Err(ConfigError::Validation(format!(
                "{field_name} must be less than or equal to 3600"
            )));
        }
        Ok(())
    }

    /// Validate that a count is reasonable
    pub fn validate_count(count: usize, field_name: &str) -> ConfigResult<()> {
        if count == 0 {
            return Err(ConfigError::Validation(format!(
                "{field_name} must be greater than 0"
            )));
        }
        if count > 10000 {
            return Err(ConfigError::Validation(format!(
                "{field_name} must be less than or equal to 10000"
            )));
        }
        Ok(())
    }

    /// 远端目录必须是以 `/` 结尾的绝对路径，这样 `<dir><file>` 拼接才成立
    pub fn validate_remote_dir(dir: &str, field_name: &str) -> ConfigResult<()> {
        Self::validate_not_empty(dir, field_name)?;
        if !dir.starts_with('/') {
            return Err(ConfigError::Validation(format!(
                "{field_name} must be an absolute path"
            )));
        }
        if !dir.ends_with('/') {
            return Err(ConfigError::Validation(format!(
                "{field_name} must end with '/'"
            )));
        }
        if dir.chars().any(char::is_whitespace) {
            return Err(ConfigError::Validation(format!(
                "{field_name} cannot contain whitespace"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_not_empty() {
        assert!(ValidationUtils::validate_not_empty("test", "field").is_ok());
        assert!(ValidationUtils::validate_not_empty("  test  ", "field").is_ok());
        assert!(ValidationUtils::validate_not_empty("", "field").is_err());
        assert!(ValidationUtils::validate_not_empty("   ", "field").is_err());
    }

    #[test]
    fn test_validate_port() {
        assert!(ValidationUtils::validate_port(22, "ssh.port").is_ok());
        assert!(ValidationUtils::validate_port(65535, "ssh.port").is_ok());
        assert!(ValidationUtils::validate_port(0, "ssh.port").is_err());
    }

    #[test]
    fn test_validate_timeout_seconds() {
        assert!(ValidationUtils::validate_timeout_seconds(60, "t").is_ok());
        assert!(ValidationUtils::validate_timeout_seconds(3600, "t").is_ok());
        assert!(ValidationUtils::validate_timeout_seconds(0, "t").is_err());
        assert!(ValidationUtils::validate_timeout_seconds(3601, "t").is_err());
    }

    #[test]
    fn test_validate_count() {
        assert!(ValidationUtils::validate_count(2, "test").is_ok());
        assert!(ValidationUtils::validate_count(0, "test").is_err());
        assert!(ValidationUtils::validate_count(10001, "test").is_err());
    }

    #[test]
    fn test_validate_remote_dir() {
        assert!(ValidationUtils::validate_remote_dir("/tmp/atriz_run/", "dir").is_ok());
        assert!(ValidationUtils::validate_remote_dir("/tmp/atriz_run", "dir").is_err());
        assert!(ValidationUtils::validate_remote_dir("tmp/atriz_run/", "dir").is_err());
        assert!(ValidationUtils::validate_remote_dir("/tmp/my dir/", "dir").is_err());
        assert!(ValidationUtils::validate_remote_dir("", "dir").is_err());
    }
}
