use crate::validation::{ConfigValidator, ValidationUtils};
use serde::{Deserialize, Serialize};

/// 任务状态存储的后端选择：不配置 url 时使用进程内存储
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 5,
        }
    }
}

impl DatabaseConfig {
    pub fn is_persistent(&self) -> bool {
        self.url.is_some()
    }
}

impl ConfigValidator for DatabaseConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        if let Some(url) = &self.url {
            ValidationUtils::validate_not_empty(url, "database.url")?;
            if !url.starts_with("sqlite:") {
                return Err(crate::ConfigError::Validation(
                    "database.url must start with sqlite:".to_string(),
                ));
            }
        }

        ValidationUtils::validate_count(self.max_connections as usize, "database.max_connections")?;

        Ok(())
    }
}
