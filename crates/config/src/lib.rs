pub mod models;
pub mod validation;

pub use models::{
    AppConfig, DatabaseConfig, DeploymentConfig, LogConfig, LogLevel, OutputFormat, SshConfig,
    WorkerConfig,
};
pub use validation::{ConfigValidator, ValidationUtils};

pub type ConfigResult<T> = Result<T, ConfigError>;

/// 配置校验错误
///
/// 加载阶段（文件、环境变量、反序列化）的错误由 `AppConfig::load`
/// 以 `anyhow` 附带上下文返回，这里只描述字段取值不合法。
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("配置校验失败: {0}")]
    Validation(String),
}
