use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{
    database::DatabaseConfig, deployment::DeploymentConfig, logging::LogConfig, ssh::SshConfig,
    worker::WorkerConfig,
};
use crate::validation::ConfigValidator;

/// 默认配置文件搜索路径，按顺序取第一个存在的
pub const DEFAULT_CONFIG_PATHS: [&str; 3] = [
    "config/runner.toml",
    "runner.toml",
    "/etc/remote-runner/config.toml",
];

/// 环境变量前缀，例如 `RUNNER_SSH__USERNAME=deploy`
pub const ENV_PREFIX: &str = "RUNNER";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub ssh: SshConfig,
    pub deployment: DeploymentConfig,
    pub worker: WorkerConfig,
    pub database: DatabaseConfig,
    pub logging: LogConfig,
}

impl AppConfig {
    /// 加载顺序：内置默认值 → 配置文件 → `RUNNER_` 环境变量
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else if let Some(path) = DEFAULT_CONFIG_PATHS
            .iter()
            .find(|path| Path::new(path).exists())
        {
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;

        Ok(config)
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }
}

impl ConfigValidator for AppConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        self.ssh.validate()?;
        self.deployment.validate()?;
        self.worker.validate()?;
        self.database.validate()?;
        self.logging.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LogLevel, OutputFormat};
    use std::io::Write;

    #[test]
    fn test_app_config_default() {
        let config = AppConfig::default();
        assert_eq!(config.ssh.username, "sphero");
        assert_eq!(config.deployment.scratch_dir, "/tmp/atriz_run/");
        assert_eq!(config.worker.concurrency, 2);
        assert!(config.database.url.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_app_config_from_partial_toml() {
        let toml_str = r#"
[ssh]
username = "deploy"
private_key_path = "/home/deploy/.ssh/id_ed25519"

[worker]
concurrency = 4

[database]
url = "sqlite::memory:"

[logging]
level = "debug"
format = "json"
"#;

        let config = AppConfig::from_toml(toml_str).expect("Failed to parse TOML");
        assert_eq!(config.ssh.username, "deploy");
        assert_eq!(
            config.ssh.private_key_path.as_deref(),
            Some("/home/deploy/.ssh/id_ed25519")
        );
        assert_eq!(config.ssh.port, 22);
        assert_eq!(config.worker.concurrency, 4);
        assert_eq!(config.worker.task_queue, "default");
        assert_eq!(config.database.url.as_deref(), Some("sqlite::memory:"));
        assert_eq!(config.logging.level, LogLevel::Debug);
        assert_eq!(config.logging.format, OutputFormat::Json);
    }

    #[test]
    fn test_app_config_from_toml_rejects_invalid_values() {
        let toml_str = r#"
[deployment]
scratch_dir = "relative/dir/"
"#;
        assert!(AppConfig::from_toml(toml_str).is_err());
    }

    #[test]
    fn test_app_config_to_toml() {
        let config = AppConfig::default();
        let toml_str = config.to_toml().expect("Failed to serialize");
        let parsed = AppConfig::from_toml(&toml_str).expect("Failed to parse");
        assert_eq!(config, parsed);
    }

    #[test]
    fn test_load_from_explicit_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .expect("Failed to create temp file");
        writeln!(
            file,
            "[deployment]\nexecution_timeout_seconds = 5\n\n[worker]\ntask_queue = \"robots\""
        )
        .expect("Failed to write config");

        let path = file.path().to_str().expect("utf-8 path");
        let config = AppConfig::load(Some(path)).expect("Failed to load config");
        assert_eq!(config.deployment.execution_timeout_seconds, 5);
        assert_eq!(config.worker.task_queue, "robots");
        assert_eq!(config.ssh.username, "sphero");
    }

    #[test]
    fn test_load_missing_explicit_file_fails() {
        let result = AppConfig::load(Some("/nonexistent/runner.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_environment_overrides() {
        std::env::set_var("RUNNER_DEPLOYMENT__INTERPRETER", "python3.11");
        let config = AppConfig::load(None);
        std::env::remove_var("RUNNER_DEPLOYMENT__INTERPRETER");

        let config = config.expect("Failed to load config");
        assert_eq!(config.deployment.interpreter, "python3.11");
    }
}
