use crate::validation::{ConfigValidator, ValidationUtils};
use serde::{Deserialize, Serialize};

/// SSH 连接参数，启动时解析一次，所有会话共用
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SshConfig {
    pub username: String,
    /// 私钥路径，不设置时交给 ssh 客户端自己的默认身份
    pub private_key_path: Option<String>,
    pub port: u16,
    pub connect_timeout_seconds: u64,
    /// 关闭时使用 `StrictHostKeyChecking=no` 且不写 known_hosts
    pub strict_host_key_checking: bool,
    pub ssh_binary: String,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            username: "sphero".to_string(),
            private_key_path: None,
            port: 22,
            connect_timeout_seconds: 10,
            strict_host_key_checking: false,
            ssh_binary: "ssh".to_string(),
        }
    }
}

impl SshConfig {
    pub fn connect_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.connect_timeout_seconds)
    }
}

impl ConfigValidator for SshConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_not_empty(&self.username, "ssh.username")?;
        ValidationUtils::validate_port(self.port, "ssh.port")?;
        ValidationUtils::validate_timeout_seconds(
            self.connect_timeout_seconds,
            "ssh.connect_timeout_seconds",
        )?;
        ValidationUtils::validate_not_empty(&self.ssh_binary, "ssh.ssh_binary")?;

        if let Some(path) = &self.private_key_path {
            ValidationUtils::validate_not_empty(path, "ssh.private_key_path")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssh_config_defaults() {
        let config = SshConfig::default();
        assert_eq!(config.username, "sphero");
        assert_eq!(config.port, 22);
        assert!(!config.strict_host_key_checking);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_ssh_config_validation() {
        let mut config = SshConfig::default();
        config.username = " ".to_string();
        assert!(config.validate().is_err());

        let mut config = SshConfig::default();
        config.port = 0;
        assert!(config.validate().is_err());

        let mut config = SshConfig::default();
        config.private_key_path = Some(String::new());
        assert!(config.validate().is_err());
    }
}
