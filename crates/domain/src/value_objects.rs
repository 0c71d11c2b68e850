use runner_errors::{RunnerError, RunnerResult};

/// 持久化记录中脚本内容摘要的最大字符数
pub const SCRIPT_SUMMARY_MAX_CHARS: usize = 100;

/// 生成脚本内容摘要：超过100个字符时截断并追加 `...`
pub fn summarize_script_content(content: &str) -> String {
    if content.chars().count() > SCRIPT_SUMMARY_MAX_CHARS {
        let prefix: String = content.chars().take(SCRIPT_SUMMARY_MAX_CHARS).collect();
        format!("{prefix}...")
    } else {
        content.to_string()
    }
}

/// 校验脚本文件名
///
/// 远程命令按 `<interpreter> <scratch_dir><script_name>` 原样拼接，不做转义，
/// 因此文件名只能由字母、数字、`.`、`_`、`-` 组成。
pub fn validate_script_name(script_name: &str) -> RunnerResult<()> {
    if script_name.is_empty() {
        return Err(RunnerError::invalid_params("script_name cannot be empty"));
    }
    if script_name == "." || script_name == ".." {
        return Err(RunnerError::invalid_params(format!(
            "script_name '{script_name}' is not a file name"
        )));
    }
    if let Some(c) = script_name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
    {
        return Err(RunnerError::invalid_params(format!(
            "script_name '{script_name}' contains invalid character {c:?}"
        )));
    }
    Ok(())
}

/// 校验目标主机地址
pub fn validate_host(host: &str) -> RunnerResult<()> {
    if host.trim().is_empty() {
        return Err(RunnerError::invalid_params("host cannot be empty"));
    }
    if host.starts_with('-') || host.chars().any(char::is_whitespace) {
        return Err(RunnerError::invalid_params(format!(
            "host '{host}' is not a valid address"
        )));
    }
    Ok(())
}
