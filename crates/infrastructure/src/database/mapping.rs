use runner_domain::entities::{ExecutionResult, FailureDetail, TaskStatus};
use runner_errors::RunnerResult;
use serde::{de::DeserializeOwned, Serialize};
use sqlx::{sqlite::SqliteRow, Row};

/// `task_states` 行与领域类型之间的列映射
pub struct MappingHelpers;

impl MappingHelpers {
    /// 状态列保存 `queued` / `running` / `success` / `failure`
    pub fn status_column(row: &SqliteRow) -> RunnerResult<TaskStatus> {
        let status: String = row.try_get("status")?;
        status.parse()
    }

    pub fn result_column(row: &SqliteRow) -> RunnerResult<Option<ExecutionResult>> {
        Self::json_column(row, "result")
    }

    pub fn error_column(row: &SqliteRow) -> RunnerResult<Option<FailureDetail>> {
        Self::json_column(row, "error")
    }

    /// 终态写入的结果或错误，未提供时写 NULL
    pub fn to_json_text<T: Serialize>(value: Option<&T>) -> RunnerResult<Option<String>> {
        value
            .map(|value| serde_json::to_string(value).map_err(Into::into))
            .transpose()
    }

    fn json_column<T: DeserializeOwned>(row: &SqliteRow, column: &str) -> RunnerResult<Option<T>> {
        let text: Option<String> = row.try_get(column)?;
        text.map(|text| serde_json::from_str(&text).map_err(Into::into))
            .transpose()
    }
}
