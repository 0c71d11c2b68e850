pub mod sqlite_message_queue;
pub mod sqlite_task_state_store;

pub use sqlite_message_queue::SqliteMessageQueue;
pub use sqlite_task_state_store::SqliteTaskStateStore;

use runner_config::DatabaseConfig;
use runner_errors::{RunnerError, RunnerResult};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use tracing::{debug, info};

pub struct DatabaseManager {
    pool: SqlitePool,
}

impl DatabaseManager {
    /// 按配置建立连接池并执行建表
    ///
    /// `:memory:` 数据库每个连接各自独立，因此只保留一个常驻连接。
    pub async fn new(config: &DatabaseConfig) -> RunnerResult<Self> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| RunnerError::config_error("database.url is not set"))?;
        let in_memory = url.contains(":memory:");

        debug!("Connecting to SQLite database: {}", url);
        let connect_options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);

        let mut pool_options = SqlitePoolOptions::new();
        pool_options = if in_memory {
            pool_options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            pool_options.max_connections(config.max_connections)
        };

        let pool = pool_options.connect_with(connect_options).await?;
        let manager = Self { pool };
        manager.migrate().await?;

        info!("SQLite database ready (in_memory: {})", in_memory);
        Ok(manager)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> RunnerResult<()> {
        debug!("Running SQLite database migrations");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS task_states (
                task_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                host TEXT NOT NULL,
                script_name TEXT NOT NULL,
                script_content TEXT NOT NULL,
                status TEXT NOT NULL,
                experiment_id INTEGER,
                result TEXT,
                error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_task_states_status ON task_states(status)")
            .execute(&self.pool)
            .await?;

        // claimed_at 为 NULL 表示待消费，否则是被取走时的毫秒时间戳
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS queue_messages (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                message_id TEXT NOT NULL UNIQUE,
                queue TEXT NOT NULL,
                payload TEXT NOT NULL,
                claimed_at INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_queue_messages_queue ON queue_messages(queue, claimed_at)",
        )
        .execute(&self.pool)
        .await?;

        debug!("Successfully completed SQLite database migrations");
        Ok(())
    }

    pub async fn health_check(&self) -> RunnerResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
