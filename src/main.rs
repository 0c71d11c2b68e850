use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use remote_runner::{wait_for_shutdown_signal, Application, ScriptSource, ShutdownManager};
use runner_config::{AppConfig, LogConfig, LogLevel, OutputFormat};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

fn cli() -> Command {
    Command::new("remote-runner")
        .version("1.0.0")
        .about("远程脚本执行系统")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径（默认按搜索路径查找）")
                .global(true),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别")
                .value_parser(["trace", "debug", "info", "warn", "error"])
                .global(true),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式")
                .value_parser(["json", "pretty"])
                .global(true),
        )
        .subcommand(
            Command::new("serve").about("从共享数据库的任务队列取任务执行，直到收到关闭信号"),
        )
        .subcommand(
            Command::new("submit")
                .about("把脚本登记到共享数据库的任务队列，输出任务记录后立即返回")
                .arg(host_arg())
                .arg(script_list_arg()),
        )
        .subcommand(
            Command::new("status").about("查询任务记录").arg(
                Arg::new("task-id")
                    .value_name("TASK_ID")
                    .help("任务ID，可重复")
                    .required(true)
                    .num_args(1..)
                    .action(ArgAction::Append),
            ),
        )
        .subcommand(
            Command::new("exec")
                .about("在远程主机上执行一次脚本并输出结果")
                .arg(host_arg())
                .arg(
                    Arg::new("script")
                        .long("script")
                        .value_name("FILE")
                        .help("本地脚本文件")
                        .required(true),
                )
                .arg(
                    Arg::new("name")
                        .long("name")
                        .value_name("NAME")
                        .help("远程脚本文件名（默认取本地文件名）"),
                )
                .arg(
                    Arg::new("timeout")
                        .long("timeout")
                        .value_name("SECS")
                        .help("脚本执行超时（秒）")
                        .value_parser(value_parser!(u64).range(1..=3600)),
                ),
        )
        .subcommand(
            Command::new("batch")
                .about("通过任务队列提交多个脚本，等待全部完成")
                .arg(host_arg())
                .arg(script_list_arg()),
        )
}

fn script_list_arg() -> Arg {
    Arg::new("script")
        .long("script")
        .value_name("FILE")
        .help("本地脚本文件，可重复")
        .required(true)
        .num_args(1..)
        .action(ArgAction::Append)
}

fn host_arg() -> Arg {
    Arg::new("host")
        .long("host")
        .value_name("HOST")
        .help("目标主机")
        .required(true)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let matches = cli().get_matches();

    let config_path = matches.get_one::<String>("config").map(String::as_str);
    let mut config = AppConfig::load(config_path).context("加载配置失败")?;
    config.logging = apply_log_overrides(config.logging, &matches)?;

    init_logging(&config.logging)?;

    let app = Application::new(config).await?;

    match matches.subcommand() {
        Some(("serve", _)) => serve(app).await,
        Some(("exec", sub)) => exec(&app, sub).await,
        Some(("batch", sub)) => batch(&app, sub).await,
        Some(("submit", sub)) => submit(&app, sub).await,
        Some(("status", sub)) => status(&app, sub).await,
        _ => Err(anyhow::anyhow!("未知的子命令")),
    }
}

async fn serve(app: Application) -> Result<ExitCode> {
    require_shared_backend(&app, "serve")?;
    info!("启动远程脚本执行服务");

    let shutdown_manager = ShutdownManager::new();
    let app = Arc::new(app);
    let app_handle = {
        let app = Arc::clone(&app);
        let shutdown_rx = shutdown_manager.subscribe();
        tokio::spawn(async move {
            if let Err(e) = app.run(shutdown_rx).await {
                error!("应用运行失败: {e}");
            }
        })
    };

    let signal = wait_for_shutdown_signal().await;
    info!("收到{}信号，开始优雅关闭...", signal);
    shutdown_manager.shutdown();

    match tokio::time::timeout(SHUTDOWN_TIMEOUT, app_handle).await {
        Ok(Ok(())) => info!("应用已优雅关闭"),
        Ok(Err(e)) => error!("应用关闭时发生错误: {e}"),
        Err(_) => warn!("应用关闭超时，强制退出"),
    }

    let pending = app.pending_messages().await?;
    if pending > 0 {
        warn!("仍有 {} 条任务消息未被处理", pending);
    }
    Ok(ExitCode::SUCCESS)
}

async fn exec(app: &Application, matches: &ArgMatches) -> Result<ExitCode> {
    let host = required(matches, "host")?;
    let script_path = required(matches, "script")?;
    let mut script = read_script(script_path).await?;
    if let Some(name) = matches.get_one::<String>("name") {
        script.script_name = name.clone();
    }
    let timeout = matches.get_one::<u64>("timeout").copied().map(Duration::from_secs);

    let outcome = app.exec_once(host, &script, timeout).await;
    println!("{}", serde_json::to_string_pretty(&outcome)?);

    Ok(if outcome.is_completed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn batch(app: &Application, matches: &ArgMatches) -> Result<ExitCode> {
    let host = required(matches, "host")?;
    let scripts = read_scripts(matches).await?;

    let tasks = app.run_batch(host, scripts).await?;
    println!("{}", serde_json::to_string_pretty(&tasks)?);

    Ok(if tasks.iter().all(|t| t.error.is_none()) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn submit(app: &Application, matches: &ArgMatches) -> Result<ExitCode> {
    require_shared_backend(app, "submit")?;
    let host = required(matches, "host")?;
    let scripts = read_scripts(matches).await?;

    let tasks = app.submit_scripts(host, scripts).await?;
    println!("{}", serde_json::to_string_pretty(&tasks)?);
    Ok(ExitCode::SUCCESS)
}

async fn status(app: &Application, matches: &ArgMatches) -> Result<ExitCode> {
    let task_ids: Vec<String> = matches
        .get_many::<String>("task-id")
        .into_iter()
        .flatten()
        .cloned()
        .collect();

    let tasks = app.task_status(&task_ids).await?;
    println!("{}", serde_json::to_string_pretty(&tasks)?);
    Ok(ExitCode::SUCCESS)
}

/// `serve` 与 `submit` 分属不同进程，只能通过 `database.url` 指向的数据库交换任务
fn require_shared_backend(app: &Application, command: &str) -> Result<()> {
    if !app.is_shared_backend() {
        anyhow::bail!("{command} 需要配置 database.url（sqlite:...），进程内队列无法被其他进程访问");
    }
    Ok(())
}

fn required<'a>(matches: &'a ArgMatches, name: &str) -> Result<&'a str> {
    matches
        .get_one::<String>(name)
        .map(String::as_str)
        .ok_or_else(|| anyhow::anyhow!("缺少参数 --{name}"))
}

async fn read_scripts(matches: &ArgMatches) -> Result<Vec<ScriptSource>> {
    let mut scripts = Vec::new();
    for path in matches.get_many::<String>("script").into_iter().flatten() {
        scripts.push(read_script(path).await?);
    }
    Ok(scripts)
}

async fn read_script(path: &str) -> Result<ScriptSource> {
    let script_content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("读取脚本失败: {path}"))?;
    let script_name = Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| anyhow::anyhow!("无法从路径推断脚本名: {path}"))?;

    Ok(ScriptSource {
        script_name,
        script_content,
    })
}

/// 命令行参数覆盖配置文件中的日志设置
fn apply_log_overrides(mut logging: LogConfig, matches: &ArgMatches) -> Result<LogConfig> {
    if let Some(level) = matches.get_one::<String>("log-level") {
        let level: LogLevel = level.parse().map_err(anyhow::Error::msg)?;
        logging = logging.with_level(level);
    }
    if let Some(format) = matches.get_one::<String>("log-format") {
        let format: OutputFormat = format.parse().map_err(anyhow::Error::msg)?;
        logging = logging.with_format(format);
    }
    Ok(logging)
}

/// 初始化日志系统，`RUST_LOG` 优先于配置的级别
fn init_logging(logging: &LogConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.filter_directive()));

    // 标准输出留给命令结果
    let registry = tracing_subscriber::registry().with(env_filter);

    match logging.format {
        OutputFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
            .context("初始化JSON日志格式失败")?,
        OutputFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().pretty().with_writer(std::io::stderr))
            .try_init()
            .context("初始化Pretty日志格式失败")?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_valid() {
        cli().debug_assert();
    }

    #[test]
    fn test_exec_arguments() {
        let matches = cli()
            .try_get_matches_from([
                "remote-runner",
                "exec",
                "--host",
                "192.168.1.100",
                "--script",
                "scripts/hello.py",
                "--timeout",
                "5",
                "--log-level",
                "debug",
            ])
            .unwrap();

        let (name, sub) = matches.subcommand().unwrap();
        assert_eq!(name, "exec");
        assert_eq!(sub.get_one::<String>("host").unwrap(), "192.168.1.100");
        assert_eq!(sub.get_one::<u64>("timeout").copied(), Some(5));
        assert_eq!(sub.get_one::<String>("log-level").unwrap(), "debug");
    }

    #[test]
    fn test_batch_accepts_many_scripts() {
        let matches = cli()
            .try_get_matches_from([
                "remote-runner",
                "batch",
                "--host",
                "192.168.1.100",
                "--script",
                "a.py",
                "b.py",
            ])
            .unwrap();

        let (_, sub) = matches.subcommand().unwrap();
        let scripts: Vec<&String> = sub.get_many::<String>("script").unwrap().collect();
        assert_eq!(scripts.len(), 2);
    }

    #[test]
    fn test_submit_and_status_arguments() {
        let matches = cli()
            .try_get_matches_from([
                "remote-runner",
                "submit",
                "--host",
                "192.168.1.100",
                "--script",
                "a.py",
            ])
            .unwrap();
        let (name, sub) = matches.subcommand().unwrap();
        assert_eq!(name, "submit");
        assert_eq!(sub.get_many::<String>("script").unwrap().count(), 1);

        let matches = cli()
            .try_get_matches_from(["remote-runner", "status", "task-1", "task-2"])
            .unwrap();
        let (name, sub) = matches.subcommand().unwrap();
        assert_eq!(name, "status");
        let ids: Vec<&String> = sub.get_many::<String>("task-id").unwrap().collect();
        assert_eq!(ids, vec!["task-1", "task-2"]);

        assert!(cli().try_get_matches_from(["remote-runner", "status"]).is_err());
    }

    #[test]
    fn test_log_overrides_replace_config_values() {
        let matches = cli()
            .try_get_matches_from(["remote-runner", "--log-format", "json", "serve"])
            .unwrap();

        let logging = apply_log_overrides(LogConfig::default(), &matches).unwrap();
        assert_eq!(logging.format, OutputFormat::Json);
        assert_eq!(logging.level, LogLevel::Info);
    }
}
