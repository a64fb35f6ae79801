//! ロギング初期化
//!
//! `tracing` の構造化ログを標準出力（人間向け）と
//! 日付付き JSON Lines ファイルの2か所へ出力する。

use chrono::{Local, NaiveDate};
use std::{
    env,
    fs::{self, OpenOptions},
    io::{self, Error, ErrorKind},
    path::{Path, PathBuf},
    sync::OnceLock,
};
use tracing_appender::{non_blocking, non_blocking::WorkerGuard};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// ログファイルベース名（JSON Lines）
pub const LOG_FILE_BASE: &str = "fleet-router.jsonl";

const LOG_SUBDIR: &str = "logs";
const DEFAULT_DATA_DIR: &str = ".fleet-router";
const DEFAULT_RETENTION_DAYS: u32 = 7;
const DEFAULT_LEVEL: &str = "info";

const LOG_DIR_ENV: &str = "FLEET_ROUTER_LOG_DIR";
const LOG_LEVEL_ENV: &str = "FLEET_ROUTER_LOG_LEVEL";
const LOG_RETENTION_DAYS_ENV: &str = "FLEET_ROUTER_LOG_RETENTION_DAYS";
const DATA_DIR_ENV: &str = "FLEET_ROUTER_DATA_DIR";
const ALT_LEVEL_ENV: &str = "RUST_LOG";

static LOGGER_GUARD: OnceLock<Result<WorkerGuard, io::Error>> = OnceLock::new();

/// 環境変数から解決したログ設定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    /// 出力ディレクトリ
    pub dir: PathBuf,
    /// フィルタ文字列（EnvFilter 構文）
    pub level: String,
    /// 保持日数
    pub retention_days: u32,
}

impl LogSettings {
    /// 環境変数から解決する
    ///
    /// ディレクトリ: `FLEET_ROUTER_LOG_DIR` > `FLEET_ROUTER_DATA_DIR/logs` > `~/.fleet-router/logs`
    /// レベル: `FLEET_ROUTER_LOG_LEVEL` > `RUST_LOG` > `info`
    pub fn from_env() -> io::Result<Self> {
        Ok(Self {
            dir: resolve_log_dir()?,
            level: env::var(LOG_LEVEL_ENV)
                .or_else(|_| env::var(ALT_LEVEL_ENV))
                .unwrap_or_else(|_| DEFAULT_LEVEL.to_string()),
            retention_days: env::var(LOG_RETENTION_DAYS_ENV)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_RETENTION_DAYS),
        })
    }

    /// 指定日のログファイルパス
    pub fn file_for(&self, date: NaiveDate) -> PathBuf {
        self.dir
            .join(format!("{}.{}", LOG_FILE_BASE, date.format("%Y-%m-%d")))
    }
}

fn resolve_log_dir() -> io::Result<PathBuf> {
    if let Ok(dir) = env::var(LOG_DIR_ENV) {
        return Ok(PathBuf::from(dir));
    }
    if let Ok(dir) = env::var(DATA_DIR_ENV) {
        return Ok(PathBuf::from(dir).join(LOG_SUBDIR));
    }
    let home = env::var("HOME")
        .or_else(|_| env::var("USERPROFILE"))
        .map_err(|_| Error::new(ErrorKind::NotFound, "Failed to resolve home directory"))?;
    Ok(PathBuf::from(home).join(DEFAULT_DATA_DIR).join(LOG_SUBDIR))
}

/// ログ出力を初期化する（2回目以降は何もしない）
pub fn init() -> io::Result<()> {
    match LOGGER_GUARD.get_or_init(|| LogSettings::from_env().and_then(|s| install(&s))) {
        Ok(_) => Ok(()),
        Err(err) => Err(io::Error::new(err.kind(), err.to_string())),
    }
}

/// 今日のログファイルのパス
pub fn log_file_path() -> io::Result<PathBuf> {
    Ok(LogSettings::from_env()?.file_for(Local::now().date_naive()))
}

/// 保持期間を過ぎたログファイルを削除し、削除数を返す
fn cleanup_old_logs(dir: &Path, retention_days: u32, today: NaiveDate) -> io::Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }
    let cutoff = today - chrono::Duration::days(retention_days as i64);
    let prefix = format!("{}.", LOG_FILE_BASE);

    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(date) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix(&prefix))
            .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
        else {
            continue;
        };
        if date < cutoff && fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}

fn install(settings: &LogSettings) -> io::Result<WorkerGuard> {
    fs::create_dir_all(&settings.dir)?;
    let today = Local::now().date_naive();
    let removed = cleanup_old_logs(&settings.dir, settings.retention_days, today)?;

    let log_path = settings.file_for(today);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;
    let (file_writer, guard) = non_blocking(file);

    let env_filter =
        EnvFilter::try_new(&settings.level).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LEVEL));

    let file_layer = fmt::layer()
        .json()
        .with_writer(file_writer)
        .with_current_span(false)
        .with_span_list(false)
        .with_target(true);

    let stdout_layer = fmt::layer().with_target(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .try_init()
        .map_err(Error::other)?;

    tracing::info!(
        category = "system",
        removed_old_files = removed,
        "Fleet router logs initialized: {}",
        log_path.display()
    );
    Ok(guard)
}
