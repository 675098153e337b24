use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::PathBuf,
    sync::Mutex,
};

use anyhow::{anyhow, Result};
use once_cell::sync::Lazy;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

pub const DEFAULT_LOG_DIR: &str = "logs";
const LOG_FILE: &str = "askmebuddy.log";

/**
 * \brief 日志级别。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    Info,
    /** \brief 可容忍的异常，例如 Key 保存失败但仍可使用 */
    Warn,
    Error,
}

impl Level {
    fn as_str(self) -> &'static str {
        match self {
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
        }
    }
}

/**
 * \brief 进程级日志目标：开关 + 目录。写入时持锁，并发问答的日志行不会交错。
 */
struct Sink {
    enabled: bool,
    dir: PathBuf,
}

static SINK: Lazy<Mutex<Sink>> = Lazy::new(|| {
    Mutex::new(Sink {
        enabled: false,
        dir: PathBuf::from(DEFAULT_LOG_DIR),
    })
});

pub fn set_enabled(enabled: bool) {
    if let Ok(mut sink) = SINK.lock() {
        sink.enabled = enabled;
    }
}

/**
 * \brief 更换日志目录（默认 `logs`）。
 */
pub fn set_dir(dir: impl Into<PathBuf>) {
    if let Ok(mut sink) = SINK.lock() {
        sink.dir = dir.into();
    }
}

pub fn log_event(category: &str, message: &str) {
    log(Level::Info, category, message);
}

pub fn log_warn(category: &str, message: &str) {
    log(Level::Warn, category, message);
}

pub fn log_error(category: &str, message: &str) {
    log(Level::Error, category, message);
}

/**
 * \brief 写入一行日志；关闭时直接返回，写入失败只打印到 stderr。
 */
fn log(level: Level, category: &str, message: &str) {
    if let Err(err) = append(level, category, message) {
        eprintln!("telemetry write failed: {}", err);
    }
}

fn append(level: Level, category: &str, message: &str) -> Result<()> {
    let sink = SINK.lock().map_err(|_| anyhow!("telemetry sink poisoned"))?;
    if !sink.enabled {
        return Ok(());
    }
    fs::create_dir_all(&sink.dir)?;
    let timestamp = OffsetDateTime::now_utc().format(&Rfc3339)?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(sink.dir.join(LOG_FILE))?;
    writeln!(file, "{}", format_line(&timestamp, level, category, message))?;
    Ok(())
}

fn format_line(timestamp: &str, level: Level, category: &str, message: &str) -> String {
    // 消息中的换行会破坏按行解析。
    let message = message.replace('\n', " ");
    format!("{} [{}] {} - {}", timestamp, level.as_str(), category, message)
}
