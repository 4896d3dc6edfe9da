//! 日志初始化
//!
//! 基于 tracing-subscriber：`RUST_LOG` 优先于配置的级别，支持可读文本和 JSON
//! 两种格式，输出到标准输出或追加写入文件。通过 `log` crate 打印的日志经
//! tracing-log 桥接进来。

use anyhow::Context;
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

use crate::config::{LogConfig, LogFormat, LogOutput};
use crate::error::InfraResult;

/// 安装全局日志订阅器
///
/// 每个进程只能成功调用一次，重复调用返回错误。
pub fn init_logging(config: &LogConfig) -> InfraResult<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)
            .with_context(|| format!("invalid log level {:?}", config.level))?,
    };

    let (writer, ansi) = match &config.output {
        LogOutput::Stdout => (BoxMakeWriter::new(std::io::stdout), true),
        LogOutput::File { path } => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            (BoxMakeWriter::new(Mutex::new(file)), false)
        }
    };

    let fmt_layer: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
        LogFormat::Pretty => fmt::layer()
            .with_writer(writer)
            .with_ansi(ansi)
            .with_target(true)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_writer(writer)
            .boxed(),
    };

    let subscriber = tracing_subscriber::registry().with(fmt_layer).with(filter);
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to initialize tracing subscriber")?;

    // 其他 crate 可能已经安装了 log 的 logger，这种情况下只是没有桥接
    if let Err(e) = tracing_log::LogTracer::init() {
        tracing::warn!(error = %e, "log bridge not installed");
    }

    tracing::info!(
        level = %config.level,
        format = ?config.format,
        output = ?config.output,
        "Logging initialized"
    );
    Ok(())
}
