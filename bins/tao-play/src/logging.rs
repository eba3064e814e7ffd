//! 日志初始化.
//!
//! 同一级别输出到两处:
//! - 终端: 彩色级别
//! - 文件: 无色, 按天滚动, 位于 $cwd/logs/{prefix}.{date}.log
//!
//! 级别选择 (优先级: TAO_LOG 环境变量 > 命令行 > 默认):
//! - 默认:   info
//! - `-v`:   debug (同步决策, 串号变化)
//! - `-vv`:  trace (仅 tao crate, 逐帧细节)
//! - `-vvv`: trace (全局)

use std::sync::OnceLock;

use anyhow::Context;
use chrono::{Datelike, Local, Timelike};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter, Registry,
    fmt::{self, FormatEvent, FormatFields, format::Writer},
    layer::{Layer, SubscriberExt},
    registry::LookupSpan,
    util::SubscriberInitExt,
};

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// -vv 级别定向 trace 的 target
const TAO_TARGETS: &[&str] = &["tao_avsync", "tao_play"];

fn build_filter(verbosity: u8) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_env("TAO_LOG") {
        return filter;
    }
    match verbosity {
        0 => EnvFilter::new("info"),
        1 => EnvFilter::new("debug"),
        2 => {
            let mut directives: Vec<String> =
                TAO_TARGETS.iter().map(|t| format!("{t}=trace")).collect();
            directives.push("info".into());
            EnvFilter::new(directives.join(","))
        }
        _ => EnvFilter::new("trace"),
    }
}

/// 初始化日志系统
///
/// 库内 `log` 宏的记录经 tracing-subscriber 自带的 log 桥接输出.
pub fn init(file_prefix: &str, verbosity: u8) -> anyhow::Result<()> {
    std::fs::create_dir_all("logs").context("创建 logs 目录失败")?;
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(file_prefix)
        .filename_suffix("log")
        .build("logs")
        .context("创建日志文件失败")?;
    let (writer, guard) = tracing_appender::non_blocking(appender);
    LOG_GUARD.set(guard).ok();

    let console_layer = fmt::Layer::default()
        .with_writer(std::io::stdout)
        .with_ansi(true)
        .event_format(LineFormatter { color: true })
        .with_filter(build_filter(verbosity));
    let file_layer = fmt::Layer::default()
        .with_writer(writer)
        .with_ansi(false)
        .event_format(LineFormatter { color: false })
        .with_filter(build_filter(verbosity));

    Registry::default()
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("日志系统已初始化")?;
    Ok(())
}

/// `[MM-DD hh:mm:ss.mmm] LEVEL > 消息`
struct LineFormatter {
    color: bool,
}

impl<S, N> FormatEvent<S, N> for LineFormatter
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &fmt::FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let now = Local::now();
        write!(
            writer,
            "[{:02}-{:02} {:02}:{:02}:{:02}.{:03}] ",
            now.month(),
            now.day(),
            now.hour(),
            now.minute(),
            now.second(),
            now.timestamp_subsec_millis(),
        )?;
        let level = *event.metadata().level();
        if self.color {
            let color = match level {
                tracing::Level::ERROR => "\x1b[31m",
                tracing::Level::WARN => "\x1b[33m",
                tracing::Level::INFO => "\x1b[32m",
                _ => "\x1b[34m",
            };
            write!(writer, "{color}{level:5}\x1b[0m > ")?;
        } else {
            write!(writer, "{level:5} > ")?;
        }
        ctx.format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}
