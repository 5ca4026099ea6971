//! 可观测性模块
//!
//! 提供日志初始化和按键锁指标。指标通过 metrics crate 门面记录，
//! 未安装 recorder 时记录操作为空操作，由宿主服务决定导出方式。

use anyhow::Result;
use serde::Deserialize;
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::error::LockError;

/// 日志配置
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// 日志级别（如 "info", "debug"）
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// 是否启用 JSON 格式日志
    #[serde(default)]
    pub json_logs: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
        }
    }
}

impl ObservabilityConfig {
    /// 从环境变量加载配置
    pub fn from_env() -> Self {
        Self {
            log_level: std::env::var("RUST_LOG").unwrap_or_else(|_| default_log_level()),
            json_logs: std::env::var("JSON_LOGS")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
        }
    }
}

/// 初始化 tracing 日志
///
/// 全局 subscriber 已存在时返回错误。
pub fn init_tracing(config: &ObservabilityConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = if config.json_logs {
        fmt::layer()
            .json()
            .with_span_events(FmtSpan::CLOSE)
            .with_target(true)
            .with_thread_ids(true)
            .boxed()
    } else {
        fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_ansi(true)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;

    describe_metrics();
    Ok(())
}

/// 注册按键锁指标描述
///
/// 这些描述会出现在导出端点的 HELP 注释中。
pub fn describe_metrics() {
    metrics::describe_counter!(
        "keyed_lock_acquisitions_total",
        "Total number of keyed lock acquisition attempts by outcome"
    );
    metrics::describe_histogram!(
        "keyed_lock_wait_duration_seconds",
        "Time spent waiting for a keyed lock in seconds"
    );
    metrics::describe_counter!("keyed_lock_releases_total", "Total number of keyed lock releases");
    metrics::describe_gauge!("keyed_lock_entries", "Number of live keyed lock entries");
}

// ============================================================================
// 指标记录函数
// ============================================================================

#[inline]
pub(crate) fn record_lock_acquired(wait_secs: f64) {
    metrics::counter!("keyed_lock_acquisitions_total", "outcome" => "acquired").increment(1);
    metrics::histogram!("keyed_lock_wait_duration_seconds").record(wait_secs);
}

#[inline]
pub(crate) fn record_lock_abandoned(err: LockError) {
    metrics::counter!("keyed_lock_acquisitions_total", "outcome" => err.outcome()).increment(1);
}

/// 记录非阻塞加锁失败
#[inline]
pub(crate) fn record_lock_contended() {
    metrics::counter!("keyed_lock_acquisitions_total", "outcome" => "contended").increment(1);
}

#[inline]
pub(crate) fn record_lock_released() {
    metrics::counter!("keyed_lock_releases_total").increment(1);
}

#[inline]
pub(crate) fn record_entry_created() {
    metrics::gauge!("keyed_lock_entries").increment(1.0);
}

#[inline]
pub(crate) fn record_entry_removed() {
    metrics::gauge!("keyed_lock_entries").decrement(1.0);
}
