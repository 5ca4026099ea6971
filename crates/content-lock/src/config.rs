//! 配置管理模块
//!
//! 支持配置文件加载与环境变量覆盖。

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// 按键锁配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// `acquire_default` 使用的等待超时（毫秒），为空表示无限等待
    pub acquire_timeout_ms: Option<u64>,
    /// 锁表初始容量
    pub initial_capacity: usize,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            acquire_timeout_ms: None,
            initial_capacity: 64,
        }
    }
}

impl LockConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 加载顺序（后加载的会覆盖先加载的同名配置项）：
    /// 1. config/default.toml（默认配置）
    /// 2. config/{environment}.toml（环境特定配置）
    /// 3. 环境变量（CONTENT_LOCK_ 前缀，如 CONTENT_LOCK_ACQUIRE_TIMEOUT_MS -> acquire_timeout_ms）
    pub fn load() -> Result<Self, ConfigError> {
        let env = std::env::var("CONTENT_LOCK_ENV").unwrap_or_else(|_| "development".to_string());
        let config_dir = std::env::var("CONFIG_DIR").unwrap_or_else(|_| "config".to_string());

        Self::load_from(Path::new(&config_dir), &env)
    }

    /// 从指定目录加载配置
    pub fn load_from(config_dir: &Path, env: &str) -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            .add_source(File::from(config_dir.join(format!("{}.toml", env))).required(false))
            // 字段名本身带下划线，嵌套分隔符使用双下划线
            .add_source(
                Environment::with_prefix("CONTENT_LOCK")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// 设置等待超时
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// 设置锁表初始容量
    pub fn with_initial_capacity(mut self, capacity: usize) -> Self {
        self.initial_capacity = capacity;
        self
    }

    /// 默认等待超时
    pub fn acquire_timeout(&self) -> Option<Duration> {
        self.acquire_timeout_ms.map(Duration::from_millis)
    }
}
