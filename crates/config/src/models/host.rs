use std::time::Duration;

use crate::validation::{ConfigValidator, ValidationUtils};
use serde::{Deserialize, Serialize};

/// 宿主级配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HostConfig {
    /// 函数应用脚本根目录
    pub script_root: String,
    /// 初始化握手时上报给Worker的宿主版本
    pub host_version: String,
    /// 未设置运行时环境变量时使用的Worker语言
    pub default_worker_runtime: String,
    /// 函数白名单，None表示不过滤
    pub function_allowlist: Option<Vec<String>>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            script_root: "./functions".to_string(),
            host_version: env!("CARGO_PKG_VERSION").to_string(),
            default_worker_runtime: "node".to_string(),
            function_allowlist: None,
        }
    }
}

impl ConfigValidator for HostConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_not_empty(&self.script_root, "host.script_root")?;
        ValidationUtils::validate_not_empty(&self.host_version, "host.host_version")?;
        ValidationUtils::validate_not_empty(
            &self.default_worker_runtime,
            "host.default_worker_runtime",
        )?;
        if let Some(allowlist) = &self.function_allowlist {
            for name in allowlist {
                ValidationUtils::validate_not_empty(name, "host.function_allowlist")?;
            }
        }
        Ok(())
    }
}

/// Worker通道协议相关的超时和缓冲配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChannelConfig {
    pub process_start_timeout_seconds: u64,
    pub worker_init_timeout_seconds: u64,
    pub environment_reload_timeout_seconds: u64,
    pub function_load_timeout_seconds: u64,
    pub invocation_timeout_seconds: u64,
    pub file_change_debounce_ms: u64,
    pub stderr_buffer_lines: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            process_start_timeout_seconds: 60,
            worker_init_timeout_seconds: 30,
            environment_reload_timeout_seconds: 30,
            function_load_timeout_seconds: 60,
            invocation_timeout_seconds: 300,
            file_change_debounce_ms: 300,
            stderr_buffer_lines: 3,
        }
    }
}

impl ChannelConfig {
    pub fn process_start_timeout(&self) -> Duration {
        Duration::from_secs(self.process_start_timeout_seconds)
    }

    pub fn worker_init_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_init_timeout_seconds)
    }

    pub fn environment_reload_timeout(&self) -> Duration {
        Duration::from_secs(self.environment_reload_timeout_seconds)
    }

    pub fn function_load_timeout(&self) -> Duration {
        Duration::from_secs(self.function_load_timeout_seconds)
    }

    pub fn invocation_timeout(&self) -> Duration {
        Duration::from_secs(self.invocation_timeout_seconds)
    }

    pub fn file_change_debounce(&self) -> Duration {
        Duration::from_millis(self.file_change_debounce_ms)
    }
}

impl ConfigValidator for ChannelConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_timeout_seconds(
            self.process_start_timeout_seconds,
            "channel.process_start_timeout_seconds",
        )?;
        ValidationUtils::validate_timeout_seconds(
            self.worker_init_timeout_seconds,
            "channel.worker_init_timeout_seconds",
        )?;
        ValidationUtils::validate_timeout_seconds(
            self.environment_reload_timeout_seconds,
            "channel.environment_reload_timeout_seconds",
        )?;
        ValidationUtils::validate_timeout_seconds(
            self.function_load_timeout_seconds,
            "channel.function_load_timeout_seconds",
        )?;
        ValidationUtils::validate_timeout_seconds(
            self.invocation_timeout_seconds,
            "channel.invocation_timeout_seconds",
        )?;
        if self.file_change_debounce_ms > 60_000 {
            return Err(crate::ConfigError::Validation(
                "channel.file_change_debounce_ms must be less than or equal to 60000".to_string(),
            ));
        }
        ValidationUtils::validate_count(self.stderr_buffer_lines, "channel.stderr_buffer_lines", 100)?;
        Ok(())
    }
}

/// 托管依赖下载选项
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ManagedDependencyConfig {
    pub enabled: bool,
}
