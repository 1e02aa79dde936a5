use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{
    host::{ChannelConfig, HostConfig, ManagedDependencyConfig},
    language_worker::LanguageWorkerConfig,
    logging::LoggingConfig,
};
use crate::validation::ConfigValidator;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub host: HostConfig,
    pub channel: ChannelConfig,
    pub managed_dependency: ManagedDependencyConfig,
    pub logging: LoggingConfig,
    pub languages: Vec<LanguageWorkerConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: HostConfig::default(),
            channel: ChannelConfig::default(),
            managed_dependency: ManagedDependencyConfig::default(),
            logging: LoggingConfig::default(),
            languages: vec![LanguageWorkerConfig::node()],
        }
    }
}

impl AppConfig {
    /// 依次叠加：配置文件 -> `FUNCHOST__` 前缀的环境变量
    ///
    /// 未指定路径时按默认路径顺序查找，都不存在则只使用默认值。
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else {
            let default_paths = ["config/funchost.toml", "funchost.toml", "/etc/funchost/config.toml"];
            if let Some(path) = default_paths.iter().find(|p| Path::new(p).exists()) {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("FUNCHOST")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;

        Ok(config)
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    /// 按语言名查找Worker配置（忽略大小写）
    pub fn language(&self, language: &str) -> Option<&LanguageWorkerConfig> {
        self.languages
            .iter()
            .find(|worker| worker.language.eq_ignore_ascii_case(language))
    }
}

impl ConfigValidator for AppConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        self.host.validate()?;
        self.channel.validate()?;
        self.logging.validate()?;
        if self.languages.is_empty() {
            return Err(crate::ConfigError::Validation(
                "at least one language worker must be configured".to_string(),
            ));
        }
        for language in &self.languages {
            language.validate()?;
        }
        let mut names: Vec<String> = self
            .languages
            .iter()
            .map(|l| l.language.to_lowercase())
            .collect();
        names.sort();
        names.dedup();
        if names.len() != self.languages.len() {
            return Err(crate::ConfigError::Validation(
                "languages contains duplicate language entries".to_string(),
            ));
        }
        Ok(())
    }
}
