use std::path::Path;

use crate::validation::{ConfigValidator, ValidationUtils};
use serde::{Deserialize, Serialize};

/// 单个语言Worker的启动描述
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LanguageWorkerConfig {
    /// 语言名称，例如 "node"
    pub language: String,
    /// 运行时可执行文件，例如 "node"
    pub executable: String,
    /// 传给运行时的额外参数
    #[serde(default)]
    pub arguments: Vec<String>,
    /// Worker入口脚本路径
    #[serde(default)]
    pub worker_path: Option<String>,
    /// 该语言的源文件扩展名（含点号）
    #[serde(default)]
    pub extensions: Vec<String>,
}

impl LanguageWorkerConfig {
    pub fn node() -> Self {
        Self {
            language: "node".to_string(),
            executable: "node".to_string(),
            arguments: Vec::new(),
            worker_path: Some("workers/node/dist/src/nodejsWorker.js".to_string()),
            extensions: vec![".js".to_string(), ".mjs".to_string()],
        }
    }

    /// 判断给定路径是否是该语言的源文件
    pub fn handles_path(&self, path: &Path) -> bool {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) => self
                .extensions
                .iter()
                .any(|candidate| candidate.trim_start_matches('.').eq_ignore_ascii_case(ext)),
            None => false,
        }
    }
}

impl ConfigValidator for LanguageWorkerConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_not_empty(&self.language, "languages.language")?;
        ValidationUtils::validate_not_empty(&self.executable, "languages.executable")?;
        if self.extensions.is_empty() {
            return Err(crate::ConfigError::Validation(format!(
                "languages.extensions cannot be empty for language '{}'",
                self.language
            )));
        }
        for extension in &self.extensions {
            ValidationUtils::validate_extension(extension, "languages.extensions")?;
        }
        Ok(())
    }
}
