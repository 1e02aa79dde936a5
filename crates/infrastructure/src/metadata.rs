use std::path::{Path, PathBuf};

use async_trait::async_trait;
use funchost_config::LanguageWorkerConfig;
use funchost_domain::{
    BindingMetadata, FunctionDescriptor, FunctionMetadataProvider, FunctionMetadataResult,
};
use funchost_errors::{HostError, HostResult};
use serde::Deserialize;
use tracing::{debug, info, warn};

const FUNCTION_JSON: &str = "function.json";

/// function.json 的磁盘格式
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FunctionJson {
    #[serde(default)]
    bindings: Vec<BindingMetadata>,
    #[serde(default)]
    script_file: Option<String>,
    #[serde(default)]
    entry_point: Option<String>,
    #[serde(default)]
    disabled: bool,
}

/// 扫描脚本根目录下每个含 function.json 的子目录
#[derive(Debug, Default, Clone)]
pub struct FileSystemMetadataProvider;

impl FileSystemMetadataProvider {
    pub fn new() -> Self {
        Self
    }

    fn read_function(
        directory: &Path,
        name: &str,
        worker_configs: &[LanguageWorkerConfig],
    ) -> Result<FunctionDescriptor, String> {
        let json_path = directory.join(FUNCTION_JSON);
        let content = std::fs::read_to_string(&json_path)
            .map_err(|e| format!("unable to read {}: {e}", json_path.display()))?;
        let function_json: FunctionJson = serde_json::from_str(&content)
            .map_err(|e| format!("invalid {FUNCTION_JSON}: {e}"))?;

        if function_json.bindings.iter().filter(|b| b.is_trigger()).count() != 1 {
            return Err("function must declare exactly one trigger binding".to_string());
        }

        let script_file = match &function_json.script_file {
            Some(script) => {
                let path = directory.join(script);
                if !path.is_file() {
                    return Err(format!("script file '{}' does not exist", path.display()));
                }
                path
            }
            None => Self::discover_script(directory, worker_configs)?,
        };

        let worker = worker_configs
            .iter()
            .find(|config| config.handles_path(&script_file))
            .ok_or_else(|| {
                format!(
                    "no language worker handles script file '{}'",
                    script_file.display()
                )
            })?;

        let mut descriptor = FunctionDescriptor::new(
            name,
            &worker.language,
            directory.to_path_buf(),
            script_file,
        );
        descriptor.entry_point = function_json.entry_point;
        descriptor.bindings = function_json.bindings;
        descriptor.is_disabled = function_json.disabled;
        Ok(descriptor)
    }

    /// 未指定scriptFile时：唯一的源文件，或者名为 index/run 的源文件
    fn discover_script(
        directory: &Path,
        worker_configs: &[LanguageWorkerConfig],
    ) -> Result<PathBuf, String> {
        let entries = std::fs::read_dir(directory)
            .map_err(|e| format!("unable to list {}: {e}", directory.display()))?;
        let mut candidates: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file())
            .filter(|path| worker_configs.iter().any(|c| c.handles_path(path)))
            .collect();
        candidates.sort();

        if candidates.len() == 1 {
            return Ok(candidates.remove(0));
        }
        candidates
            .into_iter()
            .find(|path| {
                path.file_stem()
                    .and_then(|stem| stem.to_str())
                    .is_some_and(|stem| stem.eq_ignore_ascii_case("index") || stem.eq_ignore_ascii_case("run"))
            })
            .ok_or_else(|| "unable to determine the primary script file".to_string())
    }
}

#[async_trait]
impl FunctionMetadataProvider for FileSystemMetadataProvider {
    async fn read_functions_metadata(
        &self,
        script_root: &Path,
        allowlist: Option<&[String]>,
        worker_configs: &[LanguageWorkerConfig],
    ) -> HostResult<FunctionMetadataResult> {
        let entries = std::fs::read_dir(script_root).map_err(|e| {
            HostError::Metadata(format!(
                "unable to read script root {}: {e}",
                script_root.display()
            ))
        })?;

        let mut directories: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_dir() && path.join(FUNCTION_JSON).is_file())
            .collect();
        directories.sort();

        let mut result = FunctionMetadataResult::default();
        for directory in directories {
            let Some(name) = directory.file_name().and_then(|n| n.to_str()).map(str::to_string)
            else {
                continue;
            };

            if let Some(allowlist) = allowlist {
                if !allowlist.iter().any(|allowed| allowed.eq_ignore_ascii_case(&name)) {
                    debug!(function = %name, "函数不在白名单中，跳过");
                    continue;
                }
            }

            match Self::read_function(&directory, &name, worker_configs) {
                Ok(descriptor) => result.functions.push(descriptor),
                Err(message) => {
                    warn!(function = %name, "函数元数据无效: {}", message);
                    result.add_error(&name, message);
                }
            }
        }

        info!(
            "从 {} 发现 {} 个函数，{} 个函数存在错误",
            script_root.display(),
            result.functions.len(),
            result.errors.len()
        );
        Ok(result)
    }
}
