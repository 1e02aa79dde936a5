use std::path::Path;

use async_trait::async_trait;
use funchost_config::LanguageWorkerConfig;
use funchost_errors::HostResult;

use crate::entities::FunctionMetadataResult;

/// 函数元数据来源
///
/// 单个函数目录格式错误时记录到结果的errors中，不中断整个扫描。
#[async_trait]
pub trait FunctionMetadataProvider: Send + Sync {
    async fn read_functions_metadata(
        &self,
        script_root: &Path,
        allowlist: Option<&[String]>,
        worker_configs: &[LanguageWorkerConfig],
    ) -> HostResult<FunctionMetadataResult>;
}
