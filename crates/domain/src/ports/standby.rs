use async_trait::async_trait;
use funchost_errors::HostResult;

/// 宿主级的特化钩子，对核心来说是不透明的异步操作
#[async_trait]
pub trait StandbyManager: Send + Sync {
    /// 从磁盘重新加载宿主配置
    async fn specialize_host_reload_config(&self) -> HostResult<()>;

    /// 完成宿主特化
    async fn specialize_host(&self) -> HostResult<()>;
}
