use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use funchost_config::LanguageWorkerConfig;
use funchost_errors::HostResult;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Worker进程输出的一行
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutputLine {
    pub stream: OutputStream,
    pub line: String,
}

/// 承载一个语言运行时的操作系统进程
#[async_trait]
pub trait WorkerProcess: Send + Sync {
    /// 启动进程，启动失败返回 `HostError::ProcessLaunch`
    async fn start(&self) -> HostResult<()>;

    /// 取走进程输出流，只能取一次
    fn take_output(&self) -> Option<mpsc::UnboundedReceiver<ProcessOutputLine>>;

    /// 终止进程并释放资源，可重复调用
    async fn dispose(&self);

    fn is_running(&self) -> bool;
}

/// 启动一个Worker进程所需的全部信息
#[derive(Debug, Clone)]
pub struct WorkerProcessSpec {
    pub worker_id: String,
    pub config: LanguageWorkerConfig,
    pub script_root: PathBuf,
    pub environment: Vec<(String, String)>,
}

pub trait WorkerProcessFactory: Send + Sync {
    fn create(&self, spec: WorkerProcessSpec) -> Arc<dyn WorkerProcess>;
}
