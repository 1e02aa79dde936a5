use thiserror::Error;

/// 宿主核心统一错误类型
///
/// 所有变体都可以克隆：同一个函数加载错误会被缓存，并在后续每次调用时重放。
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HostError {
    #[error("Worker进程启动失败: {0}")]
    ProcessLaunch(String),
    #[error("操作超时: {0}")]
    Timeout(String),
    #[error("函数加载失败: {function_id} - {message}")]
    FunctionLoad { function_id: String, message: String },
    #[error("函数调用失败: {0}")]
    Invocation(String),
    #[error("函数调用已取消: {invocation_id}")]
    InvocationCancelled { invocation_id: String },
    #[error("Worker通道已释放: {worker_id}")]
    ChannelDisposed { worker_id: String },
    #[error("无效的通道状态: {0}")]
    InvalidState(String),
    #[error("Worker通道错误: {language}/{worker_id} - {message}")]
    WorkerChannel {
        language: String,
        worker_id: String,
        message: String,
    },
    #[error("函数未找到: {name}")]
    FunctionNotFound { name: String },
    #[error("Worker通道未找到: {language}")]
    ChannelNotFound { language: String },
    #[error("函数元数据错误: {0}")]
    Metadata(String),
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("特化失败: {0}")]
    Specialization(String),
    #[error("IO错误: {0}")]
    Io(String),
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type HostResult<T> = Result<T, HostError>;

impl HostError {
    pub fn timeout<S: Into<String>>(operation: S) -> Self {
        Self::Timeout(operation.into())
    }
    pub fn function_load<S: Into<String>, M: Into<String>>(function_id: S, message: M) -> Self {
        Self::FunctionLoad {
            function_id: function_id.into(),
            message: message.into(),
        }
    }
    pub fn invocation<S: Into<String>>(msg: S) -> Self {
        Self::Invocation(msg.into())
    }
    pub fn channel_disposed<S: Into<String>>(worker_id: S) -> Self {
        Self::ChannelDisposed {
            worker_id: worker_id.into(),
        }
    }
    pub fn worker_channel<L, W, M>(language: L, worker_id: W, message: M) -> Self
    where
        L: Into<String>,
        W: Into<String>,
        M: Into<String>,
    {
        Self::WorkerChannel {
            language: language.into(),
            worker_id: worker_id.into(),
            message: message.into(),
        }
    }
    pub fn function_not_found<S: Into<String>>(name: S) -> Self {
        Self::FunctionNotFound { name: name.into() }
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    pub fn specialization<S: Into<String>>(msg: S) -> Self {
        Self::Specialization(msg.into())
    }

    /// 通道级致命错误：该通道不能再继续使用
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            HostError::ProcessLaunch(_)
                | HostError::ChannelDisposed { .. }
                | HostError::WorkerChannel { .. }
        )
    }

    /// 下一次请求可以重新尝试的错误
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            HostError::Timeout(_) | HostError::Specialization(_) | HostError::Io(_)
        )
    }

    /// 对外响应使用的HTTP状态码
    pub fn status_code(&self) -> u16 {
        match self {
            HostError::FunctionNotFound { .. } => 404,
            HostError::Timeout(_) => 504,
            HostError::ChannelNotFound { .. } | HostError::ChannelDisposed { .. } => 503,
            _ => 500,
        }
    }
}

impl From<serde_json::Error> for HostError {
    fn from(err: serde_json::Error) -> Self {
        HostError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for HostError {
    fn from(err: std::io::Error) -> Self {
        HostError::Io(err.to_string())
    }
}

impl From<anyhow::Error> for HostError {
    fn from(err: anyhow::Error) -> Self {
        HostError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests;
