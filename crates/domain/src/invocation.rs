//! 调用上下文与结果槽
//!
//! 调用方创建 [`ScriptInvocationContext`] 并持有对应的 [`InvocationResultReceiver`]；
//! 上下文在Worker通道内部流转，最终由响应路径、取消或通道释放恰好解析一次。

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use funchost_errors::{HostError, HostResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::entities::FunctionDescriptor;
use crate::rpc::ParameterBinding;

/// 调用结果：按名称的输出绑定加可选的返回值
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ScriptInvocationResult {
    pub outputs: HashMap<String, Value>,
    pub return_value: Option<Value>,
}

pub struct ScriptInvocationContext {
    pub function: Arc<FunctionDescriptor>,
    /// 调用方视角的调用ID，线上的invocation id在发送时另行生成
    pub invocation_id: Uuid,
    pub inputs: Vec<ParameterBinding>,
    pub trigger_metadata: HashMap<String, Value>,
    pub cancellation: CancellationToken,
    /// 调用方的tracing上下文，Worker为该调用输出日志时在其中记录
    pub span: tracing::Span,
    pub created_at: DateTime<Utc>,
    result: Option<oneshot::Sender<HostResult<ScriptInvocationResult>>>,
}

impl std::fmt::Debug for ScriptInvocationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptInvocationContext")
            .field("function", &self.function.name)
            .field("invocation_id", &self.invocation_id)
            .field("inputs", &self.inputs.len())
            .field("created_at", &self.created_at)
            .finish()
    }
}

impl ScriptInvocationContext {
    /// 创建上下文；span默认取当前span
    pub fn new(
        function: Arc<FunctionDescriptor>,
        inputs: Vec<ParameterBinding>,
    ) -> (Self, InvocationResultReceiver) {
        let (tx, rx) = oneshot::channel();
        let invocation_id = Uuid::new_v4();
        let context = Self {
            function,
            invocation_id,
            inputs,
            trigger_metadata: HashMap::new(),
            cancellation: CancellationToken::new(),
            span: tracing::Span::current(),
            created_at: Utc::now(),
            result: Some(tx),
        };
        (context, InvocationResultReceiver { invocation_id, rx })
    }

    pub fn with_trigger_metadata(mut self, trigger_metadata: HashMap<String, Value>) -> Self {
        self.trigger_metadata = trigger_metadata;
        self
    }

    pub fn with_span(mut self, span: tracing::Span) -> Self {
        self.span = span;
        self
    }

    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }

    pub fn function_id(&self) -> &str {
        &self.function.function_id
    }

    /// 解析结果槽，返回调用方是否仍在等待
    pub fn complete(mut self, result: HostResult<ScriptInvocationResult>) -> bool {
        match self.result.take() {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }

    pub fn fail(self, error: HostError) -> bool {
        self.complete(Err(error))
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// 调用方持有的结果等待端
#[derive(Debug)]
pub struct InvocationResultReceiver {
    invocation_id: Uuid,
    rx: oneshot::Receiver<HostResult<ScriptInvocationResult>>,
}

impl InvocationResultReceiver {
    pub fn invocation_id(&self) -> Uuid {
        self.invocation_id
    }

    /// 等待结果；上下文未解析就被丢弃时返回内部错误
    pub async fn wait(self) -> HostResult<ScriptInvocationResult> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(HostError::Internal(format!(
                "invocation {} was dropped without a result",
                self.invocation_id
            ))),
        }
    }
}
