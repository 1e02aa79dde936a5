//! 宿主与语言Worker之间的流式RPC消息模型
//!
//! 传输层只负责搬运 [`StreamingMessage`]，这里定义信封和各类载荷。

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::entities::{BindingDirection, FunctionDescriptor};

/// 消息种类标签，用于事件总线上的过滤
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum MessageKind {
    StartStream,
    WorkerInitRequest,
    WorkerInitResponse,
    FunctionEnvironmentReloadRequest,
    FunctionEnvironmentReloadResponse,
    FunctionLoadRequest,
    FunctionLoadResponse,
    InvocationRequest,
    InvocationResponse,
    RpcLog,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// 流式消息信封
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamingMessage {
    pub request_id: String,
    pub content: MessageContent,
}

impl StreamingMessage {
    pub fn new(content: MessageContent) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            content,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.content.kind()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum MessageContent {
    StartStream(StartStream),
    WorkerInitRequest(WorkerInitRequest),
    WorkerInitResponse(WorkerInitResponse),
    FunctionEnvironmentReloadRequest(FunctionEnvironmentReloadRequest),
    FunctionEnvironmentReloadResponse(FunctionEnvironmentReloadResponse),
    FunctionLoadRequest(FunctionLoadRequest),
    FunctionLoadResponse(FunctionLoadResponse),
    InvocationRequest(InvocationRequest),
    InvocationResponse(InvocationResponse),
    RpcLog(RpcLog),
}

impl MessageContent {
    pub fn kind(&self) -> MessageKind {
        match self {
            MessageContent::StartStream(_) => MessageKind::StartStream,
            MessageContent::WorkerInitRequest(_) => MessageKind::WorkerInitRequest,
            MessageContent::WorkerInitResponse(_) => MessageKind::WorkerInitResponse,
            MessageContent::FunctionEnvironmentReloadRequest(_) => {
                MessageKind::FunctionEnvironmentReloadRequest
            }
            MessageContent::FunctionEnvironmentReloadResponse(_) => {
                MessageKind::FunctionEnvironmentReloadResponse
            }
            MessageContent::FunctionLoadRequest(_) => MessageKind::FunctionLoadRequest,
            MessageContent::FunctionLoadResponse(_) => MessageKind::FunctionLoadResponse,
            MessageContent::InvocationRequest(_) => MessageKind::InvocationRequest,
            MessageContent::InvocationResponse(_) => MessageKind::InvocationResponse,
            MessageContent::RpcLog(_) => MessageKind::RpcLog,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Failure,
    Cancelled,
}

/// Worker端抛出的异常
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RpcException {
    pub message: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub stack_trace: Option<String>,
}

impl fmt::Display for RpcException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(source) => write!(f, "{source}: {}", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusResult {
    pub status: Status,
    #[serde(default)]
    pub exception: Option<RpcException>,
}

impl StatusResult {
    pub fn success() -> Self {
        Self {
            status: Status::Success,
            exception: None,
        }
    }

    pub fn failure(message: &str) -> Self {
        Self {
            status: Status::Failure,
            exception: Some(RpcException {
                message: message.to_string(),
                ..Default::default()
            }),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            status: Status::Cancelled,
            exception: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }

    /// 失败时给出可读的错误描述
    pub fn failure_message(&self) -> Option<String> {
        match self.status {
            Status::Success => None,
            Status::Cancelled => Some("cancelled by worker".to_string()),
            Status::Failure => Some(
                self.exception
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "unknown worker failure".to_string()),
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StartStream {
    pub worker_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerInitRequest {
    pub host_version: String,
    #[serde(default)]
    pub capabilities: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerInitResponse {
    #[serde(default)]
    pub worker_version: Option<String>,
    #[serde(default)]
    pub capabilities: HashMap<String, String>,
    pub result: StatusResult,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionEnvironmentReloadRequest {
    pub environment_variables: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionEnvironmentReloadResponse {
    pub result: StatusResult,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BindingInfo {
    #[serde(rename = "type")]
    pub binding_type: String,
    pub direction: BindingDirection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcFunctionMetadata {
    pub name: String,
    pub directory: String,
    pub script_file: String,
    pub entry_point: String,
    pub bindings: HashMap<String, BindingInfo>,
}

impl From<&FunctionDescriptor> for RpcFunctionMetadata {
    fn from(function: &FunctionDescriptor) -> Self {
        Self {
            name: function.name.clone(),
            directory: function.directory.to_string_lossy().into_owned(),
            script_file: function.script_file.to_string_lossy().into_owned(),
            entry_point: function.entry_point.clone().unwrap_or_default(),
            bindings: function
                .bindings
                .iter()
                .map(|b| {
                    (
                        b.name.clone(),
                        BindingInfo {
                            binding_type: b.binding_type.clone(),
                            direction: b.direction,
                        },
                    )
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionLoadRequest {
    pub function_id: String,
    pub metadata: RpcFunctionMetadata,
    #[serde(default)]
    pub managed_dependency_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionLoadResponse {
    pub function_id: String,
    pub result: StatusResult,
    #[serde(default)]
    pub is_dependency_downloaded: bool,
}

/// 命名的参数数据
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParameterBinding {
    pub name: String,
    pub data: Value,
}

impl ParameterBinding {
    pub fn new(name: &str, data: Value) -> Self {
        Self {
            name: name.to_string(),
            data,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InvocationRequest {
    pub invocation_id: String,
    pub function_id: String,
    pub input_data: Vec<ParameterBinding>,
    #[serde(default)]
    pub trigger_metadata: HashMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InvocationResponse {
    pub invocation_id: String,
    #[serde(default)]
    pub output_data: Vec<ParameterBinding>,
    #[serde(default)]
    pub return_value: Option<Value>,
    pub result: StatusResult,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum RpcLogLevel {
    Trace,
    Debug,
    Information,
    Warning,
    Error,
    Critical,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcLog {
    #[serde(default)]
    pub invocation_id: Option<String>,
    #[serde(default)]
    pub category: String,
    pub level: RpcLogLevel,
    pub message: String,
    #[serde(default)]
    pub event_id: Option<String>,
    #[serde(default)]
    pub exception: Option<RpcException>,
}
