//! 事件总线上流转的事件
//!
//! 各组件通过事件解耦：Worker通道只关心带自己worker id的入站消息，
//! 通道管理器只关心Worker错误，宿主只关心重启请求。

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use funchost_errors::HostError;

use crate::rpc::{MessageKind, StreamingMessage};

/// Worker发往宿主的消息
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub worker_id: String,
    pub message: Arc<StreamingMessage>,
}

impl InboundEvent {
    pub fn new(worker_id: &str, message: StreamingMessage) -> Self {
        Self {
            worker_id: worker_id.to_string(),
            message: Arc::new(message),
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.message.kind()
    }
}

/// 宿主发往Worker的消息，由传输层按worker id投递
#[derive(Debug, Clone)]
pub struct OutboundEvent {
    pub worker_id: String,
    pub message: Arc<StreamingMessage>,
}

impl OutboundEvent {
    pub fn new(worker_id: &str, message: StreamingMessage) -> Self {
        Self {
            worker_id: worker_id.to_string(),
            message: Arc::new(message),
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.message.kind()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileChangeKind {
    Created,
    Changed,
    Deleted,
    Renamed,
}

#[derive(Debug, Clone)]
pub struct FileChangeEvent {
    pub path: PathBuf,
    pub change: FileChangeKind,
}

/// Worker崩溃或协议错误
#[derive(Debug, Clone)]
pub struct WorkerErrorEvent {
    pub language: String,
    pub worker_id: String,
    pub error: HostError,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct HostRestartEvent {
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum ScriptEvent {
    Inbound(InboundEvent),
    Outbound(OutboundEvent),
    FileChanged(FileChangeEvent),
    WorkerError(WorkerErrorEvent),
    HostRestart(HostRestartEvent),
}

impl ScriptEvent {
    pub fn inbound(worker_id: &str, message: StreamingMessage) -> Self {
        ScriptEvent::Inbound(InboundEvent::new(worker_id, message))
    }

    pub fn outbound(worker_id: &str, message: StreamingMessage) -> Self {
        ScriptEvent::Outbound(OutboundEvent::new(worker_id, message))
    }

    pub fn file_changed(path: impl Into<PathBuf>, change: FileChangeKind) -> Self {
        ScriptEvent::FileChanged(FileChangeEvent {
            path: path.into(),
            change,
        })
    }

    pub fn worker_error(language: &str, worker_id: &str, error: HostError) -> Self {
        ScriptEvent::WorkerError(WorkerErrorEvent {
            language: language.to_string(),
            worker_id: worker_id.to_string(),
            error,
            occurred_at: Utc::now(),
        })
    }

    pub fn host_restart(reason: &str) -> Self {
        ScriptEvent::HostRestart(HostRestartEvent {
            reason: reason.to_string(),
            occurred_at: Utc::now(),
        })
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            ScriptEvent::Inbound(_) => "Inbound",
            ScriptEvent::Outbound(_) => "Outbound",
            ScriptEvent::FileChanged(_) => "FileChanged",
            ScriptEvent::WorkerError(_) => "WorkerError",
            ScriptEvent::HostRestart(_) => "HostRestart",
        }
    }
}
