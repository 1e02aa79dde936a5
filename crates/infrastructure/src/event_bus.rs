use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use funchost_domain::{MessageKind, ScriptEvent};
use funchost_errors::{HostError, HostResult};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// 订阅过滤条件
#[derive(Debug, Clone, PartialEq)]
pub enum EventFilter {
    All,
    /// 某个Worker发来的消息，kinds为None表示所有种类
    Inbound {
        worker_id: String,
        kinds: Option<Vec<MessageKind>>,
    },
    /// 发往Worker的消息，worker_id为None表示所有Worker
    Outbound { worker_id: Option<String> },
    FileChanged,
    WorkerError,
    HostRestart,
}

impl EventFilter {
    pub fn inbound(worker_id: &str, kind: MessageKind) -> Self {
        EventFilter::Inbound {
            worker_id: worker_id.to_string(),
            kinds: Some(vec![kind]),
        }
    }

    pub fn inbound_kinds(worker_id: &str, kinds: &[MessageKind]) -> Self {
        EventFilter::Inbound {
            worker_id: worker_id.to_string(),
            kinds: Some(kinds.to_vec()),
        }
    }

    pub fn outbound(worker_id: &str) -> Self {
        EventFilter::Outbound {
            worker_id: Some(worker_id.to_string()),
        }
    }

    pub fn matches(&self, event: &ScriptEvent) -> bool {
        match (self, event) {
            (EventFilter::All, _) => true,
            (EventFilter::Inbound { worker_id, kinds }, ScriptEvent::Inbound(inbound)) => {
                inbound.worker_id == *worker_id
                    && kinds
                        .as_ref()
                        .map_or(true, |kinds| kinds.contains(&inbound.kind()))
            }
            (EventFilter::Outbound { worker_id }, ScriptEvent::Outbound(outbound)) => worker_id
                .as_ref()
                .map_or(true, |worker_id| outbound.worker_id == *worker_id),
            (EventFilter::FileChanged, ScriptEvent::FileChanged(_)) => true,
            (EventFilter::WorkerError, ScriptEvent::WorkerError(_)) => true,
            (EventFilter::HostRestart, ScriptEvent::HostRestart(_)) => true,
            _ => false,
        }
    }
}

struct Subscriber {
    filter: EventFilter,
    sender: mpsc::UnboundedSender<ScriptEvent>,
}

#[derive(Default)]
struct BusInner {
    subscribers: RwLock<HashMap<u64, Subscriber>>,
    next_id: AtomicU64,
}

impl BusInner {
    fn unsubscribe(&self, id: u64) {
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subscribers.remove(&id);
    }
}

/// 进程级事件总线
///
/// 订阅方注册过滤条件，匹配的事件投递到各自独立的无界队列。
/// 发布是同步的且从不阻塞，接收端已关闭的订阅在发布时被清理。
#[derive(Clone, Default)]
pub struct ScriptEventManager {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for ScriptEventManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptEventManager")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl ScriptEventManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, event: ScriptEvent) {
        let mut closed = Vec::new();
        {
            let subscribers = self
                .inner
                .subscribers
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            for (id, subscriber) in subscribers.iter() {
                if subscriber.filter.matches(&event)
                    && subscriber.sender.send(event.clone()).is_err()
                {
                    closed.push(*id);
                }
            }
        }

        trace!(event_type = event.event_type(), "event published");

        if !closed.is_empty() {
            debug!("Pruning {} closed event subscriptions", closed.len());
            for id in closed {
                self.inner.unsubscribe(id);
            }
        }
    }

    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut subscribers = self
                .inner
                .subscribers
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            subscribers.insert(id, Subscriber { filter, sender });
        }
        Subscription {
            id,
            receiver,
            bus: Arc::downgrade(&self.inner),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

/// 订阅句柄，drop时自动退订
pub struct Subscription {
    id: u64,
    receiver: mpsc::UnboundedReceiver<ScriptEvent>,
    bus: Weak<BusInner>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<ScriptEvent> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ScriptEvent> {
        self.receiver.try_recv().ok()
    }

    /// 取第一个匹配事件后退订；超时返回 `HostError::Timeout`
    pub async fn next_within(mut self, timeout: Duration, operation: &str) -> HostResult<ScriptEvent> {
        match tokio::time::timeout(timeout, self.receiver.recv()).await {
            Ok(Some(event)) => Ok(event),
            Ok(None) => Err(HostError::Internal(format!(
                "event bus closed while waiting for {operation}"
            ))),
            Err(_) => Err(HostError::timeout(format!(
                "{operation} not received within {}ms",
                timeout.as_millis()
            ))),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}
