//! Scripted language worker that speaks the host protocol over the event bus.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use funchost_domain::{
    FunctionEnvironmentReloadResponse, FunctionLoadResponse, InvocationRequest,
    InvocationResponse, MessageContent, MessageKind, ParameterBinding, RpcLog, RpcLogLevel,
    ScriptEvent, StartStream, StatusResult, StreamingMessage, WorkerInitResponse,
};
use funchost_infrastructure::{EventFilter, ScriptEventManager};
use serde_json::json;
use tokio::task::JoinHandle;

pub type InvocationHandler = Arc<dyn Fn(&InvocationRequest) -> InvocationResponse + Send + Sync>;

/// How the fake worker answers each request kind.
///
/// `None` for a result means the worker never answers that request.
#[derive(Clone)]
pub struct FakeWorkerBehavior {
    pub send_start_stream: bool,
    pub init_result: Option<StatusResult>,
    pub duplicate_init_response: bool,
    pub capabilities: HashMap<String, String>,
    pub reload_result: Option<StatusResult>,
    /// function name -> load error message
    pub load_failures: HashMap<String, String>,
    pub respond_to_loads: bool,
    pub respond_to_invocations: bool,
    pub invocation_delay: Option<Duration>,
    /// emit one RpcLog per invocation before answering
    pub log_invocations: bool,
    pub invocation_handler: InvocationHandler,
}

impl Default for FakeWorkerBehavior {
    fn default() -> Self {
        let mut capabilities = HashMap::new();
        capabilities.insert("RpcHttpBodyOnly".to_string(), "true".to_string());
        Self {
            send_start_stream: true,
            init_result: Some(StatusResult::success()),
            duplicate_init_response: false,
            capabilities,
            reload_result: Some(StatusResult::success()),
            load_failures: HashMap::new(),
            respond_to_loads: true,
            respond_to_invocations: true,
            invocation_delay: None,
            log_invocations: false,
            invocation_handler: Arc::new(echo_http_response),
        }
    }
}

impl std::fmt::Debug for FakeWorkerBehavior {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeWorkerBehavior")
            .field("send_start_stream", &self.send_start_stream)
            .field("init_result", &self.init_result)
            .field("reload_result", &self.reload_result)
            .field("load_failures", &self.load_failures)
            .field("respond_to_invocations", &self.respond_to_invocations)
            .finish()
    }
}

impl FakeWorkerBehavior {
    pub fn silent() -> Self {
        Self {
            send_start_stream: false,
            init_result: None,
            reload_result: None,
            respond_to_loads: false,
            respond_to_invocations: false,
            ..Default::default()
        }
    }

    pub fn failing_load(mut self, function_name: &str, message: &str) -> Self {
        self.load_failures
            .insert(function_name.to_string(), message.to_string());
        self
    }

    pub fn holding_invocations(mut self) -> Self {
        self.respond_to_invocations = false;
        self
    }

    pub fn with_invocation_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&InvocationRequest) -> InvocationResponse + Send + Sync + 'static,
    {
        self.invocation_handler = Arc::new(handler);
        self
    }
}

/// Default handler: answers with an http `res` output echoing the first input.
pub fn echo_http_response(request: &InvocationRequest) -> InvocationResponse {
    let body = request
        .input_data
        .first()
        .map(|binding| binding.data.clone())
        .unwrap_or(serde_json::Value::Null);
    InvocationResponse {
        invocation_id: request.invocation_id.clone(),
        output_data: vec![ParameterBinding::new(
            "res",
            json!({ "status": 200, "body": body }),
        )],
        return_value: None,
        result: StatusResult::success(),
    }
}

/// A worker living on the event bus for one worker id.
pub struct FakeLanguageWorker {
    worker_id: String,
    events: ScriptEventManager,
    received: Arc<Mutex<Vec<StreamingMessage>>>,
    handle: JoinHandle<()>,
}

impl FakeLanguageWorker {
    /// Subscribes before returning, so nothing published afterwards is missed.
    pub fn spawn(events: ScriptEventManager, worker_id: &str, behavior: FakeWorkerBehavior) -> Self {
        let mut subscription = events.subscribe(EventFilter::outbound(worker_id));
        let received = Arc::new(Mutex::new(Vec::new()));

        let task_events = events.clone();
        let task_received = Arc::clone(&received);
        let task_worker_id = worker_id.to_string();
        let handle = tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                let ScriptEvent::Outbound(outbound) = event else {
                    continue;
                };
                let message = outbound.message.as_ref().clone();
                task_received.lock().unwrap().push(message.clone());
                Self::respond(&task_events, &task_worker_id, &behavior, message).await;
            }
        });

        Self {
            worker_id: worker_id.to_string(),
            events,
            received,
            handle,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn send_start_stream(&self) {
        self.reply(MessageContent::StartStream(StartStream {
            worker_id: self.worker_id.clone(),
        }));
    }

    /// Publish an arbitrary inbound message as if the worker sent it.
    pub fn reply(&self, content: MessageContent) {
        self.events
            .publish(ScriptEvent::inbound(&self.worker_id, StreamingMessage::new(content)));
    }

    pub fn received(&self) -> Vec<StreamingMessage> {
        self.received.lock().unwrap().clone()
    }

    pub fn received_of(&self, kind: MessageKind) -> Vec<StreamingMessage> {
        self.received()
            .into_iter()
            .filter(|message| message.kind() == kind)
            .collect()
    }

    pub fn invocation_requests(&self) -> Vec<InvocationRequest> {
        self.received()
            .into_iter()
            .filter_map(|message| match message.content {
                MessageContent::InvocationRequest(request) => Some(request),
                _ => None,
            })
            .collect()
    }

    pub fn stop(&self) {
        self.handle.abort();
    }

    async fn respond(
        events: &ScriptEventManager,
        worker_id: &str,
        behavior: &FakeWorkerBehavior,
        message: StreamingMessage,
    ) {
        let publish = |content: MessageContent| {
            events.publish(ScriptEvent::inbound(worker_id, StreamingMessage::new(content)));
        };

        match message.content {
            MessageContent::WorkerInitRequest(_) => {
                if let Some(result) = &behavior.init_result {
                    let response = MessageContent::WorkerInitResponse(WorkerInitResponse {
                        worker_version: Some("1.0.0-fake".to_string()),
                        capabilities: behavior.capabilities.clone(),
                        result: result.clone(),
                    });
                    if behavior.duplicate_init_response {
                        publish(response.clone());
                    }
                    publish(response);
                }
            }
            MessageContent::FunctionEnvironmentReloadRequest(_) => {
                if let Some(result) = &behavior.reload_result {
                    publish(MessageContent::FunctionEnvironmentReloadResponse(
                        FunctionEnvironmentReloadResponse {
                            result: result.clone(),
                        },
                    ));
                }
            }
            MessageContent::FunctionLoadRequest(request) => {
                if behavior.respond_to_loads {
                    let result = match behavior.load_failures.get(&request.metadata.name) {
                        Some(error) => StatusResult::failure(error),
                        None => StatusResult::success(),
                    };
                    publish(MessageContent::FunctionLoadResponse(FunctionLoadResponse {
                        function_id: request.function_id,
                        result,
                        is_dependency_downloaded: request.managed_dependency_enabled,
                    }));
                }
            }
            MessageContent::InvocationRequest(request) => {
                if !behavior.respond_to_invocations {
                    return;
                }
                if behavior.log_invocations {
                    publish(MessageContent::RpcLog(RpcLog {
                        invocation_id: Some(request.invocation_id.clone()),
                        category: "Function".to_string(),
                        level: RpcLogLevel::Information,
                        message: format!("executing {}", request.function_id),
                        event_id: None,
                        exception: None,
                    }));
                }
                if let Some(delay) = behavior.invocation_delay {
                    tokio::time::sleep(delay).await;
                }
                publish(MessageContent::InvocationResponse(
                    (behavior.invocation_handler)(&request),
                ));
            }
            _ => {}
        }
    }
}

impl Drop for FakeLanguageWorker {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
