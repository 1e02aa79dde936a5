//! 语言Worker通道
//!
//! 每个Worker进程对应一个通道。通道通过事件总线与Worker交换消息：
//! 启动握手、函数加载、调用分发以及响应关联都在这里完成。
//!
//! 每个函数有一个调用缓冲区，函数加载响应到达后缓冲区被接到一个分发任务上，
//! 分发任务按提交顺序逐个把调用发送出去。缓冲中的调用按调用方invocation id
//! 记录，执行中的调用按线上invocation id记录，两张表的条目都由分发、响应、
//! 取消或通道释放恰好移除一次。

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use dashmap::DashMap;
use funchost_config::{AppConfig, ChannelConfig, LanguageWorkerConfig};
use funchost_domain::{
    EnvironmentAccessor, FunctionDescriptor, FunctionEnvironmentReloadRequest,
    FunctionLoadRequest, FunctionLoadResponse, InvocationRequest, InvocationResponse,
    MessageContent, MessageKind, OutputStream, ProcessOutputLine, RpcFunctionMetadata, RpcLog,
    RpcLogLevel, ScriptEvent, ScriptInvocationContext, ScriptInvocationResult, Status,
    StreamingMessage, WorkerInitRequest, WorkerProcess,
};
use funchost_errors::{HostError, HostResult};
use funchost_infrastructure::{EventFilter, ScriptEventManager, Subscription};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument, Span};
use uuid::Uuid;

use crate::capabilities::Capabilities;
use crate::state::ChannelState;

/// 函数加载完成信号，加载失败时携带缓存的加载错误
pub type LoadCompletion = oneshot::Sender<HostResult<()>>;

/// 通道运行参数
#[derive(Debug, Clone)]
pub struct ChannelSettings {
    pub host_version: String,
    pub timeouts: ChannelConfig,
    pub managed_dependency_enabled: bool,
}

impl ChannelSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            host_version: config.host.host_version.clone(),
            timeouts: config.channel.clone(),
            managed_dependency_enabled: config.managed_dependency.enabled,
        }
    }
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// 按提交顺序排队的调用方invocation id，上下文本身保存在`buffered`表中
struct InvocationBuffer {
    sender: mpsc::UnboundedSender<String>,
    /// 接到分发任务之前由缓冲区持有
    receiver: Option<mpsc::UnboundedReceiver<String>>,
}

impl InvocationBuffer {
    fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Some(receiver),
        }
    }

}

/// 缓冲表和执行表的条目
struct ExecutingInvocation {
    context: ScriptInvocationContext,
    /// 条目被移除时取消，用于结束取消监听任务
    done: CancellationToken,
}

pub struct LanguageWorkerChannel {
    worker_id: String,
    config: LanguageWorkerConfig,
    settings: ChannelSettings,
    events: ScriptEventManager,
    process: Arc<dyn WorkerProcess>,
    environment: Arc<dyn EnvironmentAccessor>,
    state: Mutex<ChannelState>,
    capabilities: Capabilities,
    functions: RwLock<Vec<Arc<FunctionDescriptor>>>,
    input_buffers: DashMap<String, InvocationBuffer>,
    buffered: DashMap<String, ExecutingInvocation>,
    executing: DashMap<String, ExecutingInvocation>,
    pending_loads: DashMap<String, LoadCompletion>,
    function_load_errors: DashMap<String, HostError>,
    stderr_lines: Mutex<VecDeque<String>>,
    span: Span,
    shutdown: CancellationToken,
    disposing: AtomicBool,
}

impl std::fmt::Debug for LanguageWorkerChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LanguageWorkerChannel")
            .field("worker_id", &self.worker_id)
            .field("language", &self.config.language)
            .field("state", &self.state())
            .field("executing", &self.executing.len())
            .finish()
    }
}

impl LanguageWorkerChannel {
    /// 创建通道并订阅该Worker的入站消息，必须在tokio运行时中调用
    pub fn new(
        worker_id: &str,
        config: LanguageWorkerConfig,
        settings: ChannelSettings,
        events: ScriptEventManager,
        process: Arc<dyn WorkerProcess>,
        environment: Arc<dyn EnvironmentAccessor>,
    ) -> Arc<Self> {
        let span = info_span!(
            "worker_channel",
            worker_id = %worker_id,
            language = %config.language
        );

        let channel = Arc::new(Self {
            worker_id: worker_id.to_string(),
            config,
            settings,
            events,
            process,
            environment,
            state: Mutex::new(ChannelState::Default),
            capabilities: Capabilities::new(),
            functions: RwLock::new(Vec::new()),
            input_buffers: DashMap::new(),
            buffered: DashMap::new(),
            executing: DashMap::new(),
            pending_loads: DashMap::new(),
            function_load_errors: DashMap::new(),
            stderr_lines: Mutex::new(VecDeque::new()),
            span,
            shutdown: CancellationToken::new(),
            disposing: AtomicBool::new(false),
        });

        let inbound = channel.events.subscribe(EventFilter::inbound_kinds(
            worker_id,
            &[
                MessageKind::FunctionLoadResponse,
                MessageKind::InvocationResponse,
                MessageKind::RpcLog,
            ],
        ));
        Self::spawn_inbound_loop(Arc::downgrade(&channel), inbound, channel.shutdown.clone());

        channel
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn language(&self) -> &str {
        &self.config.language
    }

    pub fn config(&self) -> &LanguageWorkerConfig {
        &self.config
    }

    pub fn state(&self) -> ChannelState {
        *self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_disposed(&self) -> bool {
        self.disposing.load(Ordering::Acquire)
    }

    pub fn capabilities(&self) -> HashMap<String, String> {
        self.capabilities.snapshot()
    }

    pub fn capability(&self, name: &str) -> Option<String> {
        self.capabilities.get(name)
    }

    pub fn functions(&self) -> Vec<Arc<FunctionDescriptor>> {
        self.functions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn function(&self, function_id: &str) -> Option<Arc<FunctionDescriptor>> {
        self.functions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .find(|f| f.function_id == function_id)
            .cloned()
    }

    pub fn has_invocation_buffer(&self, function_id: &str) -> bool {
        self.input_buffers.contains_key(function_id)
    }

    /// 已入队但尚未发送给Worker的调用数
    pub fn buffered_count(&self) -> usize {
        self.buffered.len()
    }

    pub fn executing_count(&self) -> usize {
        self.executing.len()
    }

    pub fn function_load_error(&self, function_id: &str) -> Option<HostError> {
        self.function_load_errors
            .get(function_id)
            .map(|error| error.clone())
    }

    /// 最近的stderr输出，用于诊断
    pub fn recent_stderr(&self) -> Vec<String> {
        self.stderr_lines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    fn transition(&self, next: ChannelState) -> HostResult<ChannelState> {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let current = *state;
        if current.can_transition_to(next) {
            *state = next;
            return Ok(current);
        }
        if current == ChannelState::Disposed {
            return Err(HostError::channel_disposed(&self.worker_id));
        }
        Err(HostError::InvalidState(format!(
            "worker {} cannot move from {current} to {next}",
            self.worker_id
        )))
    }

    fn fault(&self, reason: &HostError) {
        if let Ok(previous) = self.transition(ChannelState::Faulted) {
            warn!(parent: &self.span, error = %reason, "Worker通道进入Faulted状态 (之前: {})", previous);
        }
    }

    /// 启动Worker进程并完成初始化握手
    ///
    /// 失败后通道处于Faulted状态，不应在同一个通道上重试。
    pub async fn start_worker_process(self: &Arc<Self>) -> HostResult<()> {
        let span = self.span.clone();
        self.start_worker_process_inner().instrument(span).await
    }

    async fn start_worker_process_inner(self: &Arc<Self>) -> HostResult<()> {
        self.transition(ChannelState::Initializing)?;
        info!("启动Worker进程");

        // 先订阅再启动进程，避免错过start stream
        let start_stream = self
            .events
            .subscribe(EventFilter::inbound(&self.worker_id, MessageKind::StartStream));
        let output = self.process.take_output();

        if let Err(e) = self.process.start().await {
            error!(error = %e, "Worker进程启动失败");
            self.fault(&e);
            return Err(e);
        }
        if let Some(output) = output {
            self.spawn_output_loop(output);
        }

        if let Err(e) = self
            .wait_for(
                start_stream,
                self.settings.timeouts.process_start_timeout(),
                "worker start stream",
            )
            .await
        {
            self.fault(&e);
            self.handle_worker_channel_error(&e);
            return Err(e);
        }

        let init_response = self.send_worker_init_request();
        let event = match self
            .wait_for(
                init_response,
                self.settings.timeouts.worker_init_timeout(),
                "worker init response",
            )
            .await
        {
            Ok(event) => event,
            Err(e) => {
                self.fault(&e);
                self.handle_worker_channel_error(&e);
                return Err(e);
            }
        };

        self.handle_init_response(event)
    }

    /// 发送初始化请求；返回的订阅在发送前已就绪
    fn send_worker_init_request(&self) -> Subscription {
        debug!(parent: &self.span, "收到start stream，发送WorkerInitRequest");
        let subscription = self.events.subscribe(EventFilter::inbound(
            &self.worker_id,
            MessageKind::WorkerInitResponse,
        ));
        self.send_message(MessageContent::WorkerInitRequest(WorkerInitRequest {
            host_version: self.settings.host_version.clone(),
            capabilities: HashMap::new(),
        }));
        subscription
    }

    fn handle_init_response(&self, event: ScriptEvent) -> HostResult<()> {
        let response = match &event {
            ScriptEvent::Inbound(inbound) => match &inbound.message.content {
                MessageContent::WorkerInitResponse(response) => response,
                other => {
                    return Err(HostError::Internal(format!(
                        "expected worker init response, got {}",
                        other.kind()
                    )))
                }
            },
            other => {
                return Err(HostError::Internal(format!(
                    "expected inbound event, got {}",
                    other.event_type()
                )))
            }
        };

        if let Some(message) = response.result.failure_message() {
            let error = HostError::worker_channel(
                &self.config.language,
                &self.worker_id,
                format!("worker init failed: {message}"),
            );
            self.fault(&error);
            self.handle_worker_channel_error(&error);
            return Err(error);
        }

        self.transition(ChannelState::Initialized)?;
        self.capabilities.update(&response.capabilities);
        info!(
            worker_version = response.worker_version.as_deref().unwrap_or("unknown"),
            capabilities = response.capabilities.len(),
            "Worker初始化完成"
        );
        Ok(())
    }

    /// 等待一个匹配事件；通道释放时立即返回
    async fn wait_for(
        &self,
        subscription: Subscription,
        timeout: Duration,
        operation: &str,
    ) -> HostResult<ScriptEvent> {
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(HostError::channel_disposed(&self.worker_id)),
            result = subscription.next_within(timeout, operation) => result,
        }
    }

    /// 替换通道的函数集合，为每个函数准备一个调用缓冲区
    pub fn setup_invocation_buffers(&self, functions: Vec<FunctionDescriptor>) {
        let functions: Vec<Arc<FunctionDescriptor>> = functions.into_iter().map(Arc::new).collect();
        let ids: HashSet<&str> = functions.iter().map(|f| f.function_id.as_str()).collect();

        let stale: Vec<String> = self
            .input_buffers
            .iter()
            .filter(|entry| !ids.contains(entry.key().as_str()))
            .map(|entry| entry.key().clone())
            .collect();

        for function in &functions {
            if !self.input_buffers.contains_key(&function.function_id) {
                debug!(
                    parent: &self.span,
                    function = %function.name,
                    function_id = %function.function_id,
                    "创建函数调用缓冲区"
                );
                self.input_buffers
                    .insert(function.function_id.clone(), InvocationBuffer::new());
            }
        }

        *self
            .functions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = functions;

        for function_id in stale {
            self.function_load_errors.remove(&function_id);
            if let Some((_, buffer)) = self.input_buffers.remove(&function_id) {
                let failed = self.fail_buffer(buffer, &HostError::function_not_found(&function_id));
                debug!(parent: &self.span, function_id = %function_id, failed, "移除过期的调用缓冲区");
            }
        }
    }

    /// 为当前函数集合中的每个函数发送加载请求
    pub fn send_function_load_requests(&self) {
        for function in self.functions() {
            let (completion, _) = oneshot::channel();
            self.send_function_load_request(&function, completion);
        }
    }

    /// 发送函数加载请求；匹配的加载响应到达后解析completion
    pub fn send_function_load_request(&self, function: &FunctionDescriptor, completion: LoadCompletion) {
        if self.is_disposed() {
            let _ = completion.send(Err(HostError::channel_disposed(&self.worker_id)));
            return;
        }
        debug!(
            parent: &self.span,
            function = %function.name,
            function_id = %function.function_id,
            "发送FunctionLoadRequest"
        );
        self.pending_loads
            .insert(function.function_id.clone(), completion);

        let managed_dependency_enabled = self.settings.managed_dependency_enabled;
        if managed_dependency_enabled {
            debug!(parent: &self.span, "请求{}Worker下载托管依赖", self.config.language);
        }
        self.send_message(MessageContent::FunctionLoadRequest(FunctionLoadRequest {
            function_id: function.function_id.clone(),
            metadata: RpcFunctionMetadata::from(function),
            managed_dependency_enabled,
        }));
    }

    /// 加载单个函数并等待结果，受函数加载超时约束
    pub async fn load_function(&self, function_id: &str) -> HostResult<()> {
        let function = self
            .function(function_id)
            .ok_or_else(|| HostError::function_not_found(function_id))?;

        let (completion, signal) = oneshot::channel();
        self.send_function_load_request(&function, completion);

        let timeout = self.settings.timeouts.function_load_timeout();
        match tokio::time::timeout(timeout, signal).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(HostError::function_load(
                function_id,
                "load request was superseded before a response arrived",
            )),
            Err(_) => {
                self.pending_loads
                    .remove_if(function_id, |_, completion| completion.is_closed());
                Err(HostError::timeout(format!(
                    "function load for '{}' not completed within {}s",
                    function.name,
                    timeout.as_secs()
                )))
            }
        }
    }

    fn handle_load_response(self: &Arc<Self>, response: &FunctionLoadResponse) {
        let _entered = self.span.enter();
        debug!(function_id = %response.function_id, "收到FunctionLoadResponse");

        let Some(function) = self.function(&response.function_id) else {
            warn!(function_id = %response.function_id, "加载响应无法匹配已知函数，忽略");
            return;
        };

        let outcome = match response.result.failure_message() {
            Some(message) => {
                let error = HostError::function_load(&response.function_id, message);
                error!(function = %function.name, error = %error, "函数加载错误");
                self.function_load_errors
                    .insert(response.function_id.clone(), error.clone());
                Err(error)
            }
            None => {
                self.function_load_errors.remove(&response.function_id);
                Ok(())
            }
        };

        if response.is_dependency_downloaded {
            info!("{}Worker已完成托管依赖下载", self.config.language);
        }

        self.link_invocation_buffer(&response.function_id);

        if let Some((_, completion)) = self.pending_loads.remove(&response.function_id) {
            let _ = completion.send(outcome);
        }
    }

    /// 把函数的调用缓冲区接到分发任务上；重复调用无效果
    fn link_invocation_buffer(self: &Arc<Self>, function_id: &str) {
        let receiver = self
            .input_buffers
            .get_mut(function_id)
            .and_then(|mut buffer| buffer.receiver.take());
        let Some(mut receiver) = receiver else {
            return;
        };

        let channel = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let worker_id = self.worker_id.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    caller_id = receiver.recv() => match (caller_id, channel.upgrade()) {
                        (Some(caller_id), Some(channel)) => {
                            // 已取消的调用不在缓冲表中，直接跳过
                            if let Some(context) = channel.take_buffered(&caller_id) {
                                channel.send_invocation_request(context);
                            }
                        }
                        _ => return,
                    },
                }
            }
            receiver.close();
            if let Some(channel) = channel.upgrade() {
                let error = HostError::channel_disposed(&worker_id);
                while let Ok(caller_id) = receiver.try_recv() {
                    if let Some(context) = channel.take_buffered(&caller_id) {
                        context.fail(error.clone());
                    }
                }
            }
        });
    }

    /// 未接入分发任务的缓冲调用全部以给定错误结束
    fn fail_buffer(&self, buffer: InvocationBuffer, error: &HostError) -> usize {
        let Some(mut receiver) = buffer.receiver else {
            return 0;
        };
        receiver.close();
        let mut failed = 0;
        while let Ok(caller_id) = receiver.try_recv() {
            if let Some(context) = self.take_buffered(&caller_id) {
                context.fail(error.clone());
                failed += 1;
            }
        }
        failed
    }

    fn take_buffered(&self, caller_id: &str) -> Option<ScriptInvocationContext> {
        self.buffered.remove(caller_id).map(|(_, entry)| {
            entry.done.cancel();
            entry.context
        })
    }

    /// 把调用放入对应函数的缓冲区，结果通过上下文的结果槽返回
    ///
    /// 从入队起监听取消：仍在缓冲区中的调用被取消时立即以`InvocationCancelled`结束。
    pub fn enqueue_invocation(self: &Arc<Self>, context: ScriptInvocationContext) {
        if self.is_disposed() {
            context.fail(HostError::channel_disposed(&self.worker_id));
            return;
        }
        let function_id = context.function_id().to_string();
        if let Some(error) = self.function_load_error(&function_id) {
            context.fail(error);
            return;
        }

        let sender = self
            .input_buffers
            .get(&function_id)
            .map(|buffer| buffer.sender.clone());
        match sender {
            Some(sender) => {
                let caller_id = context.invocation_id.to_string();
                let cancellation = context.cancellation.clone();
                let done = CancellationToken::new();
                self.buffered.insert(
                    caller_id.clone(),
                    ExecutingInvocation {
                        context,
                        done: done.clone(),
                    },
                );
                if sender.send(caller_id.clone()).is_err() || self.is_disposed() {
                    if let Some(context) = self.take_buffered(&caller_id) {
                        context.fail(HostError::channel_disposed(&self.worker_id));
                    }
                    return;
                }
                self.watch_buffered_cancellation(caller_id, cancellation, done);
            }
            None => {
                let name = context.function.name.clone();
                context.fail(HostError::function_not_found(name));
            }
        }
    }

    /// 分发任务的出口：登记到执行表后发送调用请求
    pub fn send_invocation_request(self: &Arc<Self>, context: ScriptInvocationContext) {
        if context.is_cancelled() {
            let invocation_id = context.invocation_id.to_string();
            context.fail(HostError::InvocationCancelled { invocation_id });
            return;
        }
        if let Some(error) = self.function_load_error(context.function_id()) {
            context.fail(error);
            return;
        }

        let request = match self.build_invocation_request(&context) {
            Ok(request) => request,
            Err(e) => {
                context.fail(e);
                return;
            }
        };

        let invocation_id = request.invocation_id.clone();
        let cancellation = context.cancellation.clone();
        let done = CancellationToken::new();
        self.executing.insert(
            invocation_id.clone(),
            ExecutingInvocation {
                context,
                done: done.clone(),
            },
        );

        // 与dispose并发时，dispose可能已经清空了执行表
        if self.is_disposed() {
            if let Some((_, entry)) = self.executing.remove(&invocation_id) {
                entry.done.cancel();
                entry
                    .context
                    .fail(HostError::channel_disposed(&self.worker_id));
            }
            return;
        }

        self.watch_cancellation(invocation_id.clone(), cancellation, done);
        trace!(
            parent: &self.span,
            invocation_id = %invocation_id,
            function_id = %request.function_id,
            "发送InvocationRequest"
        );
        self.send_message(MessageContent::InvocationRequest(request));
    }

    fn build_invocation_request(&self, context: &ScriptInvocationContext) -> HostResult<InvocationRequest> {
        let function_id = context.function_id();
        if self.function(function_id).is_none() {
            return Err(HostError::function_not_found(&context.function.name));
        }
        Ok(InvocationRequest {
            invocation_id: Uuid::new_v4().to_string(),
            function_id: function_id.to_string(),
            input_data: context.inputs.clone(),
            trigger_metadata: context.trigger_metadata.clone(),
        })
    }

    fn watch_cancellation(
        self: &Arc<Self>,
        invocation_id: String,
        cancellation: CancellationToken,
        done: CancellationToken,
    ) {
        let channel = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancellation.cancelled() => {
                    if let Some(channel) = channel.upgrade() {
                        channel.cancel_invocation(&invocation_id);
                    }
                }
                _ = done.cancelled() => {}
                _ = shutdown.cancelled() => {}
            }
        });
    }

    fn watch_buffered_cancellation(
        self: &Arc<Self>,
        caller_id: String,
        cancellation: CancellationToken,
        done: CancellationToken,
    ) {
        let channel = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancellation.cancelled() => {
                    if let Some(channel) = channel.upgrade() {
                        channel.cancel_buffered(&caller_id);
                    }
                }
                _ = done.cancelled() => {}
                _ = shutdown.cancelled() => {}
            }
        });
    }

    /// 缓冲中的调用被取消：移出缓冲表，分发任务之后会跳过它的id
    fn cancel_buffered(&self, caller_id: &str) {
        if let Some(context) = self.take_buffered(caller_id) {
            debug!(parent: &self.span, invocation_id = %caller_id, "缓冲中的调用已取消");
            context.fail(HostError::InvocationCancelled {
                invocation_id: caller_id.to_string(),
            });
        }
    }

    /// 取消时立即移除执行表条目，之后到达的响应被丢弃
    fn cancel_invocation(&self, invocation_id: &str) {
        if let Some((_, entry)) = self.executing.remove(invocation_id) {
            entry.done.cancel();
            debug!(parent: &self.span, invocation_id = %invocation_id, "调用已取消");
            let caller_id = entry.context.invocation_id.to_string();
            entry.context.fail(HostError::InvocationCancelled {
                invocation_id: caller_id,
            });
        }
    }

    fn handle_invocation_response(&self, response: &InvocationResponse) {
        let Some((_, entry)) = self.executing.remove(&response.invocation_id) else {
            debug!(
                parent: &self.span,
                invocation_id = %response.invocation_id,
                "调用响应没有对应的执行中调用，忽略"
            );
            return;
        };
        entry.done.cancel();
        let context = entry.context;

        let result = match response.result.status {
            Status::Success => Ok(ScriptInvocationResult {
                outputs: response
                    .output_data
                    .iter()
                    .map(|binding| (binding.name.clone(), binding.data.clone()))
                    .collect(),
                return_value: response.return_value.clone(),
            }),
            Status::Cancelled => Err(HostError::InvocationCancelled {
                invocation_id: context.invocation_id.to_string(),
            }),
            Status::Failure => Err(HostError::invocation(
                response.result.failure_message().unwrap_or_default(),
            )),
        };

        debug!(
            parent: &self.span,
            invocation_id = %response.invocation_id,
            success = result.is_ok(),
            "收到InvocationResponse"
        );
        context.complete(result);
    }

    /// 带invocation id的日志在调用方的span中输出，其余使用通道自己的span
    fn handle_rpc_log(&self, log: &RpcLog) {
        let span = log
            .invocation_id
            .as_deref()
            .and_then(|id| self.executing.get(id).map(|entry| entry.context.span.clone()))
            .unwrap_or_else(|| self.span.clone());
        span.in_scope(|| emit_worker_log(&self.worker_id, log));
    }

    /// 把当前进程环境发送给Worker并等待确认；失败只记录日志，不影响通道状态
    pub async fn send_function_environment_reload_request(&self) -> bool {
        if self.is_disposed() {
            return false;
        }
        debug!(parent: &self.span, "发送FunctionEnvironmentReloadRequest");

        let subscription = self.events.subscribe(EventFilter::inbound(
            &self.worker_id,
            MessageKind::FunctionEnvironmentReloadResponse,
        ));
        let environment_variables = self.environment.snapshot();
        self.send_message(MessageContent::FunctionEnvironmentReloadRequest(
            FunctionEnvironmentReloadRequest {
                environment_variables,
            },
        ));

        let event = self
            .wait_for(
                subscription,
                self.settings.timeouts.environment_reload_timeout(),
                "function environment reload response",
            )
            .await;

        match event {
            Ok(ScriptEvent::Inbound(inbound)) => match &inbound.message.content {
                MessageContent::FunctionEnvironmentReloadResponse(response) => {
                    match response.result.failure_message() {
                        None => {
                            info!(parent: &self.span, "Worker环境变量重新加载完成");
                            true
                        }
                        Some(message) => {
                            error!(parent: &self.span, error = %message, "Worker环境变量重新加载失败");
                            false
                        }
                    }
                }
                _ => false,
            },
            Ok(_) => false,
            Err(e) => {
                error!(parent: &self.span, error = %e, "Worker环境变量重新加载失败");
                false
            }
        }
    }

    fn spawn_inbound_loop(
        channel: Weak<Self>,
        mut subscription: Subscription,
        shutdown: CancellationToken,
    ) {
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = subscription.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                let Some(channel) = channel.upgrade() else {
                    break;
                };
                if let ScriptEvent::Inbound(inbound) = event {
                    channel.handle_inbound(&inbound.message);
                }
            }
        });
    }

    fn handle_inbound(self: &Arc<Self>, message: &StreamingMessage) {
        match &message.content {
            MessageContent::FunctionLoadResponse(response) => self.handle_load_response(response),
            MessageContent::InvocationResponse(response) => self.handle_invocation_response(response),
            MessageContent::RpcLog(log) => self.handle_rpc_log(log),
            other => debug!(parent: &self.span, kind = %other.kind(), "忽略未处理的消息"),
        }
    }

    fn spawn_output_loop(self: &Arc<Self>, mut output: mpsc::UnboundedReceiver<ProcessOutputLine>) {
        let channel = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let line = tokio::select! {
                    _ = shutdown.cancelled() => return,
                    line = output.recv() => line,
                };
                let Some(channel) = channel.upgrade() else {
                    return;
                };
                match line {
                    Some(line) => channel.handle_output_line(line),
                    None => {
                        channel.handle_process_exit();
                        return;
                    }
                }
            }
        });
    }

    fn handle_output_line(&self, output: ProcessOutputLine) {
        match output.stream {
            OutputStream::Stdout => info!(parent: &self.span, "{}", output.line),
            OutputStream::Stderr => {
                warn!(parent: &self.span, "{}", output.line);
                let capacity = self.settings.timeouts.stderr_buffer_lines;
                if capacity == 0 {
                    return;
                }
                let mut lines = self
                    .stderr_lines
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                while lines.len() >= capacity {
                    lines.pop_front();
                }
                lines.push_back(output.line);
            }
        }
    }

    fn handle_process_exit(&self) {
        if self.is_disposed() {
            return;
        }
        let error = HostError::worker_channel(
            &self.config.language,
            &self.worker_id,
            "worker process exited unexpectedly",
        );
        self.handle_worker_channel_error(&error);
    }

    /// 通道级错误只通过事件总线上报，附带最近的stderr输出
    fn handle_worker_channel_error(&self, error: &HostError) {
        if self.is_disposed() {
            return;
        }
        let stderr = self.recent_stderr();
        let mut message = match error {
            HostError::WorkerChannel { message, .. } => message.clone(),
            other => other.to_string(),
        };
        if !stderr.is_empty() {
            message = format!("{message}; stderr: {}", stderr.join(" | "));
        }
        error!(parent: &self.span, error = %message, "Worker通道错误");
        self.events.publish(ScriptEvent::worker_error(
            &self.config.language,
            &self.worker_id,
            HostError::worker_channel(&self.config.language, &self.worker_id, message),
        ));
    }

    fn send_message(&self, content: MessageContent) {
        self.events
            .publish(ScriptEvent::outbound(&self.worker_id, StreamingMessage::new(content)));
    }

    /// 释放通道：所有等待中的结果槽以失败结束，订阅和分发任务停止，进程终止
    pub async fn dispose(&self) {
        if self.disposing.swap(true, Ordering::AcqRel) {
            return;
        }
        let previous = {
            let mut state = self
                .state
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::replace(&mut *state, ChannelState::Disposed)
        };
        self.shutdown.cancel();

        let error = HostError::channel_disposed(&self.worker_id);

        let load_ids: Vec<String> = self.pending_loads.iter().map(|e| e.key().clone()).collect();
        for function_id in load_ids {
            if let Some((_, completion)) = self.pending_loads.remove(&function_id) {
                let _ = completion.send(Err(error.clone()));
            }
        }

        let invocation_ids: Vec<String> = self.executing.iter().map(|e| e.key().clone()).collect();
        let mut failed = 0;
        for invocation_id in invocation_ids {
            if let Some((_, entry)) = self.executing.remove(&invocation_id) {
                entry.done.cancel();
                entry.context.fail(error.clone());
                failed += 1;
            }
        }

        let buffer_ids: Vec<String> = self.input_buffers.iter().map(|e| e.key().clone()).collect();
        for function_id in buffer_ids {
            if let Some((_, buffer)) = self.input_buffers.remove(&function_id) {
                failed += self.fail_buffer(buffer, &error);
            }
        }
        // 已接入分发任务的缓冲区中剩余的调用
        let caller_ids: Vec<String> = self.buffered.iter().map(|e| e.key().clone()).collect();
        for caller_id in caller_ids {
            if let Some(context) = self.take_buffered(&caller_id) {
                context.fail(error.clone());
                failed += 1;
            }
        }

        self.process.dispose().await;
        info!(
            parent: &self.span,
            previous_state = %previous,
            failed_invocations = failed,
            "Worker通道已释放"
        );
    }
}

impl Drop for LanguageWorkerChannel {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn emit_worker_log(worker_id: &str, log: &RpcLog) {
    let exception = log.exception.as_ref().map(|e| e.to_string());
    let stack_trace = log.exception.as_ref().and_then(|e| e.stack_trace.clone());
    match log.level {
        RpcLogLevel::Trace => trace!(
            worker_id, category = %log.category, event_id = ?log.event_id,
            exception = ?exception, stack_trace = ?stack_trace, "{}", log.message
        ),
        RpcLogLevel::Debug => debug!(
            worker_id, category = %log.category, event_id = ?log.event_id,
            exception = ?exception, stack_trace = ?stack_trace, "{}", log.message
        ),
        RpcLogLevel::Information => info!(
            worker_id, category = %log.category, event_id = ?log.event_id,
            exception = ?exception, stack_trace = ?stack_trace, "{}", log.message
        ),
        RpcLogLevel::Warning => warn!(
            worker_id, category = %log.category, event_id = ?log.event_id,
            exception = ?exception, stack_trace = ?stack_trace, "{}", log.message
        ),
        RpcLogLevel::Error | RpcLogLevel::Critical => error!(
            worker_id, category = %log.category, event_id = ?log.event_id,
            exception = ?exception, stack_trace = ?stack_trace, "{}", log.message
        ),
        RpcLogLevel::None => {}
    }
}
