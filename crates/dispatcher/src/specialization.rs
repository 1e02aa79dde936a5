//! 占位实例特化
//!
//! 预热的通用Worker在第一个真实请求到达时就地切换为某个函数应用的专用Worker，
//! 同时服务触发特化的这个请求。特化成功后状态只翻转一次，之后的请求直接进入调用管道。

use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use funchost_config::AppConfig;
use funchost_domain::{
    settings, EnvironmentAccessor, EnvironmentExt, FunctionMetadataProvider, StandbyManager,
};
use funchost_errors::{HostError, HostResult};
use funchost_worker::LanguageWorkerChannelManager;
use serde::Serialize;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::pipeline::FunctionInvocationPipeline;
use crate::request::{HostRequest, HostResponse, RequestHandler};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum SpecializationState {
    Standby = 0,
    Specializing = 1,
    Specialized = 2,
}

impl SpecializationState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => SpecializationState::Specializing,
            2 => SpecializationState::Specialized,
            _ => SpecializationState::Standby,
        }
    }
}

impl std::fmt::Display for SpecializationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SpecializationState::Standby => "standby",
            SpecializationState::Specializing => "specializing",
            SpecializationState::Specialized => "specialized",
        };
        f.write_str(name)
    }
}

/// 特化协调器，位于调用管道之前
///
/// 同一时间只允许一次特化尝试：并发的触发请求在闸门上排队，
/// 拿到闸门后若已经特化完成则直接转发给调用管道。
/// 任一步骤失败都只影响触发请求本身，状态回到Standby，下一个请求重新尝试。
pub struct PlaceholderSpecializationHandler {
    config: AppConfig,
    environment: Arc<dyn EnvironmentAccessor>,
    standby: Arc<dyn StandbyManager>,
    channels: Arc<LanguageWorkerChannelManager>,
    metadata: Arc<dyn FunctionMetadataProvider>,
    pipeline: Arc<FunctionInvocationPipeline>,
    state: AtomicU8,
    gate: Mutex<()>,
}

impl PlaceholderSpecializationHandler {
    pub fn new(
        config: AppConfig,
        environment: Arc<dyn EnvironmentAccessor>,
        standby: Arc<dyn StandbyManager>,
        channels: Arc<LanguageWorkerChannelManager>,
        metadata: Arc<dyn FunctionMetadataProvider>,
        pipeline: Arc<FunctionInvocationPipeline>,
    ) -> Self {
        Self {
            config,
            environment,
            standby,
            channels,
            metadata,
            pipeline,
            state: AtomicU8::new(SpecializationState::Standby as u8),
            gate: Mutex::new(()),
        }
    }

    pub fn state(&self) -> SpecializationState {
        SpecializationState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_specialized(&self) -> bool {
        self.state() == SpecializationState::Specialized
    }

    fn ready_to_specialize(&self) -> bool {
        !self.environment.in_standby_mode() && self.environment.is_container_ready()
    }

    async fn specialize(&self, request: &HostRequest) -> HostResult<HostResponse> {
        debug!("重新加载宿主配置");
        self.standby.specialize_host_reload_config().await?;

        let runtime = self.pipeline.worker_runtime();
        let channel = self
            .channels
            .get_placeholder_channel(&runtime)
            .ok_or_else(|| HostError::ChannelNotFound {
                language: runtime.clone(),
            })?;
        info!(worker_id = %channel.worker_id(), language = %runtime, "使用占位通道进行特化");

        if !channel.send_function_environment_reload_request().await {
            return Err(HostError::specialization(format!(
                "worker {} did not reload its environment",
                channel.worker_id()
            )));
        }

        let script_root = self
            .environment
            .get(settings::SCRIPT_ROOT)
            .filter(|root| !root.trim().is_empty())
            .unwrap_or_else(|| self.config.host.script_root.clone());
        let metadata = self
            .metadata
            .read_functions_metadata(
                &PathBuf::from(&script_root),
                self.config.host.function_allowlist.as_deref(),
                &self.config.languages,
            )
            .await?;
        for (function, errors) in &metadata.errors {
            for message in errors {
                warn!(function = %function, error = %message, "函数元数据错误");
            }
        }

        let functions: Vec<_> = metadata
            .functions
            .into_iter()
            .filter(|f| f.language.eq_ignore_ascii_case(&runtime) && !f.is_disabled)
            .collect();
        let primary_id = request
            .function_name()
            .and_then(|name| functions.iter().find(|f| f.name.eq_ignore_ascii_case(name)))
            .or_else(|| functions.first())
            .map(|f| f.function_id.clone())
            .ok_or_else(|| {
                HostError::specialization(format!(
                    "no {runtime} functions found under {script_root}"
                ))
            })?;
        info!(functions = functions.len(), script_root = %script_root, "发现函数");

        channel.setup_invocation_buffers(functions);
        channel.load_function(&primary_id).await?;
        for function in channel.functions() {
            if function.function_id != primary_id {
                let (completion, _) = oneshot::channel();
                channel.send_function_load_request(&function, completion);
            }
        }

        let primary = channel
            .function(&primary_id)
            .ok_or_else(|| HostError::function_not_found(&primary_id))?;
        let response = self.pipeline.invoke(&channel, primary, request).await?;

        // 不继承触发请求的tracing上下文
        let standby = Arc::clone(&self.standby);
        tokio::spawn(
            async move { standby.specialize_host().await }
                .instrument(info_span!(parent: None, "specialize_host")),
        )
        .await
        .map_err(|e| HostError::Internal(format!("specialize host task failed: {e}")))??;

        if self
            .state
            .compare_exchange(
                SpecializationState::Specializing as u8,
                SpecializationState::Specialized as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(HostError::InvalidState(format!(
                "specialization state changed to {} during specialization",
                self.state()
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl RequestHandler for PlaceholderSpecializationHandler {
    async fn handle(&self, request: HostRequest) -> HostResponse {
        if self.is_specialized() || !self.ready_to_specialize() {
            return self.pipeline.handle(request).await;
        }

        let gate = self.gate.lock().await;
        if self.is_specialized() || !self.ready_to_specialize() {
            drop(gate);
            return self.pipeline.handle(request).await;
        }

        self.state
            .store(SpecializationState::Specializing as u8, Ordering::Release);
        let started = Instant::now();
        let span = info_span!("specialization", path = %request.path);
        match self.specialize(&request).instrument(span).await {
            Ok(response) => {
                info!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "占位实例特化完成，后续请求直接进入调用管道"
                );
                response
            }
            Err(e) => {
                self.state
                    .store(SpecializationState::Standby as u8, Ordering::Release);
                error!(error = %e, path = %request.path, "占位实例特化失败，下一个请求将重试");
                HostResponse::from_error(&e)
            }
        }
    }
}
