use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use funchost_config::AppConfig;
use funchost_domain::{
    EnvironmentAccessor, EnvironmentExt, FunctionDescriptor, ParameterBinding,
    ScriptInvocationContext, ScriptInvocationResult,
};
use funchost_errors::{HostError, HostResult};
use funchost_worker::{LanguageWorkerChannel, LanguageWorkerChannelManager};
use tracing::{debug, error, info_span, warn, Instrument};

use crate::request::{HostRequest, HostResponse, RequestHandler};

/// 正常调用管道
///
/// 按 `/api/{function}` 找到当前运行时通道上已加载的函数，把请求作为触发器绑定提交调用，
/// 在调用超时内等待结果并渲染http输出。
pub struct FunctionInvocationPipeline {
    channels: Arc<LanguageWorkerChannelManager>,
    environment: Arc<dyn EnvironmentAccessor>,
    default_runtime: String,
    invocation_timeout: Duration,
}

impl FunctionInvocationPipeline {
    pub fn new(
        config: &AppConfig,
        channels: Arc<LanguageWorkerChannelManager>,
        environment: Arc<dyn EnvironmentAccessor>,
    ) -> Self {
        Self {
            channels,
            environment,
            default_runtime: config.host.default_worker_runtime.clone(),
            invocation_timeout: config.channel.invocation_timeout(),
        }
    }

    /// 环境变量中的worker运行时优先于配置
    pub fn worker_runtime(&self) -> String {
        self.environment
            .worker_runtime()
            .unwrap_or_else(|| self.default_runtime.clone())
    }

    pub async fn execute(&self, request: &HostRequest) -> HostResult<HostResponse> {
        let name = request
            .function_name()
            .ok_or_else(|| HostError::function_not_found(&request.path))?;
        let runtime = self.worker_runtime();
        let channel = self
            .channels
            .get_placeholder_channel(&runtime)
            .ok_or(HostError::ChannelNotFound { language: runtime })?;
        let function = channel
            .functions()
            .into_iter()
            .find(|f| f.name.eq_ignore_ascii_case(name) && !f.is_disabled)
            .ok_or_else(|| HostError::function_not_found(name))?;

        self.invoke(&channel, function, request).await
    }

    /// 在给定通道上调用函数并渲染结果；超时会取消调用
    pub async fn invoke(
        &self,
        channel: &Arc<LanguageWorkerChannel>,
        function: Arc<FunctionDescriptor>,
        request: &HostRequest,
    ) -> HostResult<HostResponse> {
        let trigger = function
            .trigger_binding()
            .map(|binding| binding.name.clone())
            .unwrap_or_else(|| "req".to_string());
        let span = info_span!(
            "invocation",
            function = %function.name,
            function_id = %function.function_id,
            worker_id = %channel.worker_id()
        );

        let (context, receiver) = ScriptInvocationContext::new(
            Arc::clone(&function),
            vec![ParameterBinding::new(&trigger, request.to_binding_data())],
        );
        let context = context.with_span(span.clone());
        let cancellation = context.cancellation.clone();
        let invocation_id = receiver.invocation_id();

        span.in_scope(|| debug!(invocation_id = %invocation_id, "提交函数调用"));
        channel.enqueue_invocation(context);

        match tokio::time::timeout(self.invocation_timeout, receiver.wait())
            .instrument(span)
            .await
        {
            Ok(result) => Ok(render_result(&function, result?)),
            Err(_) => {
                cancellation.cancel();
                Err(HostError::timeout(format!(
                    "invocation {invocation_id} of '{}' exceeded {}s",
                    function.name,
                    self.invocation_timeout.as_secs()
                )))
            }
        }
    }
}

#[async_trait]
impl RequestHandler for FunctionInvocationPipeline {
    async fn handle(&self, request: HostRequest) -> HostResponse {
        match self.execute(&request).await {
            Ok(response) => response,
            Err(e) => {
                match &e {
                    HostError::FunctionNotFound { .. } => {
                        debug!(path = %request.path, "没有匹配的函数")
                    }
                    HostError::ChannelNotFound { .. } => {
                        warn!(path = %request.path, error = %e, "没有可用的Worker通道")
                    }
                    _ => error!(path = %request.path, error = %e, "函数调用失败"),
                }
                HostResponse::from_error(&e)
            }
        }
    }
}

/// http输出绑定决定响应：`$return` 取返回值，其余按名称取输出
pub fn render_result(function: &FunctionDescriptor, result: ScriptInvocationResult) -> HostResponse {
    let http_output = function
        .output_bindings()
        .find(|binding| binding.binding_type.eq_ignore_ascii_case("http"));
    let value = match http_output {
        Some(binding) if binding.name == "$return" => result.return_value,
        Some(binding) => result.outputs.get(&binding.name).cloned(),
        None => result.return_value,
    };
    match value {
        Some(value) => HostResponse::from_http_output(value),
        None => HostResponse::no_content(),
    }
}
