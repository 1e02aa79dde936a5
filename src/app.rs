use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use funchost_config::AppConfig;
use funchost_dispatcher::{
    FunctionInvocationPipeline, HostRequest, HostResponse, InstanceInfo, InstanceManager,
    PlaceholderSpecializationHandler, RequestHandler, SpecializationTrigger,
};
use funchost_domain::{
    settings, EnvironmentAccessor, EnvironmentExt, FunctionMetadataProvider, ScriptEvent,
    WorkerProcessFactory,
};
use funchost_infrastructure::{
    EventFilter, FileSystemMetadataProvider, LanguageWorkerProcessFactory, ScriptEventManager,
    SystemEnvironment,
};
use funchost_worker::LanguageWorkerChannelManager;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::standby::HostStandbyManager;

/// 函数宿主应用
///
/// 请求依次经过特化触发器、占位实例特化处理器和调用管道。
pub struct Application {
    events: ScriptEventManager,
    environment: Arc<dyn EnvironmentAccessor>,
    metadata: Arc<dyn FunctionMetadataProvider>,
    channels: Arc<LanguageWorkerChannelManager>,
    standby: Arc<HostStandbyManager>,
    pipeline: Arc<FunctionInvocationPipeline>,
    specialization: Arc<PlaceholderSpecializationHandler>,
    handler: Arc<dyn RequestHandler>,
    instance: InstanceManager,
}

impl Application {
    pub fn new(config: AppConfig, config_path: Option<String>) -> Self {
        Self::with_components(
            config,
            config_path,
            ScriptEventManager::new(),
            Arc::new(SystemEnvironment::new()),
            Arc::new(LanguageWorkerProcessFactory),
            Arc::new(FileSystemMetadataProvider::new()),
        )
    }

    pub fn with_components(
        config: AppConfig,
        config_path: Option<String>,
        events: ScriptEventManager,
        environment: Arc<dyn EnvironmentAccessor>,
        process_factory: Arc<dyn WorkerProcessFactory>,
        metadata: Arc<dyn FunctionMetadataProvider>,
    ) -> Self {
        let channels = LanguageWorkerChannelManager::new(
            config.clone(),
            events.clone(),
            process_factory,
            Arc::clone(&environment),
        );
        let standby = Arc::new(HostStandbyManager::new(
            config.clone(),
            config_path,
            Arc::clone(&environment),
            events.clone(),
        ));
        let pipeline = Arc::new(FunctionInvocationPipeline::new(
            &config,
            Arc::clone(&channels),
            Arc::clone(&environment),
        ));
        let specialization = Arc::new(PlaceholderSpecializationHandler::new(
            config.clone(),
            Arc::clone(&environment),
            standby.clone(),
            Arc::clone(&channels),
            Arc::clone(&metadata),
            Arc::clone(&pipeline),
        ));
        let handler: Arc<dyn RequestHandler> = Arc::new(SpecializationTrigger::new(
            specialization.clone(),
            Arc::clone(&environment),
            &config.host.default_worker_runtime,
        ));
        let instance = InstanceManager::new(
            &instance_id(environment.as_ref()),
            Arc::clone(&environment),
            Arc::clone(&channels),
            Arc::clone(&specialization),
        );

        Self {
            events,
            environment,
            metadata,
            channels,
            standby,
            pipeline,
            specialization,
            handler,
            instance,
        }
    }

    pub fn events(&self) -> &ScriptEventManager {
        &self.events
    }

    pub fn channels(&self) -> &Arc<LanguageWorkerChannelManager> {
        &self.channels
    }

    pub fn instance_info(&self) -> InstanceInfo {
        self.instance.instance_info()
    }

    pub async fn handle(&self, request: HostRequest) -> HostResponse {
        self.handler.handle(request).await
    }

    /// 启动Worker通道
    ///
    /// 待机时为每种语言预热一个占位通道；已分配时只启动当前运行时的通道并加载函数。
    pub async fn start(&self) -> Result<()> {
        let in_standby = self.environment.in_standby_mode();
        let languages: Vec<String> = if in_standby {
            self.standby
                .config()
                .languages
                .iter()
                .map(|l| l.language.clone())
                .collect()
        } else {
            vec![self.pipeline.worker_runtime()]
        };
        info!(standby = in_standby, languages = ?languages, "启动函数宿主");

        let mut started = 0;
        for language in &languages {
            match self.channels.initialize_channel(language).await {
                Ok(channel) => {
                    started += 1;
                    info!(language = %language, worker_id = %channel.worker_id(), "Worker通道已就绪");
                }
                Err(e) => error!(language = %language, error = %e, "Worker通道启动失败"),
            }
        }
        if started == 0 {
            bail!("没有可用的Worker通道: {languages:?}");
        }

        if !in_standby {
            let count = self.load_functions().await?;
            info!(functions = count, "函数已加载");
        }
        if let Err(e) = self.standby.watch_script_root() {
            warn!(error = %e, "无法监听脚本目录");
        }
        Ok(())
    }

    /// 扫描脚本目录，把当前运行时的函数装入对应通道
    pub async fn load_functions(&self) -> Result<usize> {
        let runtime = self.pipeline.worker_runtime();
        let channel = self
            .channels
            .get_placeholder_channel(&runtime)
            .ok_or_else(|| anyhow!("没有可用的{runtime}通道"))?;
        let config = self.standby.config();
        let script_root = self.standby.script_root();

        let result = self
            .metadata
            .read_functions_metadata(
                &script_root,
                config.host.function_allowlist.as_deref(),
                &config.languages,
            )
            .await
            .with_context(|| format!("读取函数元数据失败: {}", script_root.display()))?;
        for (function, errors) in &result.errors {
            for message in errors {
                warn!(function = %function, error = %message, "函数元数据错误");
            }
        }

        let functions: Vec<_> = result
            .functions
            .into_iter()
            .filter(|f| f.language.eq_ignore_ascii_case(&runtime) && !f.is_disabled)
            .collect();
        let count = functions.len();
        channel.setup_invocation_buffers(functions);
        channel.send_function_load_requests();
        Ok(count)
    }

    /// 运行直到收到关闭信号；脚本变化触发的重启请求会重新加载函数
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let mut restarts = self.events.subscribe(EventFilter::HostRestart);
        self.start().await?;

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("收到关闭信号");
                    break;
                }
                event = restarts.recv() => match event {
                    Some(ScriptEvent::HostRestart(restart)) => self.restart(&restart.reason).await,
                    Some(_) => {}
                    None => break,
                },
            }
        }

        self.shutdown().await;
        Ok(())
    }

    async fn restart(&self, reason: &str) {
        if self.environment.in_standby_mode() {
            debug!(reason = %reason, "待机状态下忽略重启请求");
            return;
        }
        info!(reason = %reason, "重新加载函数");
        match self.load_functions().await {
            Ok(count) => info!(functions = count, "函数已重新加载"),
            Err(e) => error!(error = %format!("{e:#}"), "重新加载函数失败"),
        }
    }

    pub async fn shutdown(&self) {
        info!(specialization = %self.specialization.state(), "关闭函数宿主");
        self.standby.stop_watching();
        self.channels.shutdown_all().await;
    }
}

fn instance_id(environment: &dyn EnvironmentAccessor) -> String {
    environment
        .get(settings::CONTAINER_NAME)
        .or_else(|| hostname::get().ok().and_then(|h| h.into_string().ok()))
        .unwrap_or_else(|| "localhost".to_string())
}
