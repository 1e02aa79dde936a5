use std::path::PathBuf;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use funchost_config::{AppConfig, LanguageWorkerConfig};
use funchost_domain::{EnvironmentAccessor, ScriptEvent, WorkerProcessFactory, WorkerProcessSpec};
use funchost_errors::{HostError, HostResult};
use funchost_infrastructure::{EventFilter, ScriptEventManager, Subscription};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::channel::{ChannelSettings, LanguageWorkerChannel};
use crate::debounce::FileChangeDebouncer;
use crate::state::ChannelState;

/// Worker通道管理器
///
/// 按worker id持有所有通道。Worker错误事件到达时释放并移除对应通道，不自动重启。
/// 每种语言只运行一个源文件变更去抖任务，与该语言的通道数量无关。
pub struct LanguageWorkerChannelManager {
    config: AppConfig,
    events: ScriptEventManager,
    process_factory: Arc<dyn WorkerProcessFactory>,
    environment: Arc<dyn EnvironmentAccessor>,
    channels: DashMap<String, Arc<LanguageWorkerChannel>>,
    /// 语言(小写) -> 去抖任务的停止令牌
    debouncers: DashMap<String, CancellationToken>,
    shutdown: CancellationToken,
}

impl LanguageWorkerChannelManager {
    pub fn new(
        config: AppConfig,
        events: ScriptEventManager,
        process_factory: Arc<dyn WorkerProcessFactory>,
        environment: Arc<dyn EnvironmentAccessor>,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            config,
            events,
            process_factory,
            environment,
            channels: DashMap::new(),
            debouncers: DashMap::new(),
            shutdown: CancellationToken::new(),
        });
        let errors = manager.events.subscribe(EventFilter::WorkerError);
        Self::spawn_error_listener(Arc::downgrade(&manager), errors, manager.shutdown.clone());
        manager
    }

    /// 为指定语言创建一个通道并完成初始化
    pub async fn initialize_channel(&self, language: &str) -> HostResult<Arc<LanguageWorkerChannel>> {
        let worker_config = self
            .config
            .language(language)
            .cloned()
            .ok_or_else(|| HostError::ChannelNotFound {
                language: language.to_string(),
            })?;

        let worker_id = Uuid::new_v4().to_string();
        let process = self.process_factory.create(WorkerProcessSpec {
            worker_id: worker_id.clone(),
            config: worker_config.clone(),
            script_root: PathBuf::from(&self.config.host.script_root),
            environment: self.environment.snapshot().into_iter().collect(),
        });

        self.ensure_debouncer(&worker_config);
        let channel = LanguageWorkerChannel::new(
            &worker_id,
            worker_config,
            ChannelSettings::from_config(&self.config),
            self.events.clone(),
            process,
            Arc::clone(&self.environment),
        );
        self.channels.insert(worker_id.clone(), Arc::clone(&channel));

        info!(worker_id = %worker_id, language = %language, "初始化Worker通道");
        if let Err(e) = channel.start_worker_process().await {
            error!(worker_id = %worker_id, language = %language, error = %e, "Worker通道初始化失败");
            self.shutdown_channel(&worker_id).await;
            return Err(e);
        }
        Ok(channel)
    }

    pub fn get_channels(&self, language: &str) -> Vec<Arc<LanguageWorkerChannel>> {
        self.channels
            .iter()
            .filter(|entry| entry.value().language().eq_ignore_ascii_case(language))
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// 当前可用于特化的占位通道：该语言下已初始化的通道
    pub fn get_placeholder_channel(&self, language: &str) -> Option<Arc<LanguageWorkerChannel>> {
        self.get_channels(language)
            .into_iter()
            .find(|channel| channel.state() == ChannelState::Initialized)
    }

    pub fn get_channel(&self, worker_id: &str) -> Option<Arc<LanguageWorkerChannel>> {
        self.channels
            .get(worker_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn all_channels(&self) -> Vec<Arc<LanguageWorkerChannel>> {
        self.channels
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// 正在运行去抖任务的语言数
    pub fn debouncer_count(&self) -> usize {
        self.debouncers.len()
    }

    fn ensure_debouncer(&self, config: &LanguageWorkerConfig) {
        let language = config.language.to_ascii_lowercase();
        self.debouncers.entry(language).or_insert_with(|| {
            let stop = self.shutdown.child_token();
            FileChangeDebouncer::new(config.clone(), self.config.channel.file_change_debounce())
                .spawn(
                    self.events.clone(),
                    stop.clone(),
                    info_span!("file_change_debouncer", language = %config.language),
                );
            debug!(language = %config.language, "启动源文件变更去抖任务");
            stop
        });
    }

    /// 语言的最后一个通道移除后停止它的去抖任务
    fn release_debouncer(&self, language: &str) {
        if !self.get_channels(language).is_empty() {
            return;
        }
        if let Some((_, stop)) = self.debouncers.remove(&language.to_ascii_lowercase()) {
            stop.cancel();
            debug!(language = %language, "停止源文件变更去抖任务");
        }
    }

    /// 释放并移除通道，返回通道是否存在
    pub async fn shutdown_channel(&self, worker_id: &str) -> bool {
        match self.channels.remove(worker_id) {
            Some((_, channel)) => {
                self.release_debouncer(channel.language());
                channel.dispose().await;
                info!(worker_id = %worker_id, "Worker通道已关闭");
                true
            }
            None => false,
        }
    }

    pub async fn shutdown_all(&self) {
        let worker_ids: Vec<String> = self.channels.iter().map(|e| e.key().clone()).collect();
        info!("关闭全部 {} 个Worker通道", worker_ids.len());
        for worker_id in worker_ids {
            self.shutdown_channel(&worker_id).await;
        }
    }

    fn spawn_error_listener(
        manager: Weak<Self>,
        mut errors: Subscription,
        shutdown: CancellationToken,
    ) {
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = errors.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                let ScriptEvent::WorkerError(worker_error) = event else {
                    continue;
                };
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                warn!(
                    worker_id = %worker_error.worker_id,
                    language = %worker_error.language,
                    error = %worker_error.error,
                    "Worker出错，移除对应通道"
                );
                manager.shutdown_channel(&worker_error.worker_id).await;
            }
        });
    }
}

impl Drop for LanguageWorkerChannelManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
