use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use funchost_config::AppConfig;
use funchost_domain::{settings, EnvironmentAccessor, StandbyManager};
use funchost_errors::{HostError, HostResult};
use funchost_infrastructure::{FileEventSource, ScriptEventManager};
use tracing::{debug, info};

/// 宿主级的特化钩子
///
/// 重新加载配置文件，特化完成后把文件监听切换到函数应用的脚本目录。
pub struct HostStandbyManager {
    config_path: Option<String>,
    config: RwLock<AppConfig>,
    environment: Arc<dyn EnvironmentAccessor>,
    events: ScriptEventManager,
    watcher: Mutex<Option<FileEventSource>>,
}

impl HostStandbyManager {
    pub fn new(
        config: AppConfig,
        config_path: Option<String>,
        environment: Arc<dyn EnvironmentAccessor>,
        events: ScriptEventManager,
    ) -> Self {
        Self {
            config_path,
            config: RwLock::new(config),
            environment,
            events,
            watcher: Mutex::new(None),
        }
    }

    pub fn config(&self) -> AppConfig {
        self.config
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// 环境变量中的脚本目录优先于配置
    pub fn script_root(&self) -> PathBuf {
        self.environment
            .get(settings::SCRIPT_ROOT)
            .filter(|root| !root.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(self.config().host.script_root))
    }

    /// 监听当前脚本目录，替换之前的监听；目录不存在时不监听
    pub fn watch_script_root(&self) -> HostResult<()> {
        let root = self.script_root();
        let mut watcher = self
            .watcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if watcher.as_ref().map(|w| w.root()) == Some(root.as_path()) {
            return Ok(());
        }
        if !root.is_dir() {
            debug!(script_root = %root.display(), "脚本目录不存在，跳过文件监听");
            *watcher = None;
            return Ok(());
        }
        *watcher = Some(FileEventSource::start(&root, self.events.clone())?);
        Ok(())
    }

    pub fn watched_root(&self) -> Option<PathBuf> {
        self.watcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .map(|w| w.root().to_path_buf())
    }

    pub fn stop_watching(&self) {
        self.watcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
    }
}

#[async_trait]
impl StandbyManager for HostStandbyManager {
    async fn specialize_host_reload_config(&self) -> HostResult<()> {
        let Some(path) = self.config_path.as_deref() else {
            debug!("未指定配置文件，保留当前配置");
            return Ok(());
        };
        let config = AppConfig::load(Some(path))
            .map_err(|e| HostError::config_error(format!("{e:#}")))?;
        *self
            .config
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = config;
        info!(config = %path, "宿主配置已重新加载");
        Ok(())
    }

    async fn specialize_host(&self) -> HostResult<()> {
        self.watch_script_root()?;
        info!(script_root = %self.script_root().display(), "宿主已特化");
        Ok(())
    }
}

impl std::fmt::Debug for HostStandbyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostStandbyManager")
            .field("config_path", &self.config_path)
            .field("watched_root", &self.watched_root())
            .finish()
    }
}
