use std::path::{Path, PathBuf};

use funchost_domain::{FileChangeKind, ScriptEvent};
use funchost_errors::{HostError, HostResult};
use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, info, warn};

use crate::event_bus::ScriptEventManager;

/// 监听脚本根目录并把文件变更发布到事件总线
///
/// 监听在该对象存活期间有效，drop即停止。
pub struct FileEventSource {
    root: PathBuf,
    _watcher: RecommendedWatcher,
}

impl std::fmt::Debug for FileEventSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileEventSource")
            .field("root", &self.root)
            .finish()
    }
}

impl FileEventSource {
    pub fn start(root: &Path, events: ScriptEventManager) -> HostResult<Self> {
        let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            match result {
                Ok(event) => {
                    let Some(change) = Self::change_kind(&event.kind) else {
                        return;
                    };
                    for path in event.paths {
                        debug!(path = %path.display(), ?change, "文件变更");
                        events.publish(ScriptEvent::file_changed(path, change));
                    }
                }
                Err(e) => warn!("文件监听错误: {}", e),
            }
        })
        .map_err(|e| HostError::Io(format!("failed to create file watcher: {e}")))?;

        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(|e| HostError::Io(format!("failed to watch {}: {e}", root.display())))?;

        info!("开始监听脚本目录: {}", root.display());
        Ok(Self {
            root: root.to_path_buf(),
            _watcher: watcher,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn change_kind(kind: &EventKind) -> Option<FileChangeKind> {
        match kind {
            EventKind::Create(_) => Some(FileChangeKind::Created),
            EventKind::Modify(ModifyKind::Name(_)) => Some(FileChangeKind::Renamed),
            EventKind::Modify(_) => Some(FileChangeKind::Changed),
            EventKind::Remove(_) => Some(FileChangeKind::Deleted),
            _ => None,
        }
    }
}
