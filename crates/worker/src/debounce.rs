use std::path::PathBuf;
use std::time::Duration;

use funchost_config::LanguageWorkerConfig;
use funchost_domain::ScriptEvent;
use funchost_infrastructure::{EventFilter, ScriptEventManager, Subscription};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, Instrument, Span};

/// 源文件变更去抖
///
/// 只关注该语言扩展名的文件。一串变更在窗口内静默后合并为一次宿主重启事件，
/// 窗口从最后一次变更开始计时。
#[derive(Debug, Clone)]
pub struct FileChangeDebouncer {
    config: LanguageWorkerConfig,
    window: Duration,
}

impl FileChangeDebouncer {
    pub fn new(config: LanguageWorkerConfig, window: Duration) -> Self {
        Self { config, window }
    }

    /// 订阅在返回前完成
    pub fn spawn(self, events: ScriptEventManager, shutdown: CancellationToken, span: Span) {
        let subscription = events.subscribe(EventFilter::FileChanged);
        tokio::spawn(
            async move { self.run(events, subscription, shutdown).await }.instrument(span),
        );
    }

    async fn run(
        self,
        events: ScriptEventManager,
        mut subscription: Subscription,
        shutdown: CancellationToken,
    ) {
        loop {
            let mut last = tokio::select! {
                _ = shutdown.cancelled() => return,
                path = self.next_relevant(&mut subscription) => match path {
                    Some(path) => path,
                    None => return,
                },
            };
            let mut coalesced = 1usize;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(self.window) => break,
                    path = self.next_relevant(&mut subscription) => match path {
                        Some(path) => {
                            coalesced += 1;
                            last = path;
                        }
                        None => return,
                    },
                }
            }

            info!(
                coalesced,
                path = %last.display(),
                "源文件发生变更，请求重启宿主"
            );
            events.publish(ScriptEvent::host_restart(&format!(
                "{} source file change(s), last: {}",
                coalesced,
                last.display()
            )));
        }
    }

    async fn next_relevant(&self, subscription: &mut Subscription) -> Option<PathBuf> {
        while let Some(event) = subscription.recv().await {
            if let ScriptEvent::FileChanged(change) = event {
                if self.config.handles_path(&change.path) {
                    return Some(change.path);
                }
                debug!(path = %change.path.display(), "忽略非源文件变更");
            }
        }
        None
    }
}
