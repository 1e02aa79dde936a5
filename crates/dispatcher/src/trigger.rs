use std::sync::Arc;

use async_trait::async_trait;
use funchost_domain::{settings, EnvironmentAccessor, EnvironmentExt};
use tracing::info;

use crate::request::{HostRequest, HostResponse, RequestHandler};

pub const SPECIALIZATION_TRIGGER_PATH: &str = "/api/specializationhack";

/// 开发用特化触发器
///
/// 待机状态下访问 `/api/specializationhack` 时，直接把环境切换到"已分配"状态
/// （退出占位模式、容器就绪、设置worker运行时），然后照常转发请求。
pub struct SpecializationTrigger {
    inner: Arc<dyn RequestHandler>,
    environment: Arc<dyn EnvironmentAccessor>,
    worker_runtime: String,
}

impl SpecializationTrigger {
    pub fn new(
        inner: Arc<dyn RequestHandler>,
        environment: Arc<dyn EnvironmentAccessor>,
        worker_runtime: &str,
    ) -> Self {
        Self {
            inner,
            environment,
            worker_runtime: worker_runtime.to_string(),
        }
    }

    pub fn is_trigger(&self, request: &HostRequest) -> bool {
        self.environment.in_standby_mode()
            && request.starts_with_segments(SPECIALIZATION_TRIGGER_PATH)
    }
}

#[async_trait]
impl RequestHandler for SpecializationTrigger {
    async fn handle(&self, request: HostRequest) -> HostResponse {
        if self.is_trigger(&request) {
            info!(runtime = %self.worker_runtime, "收到特化触发请求，退出占位模式");
            self.environment.set(settings::PLACEHOLDER_MODE, Some("0"));
            self.environment.set(settings::CONTAINER_READY, Some("1"));
            self.environment
                .set(settings::WORKER_RUNTIME, Some(&self.worker_runtime));
        }
        self.inner.handle(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use funchost_infrastructure::InMemoryEnvironment;
    use serde_json::json;

    #[derive(Default)]
    struct RecordingHandler {
        paths: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RequestHandler for RecordingHandler {
        async fn handle(&self, request: HostRequest) -> HostResponse {
            self.paths.lock().unwrap().push(request.path);
            HostResponse::ok(json!("forwarded"))
        }
    }

    fn build_trigger(
        standby: &str,
    ) -> (SpecializationTrigger, Arc<RecordingHandler>, Arc<InMemoryEnvironment>) {
        let inner = Arc::new(RecordingHandler::default());
        let environment = Arc::new(InMemoryEnvironment::with_variables([(
            settings::PLACEHOLDER_MODE,
            standby,
        )]));
        let trigger = SpecializationTrigger::new(
            inner.clone(),
            environment.clone(),
            "node",
        );
        (trigger, inner, environment)
    }

    #[tokio::test]
    async fn test_trigger_path_leaves_standby() {
        let (trigger, inner, environment) = build_trigger("1");

        let response = trigger.handle(HostRequest::get("/api/specializationhack")).await;

        assert_eq!(response.body, json!("forwarded"));
        assert!(!environment.in_standby_mode());
        assert!(environment.is_container_ready());
        assert_eq!(environment.worker_runtime().as_deref(), Some("node"));
        assert_eq!(inner.paths.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_other_paths_and_non_standby_are_untouched() {
        let (trigger, inner, environment) = build_trigger("1");
        trigger.handle(HostRequest::get("/api/HttpTrigger")).await;
        assert!(environment.in_standby_mode());
        assert!(environment.get(settings::CONTAINER_READY).is_none());

        let (trigger, _, environment) = build_trigger("0");
        trigger.handle(HostRequest::get("/api/specializationhack")).await;
        assert!(environment.get(settings::CONTAINER_READY).is_none());
        assert!(environment.worker_runtime().is_none());

        assert_eq!(inner.paths.lock().unwrap().as_slice(), ["/api/HttpTrigger"]);
    }
}
