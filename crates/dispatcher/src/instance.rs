use std::collections::HashMap;
use std::sync::Arc;

use funchost_domain::{EnvironmentAccessor, EnvironmentExt};
use funchost_worker::{ChannelState, LanguageWorkerChannelManager};
use serde::Serialize;

use crate::specialization::{PlaceholderSpecializationHandler, SpecializationState};

/// 单个Worker通道的概况
#[derive(Debug, Clone, Serialize)]
pub struct ChannelInfo {
    pub worker_id: String,
    pub language: String,
    pub state: ChannelState,
    pub capabilities: HashMap<String, String>,
    pub functions: usize,
    pub executing: usize,
}

/// 当前实例及其分配状态
#[derive(Debug, Clone, Serialize)]
pub struct InstanceInfo {
    pub instance_id: String,
    pub in_standby_mode: bool,
    pub container_ready: bool,
    pub specialization: SpecializationState,
    pub worker_runtime: Option<String>,
    pub channels: Vec<ChannelInfo>,
}

pub struct InstanceManager {
    instance_id: String,
    environment: Arc<dyn EnvironmentAccessor>,
    channels: Arc<LanguageWorkerChannelManager>,
    specialization: Arc<PlaceholderSpecializationHandler>,
}

impl InstanceManager {
    pub fn new(
        instance_id: &str,
        environment: Arc<dyn EnvironmentAccessor>,
        channels: Arc<LanguageWorkerChannelManager>,
        specialization: Arc<PlaceholderSpecializationHandler>,
    ) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            environment,
            channels,
            specialization,
        }
    }

    pub fn instance_info(&self) -> InstanceInfo {
        let mut channels: Vec<ChannelInfo> = self
            .channels
            .all_channels()
            .iter()
            .map(|channel| ChannelInfo {
                worker_id: channel.worker_id().to_string(),
                language: channel.language().to_string(),
                state: channel.state(),
                capabilities: channel.capabilities(),
                functions: channel.functions().len(),
                executing: channel.executing_count(),
            })
            .collect();
        channels.sort_by(|a, b| (&a.language, &a.worker_id).cmp(&(&b.language, &b.worker_id)));

        InstanceInfo {
            instance_id: self.instance_id.clone(),
            in_standby_mode: self.environment.in_standby_mode(),
            container_ready: self.environment.is_container_ready(),
            specialization: self.specialization.state(),
            worker_runtime: self.environment.worker_runtime(),
            channels,
        }
    }
}
