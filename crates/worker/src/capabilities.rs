use std::collections::HashMap;
use std::sync::RwLock;

use tracing::debug;

/// Worker在初始化响应中上报的能力集合
#[derive(Debug, Default)]
pub struct Capabilities {
    values: RwLock<HashMap<String, String>>,
}

impl Capabilities {
    pub fn new() -> Self {
        Self::default()
    }

    /// 合并能力；新增或变化的能力逐条记录
    pub fn update(&self, capabilities: &HashMap<String, String>) {
        let mut values = self
            .values
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for (name, value) in capabilities {
            if values.get(name) != Some(value) {
                debug!(capability = %name, value = %value, "更新Worker能力");
                values.insert(name.clone(), value.clone());
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.values
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .cloned()
    }

    pub fn snapshot(&self) -> HashMap<String, String> {
        self.values
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}
