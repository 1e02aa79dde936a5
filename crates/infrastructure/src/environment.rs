use std::collections::HashMap;
use std::sync::RwLock;

use funchost_domain::EnvironmentAccessor;

/// 直接读写进程环境变量
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemEnvironment;

impl SystemEnvironment {
    pub fn new() -> Self {
        Self
    }
}

impl EnvironmentAccessor for SystemEnvironment {
    fn get(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }

    fn set(&self, name: &str, value: Option<&str>) {
        // 宿主启动后只有特化流程会修改环境变量
        match value {
            Some(value) => std::env::set_var(name, value),
            None => std::env::remove_var(name),
        }
    }

    fn snapshot(&self) -> HashMap<String, String> {
        std::env::vars().collect()
    }
}

/// 内存中的环境变量表，用于测试和嵌入场景
#[derive(Debug, Default)]
pub struct InMemoryEnvironment {
    variables: RwLock<HashMap<String, String>>,
}

impl InMemoryEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_variables<I, K, V>(variables: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            variables: RwLock::new(
                variables
                    .into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
        }
    }
}

impl EnvironmentAccessor for InMemoryEnvironment {
    fn get(&self, name: &str) -> Option<String> {
        self.variables
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .cloned()
    }

    fn set(&self, name: &str, value: Option<&str>) {
        let mut variables = self
            .variables
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match value {
            Some(value) => {
                variables.insert(name.to_string(), value.to_string());
            }
            None => {
                variables.remove(name);
            }
        }
    }

    fn snapshot(&self) -> HashMap<String, String> {
        self.variables
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use funchost_domain::{settings, EnvironmentExt};

    #[test]
    fn test_in_memory_environment_flags() {
        let env = InMemoryEnvironment::with_variables([
            (settings::PLACEHOLDER_MODE, "1"),
            (settings::WORKER_RUNTIME, "  "),
        ]);
        assert!(env.in_standby_mode());
        assert!(!env.is_container_ready());
        assert_eq!(env.worker_runtime(), None);

        env.set(settings::PLACEHOLDER_MODE, Some("0"));
        env.set(settings::CONTAINER_READY, Some("1"));
        env.set(settings::WORKER_RUNTIME, Some("node"));
        assert!(!env.in_standby_mode());
        assert!(env.is_container_ready());
        assert_eq!(env.worker_runtime().as_deref(), Some("node"));

        env.set(settings::WORKER_RUNTIME, None);
        assert!(!env.snapshot().contains_key(settings::WORKER_RUNTIME));
    }

    #[test]
    fn test_system_environment_roundtrip() {
        let env = SystemEnvironment::new();
        let name = "FUNCHOST_ENVIRONMENT_TEST_VARIABLE";
        env.set(name, Some("value"));
        assert_eq!(env.get(name).as_deref(), Some("value"));
        assert_eq!(env.snapshot().get(name).map(String::as_str), Some("value"));
        env.set(name, None);
        assert_eq!(env.get(name), None);
    }
}
