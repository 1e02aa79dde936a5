use std::collections::HashMap;

/// 环境变量名称
pub mod settings {
    pub const PLACEHOLDER_MODE: &str = "WEBSITE_PLACEHOLDER_MODE";
    pub const CONTAINER_READY: &str = "WEBSITE_CONTAINER_READY";
    pub const WORKER_RUNTIME: &str = "FUNCTIONS_WORKER_RUNTIME";
    pub const SCRIPT_ROOT: &str = "AzureWebJobsScriptRoot";
    pub const CONTAINER_NAME: &str = "CONTAINER_NAME";
    pub const SITE_NAME: &str = "WEBSITE_SITE_NAME";
}

/// 进程级命名字符串变量的读写
pub trait EnvironmentAccessor: Send + Sync {
    fn get(&self, name: &str) -> Option<String>;
    fn set(&self, name: &str, value: Option<&str>);
    /// 当前全部变量的快照
    fn snapshot(&self) -> HashMap<String, String>;
}

/// 基于环境变量的宿主状态判断
pub trait EnvironmentExt {
    fn in_standby_mode(&self) -> bool;
    fn is_container_ready(&self) -> bool;
    fn worker_runtime(&self) -> Option<String>;
}

impl<T: EnvironmentAccessor + ?Sized> EnvironmentExt for T {
    fn in_standby_mode(&self) -> bool {
        self.get(settings::PLACEHOLDER_MODE).as_deref() == Some("1")
    }

    fn is_container_ready(&self) -> bool {
        self.get(settings::CONTAINER_READY).as_deref() == Some("1")
    }

    fn worker_runtime(&self) -> Option<String> {
        self.get(settings::WORKER_RUNTIME)
            .filter(|runtime| !runtime.trim().is_empty())
    }
}
