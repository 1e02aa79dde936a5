//! Test data builders for creating test entities
//!
//! This module provides builder patterns for creating test data with
//! sensible defaults and easy customization.

use std::path::PathBuf;

use funchost_config::{AppConfig, ChannelConfig, LanguageWorkerConfig};
use funchost_domain::{BindingDirection, BindingMetadata, FunctionDescriptor};

/// Builder for creating test FunctionDescriptor entities
///
/// Defaults to a node http function with a `req` trigger and a `res` output.
pub struct FunctionDescriptorBuilder {
    function: FunctionDescriptor,
}

impl FunctionDescriptorBuilder {
    pub fn new(name: &str) -> Self {
        let directory = PathBuf::from("/app").join(name);
        let script_file = directory.join("index.js");
        let mut function = FunctionDescriptor::new(name, "node", directory, script_file);
        function.bindings = vec![
            BindingMetadata::new("req", BindingDirection::In, "httpTrigger"),
            BindingMetadata::new("res", BindingDirection::Out, "http"),
        ];
        Self { function }
    }

    pub fn with_function_id(mut self, function_id: &str) -> Self {
        self.function.function_id = function_id.to_string();
        self
    }

    pub fn with_language(mut self, language: &str) -> Self {
        self.function.language = language.to_string();
        self
    }

    pub fn with_entry_point(mut self, entry_point: &str) -> Self {
        self.function.entry_point = Some(entry_point.to_string());
        self
    }

    pub fn with_bindings(mut self, bindings: Vec<BindingMetadata>) -> Self {
        self.function.bindings = bindings;
        self
    }

    pub fn with_binding(mut self, name: &str, direction: BindingDirection, binding_type: &str) -> Self {
        self.function
            .bindings
            .push(BindingMetadata::new(name, direction, binding_type));
        self
    }

    pub fn returning_value(self) -> Self {
        self.with_bindings(vec![
            BindingMetadata::new("req", BindingDirection::In, "httpTrigger"),
            BindingMetadata::new("$return", BindingDirection::Out, "http"),
        ])
    }

    pub fn disabled(mut self) -> Self {
        self.function.is_disabled = true;
        self
    }

    pub fn build(self) -> FunctionDescriptor {
        self.function
    }
}

/// App config with short protocol timeouts for tests.
pub fn test_app_config(script_root: &str) -> AppConfig {
    let mut config = AppConfig::default();
    config.host.script_root = script_root.to_string();
    config.channel = ChannelConfig {
        process_start_timeout_seconds: 5,
        worker_init_timeout_seconds: 5,
        environment_reload_timeout_seconds: 5,
        function_load_timeout_seconds: 5,
        invocation_timeout_seconds: 10,
        file_change_debounce_ms: 300,
        stderr_buffer_lines: 3,
    };
    config.languages = vec![LanguageWorkerConfig::node()];
    config
}
