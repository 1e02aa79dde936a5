use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 绑定方向
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum BindingDirection {
    In,
    Out,
    #[serde(rename = "inout")]
    InOut,
}

/// 函数的一个绑定声明，例如 `httpTrigger` 输入或 `http` 输出
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BindingMetadata {
    pub name: String,
    pub direction: BindingDirection,
    #[serde(rename = "type")]
    pub binding_type: String,
}

impl BindingMetadata {
    pub fn new(name: &str, direction: BindingDirection, binding_type: &str) -> Self {
        Self {
            name: name.to_string(),
            direction,
            binding_type: binding_type.to_string(),
        }
    }

    /// 触发器绑定：类型以 "Trigger" 结尾的输入绑定
    pub fn is_trigger(&self) -> bool {
        self.direction == BindingDirection::In
            && self.binding_type.to_ascii_lowercase().ends_with("trigger")
    }
}

/// 函数描述，由元数据提供方生成，创建后不可变
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionDescriptor {
    /// 每次加载生成一次的稳定ID
    pub function_id: String,
    pub name: String,
    pub directory: PathBuf,
    pub script_file: PathBuf,
    pub entry_point: Option<String>,
    pub language: String,
    pub bindings: Vec<BindingMetadata>,
    pub is_disabled: bool,
}

impl FunctionDescriptor {
    pub fn new(name: &str, language: &str, directory: PathBuf, script_file: PathBuf) -> Self {
        Self {
            function_id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            directory,
            script_file,
            entry_point: None,
            language: language.to_string(),
            bindings: Vec::new(),
            is_disabled: false,
        }
    }

    pub fn trigger_binding(&self) -> Option<&BindingMetadata> {
        self.bindings.iter().find(|binding| binding.is_trigger())
    }

    pub fn output_bindings(&self) -> impl Iterator<Item = &BindingMetadata> {
        self.bindings
            .iter()
            .filter(|binding| binding.direction != BindingDirection::In)
    }
}

/// 一次元数据扫描的结果：成功解析的函数与按函数名归类的错误
#[derive(Debug, Clone, Default)]
pub struct FunctionMetadataResult {
    pub functions: Vec<FunctionDescriptor>,
    pub errors: HashMap<String, Vec<String>>,
}

impl FunctionMetadataResult {
    pub fn add_error(&mut self, function_name: &str, message: String) {
        self.errors
            .entry(function_name.to_string())
            .or_default()
            .push(message);
    }

    pub fn find(&self, name: &str) -> Option<&FunctionDescriptor> {
        self.functions
            .iter()
            .find(|f| f.name.eq_ignore_ascii_case(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http_function() -> FunctionDescriptor {
        let mut f = FunctionDescriptor::new(
            "HttpTrigger",
            "node",
            PathBuf::from("/app/HttpTrigger"),
            PathBuf::from("/app/HttpTrigger/index.js"),
        );
        f.bindings = vec![
            BindingMetadata::new("req", BindingDirection::In, "httpTrigger"),
            BindingMetadata::new("res", BindingDirection::Out, "http"),
        ];
        f
    }

    #[test]
    fn test_trigger_and_output_bindings() {
        let f = http_function();
        assert_eq!(f.trigger_binding().map(|b| b.name.as_str()), Some("req"));
        let outputs: Vec<_> = f.output_bindings().map(|b| b.name.as_str()).collect();
        assert_eq!(outputs, vec!["res"]);
    }

    #[test]
    fn test_function_ids_are_unique_per_descriptor() {
        assert_ne!(http_function().function_id, http_function().function_id);
    }

    #[test]
    fn test_binding_direction_serde() {
        let binding: BindingMetadata =
            serde_json::from_str(r#"{"name":"q","direction":"inout","type":"queue"}"#).unwrap();
        assert_eq!(binding.direction, BindingDirection::InOut);
        assert_eq!(binding.binding_type, "queue");
    }

    #[test]
    fn test_metadata_result_errors_grouped_by_function() {
        let mut result = FunctionMetadataResult::default();
        result.add_error("Broken", "missing function.json".to_string());
        result.add_error("Broken", "no script file".to_string());
        assert_eq!(result.errors["Broken"].len(), 2);
        result.functions.push(http_function());
        assert!(result.find("httptrigger").is_some());
    }
}
