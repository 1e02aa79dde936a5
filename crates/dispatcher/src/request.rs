//! 宿主HTTP管道与调度核心之间的请求/响应模型

use std::collections::HashMap;

use async_trait::async_trait;
use funchost_errors::HostError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// 入站请求
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HostRequest {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub query: HashMap<String, String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
}

impl HostRequest {
    pub fn new(method: &str, path: &str) -> Self {
        Self {
            method: method.to_uppercase(),
            path: path.to_string(),
            ..Default::default()
        }
    }

    pub fn get(path: &str) -> Self {
        Self::new("GET", path)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_query(mut self, name: &str, value: &str) -> Self {
        self.query.insert(name.to_string(), value.to_string());
        self
    }

    /// `/api/{function}` 路由中的函数名
    pub fn function_name(&self) -> Option<&str> {
        let mut segments = self.path.split('/').filter(|s| !s.is_empty());
        match (segments.next(), segments.next()) {
            (Some(prefix), Some(name)) if prefix.eq_ignore_ascii_case("api") => Some(name),
            _ => None,
        }
    }

    /// 路径是否以给定的完整路径段开头，忽略大小写
    pub fn starts_with_segments(&self, prefix: &str) -> bool {
        let path = self.path.to_ascii_lowercase();
        let prefix = prefix.trim_end_matches('/').to_ascii_lowercase();
        path == prefix || path.starts_with(&format!("{prefix}/"))
    }

    /// 作为触发器绑定传给Worker的数据
    pub fn to_binding_data(&self) -> Value {
        json!({
            "method": self.method,
            "url": self.path,
            "headers": self.headers,
            "query": self.query,
            "body": self.body,
        })
    }
}

/// 出站响应
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Value,
}

impl HostResponse {
    pub fn new(status: u16, body: Value) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body,
        }
    }

    pub fn ok(body: Value) -> Self {
        Self::new(200, body)
    }

    pub fn no_content() -> Self {
        Self::new(204, Value::Null)
    }

    pub fn from_error(error: &HostError) -> Self {
        Self::new(error.status_code(), json!({ "error": error.to_string() }))
    }

    /// 把http输出绑定的值转换为响应
    ///
    /// 形如 `{status, headers, body}` 的对象按字段解释，其他值整体作为响应体。
    pub fn from_http_output(value: Value) -> Self {
        let Value::Object(mut fields) = value else {
            return Self::ok(value);
        };
        let shaped = ["status", "statusCode", "body", "headers"]
            .iter()
            .any(|key| fields.contains_key(*key));
        if !shaped {
            return Self::ok(Value::Object(fields));
        }

        let status = fields
            .get("status")
            .or_else(|| fields.get("statusCode"))
            .and_then(|status| match status {
                Value::Number(n) => n.as_u64(),
                Value::String(s) => s.parse().ok(),
                _ => None,
            })
            .and_then(|status| u16::try_from(status).ok())
            .unwrap_or(200);

        let headers = match fields.remove("headers") {
            Some(Value::Object(headers)) => headers
                .into_iter()
                .map(|(name, value)| {
                    let value = match value {
                        Value::String(s) => s,
                        other => other.to_string(),
                    };
                    (name, value)
                })
                .collect(),
            _ => HashMap::new(),
        };

        Self {
            status,
            headers,
            body: fields.remove("body").unwrap_or(Value::Null),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// 处理一个入站请求
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: HostRequest) -> HostResponse;
}
