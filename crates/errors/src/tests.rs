use crate::*;

#[test]
fn test_host_error_display() {
    let launch = HostError::ProcessLaunch("node: not found".to_string());
    assert_eq!(launch.to_string(), "Worker进程启动失败: node: not found");

    let load = HostError::function_load("f-1", "syntax error");
    assert_eq!(load.to_string(), "函数加载失败: f-1 - syntax error");

    let disposed = HostError::channel_disposed("worker-1");
    assert_eq!(disposed.to_string(), "Worker通道已释放: worker-1");

    let channel = HostError::worker_channel("node", "worker-1", "crashed");
    assert_eq!(channel.to_string(), "Worker通道错误: node/worker-1 - crashed");
}

#[test]
fn test_error_classification() {
    assert!(HostError::ProcessLaunch("x".into()).is_fatal());
    assert!(HostError::channel_disposed("w").is_fatal());
    assert!(!HostError::invocation("boom").is_fatal());

    assert!(HostError::timeout("worker init").is_retryable());
    assert!(HostError::specialization("reload failed").is_retryable());
    assert!(!HostError::function_load("f", "bad").is_retryable());
}

#[test]
fn test_status_code_mapping() {
    assert_eq!(HostError::function_not_found("Ping").status_code(), 404);
    assert_eq!(HostError::timeout("invoke").status_code(), 504);
    assert_eq!(
        HostError::ChannelNotFound {
            language: "node".into()
        }
        .status_code(),
        503
    );
    assert_eq!(HostError::invocation("boom").status_code(), 500);
}

#[test]
fn test_conversions() {
    let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
    assert!(matches!(HostError::from(json_err), HostError::Serialization(_)));

    let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
    assert_eq!(HostError::from(io_err), HostError::Io("missing".to_string()));

    let any_err = anyhow::anyhow!("wrapped");
    assert_eq!(HostError::from(any_err), HostError::Internal("wrapped".to_string()));
}
