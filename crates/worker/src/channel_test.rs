use std::sync::Arc;
use std::time::Duration;

use funchost_config::LanguageWorkerConfig;
use funchost_domain::{
    FunctionDescriptor, FunctionLoadResponse, InvocationResponse, MessageContent, MessageKind,
    OutputStream, ParameterBinding, ScriptEvent, ScriptInvocationContext, StatusResult,
    StreamingMessage, WorkerProcess,
};
use funchost_errors::HostError;
use funchost_infrastructure::{EventFilter, InMemoryEnvironment, ScriptEventManager};
use funchost_testing_utils::{
    test_app_config, FakeWorkerBehavior, FunctionDescriptorBuilder, MockWorkerProcess, TestEnv,
};
use serde_json::json;

use crate::channel::{ChannelSettings, LanguageWorkerChannel};
use crate::state::ChannelState;

const WORKER_ID: &str = "worker-1";

fn settings() -> ChannelSettings {
    ChannelSettings::from_config(&test_app_config("/app"))
}

fn channel_for(
    bus: &ScriptEventManager,
    process: Arc<MockWorkerProcess>,
) -> Arc<LanguageWorkerChannel> {
    LanguageWorkerChannel::new(
        WORKER_ID,
        LanguageWorkerConfig::node(),
        settings(),
        bus.clone(),
        process,
        Arc::new(InMemoryEnvironment::with_variables([("APP_SETTING", "42")])),
    )
}

fn faked(
    behavior: FakeWorkerBehavior,
) -> (ScriptEventManager, Arc<MockWorkerProcess>, Arc<LanguageWorkerChannel>) {
    let bus = ScriptEventManager::new();
    let process = Arc::new(MockWorkerProcess::with_fake_worker(
        WORKER_ID,
        bus.clone(),
        behavior,
    ));
    let channel = channel_for(&bus, Arc::clone(&process));
    (bus, process, channel)
}

fn invocation(
    function: &FunctionDescriptor,
    request: &str,
) -> (ScriptInvocationContext, funchost_domain::InvocationResultReceiver) {
    ScriptInvocationContext::new(
        Arc::new(function.clone()),
        vec![ParameterBinding::new("req", json!(request))],
    )
}

fn inject(bus: &ScriptEventManager, content: MessageContent) {
    bus.publish(ScriptEvent::inbound(WORKER_ID, StreamingMessage::new(content)));
}

fn load_success(function_id: &str) -> MessageContent {
    MessageContent::FunctionLoadResponse(FunctionLoadResponse {
        function_id: function_id.to_string(),
        result: StatusResult::success(),
        is_dependency_downloaded: false,
    })
}

#[tokio::test]
async fn test_start_initializes_and_merges_capabilities() {
    let (_bus, process, channel) = faked(FakeWorkerBehavior::default());
    assert_eq!(channel.state(), ChannelState::Default);

    channel.start_worker_process().await.unwrap();

    assert_eq!(channel.state(), ChannelState::Initialized);
    assert_eq!(channel.capability("RpcHttpBodyOnly").as_deref(), Some("true"));
    let fake = process.fake_worker().unwrap();
    let init = fake.received_of(MessageKind::WorkerInitRequest);
    assert_eq!(init.len(), 1);
    match &init[0].content {
        MessageContent::WorkerInitRequest(request) => {
            assert_eq!(request.host_version, settings().host_version)
        }
        other => panic!("unexpected message {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_init_timeout_faults_channel_and_reports_error() {
    let behavior = FakeWorkerBehavior {
        init_result: None,
        ..Default::default()
    };
    let (bus, _process, channel) = faked(behavior);
    let mut errors = bus.subscribe(EventFilter::WorkerError);

    let result = channel.start_worker_process().await;

    assert!(matches!(result, Err(HostError::Timeout(_))));
    assert_eq!(channel.state(), ChannelState::Faulted);
    match errors.try_recv() {
        Some(ScriptEvent::WorkerError(event)) => {
            assert_eq!(event.worker_id, WORKER_ID);
            assert_eq!(event.language, "node");
        }
        other => panic!("expected worker error, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_missing_start_stream_times_out() {
    let (_bus, _process, channel) = faked(FakeWorkerBehavior::silent());
    let result = channel.start_worker_process().await;
    assert!(matches!(result, Err(HostError::Timeout(_))));
    assert_eq!(channel.state(), ChannelState::Faulted);
}

#[tokio::test]
async fn test_init_failure_response_faults_channel() {
    let behavior = FakeWorkerBehavior {
        init_result: Some(StatusResult::failure("unsupported host version")),
        ..Default::default()
    };
    let (_bus, _process, channel) = faked(behavior);

    let result = channel.start_worker_process().await;

    match result {
        Err(HostError::WorkerChannel { message, .. }) => {
            assert!(message.contains("unsupported host version"))
        }
        other => panic!("unexpected result {other:?}"),
    }
    assert_eq!(channel.state(), ChannelState::Faulted);
}

#[tokio::test]
async fn test_duplicate_init_responses_initialize_once() {
    let behavior = FakeWorkerBehavior {
        duplicate_init_response: true,
        ..Default::default()
    };
    let (_bus, _process, channel) = faked(behavior);

    channel.start_worker_process().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(channel.state(), ChannelState::Initialized);
    assert!(matches!(
        channel.start_worker_process().await,
        Err(HostError::InvalidState(_))
    ));
}

#[tokio::test]
async fn test_launch_failure_is_not_retried_on_same_channel() {
    let bus = ScriptEventManager::new();
    let process = Arc::new(MockWorkerProcess::failing(WORKER_ID));
    let channel = channel_for(&bus, Arc::clone(&process));

    assert!(matches!(
        channel.start_worker_process().await,
        Err(HostError::ProcessLaunch(_))
    ));
    assert_eq!(channel.state(), ChannelState::Faulted);
    assert!(channel.start_worker_process().await.is_err());
    assert_eq!(process.start_count(), 1);
}

#[tokio::test]
async fn test_end_to_end_invocation() {
    let (_bus, process, channel) = faked(FakeWorkerBehavior::default());
    channel.start_worker_process().await.unwrap();

    let f1 = FunctionDescriptorBuilder::new("f1").build();
    channel.setup_invocation_buffers(vec![f1.clone()]);
    assert!(channel.has_invocation_buffer(&f1.function_id));
    channel.load_function(&f1.function_id).await.unwrap();

    let (context, receiver) = invocation(&f1, "GET /api/f1");
    channel.enqueue_invocation(context);
    let result = receiver.wait().await.unwrap();

    assert_eq!(result.outputs["res"], json!({"status": 200, "body": "GET /api/f1"}));
    let requests = process.fake_worker().unwrap().invocation_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].function_id, f1.function_id);
    assert_eq!(channel.executing_count(), 0);
}

#[tokio::test]
async fn test_invocations_reach_wire_in_submission_order() {
    let (_bus, process, channel) = faked(FakeWorkerBehavior::default().holding_invocations());
    channel.start_worker_process().await.unwrap();
    let f1 = FunctionDescriptorBuilder::new("f1").build();
    channel.setup_invocation_buffers(vec![f1.clone()]);

    let mut receivers = Vec::new();
    // 加载完成前提交的调用先缓冲
    for i in 0..5 {
        let (context, receiver) = invocation(&f1, &format!("request-{i}"));
        channel.enqueue_invocation(context);
        receivers.push(receiver);
    }
    channel.load_function(&f1.function_id).await.unwrap();
    for i in 5..10 {
        let (context, receiver) = invocation(&f1, &format!("request-{i}"));
        channel.enqueue_invocation(context);
        receivers.push(receiver);
    }

    let fake = process.fake_worker().unwrap();
    assert!(TestEnv::wait_for(|| fake.invocation_requests().len() == 10, Duration::from_secs(5)).await);
    let order: Vec<_> = fake
        .invocation_requests()
        .iter()
        .map(|request| request.input_data[0].data.clone())
        .collect();
    let expected: Vec<_> = (0..10).map(|i| json!(format!("request-{i}"))).collect();
    assert_eq!(order, expected);
    assert_eq!(channel.executing_count(), 10);
}

#[tokio::test]
async fn test_unknown_and_late_responses_are_dropped() {
    let bus = ScriptEventManager::new();
    let channel = channel_for(&bus, Arc::new(MockWorkerProcess::new(WORKER_ID)));
    let mut outbound = bus.subscribe(EventFilter::outbound(WORKER_ID));

    let f1 = FunctionDescriptorBuilder::new("f1").build();
    channel.setup_invocation_buffers(vec![f1.clone()]);
    inject(&bus, load_success(&f1.function_id));

    let (first, first_result) = invocation(&f1, "first");
    let (second, _second_result) = invocation(&f1, "second");
    channel.enqueue_invocation(first);
    channel.enqueue_invocation(second);
    assert!(TestEnv::wait_for(|| channel.executing_count() == 2, Duration::from_secs(5)).await);

    let mut wire_ids = Vec::new();
    while let Some(event) = outbound.try_recv() {
        if let ScriptEvent::Outbound(event) = event {
            if let MessageContent::InvocationRequest(request) = &event.message.content {
                wire_ids.push(request.invocation_id.clone());
            }
        }
    }
    assert_eq!(wire_ids.len(), 2);

    let response = |invocation_id: &str| {
        MessageContent::InvocationResponse(InvocationResponse {
            invocation_id: invocation_id.to_string(),
            output_data: vec![ParameterBinding::new("res", json!({"status": 202}))],
            return_value: None,
            result: StatusResult::success(),
        })
    };

    inject(&bus, response("not-a-known-invocation"));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(channel.executing_count(), 2);

    inject(&bus, response(&wire_ids[0]));
    let result = first_result.wait().await.unwrap();
    assert_eq!(result.outputs["res"], json!({"status": 202}));
    assert_eq!(channel.executing_count(), 1);

    // 重复响应被忽略
    inject(&bus, response(&wire_ids[0]));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(channel.executing_count(), 1);
}

#[tokio::test]
async fn test_failed_invocation_resolves_only_that_slot() {
    let behavior = FakeWorkerBehavior::default().with_invocation_handler(|request| {
        InvocationResponse {
            invocation_id: request.invocation_id.clone(),
            output_data: Vec::new(),
            return_value: None,
            result: StatusResult::failure("TypeError: boom"),
        }
    });
    let (_bus, _process, channel) = faked(behavior);
    channel.start_worker_process().await.unwrap();
    let f1 = FunctionDescriptorBuilder::new("f1").build();
    channel.setup_invocation_buffers(vec![f1.clone()]);
    channel.load_function(&f1.function_id).await.unwrap();

    let (context, receiver) = invocation(&f1, "GET /api/f1");
    channel.enqueue_invocation(context);

    match receiver.wait().await {
        Err(HostError::Invocation(message)) => assert!(message.contains("boom")),
        other => panic!("unexpected result {other:?}"),
    }
    assert_eq!(channel.state(), ChannelState::Initialized);
}

#[tokio::test]
async fn test_dispose_fails_all_pending_invocations() {
    let (_bus, process, channel) = faked(FakeWorkerBehavior::default().holding_invocations());
    channel.start_worker_process().await.unwrap();
    let f1 = FunctionDescriptorBuilder::new("f1").build();
    let f2 = FunctionDescriptorBuilder::new("f2").build();
    channel.setup_invocation_buffers(vec![f1.clone(), f2.clone()]);
    channel.load_function(&f1.function_id).await.unwrap();

    let mut receivers = Vec::new();
    for i in 0..5 {
        let (context, receiver) = invocation(&f1, &format!("request-{i}"));
        channel.enqueue_invocation(context);
        receivers.push(receiver);
    }
    // f2未加载，调用留在缓冲区
    for i in 0..2 {
        let (context, receiver) = invocation(&f2, &format!("buffered-{i}"));
        channel.enqueue_invocation(context);
        receivers.push(receiver);
    }
    assert!(TestEnv::wait_for(|| channel.executing_count() == 5, Duration::from_secs(5)).await);

    channel.dispose().await;
    channel.dispose().await;

    for receiver in receivers {
        assert!(matches!(
            receiver.wait().await,
            Err(HostError::ChannelDisposed { .. })
        ));
    }
    assert_eq!(channel.executing_count(), 0);
    assert_eq!(channel.state(), ChannelState::Disposed);
    assert!(process.is_disposed());
    assert!(!process.is_running());

    let (late, late_result) = invocation(&f1, "late");
    channel.enqueue_invocation(late);
    assert!(matches!(
        late_result.wait().await,
        Err(HostError::ChannelDisposed { .. })
    ));
}

#[tokio::test]
async fn test_load_error_is_cached_and_fails_fast() {
    let (_bus, process, channel) =
        faked(FakeWorkerBehavior::default().failing_load("f1", "SyntaxError: Unexpected token"));
    channel.start_worker_process().await.unwrap();
    let f1 = FunctionDescriptorBuilder::new("f1").build();
    let f2 = FunctionDescriptorBuilder::new("f2").build();
    channel.setup_invocation_buffers(vec![f1.clone(), f2.clone()]);

    assert!(matches!(
        channel.load_function(&f1.function_id).await,
        Err(HostError::FunctionLoad { .. })
    ));
    channel.load_function(&f2.function_id).await.unwrap();
    assert!(channel.function_load_error(&f1.function_id).is_some());

    let (context, receiver) = invocation(&f1, "GET /api/f1");
    channel.enqueue_invocation(context);
    match receiver.wait().await {
        Err(HostError::FunctionLoad { message, .. }) => assert!(message.contains("SyntaxError")),
        other => panic!("unexpected result {other:?}"),
    }

    let (context, receiver) = invocation(&f2, "GET /api/f2");
    channel.enqueue_invocation(context);
    assert!(receiver.wait().await.is_ok());

    let requests = process.fake_worker().unwrap().invocation_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].function_id, f2.function_id);
}

#[tokio::test]
async fn test_cancellation_removes_table_entry() {
    let (_bus, _process, channel) = faked(FakeWorkerBehavior::default().holding_invocations());
    channel.start_worker_process().await.unwrap();
    let f1 = FunctionDescriptorBuilder::new("f1").build();
    channel.setup_invocation_buffers(vec![f1.clone()]);
    channel.load_function(&f1.function_id).await.unwrap();

    let (context, receiver) = invocation(&f1, "slow");
    let token = context.cancellation.clone();
    let caller_id = receiver.invocation_id().to_string();
    channel.enqueue_invocation(context);
    assert!(TestEnv::wait_for(|| channel.executing_count() == 1, Duration::from_secs(5)).await);

    token.cancel();

    match receiver.wait().await {
        Err(HostError::InvocationCancelled { invocation_id }) => assert_eq!(invocation_id, caller_id),
        other => panic!("unexpected result {other:?}"),
    }
    assert_eq!(channel.executing_count(), 0);
}

#[tokio::test]
async fn test_cancelled_buffered_invocations_are_resolved_and_released() {
    let (_bus, process, channel) = faked(FakeWorkerBehavior::default());
    channel.start_worker_process().await.unwrap();
    let f2 = FunctionDescriptorBuilder::new("f2").build();
    // 没有加载请求，调用只能留在缓冲区
    channel.setup_invocation_buffers(vec![f2.clone()]);

    let mut pending = Vec::new();
    for i in 0..100 {
        let (context, receiver) = invocation(&f2, &format!("request-{i}"));
        let token = context.cancellation.clone();
        channel.enqueue_invocation(context);
        pending.push((token, receiver));
    }
    assert_eq!(channel.buffered_count(), 100);

    let (kept, kept_result) = invocation(&f2, "kept");
    channel.enqueue_invocation(kept);

    for (token, receiver) in pending {
        let caller_id = receiver.invocation_id().to_string();
        token.cancel();
        match tokio::time::timeout(Duration::from_secs(2), receiver.wait()).await {
            Ok(Err(HostError::InvocationCancelled { invocation_id })) => {
                assert_eq!(invocation_id, caller_id)
            }
            other => panic!("unexpected result {other:?}"),
        }
    }
    assert_eq!(channel.buffered_count(), 1);

    // 加载完成后分发任务跳过已取消的调用，只发送剩下的一个
    channel.load_function(&f2.function_id).await.unwrap();
    assert!(kept_result.wait().await.is_ok());
    assert_eq!(channel.buffered_count(), 0);
    assert_eq!(channel.executing_count(), 0);

    let requests = process.fake_worker().unwrap().invocation_requests();
    assert_eq!(requests.len(), 1);
}

#[tokio::test]
async fn test_unknown_function_and_unmatched_load_response() {
    let bus = ScriptEventManager::new();
    let channel = channel_for(&bus, Arc::new(MockWorkerProcess::new(WORKER_ID)));
    let f1 = FunctionDescriptorBuilder::new("f1").build();
    let stranger = FunctionDescriptorBuilder::new("stranger").build();
    channel.setup_invocation_buffers(vec![f1.clone()]);

    inject(&bus, load_success(&stranger.function_id));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!channel.has_invocation_buffer(&stranger.function_id));

    let (context, receiver) = invocation(&stranger, "GET /api/stranger");
    channel.enqueue_invocation(context);
    assert!(matches!(
        receiver.wait().await,
        Err(HostError::FunctionNotFound { .. })
    ));
    assert!(matches!(
        channel.load_function(&stranger.function_id).await,
        Err(HostError::FunctionNotFound { .. })
    ));
}

#[tokio::test]
async fn test_setup_replaces_function_set() {
    let bus = ScriptEventManager::new();
    let channel = channel_for(&bus, Arc::new(MockWorkerProcess::new(WORKER_ID)));
    let old = FunctionDescriptorBuilder::new("old").build();
    let new = FunctionDescriptorBuilder::new("new").build();

    channel.setup_invocation_buffers(vec![old.clone()]);
    let (context, receiver) = invocation(&old, "queued");
    channel.enqueue_invocation(context);

    channel.setup_invocation_buffers(vec![new.clone()]);

    assert!(!channel.has_invocation_buffer(&old.function_id));
    assert!(channel.has_invocation_buffer(&new.function_id));
    assert_eq!(channel.functions().len(), 1);
    assert!(matches!(
        receiver.wait().await,
        Err(HostError::FunctionNotFound { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_load_timeout() {
    let behavior = FakeWorkerBehavior {
        respond_to_loads: false,
        ..Default::default()
    };
    let (_bus, _process, channel) = faked(behavior);
    channel.start_worker_process().await.unwrap();
    let f1 = FunctionDescriptorBuilder::new("f1").build();
    channel.setup_invocation_buffers(vec![f1.clone()]);

    assert!(matches!(
        channel.load_function(&f1.function_id).await,
        Err(HostError::Timeout(_))
    ));
}

#[tokio::test]
async fn test_send_function_load_requests_for_all_functions() {
    let (_bus, process, channel) = faked(FakeWorkerBehavior::default());
    channel.start_worker_process().await.unwrap();
    let functions: Vec<_> = ["a", "b", "c"]
        .iter()
        .map(|name| FunctionDescriptorBuilder::new(name).build())
        .collect();
    channel.setup_invocation_buffers(functions.clone());

    channel.send_function_load_requests();

    let fake = process.fake_worker().unwrap();
    assert!(
        TestEnv::wait_for(
            || fake.received_of(MessageKind::FunctionLoadRequest).len() == 3,
            Duration::from_secs(5)
        )
        .await
    );
    let (context, receiver) = invocation(&functions[2], "GET /api/c");
    channel.enqueue_invocation(context);
    assert!(receiver.wait().await.is_ok());
}

#[tokio::test]
async fn test_environment_reload_sends_snapshot() {
    let (_bus, process, channel) = faked(FakeWorkerBehavior::default());
    channel.start_worker_process().await.unwrap();

    assert!(channel.send_function_environment_reload_request().await);

    let reloads = process
        .fake_worker()
        .unwrap()
        .received_of(MessageKind::FunctionEnvironmentReloadRequest);
    assert_eq!(reloads.len(), 1);
    match &reloads[0].content {
        MessageContent::FunctionEnvironmentReloadRequest(request) => {
            assert_eq!(request.environment_variables["APP_SETTING"], "42")
        }
        other => panic!("unexpected message {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_environment_reload_failure_does_not_fault() {
    let behavior = FakeWorkerBehavior {
        reload_result: None,
        ..Default::default()
    };
    let (_bus, _process, channel) = faked(behavior);
    channel.start_worker_process().await.unwrap();

    assert!(!channel.send_function_environment_reload_request().await);
    assert_eq!(channel.state(), ChannelState::Initialized);
}

#[tokio::test]
async fn test_process_exit_reports_recent_stderr() {
    let (bus, process, channel) = faked(FakeWorkerBehavior::default());
    let mut errors = bus.subscribe(EventFilter::WorkerError);
    channel.start_worker_process().await.unwrap();

    for i in 0..5 {
        process.emit(OutputStream::Stderr, &format!("stderr-{i}"));
    }
    process.emit(OutputStream::Stdout, "ready");
    assert!(TestEnv::wait_for(|| channel.recent_stderr().len() == 3, Duration::from_secs(5)).await);
    assert_eq!(channel.recent_stderr(), vec!["stderr-2", "stderr-3", "stderr-4"]);

    process.exit();

    let event = tokio::time::timeout(Duration::from_secs(5), errors.recv())
        .await
        .unwrap()
        .unwrap();
    match event {
        ScriptEvent::WorkerError(event) => {
            let message = event.error.to_string();
            assert!(message.contains("exited unexpectedly"));
            assert!(message.contains("stderr-4"));
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_disposed_channel_does_not_report_exit() {
    let (bus, process, channel) = faked(FakeWorkerBehavior::default());
    let mut errors = bus.subscribe(EventFilter::WorkerError);
    channel.start_worker_process().await.unwrap();

    channel.dispose().await;
    process.exit();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(errors.try_recv().is_none());
    assert!(!process.is_running());
}
