use std::sync::Arc;
use std::time::Duration;

use funchost_domain::{FileChangeKind, ScriptEvent, StatusResult, WorkerProcess};
use funchost_errors::HostError;
use funchost_infrastructure::{EventFilter, InMemoryEnvironment, ScriptEventManager};
use funchost_testing_utils::{
    test_app_config, FakeWorkerBehavior, MockWorkerProcessFactory, TestEnv,
};

use crate::manager::LanguageWorkerChannelManager;
use crate::state::ChannelState;

fn manager_with(
    factory: Arc<MockWorkerProcessFactory>,
    bus: &ScriptEventManager,
) -> Arc<LanguageWorkerChannelManager> {
    LanguageWorkerChannelManager::new(
        test_app_config("/home/site/wwwroot"),
        bus.clone(),
        factory,
        Arc::new(InMemoryEnvironment::with_variables([("WEBSITE_SITE_NAME", "demo")])),
    )
}

#[tokio::test]
async fn test_initialize_channel_registers_initialized_channel() {
    let bus = ScriptEventManager::new();
    let factory = Arc::new(MockWorkerProcessFactory::new(bus.clone(), FakeWorkerBehavior::default()));
    let manager = manager_with(Arc::clone(&factory), &bus);

    let channel = manager.initialize_channel("node").await.unwrap();

    assert_eq!(channel.state(), ChannelState::Initialized);
    assert_eq!(manager.channel_count(), 1);
    assert!(manager.get_channel(channel.worker_id()).is_some());
    assert_eq!(manager.get_channels("NODE").len(), 1);

    let placeholder = manager.get_placeholder_channel("node").unwrap();
    assert_eq!(placeholder.worker_id(), channel.worker_id());

    let specs = factory.specs();
    assert_eq!(specs.len(), 1);
    assert_eq!(specs[0].worker_id, channel.worker_id());
    assert_eq!(specs[0].script_root.to_string_lossy(), "/home/site/wwwroot");
    assert!(specs[0]
        .environment
        .iter()
        .any(|(key, value)| key == "WEBSITE_SITE_NAME" && value == "demo"));
}

#[tokio::test]
async fn test_unknown_language_is_rejected() {
    let bus = ScriptEventManager::new();
    let factory = Arc::new(MockWorkerProcessFactory::new(bus.clone(), FakeWorkerBehavior::default()));
    let manager = manager_with(Arc::clone(&factory), &bus);

    assert!(matches!(
        manager.initialize_channel("cobol").await,
        Err(HostError::ChannelNotFound { .. })
    ));
    assert!(factory.processes().is_empty());
    assert!(manager.get_placeholder_channel("cobol").is_none());
}

#[tokio::test]
async fn test_failed_initialization_removes_channel() {
    let bus = ScriptEventManager::new();
    let factory = Arc::new(MockWorkerProcessFactory::failing());
    let manager = manager_with(Arc::clone(&factory), &bus);

    assert!(matches!(
        manager.initialize_channel("node").await,
        Err(HostError::ProcessLaunch(_))
    ));
    assert_eq!(manager.channel_count(), 0);
    assert!(factory.processes()[0].is_disposed());
}

#[tokio::test]
async fn test_init_failure_leaves_no_placeholder() {
    let bus = ScriptEventManager::new();
    let behavior = FakeWorkerBehavior {
        init_result: Some(StatusResult::failure("bad runtime")),
        ..Default::default()
    };
    let factory = Arc::new(MockWorkerProcessFactory::new(bus.clone(), behavior));
    let manager = manager_with(Arc::clone(&factory), &bus);

    assert!(manager.initialize_channel("node").await.is_err());
    assert!(TestEnv::wait_for(|| manager.channel_count() == 0, Duration::from_secs(5)).await);
    assert!(manager.get_placeholder_channel("node").is_none());
}

#[tokio::test]
async fn test_worker_error_disposes_and_removes_channel() {
    let bus = ScriptEventManager::new();
    let factory = Arc::new(MockWorkerProcessFactory::new(bus.clone(), FakeWorkerBehavior::default()));
    let manager = manager_with(Arc::clone(&factory), &bus);

    let first = manager.initialize_channel("node").await.unwrap();
    let second = manager.initialize_channel("node").await.unwrap();
    assert_eq!(manager.channel_count(), 2);

    bus.publish(ScriptEvent::worker_error(
        "node",
        first.worker_id(),
        HostError::worker_channel("node", first.worker_id(), "crashed"),
    ));

    assert!(TestEnv::wait_for(|| manager.channel_count() == 1, Duration::from_secs(5)).await);
    assert_eq!(first.state(), ChannelState::Disposed);
    assert!(factory.process(first.worker_id()).unwrap().is_disposed());
    assert_eq!(
        manager.get_placeholder_channel("node").unwrap().worker_id(),
        second.worker_id()
    );
}

#[tokio::test]
async fn test_process_exit_removes_channel_without_restart() {
    let bus = ScriptEventManager::new();
    let factory = Arc::new(MockWorkerProcessFactory::new(bus.clone(), FakeWorkerBehavior::default()));
    let manager = manager_with(Arc::clone(&factory), &bus);

    let channel = manager.initialize_channel("node").await.unwrap();
    let process = factory.process(channel.worker_id()).unwrap();
    process.exit();

    assert!(TestEnv::wait_for(|| manager.channel_count() == 0, Duration::from_secs(5)).await);
    assert_eq!(factory.processes().len(), 1);
    assert!(!process.is_running());
}

#[tokio::test]
async fn test_shutdown_channel_and_shutdown_all() {
    let bus = ScriptEventManager::new();
    let factory = Arc::new(MockWorkerProcessFactory::new(bus.clone(), FakeWorkerBehavior::default()));
    let manager = manager_with(Arc::clone(&factory), &bus);

    let first = manager.initialize_channel("node").await.unwrap();
    manager.initialize_channel("node").await.unwrap();
    manager.initialize_channel("node").await.unwrap();

    assert!(manager.shutdown_channel(first.worker_id()).await);
    assert!(!manager.shutdown_channel(first.worker_id()).await);
    assert_eq!(manager.channel_count(), 2);

    manager.shutdown_all().await;

    assert_eq!(manager.channel_count(), 0);
    assert!(factory.processes().iter().all(|process| process.is_disposed()));
}

#[tokio::test]
async fn test_channels_of_one_language_share_a_debouncer() {
    let bus = ScriptEventManager::new();
    let factory = Arc::new(MockWorkerProcessFactory::new(bus.clone(), FakeWorkerBehavior::default()));
    let manager = manager_with(Arc::clone(&factory), &bus);

    let first = manager.initialize_channel("node").await.unwrap();
    let second = manager.initialize_channel("node").await.unwrap();
    assert_eq!(manager.debouncer_count(), 1);

    let mut restarts = bus.subscribe(EventFilter::HostRestart);
    for i in 0..3 {
        bus.publish(ScriptEvent::file_changed(
            format!("/home/site/wwwroot/HttpTrigger/file{i}.js"),
            FileChangeKind::Changed,
        ));
    }
    let events = TestEnv::drain(&mut restarts, Duration::from_secs(1)).await;
    assert_eq!(events.len(), 1);

    manager.shutdown_channel(first.worker_id()).await;
    assert_eq!(manager.debouncer_count(), 1);
    manager.shutdown_channel(second.worker_id()).await;
    assert_eq!(manager.debouncer_count(), 0);

    bus.publish(ScriptEvent::file_changed(
        "/home/site/wwwroot/HttpTrigger/index.js",
        FileChangeKind::Changed,
    ));
    assert!(TestEnv::drain(&mut restarts, Duration::from_secs(1)).await.is_empty());
}
