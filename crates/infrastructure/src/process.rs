use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use funchost_domain::{
    OutputStream, ProcessOutputLine, WorkerProcess, WorkerProcessFactory, WorkerProcessSpec,
};
use funchost_errors::{HostError, HostResult};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 基于 `tokio::process` 的语言Worker进程
///
/// stdout/stderr按行转发到输出通道；进程退出后所有发送端被释放，
/// 输出通道随之关闭，持有接收端的一方由此得知进程已退出。
pub struct LanguageWorkerProcess {
    spec: WorkerProcessSpec,
    output_tx: Mutex<Option<mpsc::UnboundedSender<ProcessOutputLine>>>,
    output_rx: Mutex<Option<mpsc::UnboundedReceiver<ProcessOutputLine>>>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    running: Arc<AtomicBool>,
    disposed: AtomicBool,
}

impl LanguageWorkerProcess {
    pub fn new(spec: WorkerProcessSpec) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            spec,
            output_tx: Mutex::new(Some(tx)),
            output_rx: Mutex::new(Some(rx)),
            kill_tx: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
            disposed: AtomicBool::new(false),
        }
    }

    /// 构造命令行: `<executable> [arguments] [worker_path] --workerId <id> --requestId <id>`
    pub fn build_arguments(&self) -> Vec<String> {
        let mut args = self.spec.config.arguments.clone();
        if let Some(worker_path) = &self.spec.config.worker_path {
            args.push(worker_path.clone());
        }
        args.push("--workerId".to_string());
        args.push(self.spec.worker_id.clone());
        args.push("--requestId".to_string());
        args.push(Uuid::new_v4().to_string());
        args
    }

    fn spawn_reader<R>(reader: R, stream: OutputStream, tx: mpsc::UnboundedSender<ProcessOutputLine>)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if tx.send(ProcessOutputLine { stream, line }).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("读取Worker进程输出失败: {:?} {}", stream, e);
                        break;
                    }
                }
            }
        });
    }
}

#[async_trait]
impl WorkerProcess for LanguageWorkerProcess {
    async fn start(&self) -> HostResult<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(HostError::channel_disposed(&self.spec.worker_id));
        }
        let output_tx = self
            .output_tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or_else(|| HostError::InvalidState("worker process already started".to_string()))?;

        let args = self.build_arguments();
        info!(
            worker_id = %self.spec.worker_id,
            language = %self.spec.config.language,
            "启动Worker进程: {} {:?}",
            self.spec.config.executable,
            args
        );

        let mut cmd = Command::new(&self.spec.config.executable);
        cmd.args(&args)
            .current_dir(&self.spec.script_root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &self.spec.environment {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| {
            HostError::ProcessLaunch(format!(
                "failed to start '{}' for worker {}: {e}",
                self.spec.config.executable, self.spec.worker_id
            ))
        })?;

        if let Some(stdout) = child.stdout.take() {
            Self::spawn_reader(stdout, OutputStream::Stdout, output_tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            Self::spawn_reader(stderr, OutputStream::Stderr, output_tx.clone());
        }

        let (kill_tx, kill_rx) = oneshot::channel();
        *self
            .kill_tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(kill_tx);
        self.running.store(true, Ordering::Release);

        let running = Arc::clone(&self.running);
        let worker_id = self.spec.worker_id.clone();
        tokio::spawn(async move {
            // 进程退出前一直持有output_tx，退出后输出通道关闭
            let _output_tx = output_tx;
            tokio::select! {
                status = child.wait() => {
                    match status {
                        Ok(status) => info!(worker_id = %worker_id, "Worker进程已退出: {}", status),
                        Err(e) => warn!(worker_id = %worker_id, "等待Worker进程结束失败: {}", e),
                    }
                }
                _ = kill_rx => {
                    if let Err(e) = child.kill().await {
                        warn!(worker_id = %worker_id, "终止Worker进程失败: {}", e);
                    } else {
                        debug!(worker_id = %worker_id, "Worker进程已终止");
                    }
                }
            }
            running.store(false, Ordering::Release);
        });

        Ok(())
    }

    fn take_output(&self) -> Option<mpsc::UnboundedReceiver<ProcessOutputLine>> {
        self.output_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let kill_tx = self
            .kill_tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(kill_tx) = kill_tx {
            let _ = kill_tx.send(());
        }
        debug!(worker_id = %self.spec.worker_id, "Worker进程已释放");
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// 为每个通道创建真实进程的工厂
#[derive(Debug, Default, Clone)]
pub struct LanguageWorkerProcessFactory;

impl WorkerProcessFactory for LanguageWorkerProcessFactory {
    fn create(&self, spec: WorkerProcessSpec) -> Arc<dyn WorkerProcess> {
        Arc::new(LanguageWorkerProcess::new(spec))
    }
}
