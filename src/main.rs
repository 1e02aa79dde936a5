use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use funchost::app::Application;
use funchost::shutdown::ShutdownManager;
use funchost_config::{AppConfig, LogLevel, OutputFormat};
use funchost_dispatcher::HostRequest;
use funchost_domain::FunctionMetadataProvider;
use funchost_infrastructure::FileSystemMetadataProvider;
use serde_json::Value;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "funchost")]
#[command(about = "多语言函数宿主")]
#[command(version = "1.0.0")]
struct Cli {
    /// 配置文件路径
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// 日志级别，覆盖配置文件
    #[arg(short, long, global = true)]
    log_level: Option<LogLevel>,

    /// 日志格式，覆盖配置文件
    #[arg(long, global = true)]
    log_format: Option<OutputFormat>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// 运行宿主直到收到关闭信号
    Run,
    /// 列出脚本目录中的函数
    Functions {
        /// 脚本目录，默认使用配置
        #[arg(long)]
        script_root: Option<PathBuf>,
    },
    /// 输出合并后的配置
    Config,
    /// 启动宿主并处理一个请求
    Invoke {
        /// 请求路径，例如 /api/HttpTrigger
        path: String,
        #[arg(short = 'X', long, default_value = "GET")]
        method: String,
        /// 请求体，不是合法JSON时按字符串传递
        #[arg(short, long)]
        body: Option<String>,
    },
    /// 启动宿主并输出实例信息
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load(cli.config.as_deref()).with_context(|| {
        format!(
            "加载配置失败: {}",
            cli.config.as_deref().unwrap_or("<默认路径>")
        )
    })?;

    let log_level = cli.log_level.unwrap_or(config.logging.level);
    let log_format = cli.log_format.unwrap_or(config.logging.format);
    init_logging(log_level, log_format)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config, cli.config).await,
        Commands::Functions { script_root } => list_functions(&config, script_root).await,
        Commands::Config => {
            println!("{}", config.to_toml()?);
            Ok(())
        }
        Commands::Invoke { path, method, body } => {
            let mut request = HostRequest::new(&method, &path);
            if let Some(body) = body {
                let body = serde_json::from_str(&body).unwrap_or(Value::String(body));
                request = request.with_body(body);
            }
            let app = Application::new(config, cli.config);
            app.start().await?;
            let response = app.handle(request).await;
            app.shutdown().await;
            println!("{}", serde_json::to_string_pretty(&response)?);
            Ok(())
        }
        Commands::Info => {
            let app = Application::new(config, cli.config);
            app.start().await?;
            println!("{}", serde_json::to_string_pretty(&app.instance_info())?);
            app.shutdown().await;
            Ok(())
        }
    }
}

async fn run(config: AppConfig, config_path: Option<String>) -> Result<()> {
    info!(
        script_root = %config.host.script_root,
        runtime = %config.host.default_worker_runtime,
        "启动函数宿主"
    );

    let app = Arc::new(Application::new(config, config_path));
    let shutdown_manager = ShutdownManager::default();

    let mut app_handle = {
        let shutdown_rx = shutdown_manager.subscribe().await;
        let app = Arc::clone(&app);
        tokio::spawn(async move {
            if let Err(e) = app.run(shutdown_rx).await {
                error!("宿主运行失败: {e:#}");
            }
        })
    };

    tokio::select! {
        _ = wait_for_shutdown_signal() => {
            info!("收到关闭信号，开始优雅关闭...");
        }
        _ = &mut app_handle => {
            warn!("宿主提前退出");
            return Ok(());
        }
    }

    shutdown_manager.shutdown().await;
    if shutdown_manager.drain(app_handle).await {
        info!("函数宿主已优雅关闭");
    } else {
        app.shutdown().await;
    }
    Ok(())
}

async fn list_functions(config: &AppConfig, script_root: Option<PathBuf>) -> Result<()> {
    let script_root = script_root.unwrap_or_else(|| PathBuf::from(&config.host.script_root));
    let result = FileSystemMetadataProvider::new()
        .read_functions_metadata(
            &script_root,
            config.host.function_allowlist.as_deref(),
            &config.languages,
        )
        .await
        .with_context(|| format!("读取函数元数据失败: {}", script_root.display()))?;

    let mut functions = result.functions;
    functions.sort_by(|a, b| a.name.cmp(&b.name));
    for function in &functions {
        let trigger = function
            .trigger_binding()
            .map(|b| b.binding_type.as_str())
            .unwrap_or("-");
        println!(
            "{:<24} {:<10} {:<16} {}{}",
            function.name,
            function.language,
            trigger,
            function.script_file.display(),
            if function.is_disabled { " (disabled)" } else { "" }
        );
    }
    for (function, errors) in &result.errors {
        for message in errors {
            eprintln!("{function}: {message}");
        }
    }
    Ok(())
}

/// 初始化日志系统
fn init_logging(log_level: LogLevel, log_format: OutputFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));

    let registry = tracing_subscriber::registry().with(env_filter);

    match log_format {
        OutputFormat::Json => {
            registry
                .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
                .try_init()
                .context("初始化JSON日志格式失败")?;
        }
        OutputFormat::Pretty => {
            registry
                .with(tracing_subscriber::fmt::layer().pretty().with_writer(std::io::stderr))
                .try_init()
                .context("初始化Pretty日志格式失败")?;
        }
    }

    Ok(())
}

/// 等待关闭信号
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("安装Ctrl+C信号处理器失败: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("安装SIGTERM信号处理器失败: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("收到Ctrl+C信号");
        },
        _ = terminate => {
            info!("收到SIGTERM信号");
        },
    }
}
