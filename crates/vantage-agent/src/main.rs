//! vantage-agent 入口
//!
//! 负责单实例锁、日志初始化、探测工具自举、信号处理与重启。

use anyhow::{Context, Result};
use clap::Parser;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::io::AsRawFd;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use vantage_agent::config::{create_default_config, AgentConfig, CliArgs, ConfigManager};
use vantage_agent::fetch::HyperFetcher;
use vantage_agent::metrics::MetricsCollector;
use vantage_agent::update::{SelfUpdateManager, CONFIG_ARTIFACT};
use vantage_agent::{Agent, LifecycleEvent, SHUTDOWN_GRACE};
use vantage_common::Component;

/// 已有实例在运行
const EXIT_ALREADY_RUNNING: i32 = 17;

/// 探测工具缺失且无法安装
const EXIT_PROBER_UNAVAILABLE: i32 = 6;

/// SIGINT 对应的退出码
const EXIT_INTERRUPTED: i32 = 2;

/// SIGTERM 对应的退出码
const EXIT_TERMINATED: i32 = 15;

fn main() {
    let cli = CliArgs::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            error!("代理异常退出: {:#}", e);
            eprintln!("vantage-agent: {:#}", e);
            1
        }
    };
    std::process::exit(code);
}

fn run(mut cli: CliArgs) -> Result<i32> {
    if cli.config.is_none() {
        cli.config = installed_config();
    }
    let config = ConfigManager::new(cli.config.as_deref())?.into_config(&cli);
    init_tracing(&config.log_level);

    let Some(_lock) = acquire_lock(&config.pid_file)? else {
        error!("已有实例持有 {:?}，退出", config.pid_file);
        return Ok(EXIT_ALREADY_RUNNING);
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("无法创建 tokio 运行时")?;
    runtime.block_on(serve(config))
}

/// 自更新安装的配置文件，存在时作为默认配置
fn installed_config() -> Option<PathBuf> {
    let path = create_default_config().update.install_dir.join(CONFIG_ARTIFACT);
    path.exists().then_some(path)
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// 对锁文件加排他锁并写入 pid；已被占用时返回 `None`
fn acquire_lock(path: &Path) -> Result<Option<File>> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)
        .with_context(|| format!("无法打开锁文件 {:?}", path))?;

    // SAFETY: 文件描述符在 `file` 的生命周期内有效
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
            return Ok(None);
        }
        return Err(err).with_context(|| format!("无法锁定 {:?}", path));
    }

    file.set_len(0)?;
    writeln!(file, "{}", std::process::id())?;
    Ok(Some(file))
}

/// 工具目录缺失时安装探测工具包
async fn bootstrap(config: &AgentConfig, updater: &SelfUpdateManager) -> bool {
    if config.probing.tool_dir.exists() {
        return true;
    }
    warn!("工具目录 {:?} 不存在，尝试安装探测工具", config.probing.tool_dir);
    match updater.install(Component::Prober).await {
        Ok(version) => {
            info!("探测工具 {} 安装完成", version);
            true
        }
        Err(e) => {
            error!("无法安装探测工具: {}", e);
            false
        }
    }
}

async fn serve(config: AgentConfig) -> Result<i32> {
    let metrics = Arc::new(MetricsCollector::new().context("无法创建指标收集器")?);
    let updater = SelfUpdateManager::new(
        Arc::new(HyperFetcher::new(config.controller.timeout())),
        config.update.clone(),
        config.probing.tool_dir.clone(),
        metrics,
    );
    if !bootstrap(&config, &updater).await {
        return Ok(EXIT_PROBER_UNAVAILABLE);
    }

    let mut sigint = signal(SignalKind::interrupt()).context("无法监听 SIGINT")?;
    let mut sigterm = signal(SignalKind::terminate()).context("无法监听 SIGTERM")?;

    loop {
        let (events, mut lifecycle) = mpsc::unbounded_channel();
        let agent = Agent::new(config.clone(), events).await?;
        agent.start().await?;

        let event = tokio::select! {
            _ = sigint.recv() => {
                info!("收到 SIGINT");
                tokio::time::sleep(SHUTDOWN_GRACE).await;
                LifecycleEvent::Shutdown(EXIT_INTERRUPTED)
            }
            _ = sigterm.recv() => {
                info!("收到 SIGTERM");
                tokio::time::sleep(SHUTDOWN_GRACE).await;
                LifecycleEvent::Shutdown(EXIT_TERMINATED)
            }
            Some(event) = lifecycle.recv() => event,
        };

        agent.stop_service().await;
        match event {
            LifecycleEvent::Shutdown(code) => {
                info!("代理退出，退出码 {}", code);
                return Ok(code);
            }
            LifecycleEvent::Restart => {
                let binary = updater.install_path(Component::Agent);
                let err = reexec(&binary);
                warn!("无法重新执行 {:?}: {}，在进程内重建代理", binary, err);
            }
        }
    }
}

/// 以相同参数重新执行代理；优先使用自更新安装的二进制，成功时不返回
fn reexec(installed: &Path) -> io::Error {
    let binary = if installed.is_file() {
        installed.to_path_buf()
    } else {
        match std::env::current_exe() {
            Ok(path) => path,
            Err(e) => return e,
        }
    };
    info!("重新执行 {:?}", binary);
    std::process::Command::new(binary)
        .args(std::env::args_os().skip(1))
        .exec()
}
