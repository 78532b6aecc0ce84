//! 欺骗探测协调
//!
//! 发送端把按接收者分组的目标写成工作文件交给发送工具；接收端工具在后台
//! 运行，按会话 ID 区分并发会话。同一会话的并发调用由调用方串行化。

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tracing::{debug, info, warn};

use vantage_common::{
    validate_spoof_id, Error, ReceiverMap, Result, SpoofKind, SpoofResults, SpoofSession,
    TimestampProbe, TracerouteTarget, TtlRange,
};

use crate::executor::read_result;
use crate::tools::{ScopedFiles, ToolRunner};
use crate::workfile::WorkFileAllocator;

/// 欺骗 traceroute 发送工具
pub const SPOOF_TRACEROUTE_TOOL: &str = "pingspoof";

/// 匹配指定会话接收端的命令行模式
fn session_pattern(prefixes: &str, id: u32) -> String {
    format!("({})-recv [^ ]+ [^ ]+ {}$", prefixes, id)
}

/// 两类接收端的前缀组合
const ALL_RECEIVER_PREFIXES: &str = "tsprespec|rrspoof";

/// record route 工作文件行：`目标 接收者`
pub fn rr_lines(probes: &ReceiverMap<String>) -> Vec<String> {
    let mut lines = Vec::with_capacity(probes.target_count());
    for (receiver, targets) in probes.iter() {
        info!("为 {} 欺骗 {} 个 record route", receiver, targets.len());
        lines.extend(targets.iter().map(|dst| format!("{} {}", dst, receiver)));
    }
    lines
}

/// 时间戳工作文件行：`接收者 目标 槽位...`
pub fn ts_lines(probes: &ReceiverMap<TimestampProbe>) -> Vec<String> {
    let mut lines = Vec::with_capacity(probes.target_count());
    for (receiver, specs) in probes.iter() {
        info!("为 {} 欺骗 {} 个时间戳探测", receiver, specs.len());
        lines.extend(specs.iter().map(|spec| format!("{} {}", receiver, spec.line())));
    }
    lines
}

/// traceroute 工作文件行：每个 `(目标, TTL, 接收者)` 一行
///
/// 任一目标的 TTL 区间不合法时整体失败，不产生任何行。
pub fn tr_lines(probes: &ReceiverMap<TracerouteTarget>) -> Result<Vec<String>> {
    let mut plan: Vec<(&str, &str, TtlRange)> = Vec::with_capacity(probes.target_count());
    for (receiver, targets) in probes.iter() {
        for target in targets {
            plan.push((receiver, target.destination(), target.ttl_range()?));
        }
    }

    let mut lines = Vec::new();
    for (receiver, dst, range) in plan {
        lines.extend(range.ttls().map(|ttl| format!("{} {} {}", dst, ttl, receiver)));
    }
    Ok(lines)
}

/// 欺骗探测协调器
pub struct SpoofCoordinator {
    allocator: Arc<WorkFileAllocator>,
    runner: Arc<ToolRunner>,
}

impl SpoofCoordinator {
    /// 创建新的协调器
    pub fn new(allocator: Arc<WorkFileAllocator>, runner: Arc<ToolRunner>) -> Self {
        Self { allocator, runner }
    }

    /// 发送欺骗 record route
    pub async fn send_rr(&self, probes: &ReceiverMap<String>, id: u32) -> Result<()> {
        self.send(SpoofKind::Rr.send_tool(), rr_lines(probes), id.to_string())
            .await
    }

    /// 发送欺骗时间戳探测
    pub async fn send_ts(&self, probes: &ReceiverMap<TimestampProbe>, id: u32) -> Result<()> {
        self.send(SpoofKind::Ts.send_tool(), ts_lines(probes), id.to_string())
            .await
    }

    /// 发送欺骗 traceroute，会话 ID 与 TTL 区间在调用任何工具之前校验
    pub async fn send_tr(&self, probes: &ReceiverMap<TracerouteTarget>, id: i64) -> Result<()> {
        let id = validate_spoof_id(id)?;
        let lines = tr_lines(probes)?;
        info!(
            "向 {} 个接收者发送欺骗 traceroute，共 {} 个探测",
            probes.receivers().len(),
            lines.len()
        );
        self.send(SPOOF_TRACEROUTE_TOOL, lines, id.to_string()).await
    }

    async fn send(&self, tool: &str, lines: Vec<String>, id: String) -> Result<()> {
        let work_file = self.allocator.allocate_lines(lines)?;
        let _cleanup = ScopedFiles::new(vec![work_file.clone()]);
        let cmd = self.runner.probe_command(tool, &work_file, [id]);
        self.runner.run(tool, cmd).await?;
        Ok(())
    }

    /// 启动接收端，立即返回其输出路径
    ///
    /// 先终止同一会话的旧接收端，不影响其他会话。
    pub async fn start_receive(&self, session: SpoofSession) -> Result<PathBuf> {
        let SpoofSession { id, kind } = session;
        self.runner
            .kill_matching(&session_pattern(kind.receiver_prefix(), id))
            .await;

        let path = self.allocator.receiver_path(kind);
        info!("接收欺骗 {} 探测，会话 {}，输出 {:?}", kind, id, path);

        let tool = kind.receiver_tool();
        let mut cmd = self.runner.command(self.runner.tool_path(&tool));
        cmd.arg(self.runner.device())
            .arg(&path)
            .arg(id.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let mut child = self.runner.spawn(&tool, cmd)?;

        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => debug!("接收端 {} 退出: {}", tool, status),
                Err(e) => warn!("等待接收端 {} 失败: {}", tool, e),
            }
        });
        Ok(path)
    }

    /// 终止会话的接收端并取回结果
    pub async fn kill_and_retrieve(&self, path: &Path, id: u32) -> Result<SpoofResults> {
        self.runner
            .kill_matching(&session_pattern(ALL_RECEIVER_PREFIXES, id))
            .await;
        info!("取回 {:?}", path);

        let src = companion(path, ".src");
        let ttl = companion(path, ".ttl");
        let files = vec![path.to_path_buf(), src.clone(), ttl.clone()];
        self.runner.fix_ownership(&files).await;
        let _cleanup = ScopedFiles::new(files);

        let probes = read_result(path).await?;
        let sources = read_result(&src)
            .await?
            .lines()
            .map(str::to_string)
            .collect();
        let ttl = match read_result(&ttl).await {
            Ok(text) => Some(text),
            Err(Error::MissingResultFile(_)) => None,
            Err(e) => {
                warn!("无法读取 {:?}: {}", ttl, e);
                None
            }
        };

        Ok(SpoofResults {
            probes,
            sources,
            ttl,
        })
    }

    /// 终止所有接收端，清理僵尸进程
    pub async fn kill_all_receivers(&self) {
        self.runner
            .kill_matching(&format!("({})-recv ", ALL_RECEIVER_PREFIXES))
            .await;
    }
}

fn companion(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}
