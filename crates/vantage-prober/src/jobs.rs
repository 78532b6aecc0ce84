//! 异步探测作业跟踪
//!
//! `launch` 在后台拉起探测工具后立即返回子进程 pid 作为句柄，`reap` 按句柄
//! 收取结果。表项在 `reap` 开始时即被移除，同一句柄至多被收取一次。

use std::collections::HashMap;
use std::fs::File;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Child;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use vantage_common::{Error, JobHandle, ProbeKind, ProbeTargets, Result};

use crate::executor::{read_result, ProbePlan};
use crate::tools::{remove_files, ScopedFiles, ToolRunner};
use crate::workfile::WorkFileAllocator;

/// 被跟踪的后台作业
pub struct ProbeJob {
    /// 句柄（子进程 pid）
    pub handle: JobHandle,
    /// 探测种类
    pub kind: ProbeKind,
    /// 文件布局
    pub plan: ProbePlan,
    /// 子进程
    child: Child,
}

/// 异步作业跟踪器
pub struct AsyncJobTracker {
    allocator: Arc<WorkFileAllocator>,
    runner: Arc<ToolRunner>,
    /// 句柄到作业的映射
    jobs: Mutex<HashMap<JobHandle, ProbeJob>>,
}

impl AsyncJobTracker {
    /// 创建新的跟踪器
    pub fn new(allocator: Arc<WorkFileAllocator>, runner: Arc<ToolRunner>) -> Self {
        Self {
            allocator,
            runner,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// 在后台启动一次探测，立即返回句柄
    pub async fn launch(&self, kind: ProbeKind, targets: &ProbeTargets) -> Result<JobHandle> {
        let work_file = self.allocator.allocate_lines(targets.lines())?;
        let plan = ProbePlan::new(kind, work_file);
        // 启动成功前由守卫负责清理
        let guard = ScopedFiles::new(plan.all_files());

        let mut cmd = self
            .runner
            .probe_command(kind.tool(), &plan.work_file, &plan.extra_args);
        if kind.writes_stdout() {
            let output = File::create(&plan.output)?;
            cmd.stdout(Stdio::from(output));
        } else {
            cmd.stdout(Stdio::null());
        }
        cmd.stderr(Stdio::null());

        let child = self.runner.spawn(kind.tool(), cmd)?;
        let handle = child
            .id()
            .ok_or_else(|| Error::Subprocess(format!("{} 启动后立即退出", kind.tool())))?;
        let _ = guard.release();

        info!("启动异步 {} 作业 {}，目标数 {}", kind, handle, targets.len());
        self.track(ProbeJob {
            handle,
            kind,
            plan,
            child,
        })
        .await;
        Ok(handle)
    }

    /// 登记作业；同一 pid 仍有未收取的旧作业时丢弃旧作业
    async fn track(&self, job: ProbeJob) {
        let handle = job.handle;
        let stale = self.jobs.lock().await.insert(handle, job);
        if let Some(stale) = stale {
            warn!("pid {} 被复用，丢弃未收取的旧 {} 作业", handle, stale.kind);
            self.discard(stale).await;
        }
    }

    /// 终止作业并删除其文件
    async fn discard(&self, mut job: ProbeJob) {
        if let Ok(None) = job.child.try_wait() {
            self.runner.terminate(&mut job.child).await;
        }
        self.runner.fix_ownership(&job.plan.tool_files()).await;
        remove_files(&job.plan.all_files());
    }

    /// 收取作业结果，仍在运行的作业会被强制终止
    pub async fn reap(&self, handle: JobHandle) -> Result<String> {
        let job = self
            .jobs
            .lock()
            .await
            .remove(&handle)
            .ok_or(Error::UnknownHandle(handle))?;
        let ProbeJob {
            kind,
            plan,
            mut child,
            ..
        } = job;
        let cleanup = ScopedFiles::new(plan.all_files());

        match child.try_wait() {
            Ok(Some(status)) => debug!("作业 {} 已结束: {}", handle, status),
            Ok(None) => {
                warn!("作业 {} ({}) 仍在运行，强制终止", handle, kind);
                self.runner.terminate(&mut child).await;
            }
            Err(e) => warn!("无法查询作业 {} 状态: {}", handle, e),
        }

        self.runner.fix_ownership(&plan.tool_files()).await;
        let result = read_result(&plan.output).await;
        drop(cleanup);
        info!("收取异步作业 {}", handle);
        result
    }

    /// 当前被跟踪的作业数
    pub async fn len(&self) -> usize {
        self.jobs.lock().await.len()
    }

    /// 是否没有被跟踪的作业
    pub async fn is_empty(&self) -> bool {
        self.jobs.lock().await.is_empty()
    }

    /// 终止并丢弃全部作业，用于服务停止
    pub async fn abort_all(&self) {
        let jobs: Vec<ProbeJob> = self.jobs.lock().await.drain().map(|(_, job)| job).collect();
        for job in jobs {
            self.discard(job).await;
        }
    }
}
