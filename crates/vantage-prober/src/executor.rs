//! 同步探测执行器
//!
//! 写目标文件、调用一个外部工具并等待结束、读取结果，无论成功与否都删除
//! 临时文件。调用期间阻塞当前请求；需要及时返回的调用方应使用
//! [`crate::AsyncJobTracker`]。

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use vantage_common::{Error, ProbeKind, ProbeTargets, Result, TimestampProbe};

use crate::tools::{ScopedFiles, ToolRunner};
use crate::workfile::WorkFileAllocator;

/// 一次探测调用的文件与参数布局
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbePlan {
    /// 探测种类
    pub kind: ProbeKind,
    /// 目标文件
    pub work_file: PathBuf,
    /// 线程数、目标文件、网卡之后的附加参数
    pub extra_args: Vec<OsString>,
    /// 主结果文件（标准输出型工具在异步模式下重定向到这里）
    pub output: PathBuf,
    /// 工具写出的旁路文件
    pub side_files: Vec<PathBuf>,
}

fn suffixed(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

impl ProbePlan {
    /// 为目标文件生成对应种类的布局
    pub fn new(kind: ProbeKind, work_file: PathBuf) -> Self {
        match kind {
            ProbeKind::Traceroute => {
                let trace = suffixed(&work_file, ".trace.out");
                let count = suffixed(&work_file, ".count.out");
                Self {
                    kind,
                    extra_args: vec!["1".into(), trace.clone().into(), count.clone().into()],
                    output: trace,
                    side_files: vec![count],
                    work_file,
                }
            }
            ProbeKind::Rr => {
                let out = suffixed(&work_file, ".rrping.out");
                let ttl = suffixed(&work_file, ".rrping.out.ttl");
                Self {
                    kind,
                    extra_args: vec![out.clone().into()],
                    output: out,
                    side_files: vec![ttl],
                    work_file,
                }
            }
            ProbeKind::Ping | ProbeKind::Ts => Self {
                kind,
                extra_args: Vec::new(),
                output: suffixed(&work_file, ".out"),
                side_files: Vec::new(),
                work_file,
            },
        }
    }

    /// 作业涉及的全部文件，主结果在前，目标文件在最后
    pub fn all_files(&self) -> Vec<PathBuf> {
        let mut files = vec![self.output.clone()];
        files.extend(self.side_files.iter().cloned());
        files.push(self.work_file.clone());
        files
    }

    /// 工具写出的文件（不含目标文件）
    pub fn tool_files(&self) -> Vec<PathBuf> {
        let mut files = vec![self.output.clone()];
        files.extend(self.side_files.iter().cloned());
        files
    }
}

/// 读取工具输出，文件不存在时返回 `MissingResultFile`
pub(crate) async fn read_result(path: &Path) -> Result<String> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(Error::MissingResultFile(path.to_path_buf()))
        }
        Err(e) => Err(e.into()),
    }
}

/// 同步探测执行器
pub struct ProbeExecutor {
    /// 工作文件分配器
    allocator: Arc<WorkFileAllocator>,
    /// 工具调用器
    runner: Arc<ToolRunner>,
}

impl ProbeExecutor {
    /// 创建新的执行器
    pub fn new(allocator: Arc<WorkFileAllocator>, runner: Arc<ToolRunner>) -> Self {
        Self { allocator, runner }
    }

    /// 路由跟踪
    pub async fn traceroute(&self, targets: &[String]) -> Result<String> {
        info!("发送 {} 个 traceroute", targets.len());
        self.run(ProbeKind::Traceroute, &ProbeTargets::Hosts(targets.to_vec())).await
    }

    /// ping
    pub async fn ping(&self, targets: &[String]) -> Result<String> {
        info!("发送 {} 个 ping", targets.len());
        self.run(ProbeKind::Ping, &ProbeTargets::Hosts(targets.to_vec())).await
    }

    /// record route
    pub async fn rr(&self, targets: &[String]) -> Result<String> {
        info!("发送 {} 个 record route", targets.len());
        self.run(ProbeKind::Rr, &ProbeTargets::Hosts(targets.to_vec())).await
    }

    /// 时间戳探测
    pub async fn ts(&self, probes: &[TimestampProbe]) -> Result<String> {
        info!("发送 {} 个时间戳探测", probes.len());
        self.run(ProbeKind::Ts, &ProbeTargets::Timestamps(probes.to_vec())).await
    }

    /// 运行一次同步探测
    pub async fn run(&self, kind: ProbeKind, targets: &ProbeTargets) -> Result<String> {
        let work_file = self.allocator.allocate_lines(targets.lines())?;
        let plan = ProbePlan::new(kind, work_file);

        if kind.writes_stdout() {
            let _cleanup = ScopedFiles::new(vec![plan.work_file.clone()]);
            let cmd = self
                .runner
                .probe_command(kind.tool(), &plan.work_file, &plan.extra_args);
            let output = self.runner.run(kind.tool(), cmd).await?;
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }

        let cleanup = ScopedFiles::new(plan.all_files());
        let cmd = self
            .runner
            .probe_command(kind.tool(), &plan.work_file, &plan.extra_args);
        let status = self.runner.run(kind.tool(), cmd).await;
        // 先改回属主，失败路径上的文件才能被删除
        self.runner.fix_ownership(&plan.tool_files()).await;
        status?;

        let probes = read_result(&plan.output).await;
        drop(cleanup);
        probes
    }

    /// Paris traceroute：在工具目录的 `ptrun` 子目录中运行 `ptrun.py`
    pub async fn paris_traceroute(&self, target: &str) -> Result<String> {
        info!("向 {} 运行 Paris traceroute", target);
        let output_dir = self.allocator.output_dir();
        let base = output_dir.join(format!(
            "paristrace_output_{}_{}",
            self.allocator.port(),
            self.allocator.next_uid()
        ));
        let bin = suffixed(&base, ".bin");
        let txt = suffixed(&base, ".txt");
        let cleanup = ScopedFiles::new(vec![txt.clone(), bin.clone()]);

        let ptrun_dir = self.runner.tool_path("ptrun");
        let mut cmd = self.runner.command(ptrun_dir.join("ptrun.py"));
        cmd.current_dir(&ptrun_dir)
            .arg("-d")
            .arg(target)
            .arg("-o")
            .arg(&bin)
            .arg("-s")
            .arg(&txt);
        let status = self.runner.run("ptrun.py", cmd).await;
        self.runner.fix_ownership(cleanup.files()).await;
        status?;

        read_result(&txt).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::tools::ProberConfig;
    use rstest::rstest;
    use std::os::unix::fs::PermissionsExt;

    /// 在目录中写一个可执行的假工具脚本
    pub(crate) fn fake_tool(dir: &Path, name: &str, body: &str) {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    pub(crate) fn fixture(dir: &Path) -> (Arc<WorkFileAllocator>, Arc<ToolRunner>) {
        let config = ProberConfig {
            tool_dir: dir.join("tools"),
            output_dir: dir.join("out"),
            threads: 4,
            use_sudo: false,
        };
        std::fs::create_dir_all(&config.tool_dir).unwrap();
        std::fs::create_dir_all(&config.output_dir).unwrap();
        let allocator = Arc::new(WorkFileAllocator::new(&config.output_dir));
        allocator.set_port(54321);
        (allocator, Arc::new(ToolRunner::new(config, "eth0")))
    }

    fn output_files(dir: &Path) -> Vec<PathBuf> {
        std::fs::read_dir(dir.join("out"))
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .collect()
    }

    #[test]
    fn test_plan_layout() {
        let plan = ProbePlan::new(ProbeKind::Traceroute, PathBuf::from("/tmp/targs_1_0.txt"));
        assert_eq!(plan.output, PathBuf::from("/tmp/targs_1_0.txt.trace.out"));
        assert_eq!(
            plan.all_files(),
            vec![
                PathBuf::from("/tmp/targs_1_0.txt.trace.out"),
                PathBuf::from("/tmp/targs_1_0.txt.count.out"),
                PathBuf::from("/tmp/targs_1_0.txt"),
            ]
        );

        let plan = ProbePlan::new(ProbeKind::Ping, PathBuf::from("/tmp/t.txt"));
        assert_eq!(plan.all_files(), vec![PathBuf::from("/tmp/t.txt.out"), PathBuf::from("/tmp/t.txt")]);
    }

    #[rstest]
    #[case(ProbeKind::Traceroute, "/w.txt.trace.out", 3)]
    #[case(ProbeKind::Ping, "/w.txt.out", 0)]
    #[case(ProbeKind::Rr, "/w.txt.rrping.out", 1)]
    #[case(ProbeKind::Ts, "/w.txt.out", 0)]
    fn test_plan_output_per_kind(#[case] kind: ProbeKind, #[case] output: &str, #[case] extra: usize) {
        let plan = ProbePlan::new(kind, PathBuf::from("/w.txt"));
        assert_eq!(plan.output, PathBuf::from(output));
        assert_eq!(plan.extra_args.len(), extra);
        assert!(!plan.tool_files().contains(&plan.work_file));
    }

    #[tokio::test]
    async fn test_traceroute_reads_side_output_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let (allocator, runner) = fixture(dir.path());
        // 参数: threads work_file device 1 trace_out count_out
        fake_tool(
            &dir.path().join("tools"),
            "randstprober",
            r#"sed 's/^/hop /' "$2" > "$5"; echo 2 > "$6""#,
        );

        let executor = ProbeExecutor::new(allocator, runner);
        let result = executor
            .traceroute(&["10.0.0.1".to_string(), "10.0.0.2".to_string()])
            .await
            .unwrap();
        assert_eq!(result, "hop 10.0.0.1\nhop 10.0.0.2\n");
        assert!(output_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_ping_uses_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let (allocator, runner) = fixture(dir.path());
        fake_tool(&dir.path().join("tools"), "aliasprobe", r#"echo "$1 $3"; cat "$2""#);

        let executor = ProbeExecutor::new(allocator, runner);
        let result = executor.ping(&["1.2.3.4".to_string()]).await.unwrap();
        assert_eq!(result, "4 eth0\n1.2.3.4\n");
        assert!(output_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_ts_writes_probe_specs() {
        let dir = tempfile::tempdir().unwrap();
        let (allocator, runner) = fixture(dir.path());
        fake_tool(&dir.path().join("tools"), "tsprespec-ping", r#"cat "$2""#);

        let executor = ProbeExecutor::new(allocator, runner);
        let probes = vec![TimestampProbe::new("1.1.1.1", ["2.2.2.2", "1.1.1.1"])];
        assert_eq!(executor.ts(&probes).await.unwrap(), "1.1.1.1 2.2.2.2 1.1.1.1\n");
    }

    #[tokio::test]
    async fn test_missing_output_is_an_error_and_files_removed() {
        let dir = tempfile::tempdir().unwrap();
        let (allocator, runner) = fixture(dir.path());
        // 工具正常退出但不写结果文件
        fake_tool(&dir.path().join("tools"), "rrping", "exit 0");

        let executor = ProbeExecutor::new(allocator, runner);
        let err = executor.rr(&["1.2.3.4".to_string()]).await.unwrap_err();
        assert!(matches!(err, Error::MissingResultFile(_)));
        assert!(output_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_crashing_tool_still_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let (allocator, runner) = fixture(dir.path());
        fake_tool(&dir.path().join("tools"), "rrping", r#"echo partial > "$4"; exit 3"#);

        let executor = ProbeExecutor::new(allocator, runner);
        let err = executor.rr(&["1.2.3.4".to_string()]).await.unwrap_err();
        assert_eq!(err.kind(), "subprocess");
        assert!(output_files(dir.path()).is_empty());
    }
}
