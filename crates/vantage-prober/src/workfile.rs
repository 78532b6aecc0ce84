//! 工作文件分配
//!
//! 每次探测都要写一个目标文件交给外部工具。文件名中嵌入监听端口与进程内单调
//! 递增的计数器，保证并发作业之间不会冲突。计数器只在这里、在一把互斥锁下
//! 读取并自增，进程存活期间从不重置。

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Mutex;
use tracing::{debug, warn};

use vantage_common::{Result, SpoofKind};

/// 工作文件分配器
pub struct WorkFileAllocator {
    /// 临时输出目录
    output_dir: PathBuf,
    /// RPC 监听端口，监听器启动后写入
    port: AtomicU16,
    /// 全局计数器
    counter: Mutex<u64>,
}

impl WorkFileAllocator {
    /// 创建新的分配器
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            port: AtomicU16::new(0),
            counter: Mutex::new(0),
        }
    }

    /// 记录实际监听端口
    pub fn set_port(&self, port: u16) {
        self.port.store(port, Ordering::Relaxed);
    }

    /// 当前端口
    pub fn port(&self) -> u16 {
        self.port.load(Ordering::Relaxed)
    }

    /// 临时输出目录
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// 读取并自增计数器
    pub fn next_uid(&self) -> u64 {
        let mut counter = self.counter.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let uid = *counter;
        *counter += 1;
        uid
    }

    /// 分配一个目标文件，交给 `filler` 填充后返回路径
    ///
    /// 填充失败时删除半成品文件并把错误返回给本次调用。
    pub fn allocate<F>(&self, filler: F) -> Result<PathBuf>
    where
        F: FnOnce(&mut File) -> io::Result<()>,
    {
        let uid = self.next_uid();
        let path = self
            .output_dir
            .join(format!("targs_{}_{}.txt", self.port(), uid));

        let written = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .and_then(|mut file| {
                filler(&mut file)?;
                file.flush()
            });

        if let Err(e) = written {
            if let Err(remove_err) = std::fs::remove_file(&path) {
                if remove_err.kind() != io::ErrorKind::NotFound {
                    warn!("无法删除未写完的工作文件 {:?}: {}", path, remove_err);
                }
            }
            return Err(e.into());
        }

        debug!("分配工作文件 {:?}", path);
        Ok(path)
    }

    /// 分配一个每行一条记录的目标文件
    pub fn allocate_lines<I, S>(&self, lines: I) -> Result<PathBuf>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.allocate(|file| {
            for line in lines {
                writeln!(file, "{}", line.as_ref())?;
            }
            Ok(())
        })
    }

    /// 为欺骗探测接收端分配输出路径（不创建文件）
    pub fn receiver_path(&self, kind: SpoofKind) -> PathBuf {
        let uid = self.next_uid();
        self.output_dir.join(format!(
            "spoof_{}_{}_{}ping.out",
            self.port(),
            uid,
            kind.receiver_prefix()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_allocate_writes_lines() {
        let dir = tempfile::tempdir().unwrap();
        let allocator = WorkFileAllocator::new(dir.path());
        allocator.set_port(54321);

        let path = allocator.allocate_lines(["10.0.0.1", "10.0.0.2"]).unwrap();
        assert_eq!(path, dir.path().join("targs_54321_0.txt"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "10.0.0.1\n10.0.0.2\n");

        let next = allocator.allocate_lines(["10.0.0.3"]).unwrap();
        assert_eq!(next, dir.path().join("targs_54321_1.txt"));
    }

    #[test]
    fn test_concurrent_allocations_are_unique() {
        let dir = tempfile::tempdir().unwrap();
        let allocator = Arc::new(WorkFileAllocator::new(dir.path()));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let allocator = allocator.clone();
                std::thread::spawn(move || {
                    (0..25)
                        .map(|_| allocator.allocate_lines(["1.2.3.4"]).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for path in handle.join().unwrap() {
                assert!(seen.insert(path), "路径重复");
            }
        }
        assert_eq!(seen.len(), 16 * 25);
    }

    #[test]
    fn test_failed_filler_propagates_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let allocator = WorkFileAllocator::new(dir.path());

        let result = allocator.allocate(|_| Err(io::Error::new(io::ErrorKind::Other, "磁盘已满")));
        assert!(result.is_err());
        assert!(!dir.path().join("targs_0_0.txt").exists());

        // 失败不影响后续调用
        assert!(allocator.allocate_lines(["1.2.3.4"]).is_ok());
    }

    #[test]
    fn test_receiver_path_shares_counter() {
        let dir = tempfile::tempdir().unwrap();
        let allocator = WorkFileAllocator::new(dir.path());
        allocator.set_port(7);

        allocator.allocate_lines(["1.2.3.4"]).unwrap();
        let path = allocator.receiver_path(SpoofKind::Rr);
        assert_eq!(path, dir.path().join("spoof_7_1_rrspoofping.out"));
        assert!(!path.exists());
    }
}
