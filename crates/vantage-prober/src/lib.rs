//! Vantage Prober - 探测作业层
//!
//! 该模块负责外部探测工具的调用：选择探测网卡、分配工作文件、同步执行探测、
//! 跟踪异步作业以及协调欺骗探测的发送与接收。

mod device;
mod executor;
mod jobs;
mod spoof;
mod tools;
mod workfile;

pub use device::*;
pub use executor::*;
pub use jobs::*;
pub use spoof::*;
pub use tools::*;
pub use workfile::*;

use std::sync::Arc;
use tracing::info;

/// 探测层聚合，各组件共享同一个分配器与工具调用器
pub struct Prober {
    /// 工作文件分配器
    pub allocator: Arc<WorkFileAllocator>,
    /// 工具调用器
    pub runner: Arc<ToolRunner>,
    /// 同步探测
    pub executor: ProbeExecutor,
    /// 异步作业
    pub jobs: AsyncJobTracker,
    /// 欺骗探测
    pub spoof: SpoofCoordinator,
}

impl Prober {
    /// 选择探测网卡后创建探测层
    pub fn new(config: ProberConfig) -> Self {
        let device = DeviceSelector::default().select();
        Self::with_device(config, device)
    }

    /// 使用指定网卡创建探测层
    pub fn with_device(config: ProberConfig, device: impl Into<String>) -> Self {
        let device = device.into();
        info!(
            "探测层初始化: 网卡 {}，工具目录 {:?}，输出目录 {:?}",
            device, config.tool_dir, config.output_dir
        );
        let allocator = Arc::new(WorkFileAllocator::new(&config.output_dir));
        let runner = Arc::new(ToolRunner::new(config, device));
        Self {
            executor: ProbeExecutor::new(allocator.clone(), runner.clone()),
            jobs: AsyncJobTracker::new(allocator.clone(), runner.clone()),
            spoof: SpoofCoordinator::new(allocator.clone(), runner.clone()),
            allocator,
            runner,
        }
    }

    /// 探测网卡
    pub fn device(&self) -> &str {
        self.runner.device()
    }

    /// 记录监听端口，之后分配的文件名都会带上它
    pub fn set_port(&self, port: u16) {
        self.allocator.set_port(port);
    }
}
