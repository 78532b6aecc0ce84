//! 指标收集与导出模块
//!
//! 该模块统计 RPC 调用、探测作业、欺骗探测、注册与自更新的次数，
//! 并通过 RPC 监听器上的 `/metrics` 以 Prometheus 文本格式导出。

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// 指标收集器
pub struct MetricsCollector {
    /// Prometheus 注册表
    registry: Registry,
    /// RPC 调用计数（按方法）
    rpc_requests_total: IntCounterVec,
    /// RPC 失败计数（按错误分类）
    rpc_errors_total: IntCounterVec,
    /// 被访问控制拒绝的连接
    rejected_peers_total: IntCounter,
    /// 探测次数（按种类与模式）
    probes_total: IntCounterVec,
    /// 欺骗探测发送次数（按种类）
    spoof_sends_total: IntCounterVec,
    /// 注册成功次数
    registrations_total: IntCounter,
    /// 注册失败次数
    registration_failures_total: IntCounter,
    /// 安装的更新数
    updates_installed_total: IntCounter,
    /// 当前跟踪的异步作业数
    tracked_jobs: IntGauge,
}

impl MetricsCollector {
    /// 创建新的指标收集器
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let rpc_requests_total = IntCounterVec::new(
            Opts::new("vantage_rpc_requests_total", "Total number of RPC requests handled"),
            &["method"],
        )?;
        let rpc_errors_total = IntCounterVec::new(
            Opts::new("vantage_rpc_errors_total", "Total number of failed RPC requests"),
            &["kind"],
        )?;
        let rejected_peers_total = IntCounter::new(
            "vantage_rejected_peers_total",
            "Total number of requests rejected by the allow-list",
        )?;
        let probes_total = IntCounterVec::new(
            Opts::new("vantage_probes_total", "Total number of probe tool invocations"),
            &["kind", "mode"],
        )?;
        let spoof_sends_total = IntCounterVec::new(
            Opts::new("vantage_spoof_sends_total", "Total number of spoofed probe batches sent"),
            &["kind"],
        )?;
        let registrations_total = IntCounter::new(
            "vantage_registrations_total",
            "Total number of successful controller registrations",
        )?;
        let registration_failures_total = IntCounter::new(
            "vantage_registration_failures_total",
            "Total number of failed controller registrations",
        )?;
        let updates_installed_total = IntCounter::new(
            "vantage_updates_installed_total",
            "Total number of component updates installed",
        )?;
        let tracked_jobs = IntGauge::new(
            "vantage_tracked_jobs",
            "Current number of tracked asynchronous probe jobs",
        )?;

        // 注册指标
        registry.register(Box::new(rpc_requests_total.clone()))?;
        registry.register(Box::new(rpc_errors_total.clone()))?;
        registry.register(Box::new(rejected_peers_total.clone()))?;
        registry.register(Box::new(probes_total.clone()))?;
        registry.register(Box::new(spoof_sends_total.clone()))?;
        registry.register(Box::new(registrations_total.clone()))?;
        registry.register(Box::new(registration_failures_total.clone()))?;
        registry.register(Box::new(updates_installed_total.clone()))?;
        registry.register(Box::new(tracked_jobs.clone()))?;

        Ok(Self {
            registry,
            rpc_requests_total,
            rpc_errors_total,
            rejected_peers_total,
            probes_total,
            spoof_sends_total,
            registrations_total,
            registration_failures_total,
            updates_installed_total,
            tracked_jobs,
        })
    }

    /// 记录一次 RPC 调用
    pub fn record_request(&self, method: &str) {
        self.rpc_requests_total.with_label_values(&[method]).inc();
    }

    /// 记录一次 RPC 失败
    pub fn record_error(&self, kind: &str) {
        self.rpc_errors_total.with_label_values(&[kind]).inc();
    }

    /// 记录一次被拒绝的连接
    pub fn record_rejected_peer(&self) {
        self.rejected_peers_total.inc();
    }

    /// 记录一次探测
    pub fn record_probe(&self, kind: &str, mode: &str) {
        self.probes_total.with_label_values(&[kind, mode]).inc();
    }

    /// 记录一次欺骗探测发送
    pub fn record_spoof_send(&self, kind: &str) {
        self.spoof_sends_total.with_label_values(&[kind]).inc();
    }

    /// 记录注册结果
    pub fn record_registration(&self, success: bool) {
        if success {
            self.registrations_total.inc();
        } else {
            self.registration_failures_total.inc();
        }
    }

    /// 记录一次安装的更新
    pub fn record_update(&self) {
        self.updates_installed_total.inc();
    }

    /// 设置当前跟踪的作业数
    pub fn set_tracked_jobs(&self, count: usize) {
        self.tracked_jobs.set(count as i64);
    }

    /// 以 Prometheus 文本格式导出
    pub fn encode(&self) -> prometheus::Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        Ok((encoder.format_type().to_string(), buffer))
    }

    /// 获取 Prometheus 注册表
    pub fn get_registry(&self) -> &Registry {
        &self.registry
    }
}

/// 创建默认的指标收集器
pub fn create_default_metrics_collector() -> prometheus::Result<MetricsCollector> {
    MetricsCollector::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_contains_counters() {
        let metrics = create_default_metrics_collector().unwrap();
        metrics.record_request("ping");
        metrics.record_probe("ping", "sync");
        metrics.record_registration(true);
        metrics.record_registration(false);
        metrics.set_tracked_jobs(3);

        let (content_type, body) = metrics.encode().unwrap();
        let text = String::from_utf8(body).unwrap();
        assert!(content_type.starts_with("text/plain"));
        assert!(text.contains("vantage_rpc_requests_total{method=\"ping\"} 1"));
        assert!(text.contains("vantage_registrations_total 1"));
        assert!(text.contains("vantage_registration_failures_total 1"));
        assert!(text.contains("vantage_tracked_jobs 3"));
    }
}
