//! 进程级指标：请求与步骤计数器、规划 / 翻译 / 沙箱延迟直方图
//!
//! 全局单例，原子计数，可渲染为 Prometheus 文本格式。

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use serde::Serialize;

const PLANNER_BUCKETS: &[f64] = &[0.2, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0];
const EXECUTOR_BUCKETS: &[f64] = &[0.05, 0.1, 0.2, 0.5, 1.0, 2.0, 5.0];
const SANDBOX_BUCKETS: &[f64] = &[0.05, 0.1, 0.2, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0];

/// 单调递增计数器
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// 固定桶直方图（秒）
#[derive(Debug)]
pub struct Histogram {
    bounds: &'static [f64],
    /// 每个桶的非累计计数，最后一个为 +Inf
    buckets: Vec<AtomicU64>,
    count: AtomicU64,
    sum_micros: AtomicU64,
}

impl Histogram {
    fn new(bounds: &'static [f64]) -> Self {
        Self {
            bounds,
            buckets: (0..=bounds.len()).map(|_| AtomicU64::new(0)).collect(),
            count: AtomicU64::new(0),
            sum_micros: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        let idx = self
            .bounds
            .iter()
            .position(|b| secs <= *b)
            .unwrap_or(self.bounds.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum_seconds(&self) -> f64 {
        self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0
    }

    fn render(&self, name: &str, help: &str, out: &mut String) {
        let _ = writeln!(out, "# HELP {name} {help}");
        let _ = writeln!(out, "# TYPE {name} histogram");
        let mut cumulative = 0;
        for (bound, bucket) in self.bounds.iter().zip(&self.buckets) {
            cumulative += bucket.load(Ordering::Relaxed);
            let _ = writeln!(out, "{name}_bucket{{le=\"{bound}\"}} {cumulative}");
        }
        if let Some(inf) = self.buckets.last() {
            cumulative += inf.load(Ordering::Relaxed);
        }
        let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {cumulative}");
        let _ = writeln!(out, "{name}_sum {}", self.sum_seconds());
        let _ = writeln!(out, "{name}_count {}", self.count());
    }
}

/// 引擎指标
#[derive(Debug)]
pub struct Metrics {
    pub execute_goal_requests: Counter,
    /// 派发到沙箱的步骤数
    pub steps_executed: Counter,
    /// 失败的步骤数（非零退出、超时、翻译或执行器错误）
    pub steps_failed: Counter,
    pub planner_latency: Histogram,
    /// 翻译网关（命令生成）延迟
    pub executor_latency: Histogram,
    pub sandbox_latency: Histogram,
}

/// JSON 视图
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub execute_goal_requests: u64,
    pub steps_executed: u64,
    pub steps_failed: u64,
    pub planner_calls: u64,
    pub executor_calls: u64,
    pub sandbox_runs: u64,
}

impl Metrics {
    fn new() -> Self {
        Self {
            execute_goal_requests: Counter::default(),
            steps_executed: Counter::default(),
            steps_failed: Counter::default(),
            planner_latency: Histogram::new(PLANNER_BUCKETS),
            executor_latency: Histogram::new(EXECUTOR_BUCKETS),
            sandbox_latency: Histogram::new(SANDBOX_BUCKETS),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            execute_goal_requests: self.execute_goal_requests.get(),
            steps_executed: self.steps_executed.get(),
            steps_failed: self.steps_failed.get(),
            planner_calls: self.planner_latency.count(),
            executor_calls: self.executor_latency.count(),
            sandbox_runs: self.sandbox_latency.count(),
        }
    }

    /// Prometheus 文本格式
    pub fn render(&self) -> String {
        let mut out = String::new();
        let counters = [
            (
                "engine_execute_goal_requests_total",
                "Total execute_goal requests received",
                &self.execute_goal_requests,
            ),
            (
                "engine_steps_executed_total",
                "Total sub-steps executed (attempted)",
                &self.steps_executed,
            ),
            (
                "engine_steps_failed_total",
                "Total sub-steps failed (non-zero exit or executor error)",
                &self.steps_failed,
            ),
        ];
        for (name, help, counter) in counters {
            let _ = writeln!(out, "# HELP {name} {help}");
            let _ = writeln!(out, "# TYPE {name} counter");
            let _ = writeln!(out, "{name} {}", counter.get());
        }
        self.planner_latency
            .render("engine_planner_seconds", "Planner call latency (seconds)", &mut out);
        self.executor_latency.render(
            "engine_executor_seconds",
            "Command translation call latency (seconds)",
            &mut out,
        );
        self.sandbox_latency.render(
            "engine_sandbox_seconds",
            "Sandbox execution latency (seconds)",
            &mut out,
        );
        out
    }
}

/// 全局指标
pub fn metrics() -> &'static Metrics {
    static METRICS: OnceLock<Metrics> = OnceLock::new();
    METRICS.get_or_init(Metrics::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_buckets_are_cumulative() {
        let h = Histogram::new(&[0.1, 1.0]);
        h.observe(Duration::from_millis(50));
        h.observe(Duration::from_millis(500));
        h.observe(Duration::from_secs(3));

        let mut out = String::new();
        h.render("t_seconds", "test", &mut out);
        assert!(out.contains("t_seconds_bucket{le=\"0.1\"} 1\n"));
        assert!(out.contains("t_seconds_bucket{le=\"1\"} 2\n"));
        assert!(out.contains("t_seconds_bucket{le=\"+Inf\"} 3\n"));
        assert!(out.contains("t_seconds_count 3\n"));
        assert!((h.sum_seconds() - 3.55).abs() < 1e-6);
    }

    #[test]
    fn test_render_names_every_series() {
        let m = Metrics::new();
        m.execute_goal_requests.inc();
        m.steps_failed.inc();
        let text = m.render();
        assert!(text.contains("engine_execute_goal_requests_total 1\n"));
        assert!(text.contains("engine_steps_executed_total 0\n"));
        assert!(text.contains("engine_steps_failed_total 1\n"));
        for name in ["engine_planner_seconds", "engine_executor_seconds", "engine_sandbox_seconds"] {
            assert!(text.contains(&format!("# TYPE {name} histogram")));
        }
        assert_eq!(m.snapshot().execute_goal_requests, 1);
    }
}
