// profiler.rs
// 性能分析：每个分区的计时记录、单次调用的执行概况、可读报告输出以及 CSV 追踪导出。
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::Duration;

use prettytable::{cell, row, Table as PrettyTable};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::estimator::{Coefficients, EstimatorPhase, PartitionSample};
use crate::task::TaskResult;
use crate::task_splitter::PartitionItem;

/// CSV 追踪文件的表头
pub const TRACE_HEADER: &str = "partition_index,start_ns,partition_size,requested_partition_size,partition_duration_ns,compute_duration_ns,combine_duration_ns";

/// 单个分区的计时记录，耗时单位均为纳秒
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionTrace {
    pub partition_index: usize,
    /// 相对调用开始时刻
    pub start_ns: u64,
    pub partition_size: usize,
    pub requested_size: Option<usize>,
    pub partition_ns: u64,
    /// 用户函数计算耗时
    pub compute_ns: u64,
    /// 计算耗时加上后端无法测量的调度开销
    pub task_ns: u64,
    pub combine_ns: u64,
}

impl PartitionTrace {
    pub fn from_item(item: &PartitionItem, start_ns: u64) -> Self {
        Self {
            partition_index: item.index,
            start_ns,
            partition_size: item.size,
            requested_size: item.requested_size,
            partition_ns: item.partition_ns,
            ..Self::default()
        }
    }

    pub fn record_task<R>(&mut self, result: &TaskResult<R>) {
        self.compute_ns = result.compute_ns;
        self.task_ns = result.task_ns;
    }

    pub fn total_ns(&self) -> u64 {
        self.partition_ns + self.task_ns + self.combine_ns
    }

    /// 估计器使用的观测值
    pub fn sample(&self) -> PartitionSample {
        PartitionSample {
            partition_size: self.partition_size,
            duration_ns: self.total_ns(),
        }
    }
}

/// 一次调用的全部分区记录
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvocationTrace {
    pub partitions: Vec<PartitionTrace>,
}

impl InvocationTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, trace: PartitionTrace) {
        self.partitions.push(trace);
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut PartitionTrace> {
        // 分区下标连续无空洞，直接按位置访问
        self.partitions
            .get_mut(index)
            .filter(|t| t.partition_index == index)
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    pub fn total_rows(&self) -> usize {
        self.partitions.iter().map(|t| t.partition_size).sum()
    }
}

/// 由单次调用的记录推导出的执行概况
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionProfile {
    pub function_name: String,
    pub partition_count: usize,
    /// 所有分区各阶段耗时之和（分区 + 计算 + 合并）。
    ///
    /// 各阶段按墙钟计时：外层分区等待嵌套子调用时，子任务的耗时会被再计入一次。
    pub total_cpu_ns: u64,
    pub total_compute_ns: u64,
    pub min_compute_ns: u64,
    pub max_compute_ns: u64,
    pub avg_compute_ns: u64,
    pub partitioning_ns: u64,
    pub combining_ns: u64,
    /// 无限核心下的理论加速比：各阶段耗时合计 / max(并行开销, 最慢的分区)
    pub theoretical_speedup: f64,
    /// 按拟合系数估计的加速比：(α·N + β) / (α·s + β)
    pub model_speedup: Option<f64>,
    pub estimator_phase: Option<EstimatorPhase>,
    pub estimated_partition_size: Option<usize>,
}

impl ExecutionProfile {
    pub fn from_trace(
        function_name: &str,
        trace: &InvocationTrace,
        estimator: Option<(usize, EstimatorPhase, Option<Coefficients>)>,
    ) -> Self {
        let partitions = &trace.partitions;
        let count = partitions.len();
        let total_compute_ns: u64 = partitions.iter().map(|t| t.task_ns).sum();
        let partitioning_ns: u64 = partitions.iter().map(|t| t.partition_ns).sum();
        let combining_ns: u64 = partitions.iter().map(|t| t.combine_ns).sum();
        let min_compute_ns = partitions.iter().map(|t| t.task_ns).min().unwrap_or(0);
        let max_compute_ns = partitions.iter().map(|t| t.task_ns).max().unwrap_or(0);
        let total_cpu_ns = total_compute_ns + partitioning_ns + combining_ns;

        let bottleneck = (partitioning_ns + combining_ns).max(max_compute_ns);
        let theoretical_speedup = if bottleneck == 0 {
            1.0
        } else {
            total_cpu_ns as f64 / bottleneck as f64
        };

        let (estimated_partition_size, estimator_phase, coefficients) = match estimator {
            Some((size, phase, coefficients)) => (Some(size), Some(phase), coefficients),
            None => (None, None, None),
        };
        let model_speedup = match (coefficients, estimated_partition_size) {
            (Some(c), Some(size)) if size > 0 => {
                let rows = trace.total_rows() as f64;
                Some((c.alpha * rows + c.beta) / (c.alpha * size as f64 + c.beta))
            }
            _ => None,
        };

        Self {
            function_name: function_name.to_string(),
            partition_count: count,
            total_cpu_ns,
            total_compute_ns,
            min_compute_ns,
            max_compute_ns,
            avg_compute_ns: if count == 0 { 0 } else { total_compute_ns / count as u64 },
            partitioning_ns,
            combining_ns,
            theoretical_speedup,
            model_speedup,
            estimator_phase,
            estimated_partition_size,
        }
    }

    pub fn parallel_overhead_ns(&self) -> u64 {
        self.partitioning_ns + self.combining_ns
    }

    fn share(&self, ns: u64) -> String {
        if self.total_cpu_ns == 0 {
            return "-".to_string();
        }
        format!("{:.2}%", ns as f64 / self.total_cpu_ns as f64 * 100.0)
    }
}

fn fmt_ns(ns: u64) -> String {
    format!("{:?}", Duration::from_nanos(ns))
}

/// 把执行概况以表格形式写入 `out`
pub fn print_profile<W: Write + ?Sized>(out: &mut W, profile: &ExecutionProfile) -> io::Result<()> {
    writeln!(out, "{}()", profile.function_name)?;

    let mut table = PrettyTable::new();
    table.set_titles(row!["指标", "耗时/数值", "占比"]);
    table.add_row(row!["各阶段耗时合计", fmt_ns(profile.total_cpu_ns), ""]);
    table.add_row(row![
        "计算时间",
        fmt_ns(profile.total_compute_ns),
        profile.share(profile.total_compute_ns)
    ]);
    table.add_row(row!["  最小", fmt_ns(profile.min_compute_ns), ""]);
    table.add_row(row!["  最大", fmt_ns(profile.max_compute_ns), ""]);
    table.add_row(row!["  平均", fmt_ns(profile.avg_compute_ns), ""]);
    table.add_row(row![
        "并行开销",
        fmt_ns(profile.parallel_overhead_ns()),
        profile.share(profile.parallel_overhead_ns())
    ]);
    table.add_row(row![
        "  分区",
        fmt_ns(profile.partitioning_ns),
        profile.share(profile.partitioning_ns)
    ]);
    table.add_row(row![
        "  合并",
        fmt_ns(profile.combining_ns),
        profile.share(profile.combining_ns)
    ]);
    table.add_row(row![
        "理论最大加速比",
        format!("{:.2}x", profile.theoretical_speedup),
        ""
    ]);
    if let Some(speedup) = profile.model_speedup {
        table.add_row(row!["模型加速比", format!("{:.2}x", speedup), ""]);
    }
    table.add_row(row!["分区数", profile.partition_count, ""]);
    if let Some(phase) = profile.estimator_phase {
        table.add_row(row!["估计器阶段", phase.as_str(), ""]);
    }
    if let Some(size) = profile.estimated_partition_size {
        table.add_row(row!["估计分区大小", size, ""]);
    }
    table.print(out)?;
    Ok(())
}

/// 把分区记录写为 CSV
pub fn write_trace<W: Write>(out: W, trace: &InvocationTrace) -> io::Result<()> {
    let mut out = BufWriter::new(out);
    writeln!(out, "{}", TRACE_HEADER)?;
    for t in &trace.partitions {
        let requested = t.requested_size.map(|s| s.to_string()).unwrap_or_default();
        writeln!(
            out,
            "{},{},{},{},{},{},{}",
            t.partition_index,
            t.start_ns,
            t.partition_size,
            requested,
            t.partition_ns,
            t.task_ns,
            t.combine_ns
        )?;
    }
    out.flush()
}

/// 导出 CSV 追踪文件，已存在时覆盖
pub fn export_trace(path: impl AsRef<Path>, trace: &InvocationTrace) -> Result<()> {
    let file = File::create(path)?;
    write_trace(file, trace)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trace() -> InvocationTrace {
        let mut trace = InvocationTrace::new();
        for i in 0..3 {
            trace.push(PartitionTrace {
                partition_index: i,
                start_ns: i as u64 * 100,
                partition_size: 10,
                requested_size: Some(10),
                partition_ns: 10,
                compute_ns: 1_000,
                task_ns: 1_000 * (i as u64 + 1),
                combine_ns: 5,
            });
        }
        trace
    }

    #[test]
    fn test_profile_aggregates() {
        let profile = ExecutionProfile::from_trace("double", &trace(), None);
        assert_eq!(profile.partition_count, 3);
        assert_eq!(profile.total_compute_ns, 6_000);
        assert_eq!(profile.min_compute_ns, 1_000);
        assert_eq!(profile.max_compute_ns, 3_000);
        assert_eq!(profile.avg_compute_ns, 2_000);
        assert_eq!(profile.total_cpu_ns, 6_045);
        assert!((profile.theoretical_speedup - 6_045.0 / 3_000.0).abs() < 1e-9);
        assert!(profile.model_speedup.is_none());
    }

    #[test]
    fn test_model_speedup_uses_coefficients() {
        let coefficients = Coefficients {
            alpha: 100.0,
            beta: 1_000.0,
            r2: 1.0,
            sample_count: 5,
        };
        let profile = ExecutionProfile::from_trace(
            "double",
            &trace(),
            Some((10, EstimatorPhase::Converged, Some(coefficients))),
        );
        let expected = (100.0 * 30.0 + 1_000.0) / (100.0 * 10.0 + 1_000.0);
        assert!((profile.model_speedup.unwrap() - expected).abs() < 1e-9);
    }

    #[test]
    fn test_print_profile_mentions_name() {
        let profile = ExecutionProfile::from_trace("double", &trace(), None);
        let mut out = Vec::new();
        print_profile(&mut out, &profile).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("double()"));
        assert!(text.contains("分区数"));
    }

    #[test]
    fn test_export_trace_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.csv");
        export_trace(&path, &trace()).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], TRACE_HEADER);
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[2], "1,100,10,10,10,2000,5");
    }
}
