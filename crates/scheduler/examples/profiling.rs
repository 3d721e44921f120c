// profiling.rs
// 示例：不指定分区大小，多次调用让估计器学习，打印性能报告并导出分区追踪。
use std::time::Duration;

use anyhow::Result;
use partition_scheduler::logging::init_logging;
use partition_scheduler::partition::ListChunks;
use partition_scheduler::result_merger::Sum;
use partition_scheduler::{NamedArgs, ParallelFunction, PartitionSpec, SchedulerConfig};
use prettytable::{cell, row, Table};

fn main() -> Result<()> {
    init_logging("info")?;
    println!("=== 性能分析示例 ===");

    let config = match std::env::args().nth(1) {
        Some(path) => SchedulerConfig::from_json_file(path)?,
        None => SchedulerConfig {
            enable_profiling: true,
            trace_export_path: Some(std::env::temp_dir().join("partition_trace.csv")),
            ..SchedulerConfig::default()
        },
    };

    // 每个分区固定 200µs 的开销，加上每行约 2µs 的计算
    let busy_sum = ParallelFunction::builder("busy_sum")
        .signature(["values"])
        .function(|args: &NamedArgs| -> Result<u64> {
            let values = args.get::<Vec<u64>>("values")?;
            std::thread::sleep(Duration::from_micros(200));
            let mut acc = 0u64;
            for v in values {
                let spin = std::time::Instant::now();
                while spin.elapsed() < Duration::from_micros(2) {}
                acc = acc.wrapping_add(v * v);
            }
            Ok(acc)
        })
        .partition(PartitionSpec::all(ListChunks::<u64>::new()))
        .combine(Sum::<u64>::new())
        .config(&config)
        .build()?;

    let input: Vec<u64> = (0..5_000).collect();
    let mut table = Table::new();
    table.add_row(row!["轮次", "估计器阶段", "推荐分区大小", "分区数"]);
    for round in 0..8 {
        // 后端由配置决定
        busy_sum.call(NamedArgs::new().with("values", input.clone()))?;
        let (size, phase) = busy_sum.estimator().snapshot();
        let partitions = busy_sum
            .last_profile()
            .map(|p| p.partition_count)
            .unwrap_or(0);
        table.add_row(row![round, phase.as_str(), size, partitions]);
    }
    table.printstd();

    if let Some(path) = &config.trace_export_path {
        println!("最近一次调用的分区追踪: {}", path.display());
    }
    Ok(())
}
