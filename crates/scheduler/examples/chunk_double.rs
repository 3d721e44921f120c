// chunk_double.rs
// 示例：把列表按固定大小分块，在线程池上并行翻倍后按顺序拼接。
use std::sync::Arc;

use anyhow::Result;
use partition_scheduler::backend::ThreadPoolBackend;
use partition_scheduler::context::with_backend;
use partition_scheduler::logging::init_logging;
use partition_scheduler::partition::ListChunks;
use partition_scheduler::result_merger::ListConcat;
use partition_scheduler::{Backend, NamedArgs, ParallelFunction, PartitionSpec};
use prettytable::{cell, row, Table};

fn main() -> Result<()> {
    init_logging("info")?;
    println!("=== 分块翻倍示例 ===");

    let double = ParallelFunction::builder("chunk_double")
        .signature(["values"])
        .function(|args: &NamedArgs| -> Result<Vec<i64>> {
            Ok(args.get::<Vec<i64>>("values")?.iter().map(|v| v * 2).collect())
        })
        .partition(PartitionSpec::all(ListChunks::<i64>::new()))
        .combine(ListConcat::<i64>::new())
        .fixed_partition_size(3)
        .build()?;

    let backend: Arc<dyn Backend> = Arc::new(ThreadPoolBackend::new(3)?);
    let input: Vec<i64> = (1..=9).collect();
    let output = with_backend(backend, || {
        double.call(NamedArgs::new().with("values", input.clone()))
    })?;

    let mut table = Table::new();
    table.add_row(row!["输入", "输出"]);
    for (i, o) in input.iter().zip(&output) {
        table.add_row(row![i, o]);
    }
    table.printstd();
    Ok(())
}
