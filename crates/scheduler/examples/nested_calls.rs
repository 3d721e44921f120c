// nested_calls.rs
// 示例：在分区任务内再次调用并行函数。不支持嵌套调度的后端上内层调用直接执行。
use std::sync::Arc;

use anyhow::Result;
use partition_scheduler::backend::{ThreadPerTaskBackend, ThreadPoolBackend};
use partition_scheduler::context::with_backend;
use partition_scheduler::logging::init_logging;
use partition_scheduler::partition::ListChunks;
use partition_scheduler::result_merger::{ListConcat, Sum};
use partition_scheduler::{Backend, NamedArgs, ParallelFunction, PartitionSpec};
use prettytable::{cell, row, Table};

fn main() -> Result<()> {
    init_logging("debug")?;
    println!("=== 嵌套调用示例 ===");

    let square_sum = Arc::new(
        ParallelFunction::builder("square_sum")
            .signature(["values"])
            .function(|args: &NamedArgs| -> Result<i64> {
                Ok(args.get::<Vec<i64>>("values")?.iter().map(|v| v * v).sum())
            })
            .partition(PartitionSpec::all(ListChunks::<i64>::new()))
            .combine(Sum::<i64>::new())
            .fixed_partition_size(4)
            .build()?,
    );

    let inner = Arc::clone(&square_sum);
    let per_block = ParallelFunction::builder("per_block_square_sum")
        .signature(["values"])
        .function(move |args: &NamedArgs| -> Result<Vec<i64>> {
            let values = args.get::<Vec<i64>>("values")?.clone();
            Ok(vec![inner.call(NamedArgs::new().with("values", values))?])
        })
        .partition(PartitionSpec::all(ListChunks::<i64>::new()))
        .combine(ListConcat::<i64>::new())
        .fixed_partition_size(16)
        .build()?;

    let input: Vec<i64> = (0..64).collect();
    let backends: Vec<Arc<dyn Backend>> = vec![
        Arc::new(ThreadPoolBackend::new(4)?),
        Arc::new(ThreadPerTaskBackend::new()),
    ];

    let mut table = Table::new();
    table.add_row(row!["后端", "支持嵌套", "每块平方和"]);
    for backend in backends {
        let name = backend.name().to_string();
        let nested = backend.supports_nested_scheduling();
        let sums = with_backend(backend, || {
            per_block.call(NamedArgs::new().with("values", input.clone()))
        })?;
        table.add_row(row![name, nested, format!("{:?}", sums)]);
    }
    table.printstd();
    Ok(())
}
