// group_by_country.rs
// 示例：按国家分组的表格，每组一个分区，分组结果按首次出现顺序拼接。
use anyhow::Result;
use partition_scheduler::context::with_backend_named;
use partition_scheduler::logging::init_logging;
use partition_scheduler::partition::TableGroups;
use partition_scheduler::result_merger::TableConcat;
use partition_scheduler::table::{Cell, Table};
use partition_scheduler::{NamedArgs, ParallelFunction, PartitionSpec};
use prettytable::{cell, row, Table as PrettyTable};

fn orders() -> Result<Table> {
    let mut table = Table::new(["country", "customer", "amount"]);
    let rows = [
        ("US", "alice", 120.0),
        ("DE", "bruno", 80.5),
        ("US", "carol", 42.0),
        ("FR", "denis", 310.0),
        ("DE", "emma", 19.9),
        ("US", "frank", 7.5),
    ];
    for (country, customer, amount) in rows {
        table.push_row(vec![
            Cell::from(country),
            Cell::from(customer),
            Cell::Float(amount),
        ])?;
    }
    Ok(table)
}

fn main() -> Result<()> {
    init_logging("info")?;
    println!("=== 按国家分组示例 ===");

    let summarize = ParallelFunction::builder("country_summary")
        .signature(["orders"])
        .function(|args: &NamedArgs| -> Result<Table> {
            let group = args.get::<Table>("orders")?;
            let country = group.column("country")?[0].clone();
            let total: f64 = group
                .column("amount")?
                .into_iter()
                .filter_map(|c| match c {
                    Cell::Float(v) => Some(*v),
                    _ => None,
                })
                .sum();
            let mut out = Table::new(["country", "orders", "total"]);
            out.push_row(vec![
                country,
                Cell::Int(group.row_count() as i64),
                Cell::Float(total),
            ])?;
            Ok(out)
        })
        .partition(PartitionSpec::all(TableGroups::new(["country"])))
        .combine(TableConcat)
        .build()?;

    let input = orders()?;
    let summary = with_backend_named("local_thread_pool", 2, || {
        summarize.call(NamedArgs::new().with("orders", input.clone()))
    })??;

    let mut table = PrettyTable::new();
    table.add_row(row!["国家", "订单数", "金额"]);
    for r in summary.rows() {
        table.add_row(row![r[0], r[1], r[2]]);
    }
    table.printstd();
    println!("总行数: {} (输入 {})", summary.row_count(), input.row_count());
    Ok(())
}
