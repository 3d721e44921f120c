// partition.rs
// 分区策略契约与内置策略：按块拆分列表、按行/按分组拆分表格，以及用户自定义的分区生成器。
//
// 分区源是惰性的拉取式序列，每次拉取时接收请求的分区大小，只在被拉取时才生成下一个分区。
use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::table::Table;
use crate::types::{ArgValue, NamedArgs};

/// 分区源产出的一个分区：实际大小 + 与所拥有参数按位置对齐的子参数
#[derive(Debug, Clone)]
pub struct PartitionChunk {
    pub size: usize,
    pub values: Vec<ArgValue>,
}

/// 惰性、有限、不可重启的分区序列
pub trait PartitionSource: Send {
    /// 拉取下一个分区。支持大小感知的源按 `requested` 切分，其余的源忽略该值
    fn next_partition(&mut self, requested: usize) -> Option<Result<PartitionChunk>>;

    /// 是否按请求的大小切分
    fn is_size_aware(&self) -> bool;
}

/// 分区策略：接收它拥有的参数子集，返回一个分区源
pub trait PartitionStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// 接受的参数个数，`None` 表示任意个
    fn arity(&self) -> Option<usize>;

    /// 自定义策略的粒度由调用方决定，使用它时不运行分区大小估计器
    fn is_custom(&self) -> bool {
        false
    }

    fn partition(&self, args: &NamedArgs) -> Result<Box<dyn PartitionSource>>;
}

/// 把策略包装为可共享的 trait 对象，便于组合按参数分区的规格
pub fn shared<S: PartitionStrategy + 'static>(strategy: S) -> Arc<dyn PartitionStrategy> {
    Arc::new(strategy)
}

/// 检查策略能否接受 `count` 个参数
pub(crate) fn check_arity(strategy: &dyn PartitionStrategy, count: usize) -> Result<()> {
    match strategy.arity() {
        Some(n) if n != count => Err(Error::PartitionArity(format!(
            "策略 `{}` 接受 {} 个参数，却被分配了 {} 个",
            strategy.name(),
            n,
            count
        ))),
        _ if count == 0 => Err(Error::PartitionArity(format!(
            "策略 `{}` 没有分配任何参数",
            strategy.name()
        ))),
        _ => Ok(()),
    }
}

fn equal_lengths(name: &str, lengths: &[(String, usize)]) -> Result<usize> {
    let first = lengths.first().map(|(_, len)| *len).unwrap_or(0);
    if let Some((arg, len)) = lengths.iter().find(|(_, len)| *len != first) {
        return Err(Error::PartitionArity(format!(
            "策略 `{}` 的参数长度不一致: `{}` 有 {} 项，期望 {}",
            name, arg, len, first
        )));
    }
    Ok(first)
}

/// 按相同大小的块拆分一个或多个 `Vec<T>` 参数，块在各参数间按下标对齐
pub struct ListChunks<T> {
    _item: PhantomData<fn() -> T>,
}

impl<T> ListChunks<T> {
    pub fn new() -> Self {
        Self { _item: PhantomData }
    }
}

impl<T> Default for ListChunks<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Any + Send + Sync> PartitionStrategy for ListChunks<T> {
    fn name(&self) -> &str {
        "list_by_chunk"
    }

    fn arity(&self) -> Option<usize> {
        None
    }

    fn partition(&self, args: &NamedArgs) -> Result<Box<dyn PartitionSource>> {
        let mut lengths = Vec::with_capacity(args.len());
        for name in args.names() {
            lengths.push((name.to_string(), args.get::<Vec<T>>(name)?.len()));
        }
        let total = equal_lengths(self.name(), &lengths)?;
        Ok(Box::new(ListChunkSource::<T> {
            names: lengths.into_iter().map(|(n, _)| n).collect(),
            lists: args.values().cloned().collect(),
            offset: 0,
            total,
            _item: PhantomData,
        }))
    }
}

struct ListChunkSource<T> {
    names: Vec<String>,
    lists: Vec<ArgValue>,
    offset: usize,
    total: usize,
    _item: PhantomData<fn() -> T>,
}

impl<T: Clone + Any + Send + Sync> PartitionSource for ListChunkSource<T> {
    fn next_partition(&mut self, requested: usize) -> Option<Result<PartitionChunk>> {
        if self.offset >= self.total {
            return None;
        }
        let end = self.offset.saturating_add(requested.max(1)).min(self.total);
        let mut values = Vec::with_capacity(self.lists.len());
        for (name, list) in self.names.iter().zip(&self.lists) {
            match list.get::<Vec<T>>(name) {
                Ok(items) => values.push(ArgValue::new(items[self.offset..end].to_vec())),
                Err(e) => return Some(Err(e)),
            }
        }
        let size = end - self.offset;
        self.offset = end;
        Some(Ok(PartitionChunk { size, values }))
    }

    fn is_size_aware(&self) -> bool {
        true
    }
}

/// 按行区间拆分一个或多个 `Table` 参数，各表的行区间对齐
#[derive(Debug, Default, Clone, Copy)]
pub struct TableRows;

impl PartitionStrategy for TableRows {
    fn name(&self) -> &str {
        "table_by_row"
    }

    fn arity(&self) -> Option<usize> {
        None
    }

    fn partition(&self, args: &NamedArgs) -> Result<Box<dyn PartitionSource>> {
        let mut lengths = Vec::with_capacity(args.len());
        for name in args.names() {
            lengths.push((name.to_string(), args.get::<Table>(name)?.row_count()));
        }
        let total = equal_lengths(self.name(), &lengths)?;
        Ok(Box::new(TableRowSource {
            names: lengths.into_iter().map(|(n, _)| n).collect(),
            tables: args.values().cloned().collect(),
            offset: 0,
            total,
        }))
    }
}

struct TableRowSource {
    names: Vec<String>,
    tables: Vec<ArgValue>,
    offset: usize,
    total: usize,
}

impl PartitionSource for TableRowSource {
    fn next_partition(&mut self, requested: usize) -> Option<Result<PartitionChunk>> {
        if self.offset >= self.total {
            return None;
        }
        let end = self.offset.saturating_add(requested.max(1)).min(self.total);
        let mut values = Vec::with_capacity(self.tables.len());
        for (name, table) in self.names.iter().zip(&self.tables) {
            match table.get::<Table>(name) {
                Ok(table) => values.push(ArgValue::new(table.slice(self.offset, end))),
                Err(e) => return Some(Err(e)),
            }
        }
        let size = end - self.offset;
        self.offset = end;
        Some(Ok(PartitionChunk { size, values }))
    }

    fn is_size_aware(&self) -> bool {
        true
    }
}

/// 按分组列拆分一个 `Table`，每个键一个分区，顺序为键首次出现的顺序。
///
/// 设置 `max_rows` 后，超过该行数的分组再按行切成多个分区。
#[derive(Debug, Clone)]
pub struct TableGroups {
    by: Vec<String>,
    max_rows: Option<usize>,
}

impl TableGroups {
    pub fn new<S: Into<String>>(by: impl IntoIterator<Item = S>) -> Self {
        Self {
            by: by.into_iter().map(Into::into).collect(),
            max_rows: None,
        }
    }

    pub fn max_rows(mut self, rows: usize) -> Self {
        self.max_rows = Some(rows.max(1));
        self
    }
}

impl PartitionStrategy for TableGroups {
    fn name(&self) -> &str {
        "table_by_group"
    }

    fn arity(&self) -> Option<usize> {
        Some(1)
    }

    fn partition(&self, args: &NamedArgs) -> Result<Box<dyn PartitionSource>> {
        let name = args
            .names()
            .next()
            .ok_or_else(|| Error::PartitionArity("分组策略需要一个表格参数".to_string()))?;
        // 分组只记录行下标，每个分组的数据在被拉取时才复制
        let groups = args.get::<Table>(name)?.group_indices(&self.by)?;
        Ok(Box::new(TableGroupSource {
            name: name.to_string(),
            table: args.value(name)?.clone(),
            groups: groups.into_iter(),
            max_rows: self.max_rows,
            remainder: Vec::new(),
        }))
    }
}

struct TableGroupSource {
    name: String,
    table: ArgValue,
    groups: std::vec::IntoIter<Vec<usize>>,
    max_rows: Option<usize>,
    /// 当前分组尚未产出的行
    remainder: Vec<usize>,
}

impl PartitionSource for TableGroupSource {
    fn next_partition(&mut self, _requested: usize) -> Option<Result<PartitionChunk>> {
        if self.remainder.is_empty() {
            self.remainder = self.groups.next()?;
        }
        let take = match self.max_rows {
            Some(max) => max.min(self.remainder.len()),
            None => self.remainder.len(),
        };
        let rest = self.remainder.split_off(take);
        let rows = std::mem::replace(&mut self.remainder, rest);
        let group = match self.table.get::<Table>(&self.name) {
            Ok(table) => table.take(&rows),
            Err(e) => return Some(Err(e)),
        };
        Some(Ok(PartitionChunk {
            size: rows.len(),
            values: vec![ArgValue::new(group)],
        }))
    }

    fn is_size_aware(&self) -> bool {
        false
    }
}

type PartitionIter = Box<dyn Iterator<Item = Vec<ArgValue>> + Send>;
type CustomFn = dyn Fn(&NamedArgs) -> Result<PartitionIter> + Send + Sync;

/// 用户自定义分区策略：返回任意参数元组迭代器，忽略分区大小
#[derive(Clone)]
pub struct CustomStrategy {
    name: String,
    arity: usize,
    generator: Arc<CustomFn>,
}

impl CustomStrategy {
    pub fn new<F, I>(name: &str, arity: usize, generator: F) -> Self
    where
        F: Fn(&NamedArgs) -> Result<I> + Send + Sync + 'static,
        I: Iterator<Item = Vec<ArgValue>> + Send + 'static,
    {
        Self {
            name: name.to_string(),
            arity,
            generator: Arc::new(move |args| Ok(Box::new(generator(args)?) as PartitionIter)),
        }
    }
}

impl PartitionStrategy for CustomStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn arity(&self) -> Option<usize> {
        Some(self.arity)
    }

    fn is_custom(&self) -> bool {
        true
    }

    fn partition(&self, args: &NamedArgs) -> Result<Box<dyn PartitionSource>> {
        Ok(Box::new(CustomSource {
            inner: (self.generator)(args)?,
        }))
    }
}

struct CustomSource {
    inner: PartitionIter,
}

impl PartitionSource for CustomSource {
    fn next_partition(&mut self, _requested: usize) -> Option<Result<PartitionChunk>> {
        self.inner
            .next()
            .map(|values| Ok(PartitionChunk { size: 1, values }))
    }

    fn is_size_aware(&self) -> bool {
        false
    }
}

/// 在并行函数之外驱动一个分区源，每次请求相同的分区大小
pub fn with_partition_size(
    mut source: Box<dyn PartitionSource>,
    partition_size: usize,
) -> impl Iterator<Item = Result<Vec<ArgValue>>> {
    std::iter::from_fn(move || {
        source
            .next_partition(partition_size)
            .map(|chunk| chunk.map(|c| c.values))
    })
}
