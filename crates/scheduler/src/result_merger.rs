// result_merger.rs
// 结果合并器：按分区下标顺序把分区结果交给合并策略，并记录合并策略处理每个结果所花的时间。
use std::iter::Peekable;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;

use crate::error::{Error, Result};
use crate::table::Table;

/// 合并策略：把有限的分区结果序列合并为一个与未分区函数返回类型相同的值
pub trait CombineStrategy<R>: Send + Sync {
    fn name(&self) -> &str;

    /// 没有任何分区时能否产出一个值（是否有单位元）
    fn accepts_empty(&self) -> bool {
        false
    }

    fn combine(&self, results: &mut dyn Iterator<Item = R>) -> Result<R>;
}

/// 按顺序拼接 `Vec<T>` 结果
pub struct ListConcat<T> {
    _item: PhantomData<fn() -> T>,
}

impl<T> ListConcat<T> {
    pub fn new() -> Self {
        Self { _item: PhantomData }
    }
}

impl<T> Default for ListConcat<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> CombineStrategy<Vec<T>> for ListConcat<T> {
    fn name(&self) -> &str {
        "list_concat"
    }

    fn accepts_empty(&self) -> bool {
        true
    }

    fn combine(&self, results: &mut dyn Iterator<Item = Vec<T>>) -> Result<Vec<T>> {
        Ok(results.flatten().collect())
    }
}

/// 按顺序拼接表格的行，表头不一致时报错
#[derive(Debug, Default, Clone, Copy)]
pub struct TableConcat;

impl CombineStrategy<Table> for TableConcat {
    fn name(&self) -> &str {
        "table_concat"
    }

    fn combine(&self, results: &mut dyn Iterator<Item = Table>) -> Result<Table> {
        Table::concat(results)
    }
}

/// 求和
pub struct Sum<T> {
    _item: PhantomData<fn() -> T>,
}

impl<T> Sum<T> {
    pub fn new() -> Self {
        Self { _item: PhantomData }
    }
}

impl<T> Default for Sum<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: std::iter::Sum<T>> CombineStrategy<T> for Sum<T> {
    fn name(&self) -> &str {
        "sum"
    }

    fn accepts_empty(&self) -> bool {
        true
    }

    fn combine(&self, results: &mut dyn Iterator<Item = T>) -> Result<T> {
        Ok(results.sum())
    }
}

/// 用闭包实现的合并策略，闭包返回的错误视为合并签名错误
pub struct FnCombine<R, F> {
    name: String,
    accepts_empty: bool,
    combine: F,
    _result: PhantomData<fn() -> R>,
}

impl<R, F> FnCombine<R, F> {
    /// 声明闭包在没有分区时也能产出结果
    pub fn accepting_empty(mut self) -> Self {
        self.accepts_empty = true;
        self
    }
}

impl<R, F> CombineStrategy<R> for FnCombine<R, F>
where
    F: Fn(&mut dyn Iterator<Item = R>) -> anyhow::Result<R> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn accepts_empty(&self) -> bool {
        self.accepts_empty
    }

    fn combine(&self, results: &mut dyn Iterator<Item = R>) -> Result<R> {
        (self.combine)(results)
            .map_err(|e| Error::CombineSignature(format!("合并策略 `{}` 失败: {:#}", self.name, e)))
    }
}

pub fn combine_with_fn<R, F>(name: &str, combine: F) -> FnCombine<R, F>
where
    F: Fn(&mut dyn Iterator<Item = R>) -> anyhow::Result<R> + Send + Sync,
{
    FnCombine {
        name: name.to_string(),
        accepts_empty: false,
        combine,
        _result: PhantomData,
    }
}

/// 绑定了合并策略的结果合并器
pub struct ResultMerger<R> {
    combiner: Arc<dyn CombineStrategy<R>>,
}

impl<R> Clone for ResultMerger<R> {
    fn clone(&self) -> Self {
        Self {
            combiner: Arc::clone(&self.combiner),
        }
    }
}

impl<R> ResultMerger<R> {
    pub fn new(combiner: Arc<dyn CombineStrategy<R>>) -> Self {
        Self { combiner }
    }

    pub fn combiner_name(&self) -> &str {
        self.combiner.name()
    }

    /// 合并已按下标排好序的结果
    pub fn merge(&self, results: impl Iterator<Item = R>) -> Result<R> {
        let mut results = results.peekable();
        self.merge_peekable(&mut results)
    }

    fn merge_peekable<I: Iterator<Item = R>>(&self, results: &mut Peekable<I>) -> Result<R> {
        if results.peek().is_none() && !self.combiner.accepts_empty() {
            return Err(Error::CombineSignature(format!(
                "合并策略 `{}` 不能合并零个分区结果",
                self.combiner.name()
            )));
        }
        self.combiner.combine(results)
    }

    /// 计时合并：`results` 按下标顺序产出 (下标, 结果)，遇到错误即停止。
    ///
    /// 每个结果交给合并策略后到合并策略拉取下一个结果之间的时间记为该分区的合并耗时，
    /// 通过 `on_combined(下标, 纳秒)` 报告。上游错误优先于合并策略自身的错误返回。
    pub fn merge_timed<I, F>(&self, results: I, mut on_combined: F) -> Result<R>
    where
        I: Iterator<Item = Result<(usize, R)>>,
        F: FnMut(usize, u64),
    {
        let mut failure = None;
        let merged = {
            let timed = TimedResults {
                inner: results,
                failure: &mut failure,
                last: None,
                on_combined: &mut on_combined,
            };
            let mut timed = timed.peekable();
            let merged = self.merge_peekable(&mut timed);
            drop(timed);
            merged
        };
        match failure {
            Some(err) => Err(err),
            None => merged,
        }
    }
}

struct TimedResults<'a, I> {
    inner: I,
    failure: &'a mut Option<Error>,
    last: Option<(usize, Instant)>,
    on_combined: &'a mut dyn FnMut(usize, u64),
}

impl<'a, I> TimedResults<'a, I> {
    fn finish_last(&mut self) {
        if let Some((index, started)) = self.last.take() {
            (self.on_combined)(index, started.elapsed().as_nanos() as u64);
        }
    }
}

impl<'a, I, R> Iterator for TimedResults<'a, I>
where
    I: Iterator<Item = Result<(usize, R)>>,
{
    type Item = R;

    fn next(&mut self) -> Option<R> {
        self.finish_last();
        if self.failure.is_some() {
            return None;
        }
        match self.inner.next()? {
            Ok((index, value)) => {
                self.last = Some((index, Instant::now()));
                Some(value)
            }
            Err(err) => {
                *self.failure = Some(err);
                None
            }
        }
    }
}

impl<'a, I> Drop for TimedResults<'a, I> {
    fn drop(&mut self) {
        self.finish_last();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::Cell;

    #[test]
    fn test_list_concat_preserves_order() {
        let merger: ResultMerger<Vec<i64>> = ResultMerger::new(Arc::new(ListConcat::<i64>::new()));
        let merged = merger
            .merge(vec![vec![2, 4, 6], vec![8, 10, 12], vec![14, 16, 18]].into_iter())
            .unwrap();
        assert_eq!(merged, vec![2, 4, 6, 8, 10, 12, 14, 16, 18]);
        assert_eq!(merger.merge(std::iter::empty()).unwrap(), Vec::<i64>::new());
    }

    #[test]
    fn test_empty_without_identity_is_rejected() {
        let merger: ResultMerger<Table> = ResultMerger::new(Arc::new(TableConcat));
        assert!(matches!(
            merger.merge(std::iter::empty()),
            Err(Error::CombineSignature(_))
        ));
    }

    #[test]
    fn test_table_concat_schema_mismatch() {
        let merger: ResultMerger<Table> = ResultMerger::new(Arc::new(TableConcat));
        let a = Table::new(["x"]).with_row(vec![Cell::Int(1)]).unwrap();
        let b = Table::new(["y"]).with_row(vec![Cell::Int(2)]).unwrap();
        assert!(matches!(
            merger.merge(vec![a, b].into_iter()),
            Err(Error::CombineSignature(_))
        ));
    }

    #[test]
    fn test_fn_combine_maps_errors() {
        let max = combine_with_fn("max", |results: &mut dyn Iterator<Item = i64>| {
            results.max().ok_or_else(|| anyhow::anyhow!("no results"))
        });
        let merger: ResultMerger<i64> = ResultMerger::new(Arc::new(max));
        assert_eq!(merger.merge(vec![3, 9, 4].into_iter()).unwrap(), 9);

        let failing = combine_with_fn("reject", |_: &mut dyn Iterator<Item = i64>| {
            anyhow::bail!("wrong shape")
        })
        .accepting_empty();
        let merger: ResultMerger<i64> = ResultMerger::new(Arc::new(failing));
        assert!(matches!(
            merger.merge(std::iter::empty()),
            Err(Error::CombineSignature(_))
        ));
    }

    #[test]
    fn test_merge_timed_reports_every_partition() {
        let merger: ResultMerger<i64> = ResultMerger::new(Arc::new(Sum::<i64>::new()));
        let mut combined = Vec::new();
        let total = merger
            .merge_timed((0..4).map(|i| Ok((i, i as i64 * 10))), |index, _| {
                combined.push(index)
            })
            .unwrap();
        assert_eq!(total, 60);
        assert_eq!(combined, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_merge_timed_stops_at_failure() {
        let merger: ResultMerger<Vec<i64>> = ResultMerger::new(Arc::new(ListConcat::<i64>::new()));
        let results = vec![
            Ok((0, vec![1])),
            Err(Error::task_execution(1, anyhow::anyhow!("boom"))),
            Ok((2, vec![3])),
        ];
        let mut combined = Vec::new();
        let err = merger
            .merge_timed(results.into_iter(), |index, _| combined.push(index))
            .unwrap_err();
        assert_eq!(err.partition_index(), Some(1));
        assert_eq!(combined, vec![0]);
    }
}
