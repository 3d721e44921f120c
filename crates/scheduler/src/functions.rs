// functions.rs
// parallel_map 辅助函数：每个元素一个任务提交给当前后端，按输入顺序惰性地产出结果。
use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::context;
use crate::error::{Error, Result};
use crate::scheduler::{TaskFn, TaskScheduler};
use crate::types::NamedArgs;

const ITEM: &str = "item";

enum Runner<R> {
    Sequential(Arc<TaskFn<R>>),
    Backend(TaskScheduler<R>),
}

/// `parallel_map` 返回的惰性结果序列。
///
/// 输入在结果被拉取时才逐个提交，已完成的队首结果优先产出。任一元素失败后取消其余任务，
/// 序列产出该失败后结束。
pub struct ParallelMap<I, R> {
    items: I,
    next_index: usize,
    items_done: bool,
    failed: bool,
    runner: Runner<R>,
}

impl<I, T, R> ParallelMap<I, R>
where
    I: Iterator<Item = T>,
    T: Any + Send + Sync,
    R: Send + 'static,
{
    fn new<F>(f: F, items: I) -> Self
    where
        F: Fn(&T) -> anyhow::Result<R> + Send + Sync + 'static,
    {
        let function: Arc<TaskFn<R>> = Arc::new(move |args: &NamedArgs| f(args.get::<T>(ITEM)?));
        let runner = match context::current_backend() {
            Some(backend) if context::nested_backend_allowed(backend.as_ref()) => {
                Runner::Backend(TaskScheduler::new(backend, function))
            }
            Some(_) => Runner::Sequential(function),
            None => {
                if !context::is_inside_task() {
                    warn!("没有设置并行后端，parallel_map 按顺序执行");
                }
                Runner::Sequential(function)
            }
        };
        Self {
            items,
            next_index: 0,
            items_done: false,
            failed: false,
            runner,
        }
    }

    fn next_timed(&mut self) -> Option<Result<(R, u64)>> {
        if self.failed {
            return None;
        }
        let out = match &mut self.runner {
            Runner::Sequential(function) => {
                let item = self.items.next()?;
                let index = self.next_index;
                self.next_index += 1;
                let start = Instant::now();
                let value = function(&NamedArgs::new().with(ITEM, item));
                let elapsed = start.elapsed().as_nanos() as u64;
                value
                    .map(|v| (v, elapsed))
                    .map_err(|e| Error::task_execution(index, e))
            }
            Runner::Backend(scheduler) => {
                let result = loop {
                    if self.items_done {
                        break scheduler.next_result()?;
                    }
                    if let Some(result) = scheduler.try_next_result() {
                        break result;
                    }
                    match self.items.next() {
                        Some(item) => {
                            let task = scheduler.create_task(
                                self.next_index,
                                1,
                                NamedArgs::new().with(ITEM, item),
                            );
                            self.next_index += 1;
                            if let Err(err) = scheduler.submit_task(task) {
                                self.failed = true;
                                return Some(Err(scheduler.abort(err)));
                            }
                        }
                        None => self.items_done = true,
                    }
                };
                match result.value {
                    Ok(value) => Ok((value, result.task_ns)),
                    Err(err) => Err(scheduler.abort(err)),
                }
            }
        };
        if out.is_err() {
            self.failed = true;
        }
        Some(out)
    }
}

impl<I, T, R> Iterator for ParallelMap<I, R>
where
    I: Iterator<Item = T>,
    T: Any + Send + Sync,
    R: Send + 'static,
{
    type Item = Result<R>;

    fn next(&mut self) -> Option<Result<R>> {
        self.next_timed().map(|r| r.map(|(value, _)| value))
    }
}

/// [`parallel_timed_map`] 返回的序列，额外产出每个元素的任务耗时
pub struct ParallelTimedMap<I, R>(ParallelMap<I, R>);

impl<I, T, R> Iterator for ParallelTimedMap<I, R>
where
    I: Iterator<Item = T>,
    T: Any + Send + Sync,
    R: Send + 'static,
{
    type Item = Result<(R, Duration)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.0
            .next_timed()
            .map(|r| r.map(|(value, ns)| (value, Duration::from_nanos(ns))))
    }
}

/// 对每个元素调用 `f`，使用当前后端并行执行，结果按输入顺序产出。没有后端时按顺序执行
pub fn parallel_map<T, R, F, I>(f: F, items: I) -> ParallelMap<I::IntoIter, R>
where
    I: IntoIterator<Item = T>,
    T: Any + Send + Sync,
    R: Send + 'static,
    F: Fn(&T) -> anyhow::Result<R> + Send + Sync + 'static,
{
    ParallelMap::new(f, items.into_iter())
}

/// 与 [`parallel_map`] 相同，同时返回每个元素的任务耗时（包含后端的调度开销）
pub fn parallel_timed_map<T, R, F, I>(f: F, items: I) -> ParallelTimedMap<I::IntoIter, R>
where
    I: IntoIterator<Item = T>,
    T: Any + Send + Sync,
    R: Send + 'static,
    F: Fn(&T) -> anyhow::Result<R> + Send + Sync + 'static,
{
    ParallelTimedMap(ParallelMap::new(f, items.into_iter()))
}
