// parallel_function.rs
// 并行函数：用户入口。把一次调用拆成分区任务提交给当前后端，按顺序合并结果，并把计时反馈给分区大小估计器。
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::backend::{create_backend, Backend};
use crate::config::{EstimatorConfig, SchedulerConfig};
use crate::context;
use crate::error::{Error, Result};
use crate::estimator::{EstimatorHandle, EstimatorRegistry};
use crate::profiler::{export_trace, print_profile, ExecutionProfile, InvocationTrace, PartitionTrace};
use crate::result_merger::{CombineStrategy, ResultMerger};
use crate::scheduler::{TaskFn, TaskScheduler};
use crate::task::TaskResult;
use crate::task_executor::elapsed_ns;
use crate::task_splitter::{PartitionItem, PartitionSpec, PartitionStream, Sizing, TaskSplitter};
use crate::types::{FunctionSignature, NamedArgs};

type SizeFn = dyn Fn(&NamedArgs) -> usize + Send + Sync;

/// 分区大小：固定值，或由调用参数计算
#[derive(Clone)]
pub enum SizeHint {
    Value(usize),
    FromArgs(Arc<SizeFn>),
}

impl SizeHint {
    pub fn from_args<F>(f: F) -> Self
    where
        F: Fn(&NamedArgs) -> usize + Send + Sync + 'static,
    {
        SizeHint::FromArgs(Arc::new(f))
    }

    fn resolve(&self, args: &NamedArgs) -> usize {
        match self {
            SizeHint::Value(size) => *size,
            SizeHint::FromArgs(f) => f(args),
        }
        .max(1)
    }
}

impl From<usize> for SizeHint {
    fn from(size: usize) -> Self {
        SizeHint::Value(size)
    }
}

impl fmt::Debug for SizeHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SizeHint::Value(size) => write!(f, "SizeHint::Value({})", size),
            SizeHint::FromArgs(_) => write!(f, "SizeHint::FromArgs(..)"),
        }
    }
}

/// 可被分区执行的函数
pub struct ParallelFunction<R> {
    name: String,
    splitter: TaskSplitter,
    function: Arc<TaskFn<R>>,
    merger: ResultMerger<R>,
    fixed_partition_size: Option<SizeHint>,
    initial_partition_size: Option<SizeHint>,
    enable_profiling: bool,
    trace_export_path: Option<PathBuf>,
    estimator: EstimatorHandle,
    backend: Option<Arc<dyn Backend>>,
    last_profile: Mutex<Option<ExecutionProfile>>,
}

impl<R: Send + 'static> ParallelFunction<R> {
    /// `name` 同时是调用点标识，同名的并行函数共享同一个估计器
    pub fn builder(name: &str) -> ParallelFunctionBuilder<R> {
        ParallelFunctionBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn signature(&self) -> &FunctionSignature {
        self.splitter.signature()
    }

    pub fn estimator(&self) -> &EstimatorHandle {
        &self.estimator
    }

    /// 最近一次开启性能分析的调用的执行概况
    pub fn last_profile(&self) -> Option<ExecutionProfile> {
        self.last_profile
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// 调用函数。看起来就像一次同步的普通调用：任一分区失败时整个调用失败，不返回部分结果
    pub fn call(&self, args: NamedArgs) -> Result<R> {
        let bound = self.splitter.bind(args)?;
        match self.backend.clone().or_else(context::current_backend) {
            Some(backend) if context::nested_backend_allowed(backend.as_ref()) => {
                self.call_partitioned(backend, bound)
            }
            Some(backend) => {
                debug!(
                    function = %self.name,
                    backend = backend.name(),
                    "后端不支持嵌套调度，在当前任务内直接执行"
                );
                self.call_direct(bound)
            }
            None if context::is_inside_task() => {
                debug!(function = %self.name, "嵌套调用，在当前任务内直接执行");
                self.call_direct(bound)
            }
            None => {
                warn!(function = %self.name, "没有设置并行后端，按顺序执行");
                self.call_direct(bound)
            }
        }
    }

    /// 不分区，直接以完整参数调用函数
    fn call_direct(&self, args: NamedArgs) -> Result<R> {
        (self.function)(&args).map_err(|e| Error::task_execution(0, e))
    }

    fn sizing(&self, args: &NamedArgs) -> Sizing {
        if let Some(hint) = &self.fixed_partition_size {
            return Sizing::Fixed(hint.resolve(args));
        }
        Sizing::Estimated {
            estimator: self.estimator.clone(),
            initial: self.initial_partition_size.as_ref().map(|h| h.resolve(args)),
        }
    }

    fn call_partitioned(&self, backend: Arc<dyn Backend>, args: NamedArgs) -> Result<R> {
        let clock = Instant::now();
        let sizing = self.sizing(&args);
        let mut stream = self.splitter.split(args, sizing)?;
        let estimator = stream.estimator().cloned();
        let trace = RefCell::new(InvocationTrace::new());

        // 先取两个分区：不足两个时在调用线程内执行，不经过后端
        let mut prefetched = VecDeque::with_capacity(2);
        for item in stream.by_ref().take(2) {
            prefetched.push_back(item?);
        }

        let on_combined = |index: usize, combine_ns: u64| {
            let mut trace = trace.borrow_mut();
            if let Some(t) = trace.get_mut(index) {
                t.combine_ns = combine_ns;
                // 每个完整的分区原子地更新一次估计器
                if let Some(estimator) = &estimator {
                    estimator.add_sample(t.sample());
                }
            }
        };

        let merged = if prefetched.len() < 2 {
            let results: Vec<Result<(usize, R)>> = prefetched
                .into_iter()
                .map(|item| self.run_inline(item, &trace, clock))
                .collect();
            self.merger.merge_timed(results.into_iter(), on_combined)
        } else {
            let mut scheduler = TaskScheduler::with_clock(backend, Arc::clone(&self.function), clock);
            let scatter = Scatter {
                prefetched,
                stream,
                stream_done: false,
                scheduler: &mut scheduler,
                trace: &trace,
                clock,
            };
            match self.merger.merge_timed(scatter, on_combined) {
                Ok(value) => Ok(value),
                Err(err) => Err(scheduler.abort(err)),
            }
        };

        let trace = trace.into_inner();
        let value = merged?;
        self.finish(&trace, clock, estimator.as_ref())?;
        Ok(value)
    }

    fn run_inline(
        &self,
        item: PartitionItem,
        trace: &RefCell<InvocationTrace>,
        clock: Instant,
    ) -> Result<(usize, R)> {
        let mut partition = PartitionTrace::from_item(&item, elapsed_ns(clock));
        let start = Instant::now();
        let value = (self.function)(&item.args).map_err(|e| Error::task_execution(item.index, e));
        partition.compute_ns = start.elapsed().as_nanos() as u64;
        partition.task_ns = partition.compute_ns;
        trace.borrow_mut().push(partition);
        value.map(|v| (item.index, v))
    }

    /// `estimator` 仅在本次调用由估计器决定分区大小时存在，固定大小或自定义策略时不读取它
    fn finish(
        &self,
        trace: &InvocationTrace,
        clock: Instant,
        estimator: Option<&EstimatorHandle>,
    ) -> Result<()> {
        info!(
            function = %self.name,
            partitions = trace.partition_count(),
            elapsed_ms = clock.elapsed().as_millis() as u64,
            "并行函数调用完成"
        );

        if self.enable_profiling {
            let estimate = estimator.map(|estimator| {
                let estimate = estimator.peek();
                (estimate.value, estimator.phase(), estimate.coefficients)
            });
            let profile = ExecutionProfile::from_trace(&self.name, trace, estimate);
            print_profile(&mut io::stderr(), &profile)?;
            *self
                .last_profile
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(profile);
        }

        if let Some(path) = &self.trace_export_path {
            export_trace(path, trace)?;
            debug!(function = %self.name, path = %path.display(), "已导出分区追踪");
        }
        Ok(())
    }
}

/// 把分区流提交给调度器，并按分区下标顺序产出结果。
///
/// 每次拉取前先把已完成的队首结果交出去，再继续提交新分区，分区生成与合并因此交错进行。
struct Scatter<'a, R> {
    prefetched: VecDeque<PartitionItem>,
    stream: PartitionStream,
    stream_done: bool,
    scheduler: &'a mut TaskScheduler<R>,
    trace: &'a RefCell<InvocationTrace>,
    clock: Instant,
}

impl<'a, R: Send + 'static> Scatter<'a, R> {
    fn next_partition(&mut self) -> Option<Result<PartitionItem>> {
        match self.prefetched.pop_front() {
            Some(item) => Some(Ok(item)),
            None => self.stream.next(),
        }
    }

    fn submit(&mut self, item: PartitionItem) -> Result<()> {
        let partition = PartitionTrace::from_item(&item, elapsed_ns(self.clock));
        let mut task = self.scheduler.create_task(item.index, item.size, item.args);
        task.requested_size = item.requested_size;
        self.trace.borrow_mut().push(partition);
        self.scheduler.submit_task(task)
    }

    fn accept(&self, result: TaskResult<R>) -> Result<(usize, R)> {
        if let Some(t) = self.trace.borrow_mut().get_mut(result.index) {
            t.record_task(&result);
        }
        result.value.map(|v| (result.index, v))
    }
}

impl<'a, R: Send + 'static> Iterator for Scatter<'a, R> {
    type Item = Result<(usize, R)>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.stream_done {
            if let Some(result) = self.scheduler.try_next_result() {
                return Some(self.accept(result));
            }
            match self.next_partition() {
                Some(Ok(item)) => {
                    if let Err(err) = self.submit(item) {
                        self.stream_done = true;
                        return Some(Err(err));
                    }
                }
                Some(Err(err)) => {
                    self.stream_done = true;
                    return Some(Err(err));
                }
                None => self.stream_done = true,
            }
        }
        let result = self.scheduler.next_result()?;
        Some(self.accept(result))
    }
}

/// [`ParallelFunction`] 构建器
pub struct ParallelFunctionBuilder<R> {
    name: String,
    signature: Option<Result<FunctionSignature>>,
    function: Option<Arc<TaskFn<R>>>,
    spec: Option<PartitionSpec>,
    combiner: Option<Arc<dyn CombineStrategy<R>>>,
    fixed_partition_size: Option<SizeHint>,
    initial_partition_size: Option<SizeHint>,
    enable_profiling: bool,
    trace_export_path: Option<PathBuf>,
    estimator_config: EstimatorConfig,
    estimator: Option<EstimatorHandle>,
    backend: Option<Arc<dyn Backend>>,
    backend_name: Option<(String, usize)>,
}

impl<R: Send + 'static> ParallelFunctionBuilder<R> {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            signature: None,
            function: None,
            spec: None,
            combiner: None,
            fixed_partition_size: None,
            initial_partition_size: None,
            enable_profiling: false,
            trace_export_path: None,
            estimator_config: EstimatorConfig::default(),
            estimator: None,
            backend: None,
            backend_name: None,
        }
    }

    /// 函数的参数名列表
    pub fn signature<S: Into<String>>(mut self, params: impl IntoIterator<Item = S>) -> Self {
        self.signature = Some(FunctionSignature::new(params));
        self
    }

    pub fn function<F>(mut self, function: F) -> Self
    where
        F: Fn(&NamedArgs) -> anyhow::Result<R> + Send + Sync + 'static,
    {
        self.function = Some(Arc::new(function));
        self
    }

    pub fn partition(mut self, spec: PartitionSpec) -> Self {
        self.spec = Some(spec);
        self
    }

    pub fn combine<C: CombineStrategy<R> + 'static>(mut self, combiner: C) -> Self {
        self.combiner = Some(Arc::new(combiner));
        self
    }

    /// 固定分区大小，不使用估计器
    pub fn fixed_partition_size(mut self, size: impl Into<SizeHint>) -> Self {
        self.fixed_partition_size = Some(size.into());
        self
    }

    /// 估计器仍在学习时，每次调用第一个分区使用的大小
    pub fn initial_partition_size(mut self, size: impl Into<SizeHint>) -> Self {
        self.initial_partition_size = Some(size.into());
        self
    }

    pub fn profile(mut self, enable: bool) -> Self {
        self.enable_profiling = enable;
        self
    }

    pub fn trace_export_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.trace_export_path = Some(path.into());
        self
    }

    pub fn estimator_config(mut self, config: EstimatorConfig) -> Self {
        self.estimator_config = config;
        self
    }

    /// 使用给定的估计器，而不是全局注册表中按名称共享的估计器
    pub fn estimator(mut self, estimator: EstimatorHandle) -> Self {
        self.estimator = Some(estimator);
        self
    }

    /// 从注册表中按名称取得（或创建）估计器
    pub fn registry(mut self, registry: &EstimatorRegistry) -> Self {
        let config = self.estimator_config.clone();
        self.estimator = Some(
            registry.get_or_insert_with(&self.name, || EstimatorHandle::linear_regression(config)),
        );
        self
    }

    /// 固定使用某个后端，忽略执行上下文中的后端
    pub fn backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// 应用调度器配置：分区大小、性能分析、追踪导出、估计器参数和后端
    pub fn config(mut self, config: &SchedulerConfig) -> Self {
        if let Some(size) = config.fixed_partition_size {
            self.fixed_partition_size = Some(SizeHint::Value(size));
        }
        if let Some(size) = config.initial_partition_size {
            self.initial_partition_size = Some(SizeHint::Value(size));
        }
        self.enable_profiling = config.enable_profiling;
        self.trace_export_path = config.trace_export_path.clone();
        self.estimator_config = config.estimator.clone();
        self.backend_name = Some((config.backend.clone(), config.max_workers));
        self
    }

    pub fn build(self) -> Result<ParallelFunction<R>> {
        let name = self.name;
        let missing = |what: &str| Error::Config(format!("并行函数 `{}` 缺少{}", name, what));
        let signature = self.signature.ok_or_else(|| missing("函数签名"))??;
        let function = self.function.ok_or_else(|| missing("函数体"))?;
        let spec = self.spec.ok_or_else(|| missing("分区规格"))?;
        let combiner = self.combiner.ok_or_else(|| missing("合并策略"))?;

        if self.fixed_partition_size.is_some() && self.initial_partition_size.is_some() {
            return Err(Error::Config(
                "fixed_partition_size 与 initial_partition_size 不能同时设置".to_string(),
            ));
        }
        for hint in [&self.fixed_partition_size, &self.initial_partition_size]
            .into_iter()
            .flatten()
        {
            if let SizeHint::Value(0) = hint {
                return Err(Error::Config("分区大小必须大于 0".to_string()));
            }
        }
        self.estimator_config.validate()?;

        let splitter = TaskSplitter::new(signature, spec)?;
        let backend = match (self.backend, self.backend_name) {
            (Some(backend), _) => Some(backend),
            (None, Some((name, max_workers))) => create_backend(&name, max_workers)?,
            (None, None) => None,
        };
        let estimator_config = self.estimator_config;
        let estimator = self.estimator.unwrap_or_else(|| {
            EstimatorRegistry::global()
                .get_or_insert_with(&name, || EstimatorHandle::linear_regression(estimator_config))
        });

        Ok(ParallelFunction {
            name,
            splitter,
            function,
            merger: ResultMerger::new(combiner),
            fixed_partition_size: self.fixed_partition_size,
            initial_partition_size: self.initial_partition_size,
            enable_profiling: self.enable_profiling,
            trace_export_path: self.trace_export_path,
            estimator,
            backend,
            last_profile: Mutex::new(None),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{SequentialBackend, ThreadPoolBackend};
    use crate::partition::{CustomStrategy, ListChunks};
    use crate::result_merger::ListConcat;
    use crate::types::ArgValue;

    fn doubler(name: &str) -> ParallelFunctionBuilder<Vec<i64>> {
        ParallelFunction::builder(name)
            .signature(["values"])
            .function(|args: &NamedArgs| -> anyhow::Result<Vec<i64>> {
                Ok(args.get::<Vec<i64>>("values")?.iter().map(|v| v * 2).collect())
            })
            .partition(PartitionSpec::all(ListChunks::<i64>::new()))
            .combine(ListConcat::<i64>::new())
            .estimator(EstimatorHandle::linear_regression(EstimatorConfig::default()))
    }

    #[test]
    fn test_build_requires_parts() {
        let result = ParallelFunction::<i64>::builder("incomplete").build();
        assert!(matches!(result, Err(Error::Config(_))));

        let both = doubler("both")
            .fixed_partition_size(2)
            .initial_partition_size(2)
            .build();
        assert!(matches!(both, Err(Error::Config(_))));
    }

    #[test]
    fn test_call_without_backend_runs_directly() {
        let f = doubler("no_backend").fixed_partition_size(2).build().unwrap();
        let out = f.call(NamedArgs::new().with("values", vec![1i64, 2, 3])).unwrap();
        assert_eq!(out, vec![2, 4, 6]);
    }

    #[test]
    fn test_call_on_pool_records_profile() {
        let backend: Arc<dyn Backend> = Arc::new(ThreadPoolBackend::new(2).unwrap());
        let f = doubler("pool_profile")
            .fixed_partition_size(3)
            .backend(backend)
            .profile(true)
            .build()
            .unwrap();
        let out = f
            .call(NamedArgs::new().with("values", (1..=9i64).collect::<Vec<_>>()))
            .unwrap();
        assert_eq!(out, (1..=9i64).map(|v| v * 2).collect::<Vec<_>>());
        let profile = f.last_profile().unwrap();
        assert_eq!(profile.partition_count, 3);
        assert!(profile.estimated_partition_size.is_none());
    }

    #[test]
    fn test_custom_strategy_profile_skips_estimator() {
        let halves = CustomStrategy::new("halves", 1, |args: &NamedArgs| {
            let values = args.get::<Vec<i64>>("values")?.clone();
            let mid = values.len() / 2;
            Ok(vec![
                vec![ArgValue::new(values[..mid].to_vec())],
                vec![ArgValue::new(values[mid..].to_vec())],
            ]
            .into_iter())
        });
        let backend: Arc<dyn Backend> = Arc::new(ThreadPoolBackend::new(2).unwrap());
        let estimator = EstimatorHandle::linear_regression(EstimatorConfig::default());
        let f = doubler("custom_profile")
            .partition(PartitionSpec::all(halves))
            .estimator(estimator.clone())
            .backend(backend)
            .profile(true)
            .build()
            .unwrap();
        let out = f
            .call(NamedArgs::new().with("values", vec![1i64, 2, 3, 4]))
            .unwrap();
        assert_eq!(out, vec![2, 4, 6, 8]);
        let profile = f.last_profile().unwrap();
        assert_eq!(profile.partition_count, 2);
        assert!(profile.estimated_partition_size.is_none());
        assert!(profile.estimator_phase.is_none());
        assert_eq!(estimator.snapshot().0, 0);
    }

    #[test]
    fn test_estimated_call_profile_reports_estimator() {
        let backend: Arc<dyn Backend> = Arc::new(ThreadPoolBackend::new(2).unwrap());
        let f = doubler("estimated_profile")
            .initial_partition_size(2)
            .backend(backend)
            .profile(true)
            .build()
            .unwrap();
        f.call(NamedArgs::new().with("values", (1..=8i64).collect::<Vec<_>>()))
            .unwrap();
        let profile = f.last_profile().unwrap();
        assert!(profile.estimated_partition_size.is_some());
    }

    #[test]
    fn test_single_partition_skips_backend() {
        let backend: Arc<dyn Backend> = Arc::new(SequentialBackend::new());
        backend.shutdown();
        let f = doubler("single").fixed_partition_size(10).backend(backend).build().unwrap();
        let out = f.call(NamedArgs::new().with("values", vec![5i64])).unwrap();
        assert_eq!(out, vec![10]);
    }

    #[test]
    fn test_size_hint_from_args() {
        let hint = SizeHint::from_args(|args: &NamedArgs| {
            args.get::<Vec<i64>>("values").map(|v| v.len() / 2).unwrap_or(1)
        });
        let args = NamedArgs::new().with("values", vec![0i64; 8]);
        assert_eq!(hint.resolve(&args), 4);
        assert_eq!(SizeHint::Value(0).resolve(&args), 1);
    }

    #[test]
    fn test_unknown_argument_at_call() {
        let f = doubler("unknown").build().unwrap();
        let err = f.call(NamedArgs::new().with("nope", 1i64)).unwrap_err();
        assert!(matches!(err, Error::UnknownArgument(_)));
    }
}
