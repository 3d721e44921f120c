// scheduler.rs
// 任务调度器：把分区任务提交给后端，按分区下标顺序收集结果，任一分区失败时取消尚未开始的兄弟任务。
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex, PoisonError};
use std::time::Instant;

use tracing::debug;
use uuid::Uuid;

use crate::backend::Backend;
use crate::error::{Error, Result};
use crate::task::{Task, TaskResult};
use crate::task_executor::{elapsed_ns, TaskExecutor};
use crate::types::NamedArgs;

/// 被分区执行的用户函数
pub type TaskFn<R> = dyn Fn(&NamedArgs) -> anyhow::Result<R> + Send + Sync;

/// 一次调用内所有任务共享的取消状态，记录最先观察到的失败分区
#[derive(Debug, Default)]
pub struct CancellationToken {
    cancelled: AtomicBool,
    first_failure: Mutex<Option<usize>>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// 记录失败并取消其余任务，只保留第一次失败
    pub fn record_failure(&self, index: usize) {
        let mut first = self
            .first_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if first.is_none() {
            *first = Some(index);
        }
        self.cancel();
    }

    pub fn first_failure(&self) -> Option<usize> {
        *self
            .first_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// 已提交任务的句柄，结果经由通道回传
pub struct TaskHandle<R> {
    index: usize,
    receiver: mpsc::Receiver<TaskResult<R>>,
}

impl<R> TaskHandle<R> {
    pub fn index(&self) -> usize {
        self.index
    }

    /// 阻塞等待任务结果
    pub fn wait(self) -> TaskResult<R> {
        match self.receiver.recv() {
            Ok(result) => result,
            Err(_) => TaskResult {
                index: self.index,
                value: Err(Error::Backend(format!(
                    "分区 {} 的结果丢失，后端在执行前丢弃了任务",
                    self.index
                ))),
                compute_ns: 0,
                task_ns: 0,
                enqueued_at_ns: 0,
                started_at_ns: 0,
            },
        }
    }
}

/// 单次调用的任务调度器
pub struct TaskScheduler<R> {
    invocation_id: Uuid,
    backend: Arc<dyn Backend>,
    executor: TaskExecutor<R>,
    token: Arc<CancellationToken>,
    clock: Instant,
    /// 按提交顺序（即分区下标顺序）排列的在途任务
    pending: VecDeque<TaskHandle<R>>,
    submitted: usize,
}

impl<R: Send + 'static> TaskScheduler<R> {
    pub fn new(backend: Arc<dyn Backend>, function: Arc<TaskFn<R>>) -> Self {
        Self::with_clock(backend, function, Instant::now())
    }

    /// `clock` 为调用开始时刻，任务的入队/出队时间都相对它计算
    pub fn with_clock(backend: Arc<dyn Backend>, function: Arc<TaskFn<R>>, clock: Instant) -> Self {
        let token = Arc::new(CancellationToken::new());
        let executor = TaskExecutor::new(function, Arc::clone(&backend), Arc::clone(&token), clock);
        Self {
            invocation_id: Uuid::new_v4(),
            backend,
            executor,
            token,
            clock,
            pending: VecDeque::new(),
            submitted: 0,
        }
    }

    pub fn invocation_id(&self) -> Uuid {
        self.invocation_id
    }

    pub fn token(&self) -> &Arc<CancellationToken> {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// 为本次调用创建任务
    pub fn create_task(&self, index: usize, partition_size: usize, args: NamedArgs) -> Task {
        Task::new(self.invocation_id, index, partition_size, args)
    }

    /// 提交任务并返回句柄。后端容量耗尽时阻塞
    pub fn submit(&self, task: Task) -> Result<TaskHandle<R>> {
        if self.token.is_cancelled() {
            return Err(Error::TaskCancelled(task.index));
        }
        let index = task.index;
        let (sender, receiver) = mpsc::sync_channel(1);
        let executor = self.executor.clone();
        let enqueued_at_ns = elapsed_ns(self.clock);
        self.backend.submit(Box::new(move || {
            let result = executor.execute(task, enqueued_at_ns);
            // 接收端已放弃等待时丢弃结果
            let _ = sender.send(result);
        }))?;
        Ok(TaskHandle { index, receiver })
    }

    /// 提交任务并加入按顺序收集的队列
    pub fn submit_task(&mut self, task: Task) -> Result<()> {
        let handle = self.submit(task)?;
        self.pending.push_back(handle);
        self.submitted += 1;
        Ok(())
    }

    pub fn submitted(&self) -> usize {
        self.submitted
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// 按下标顺序取出下一个结果，阻塞直到该任务完成
    pub fn next_result(&mut self) -> Option<TaskResult<R>> {
        self.pending.pop_front().map(TaskHandle::wait)
    }

    /// 队首任务已完成时取出其结果，不阻塞
    pub fn try_next_result(&mut self) -> Option<TaskResult<R>> {
        let ready = match self.pending.front()?.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(mpsc::TryRecvError::Empty) => return None,
            Err(mpsc::TryRecvError::Disconnected) => None,
        };
        let handle = self.pending.pop_front()?;
        Some(match ready {
            Some(result) => result,
            None => handle.wait(),
        })
    }

    /// 等待所有句柄，按分区下标排序返回；任一分区失败时返回最先观察到的失败
    pub fn wait_all(&self, handles: Vec<TaskHandle<R>>) -> Result<Vec<TaskResult<R>>> {
        let mut results: Vec<TaskResult<R>> = handles.into_iter().map(TaskHandle::wait).collect();
        results.sort_by_key(|r| r.index);

        if results.iter().any(|r| r.value.is_err()) {
            self.token.cancel();
            let errors = results.into_iter().filter_map(|r| r.value.err()).collect();
            return Err(self.select_failure(errors));
        }
        Ok(results)
    }

    /// 观察到失败后取消尚未开始的任务，等待在途任务结束，返回最先观察到的失败
    pub fn abort(&mut self, observed: Error) -> Error {
        self.token.cancel();
        let mut errors = vec![observed];
        let mut cancelled = 0usize;
        while let Some(result) = self.next_result() {
            match result.value {
                Err(Error::TaskCancelled(_)) => cancelled += 1,
                Err(e) => errors.push(e),
                Ok(_) => {}
            }
        }
        debug!(
            invocation = %self.invocation_id,
            cancelled,
            "调用失败，已取消未开始的分区"
        );
        self.select_failure(errors)
    }

    fn select_failure(&self, mut errors: Vec<Error>) -> Error {
        let first = self.token.first_failure();
        let pos = errors
            .iter()
            .position(|e| matches!(e, Error::TaskExecution { index, .. } if Some(*index) == first))
            .or_else(|| {
                errors
                    .iter()
                    .position(|e| !matches!(e, Error::TaskCancelled(_)))
            })
            .unwrap_or(0);
        errors.swap_remove(pos)
    }
}

impl<R> Drop for TaskScheduler<R> {
    fn drop(&mut self) {
        // 调用提前返回时，避免留下的任务继续运行用户函数
        if !self.pending.is_empty() {
            self.token.cancel();
        }
    }
}
