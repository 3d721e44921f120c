// task_executor.rs
// 工作端的任务执行包装：检查取消标记、建立任务上下文、计时并把用户函数的错误或 panic 转换为任务结果。
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use crate::backend::Backend;
use crate::context::TaskScope;
use crate::error::Error;
use crate::scheduler::{CancellationToken, TaskFn};
use crate::task::{Task, TaskResult};

pub struct TaskExecutor<R> {
    function: Arc<TaskFn<R>>,
    backend: Arc<dyn Backend>,
    token: Arc<CancellationToken>,
    clock: Instant,
}

impl<R> Clone for TaskExecutor<R> {
    fn clone(&self) -> Self {
        Self {
            function: Arc::clone(&self.function),
            backend: Arc::clone(&self.backend),
            token: Arc::clone(&self.token),
            clock: self.clock,
        }
    }
}

impl<R> TaskExecutor<R> {
    pub fn new(
        function: Arc<TaskFn<R>>,
        backend: Arc<dyn Backend>,
        token: Arc<CancellationToken>,
        clock: Instant,
    ) -> Self {
        Self {
            function,
            backend,
            token,
            clock,
        }
    }

    /// 在当前线程执行一个分区任务。开始前已被取消的任务不会调用用户函数
    pub fn execute(&self, task: Task, enqueued_at_ns: u64) -> TaskResult<R> {
        let started_at_ns = elapsed_ns(self.clock);
        if self.token.is_cancelled() {
            return TaskResult {
                index: task.index,
                value: Err(Error::TaskCancelled(task.index)),
                compute_ns: 0,
                task_ns: 0,
                enqueued_at_ns,
                started_at_ns,
            };
        }

        let start = Instant::now();
        let outcome = {
            let _scope = TaskScope::enter(&self.backend);
            panic::catch_unwind(AssertUnwindSafe(|| (self.function)(&task.args)))
        };
        let compute_ns = start.elapsed().as_nanos() as u64;

        let value = match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(Error::task_execution(task.index, err)),
            Err(payload) => Err(Error::task_execution(
                task.index,
                anyhow::anyhow!("任务 panic: {}", panic_message(payload.as_ref())),
            )),
        };
        if value.is_err() {
            self.token.record_failure(task.index);
        }

        TaskResult {
            index: task.index,
            value,
            compute_ns,
            task_ns: compute_ns + self.backend.scheduling_overhead_ns(),
            enqueued_at_ns,
            started_at_ns,
        }
    }
}

pub(crate) fn elapsed_ns(clock: Instant) -> u64 {
    clock.elapsed().as_nanos() as u64
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "未知 panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SequentialBackend;
    use crate::types::NamedArgs;
    use uuid::Uuid;

    fn executor(function: Arc<TaskFn<i64>>) -> (TaskExecutor<i64>, Arc<CancellationToken>) {
        let token = Arc::new(CancellationToken::new());
        let backend: Arc<dyn Backend> = Arc::new(SequentialBackend::new());
        (
            TaskExecutor::new(function, backend, Arc::clone(&token), Instant::now()),
            token,
        )
    }

    fn task(index: usize, x: i64) -> Task {
        Task::new(Uuid::new_v4(), index, 1, NamedArgs::new().with("x", x))
    }

    #[test]
    fn test_execute_adds_backend_overhead() {
        let (exec, _) = executor(Arc::new(|args: &NamedArgs| -> anyhow::Result<i64> {
            Ok(args.get::<i64>("x")? * 2)
        }));
        let result = exec.execute(task(0, 21), 0);
        assert_eq!(result.value.unwrap(), 42);
        assert!(result.task_ns >= result.compute_ns + SequentialBackend::SCHEDULING_OVERHEAD_NS);
    }

    #[test]
    fn test_failure_records_and_cancels() {
        let (exec, token) = executor(Arc::new(|_: &NamedArgs| -> anyhow::Result<i64> {
            anyhow::bail!("bad partition")
        }));
        let result = exec.execute(task(3, 1), 0);
        assert_eq!(result.value.unwrap_err().partition_index(), Some(3));
        assert!(token.is_cancelled());
        assert_eq!(token.first_failure(), Some(3));

        let skipped = exec.execute(task(4, 1), 0);
        assert!(matches!(skipped.value, Err(Error::TaskCancelled(4))));
    }

    #[test]
    fn test_panic_becomes_task_error() {
        let (exec, _) = executor(Arc::new(|_: &NamedArgs| -> anyhow::Result<i64> { panic!("kaboom") }));
        let err = exec.execute(task(1, 1), 0).value.unwrap_err();
        assert!(err.to_string().contains("kaboom"));
    }
}
