// backend.rs
// 后端能力契约与三种本地后端：调用线程内顺序执行、固定大小线程池、每任务一个线程。
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::error::{Error, Result};

/// 提交给后端的作业，结果由调度器通过自己的通道回传
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// 可识别的后端名称
pub const BACKEND_NAMES: &[&str] = &[
    "none",
    "local_single_process",
    "local_thread_pool",
    "local_thread_per_task",
];

/// 后端类型标签
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendKind {
    LocalSequential,
    LocalPool,
    RemotePool,
}

/// 后端能力契约
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> BackendKind;

    /// 提交作业。容量耗尽时阻塞，对分区扇出形成自然的背压
    fn submit(&self, job: Job) -> Result<()>;

    /// 工作端能否自己提交并等待子任务而不会让线程池死锁
    fn supports_nested_scheduling(&self) -> bool;

    /// 测量任务耗时时无法计入的固定调度开销（纳秒）
    fn scheduling_overhead_ns(&self) -> u64 {
        0
    }

    fn shutdown(&self);
}

/// 按名称创建后端，"none" 返回 None
pub fn create_backend(name: &str, max_workers: usize) -> Result<Option<Arc<dyn Backend>>> {
    let backend: Arc<dyn Backend> = match name {
        "none" => return Ok(None),
        "local_single_process" => Arc::new(SequentialBackend::new()),
        "local_thread_pool" => Arc::new(ThreadPoolBackend::new(max_workers)?),
        "local_thread_per_task" => Arc::new(ThreadPerTaskBackend::new()),
        other => {
            return Err(Error::Config(format!(
                "不支持的后端 `{}`，可选: {}",
                other,
                BACKEND_NAMES.join(", ")
            )))
        }
    };
    info!(backend = name, max_workers, "创建并行后端");
    Ok(Some(backend))
}

/// 在调用线程内、提交时立即执行作业，主要用于调试
#[derive(Debug, Default)]
pub struct SequentialBackend {
    closed: AtomicBool,
}

impl SequentialBackend {
    /// 无法在任务耗时中测量到的固定调度开销：5 µs
    pub const SCHEDULING_OVERHEAD_NS: u64 = 5_000;

    pub fn new() -> Self {
        Self::default()
    }
}

impl Backend for SequentialBackend {
    fn name(&self) -> &str {
        "local_single_process"
    }

    fn kind(&self) -> BackendKind {
        BackendKind::LocalSequential
    }

    fn submit(&self, job: Job) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Backend("后端已关闭".to_string()));
        }
        job();
        Ok(())
    }

    fn supports_nested_scheduling(&self) -> bool {
        false
    }

    fn scheduling_overhead_ns(&self) -> u64 {
        Self::SCHEDULING_OVERHEAD_NS
    }

    fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// 有界的并发许可，实现提交端背压
struct Permits {
    available: Mutex<usize>,
    released: Condvar,
}

impl Permits {
    fn new(count: usize) -> Self {
        Self {
            available: Mutex::new(count),
            released: Condvar::new(),
        }
    }

    fn acquire(&self) {
        let mut available = self
            .available
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while *available == 0 {
            available = self
                .released
                .wait(available)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *available -= 1;
    }

    fn release(&self) {
        let mut available = self
            .available
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *available += 1;
        self.released.notify_one();
    }
}

/// 作业结束（包括 panic 展开）时归还许可
struct PermitGuard(Arc<Permits>);

impl Drop for PermitGuard {
    fn drop(&mut self) {
        self.0.release();
    }
}

/// 基于 rayon 的固定大小线程池。
///
/// 在途作业数不超过 `max_workers`，超出时 `submit` 阻塞。阻塞等待子任务的工作线程
/// 可能耗尽线程池，因此不支持嵌套调度。
pub struct ThreadPoolBackend {
    pool: rayon::ThreadPool,
    permits: Arc<Permits>,
    max_workers: usize,
    closed: AtomicBool,
}

impl ThreadPoolBackend {
    /// 无法在任务耗时中测量到的固定调度开销：1.5 ms
    pub const SCHEDULING_OVERHEAD_NS: u64 = 1_500_000;

    pub fn new(max_workers: usize) -> Result<Self> {
        if max_workers == 0 {
            return Err(Error::Config("max_workers 必须大于 0".to_string()));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(max_workers)
            .thread_name(|i| format!("partition-worker-{}", i))
            .panic_handler(|_| error!("线程池作业发生未捕获的 panic"))
            .build()
            .map_err(|e| Error::Backend(format!("创建线程池失败: {}", e)))?;
        Ok(Self {
            pool,
            permits: Arc::new(Permits::new(max_workers)),
            max_workers,
            closed: AtomicBool::new(false),
        })
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }
}

impl Backend for ThreadPoolBackend {
    fn name(&self) -> &str {
        "local_thread_pool"
    }

    fn kind(&self) -> BackendKind {
        BackendKind::LocalPool
    }

    fn submit(&self, job: Job) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Backend("后端已关闭".to_string()));
        }
        self.permits.acquire();
        let guard = PermitGuard(Arc::clone(&self.permits));
        self.pool.spawn(move || {
            let _guard = guard;
            job();
        });
        Ok(())
    }

    fn supports_nested_scheduling(&self) -> bool {
        false
    }

    fn scheduling_overhead_ns(&self) -> u64 {
        Self::SCHEDULING_OVERHEAD_NS
    }

    fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// 每个作业一个系统线程，没有容量上限，工作线程可以安全地提交并等待子任务
#[derive(Debug, Default)]
pub struct ThreadPerTaskBackend {
    closed: AtomicBool,
}

impl ThreadPerTaskBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Backend for ThreadPerTaskBackend {
    fn name(&self) -> &str {
        "local_thread_per_task"
    }

    fn kind(&self) -> BackendKind {
        BackendKind::LocalPool
    }

    fn submit(&self, job: Job) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Backend("后端已关闭".to_string()));
        }
        thread::Builder::new()
            .name("partition-task".to_string())
            .spawn(job)
            .map(|_| ())
            .map_err(|e| Error::Backend(format!("创建任务线程失败: {}", e)))
    }

    fn supports_nested_scheduling(&self) -> bool {
        true
    }

    fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
