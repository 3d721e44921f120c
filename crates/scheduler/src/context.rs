// context.rs
// 执行上下文：线程内的后端栈（作用域覆盖，所有退出路径都会恢复）以及"当前是否在分区任务内"的标记。
use std::cell::{Cell, RefCell};
use std::marker::PhantomData;
use std::sync::Arc;

use crate::backend::{create_backend, Backend};
use crate::error::{Error, Result};

thread_local! {
    static BACKENDS: RefCell<Vec<Arc<dyn Backend>>> = RefCell::new(Vec::new());
    static INSIDE_TASK: Cell<bool> = Cell::new(false);
}

/// 当前线程最内层的后端
pub fn current_backend() -> Option<Arc<dyn Backend>> {
    BACKENDS.with(|stack| stack.borrow().last().cloned())
}

/// 当前线程是否正在执行某个分区任务
pub fn is_inside_task() -> bool {
    INSIDE_TASK.with(Cell::get)
}

/// 后端作用域守卫：创建时压栈，析构时出栈。
///
/// 守卫绑定在创建它的线程上，析构发生在 panic 展开时也能恢复外层后端。
/// 通过 [`BackendScope::owned`] 创建的作用域在退出时还会关闭后端。
pub struct BackendScope {
    backend: Arc<dyn Backend>,
    owned: bool,
    _not_send: PhantomData<*const ()>,
}

impl BackendScope {
    pub fn enter(backend: Arc<dyn Backend>) -> Self {
        Self::push(backend, false)
    }

    /// 进入作用域并在退出时关闭后端
    pub fn owned(backend: Arc<dyn Backend>) -> Self {
        Self::push(backend, true)
    }

    fn push(backend: Arc<dyn Backend>, owned: bool) -> Self {
        BACKENDS.with(|stack| stack.borrow_mut().push(Arc::clone(&backend)));
        Self {
            backend,
            owned,
            _not_send: PhantomData,
        }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }
}

impl Drop for BackendScope {
    fn drop(&mut self) {
        BACKENDS.with(|stack| {
            stack.borrow_mut().pop();
        });
        if self.owned {
            self.backend.shutdown();
        }
    }
}

/// 在 `backend` 作为当前后端的作用域内运行 `f`
pub fn with_backend<T>(backend: Arc<dyn Backend>, f: impl FnOnce() -> T) -> T {
    let _scope = BackendScope::enter(backend);
    f()
}

/// 按名称创建后端并在作用域内运行 `f`，退出时关闭该后端。名称为 "none" 时清空当前后端
pub fn with_backend_named<T>(name: &str, max_workers: usize, f: impl FnOnce() -> T) -> Result<T> {
    match create_backend(name, max_workers)? {
        Some(backend) => {
            let _scope = BackendScope::owned(backend);
            Ok(f())
        }
        None => Ok(without_backend(f)),
    }
}

/// 暂时移除当前线程的所有后端
pub fn without_backend<T>(f: impl FnOnce() -> T) -> T {
    struct Restore(Vec<Arc<dyn Backend>>);

    impl Drop for Restore {
        fn drop(&mut self) {
            let saved = std::mem::take(&mut self.0);
            BACKENDS.with(|stack| *stack.borrow_mut() = saved);
        }
    }

    let _restore = Restore(BACKENDS.with(|stack| std::mem::take(&mut *stack.borrow_mut())));
    f()
}

/// 工作线程上的任务作用域：标记"在任务内"，后端支持嵌套调度时把它安装为当前后端
pub(crate) struct TaskScope {
    previous: bool,
    _backend: Option<BackendScope>,
}

impl TaskScope {
    pub(crate) fn enter(backend: &Arc<dyn Backend>) -> Self {
        let previous = INSIDE_TASK.with(|flag| flag.replace(true));
        let nested = if backend.supports_nested_scheduling() {
            Some(BackendScope::enter(Arc::clone(backend)))
        } else {
            None
        };
        Self {
            previous,
            _backend: nested,
        }
    }
}

impl Drop for TaskScope {
    fn drop(&mut self) {
        INSIDE_TASK.with(|flag| flag.set(self.previous));
    }
}

/// 判断嵌套调用能否使用给定后端
pub(crate) fn nested_backend_allowed(backend: &dyn Backend) -> bool {
    !is_inside_task() || backend.supports_nested_scheduling()
}

/// 要求当前存在后端
pub fn require_backend() -> Result<Arc<dyn Backend>> {
    current_backend().ok_or_else(|| Error::Backend("当前上下文没有设置后端".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{SequentialBackend, ThreadPerTaskBackend};
    use std::panic;

    #[test]
    fn test_scope_restores_previous_backend() {
        assert!(current_backend().is_none());
        let outer: Arc<dyn Backend> = Arc::new(SequentialBackend::new());
        let inner: Arc<dyn Backend> = Arc::new(ThreadPerTaskBackend::new());
        with_backend(outer, || {
            assert_eq!(current_backend().unwrap().name(), "local_single_process");
            with_backend(inner, || {
                assert_eq!(current_backend().unwrap().name(), "local_thread_per_task");
            });
            assert_eq!(current_backend().unwrap().name(), "local_single_process");
        });
        assert!(current_backend().is_none());
    }

    #[test]
    fn test_scope_restored_after_panic() {
        let backend: Arc<dyn Backend> = Arc::new(SequentialBackend::new());
        let result = panic::catch_unwind(panic::AssertUnwindSafe(|| {
            with_backend(backend, || panic!("boom"));
        }));
        assert!(result.is_err());
        assert!(current_backend().is_none());
    }

    #[test]
    fn test_owned_scope_shuts_down_backend() {
        let backend: Arc<dyn Backend> = Arc::new(SequentialBackend::new());
        {
            let _scope = BackendScope::owned(Arc::clone(&backend));
        }
        assert!(backend.submit(Box::new(|| {})).is_err());
    }

    #[test]
    fn test_without_backend_and_named() {
        let result = with_backend_named("local_single_process", 1, || {
            assert!(current_backend().is_some());
            without_backend(|| current_backend().is_none())
        })
        .unwrap();
        assert!(result);
        assert!(require_backend().is_err());
        assert!(with_backend_named("unknown", 1, || ()).is_err());
    }

    #[test]
    fn test_task_scope_installs_nesting_backend_only() {
        let pool: Arc<dyn Backend> = Arc::new(SequentialBackend::new());
        {
            let _task = TaskScope::enter(&pool);
            assert!(is_inside_task());
            assert!(current_backend().is_none());
            assert!(!nested_backend_allowed(pool.as_ref()));
        }
        assert!(!is_inside_task());

        let threads: Arc<dyn Backend> = Arc::new(ThreadPerTaskBackend::new());
        let _task = TaskScope::enter(&threads);
        assert_eq!(current_backend().unwrap().name(), "local_thread_per_task");
        assert!(nested_backend_allowed(threads.as_ref()));
    }
}
