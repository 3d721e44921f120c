// lib.rs
// 调度器模块入口，声明并导出各子模块。
pub mod backend;
pub mod config;
pub mod context;
pub mod error;
pub mod estimator;
pub mod functions;
pub mod logging;
pub mod parallel_function;
pub mod partition;
pub mod profiler;
pub mod result_merger;
pub mod scheduler;
pub mod table;
pub mod task;
pub mod task_executor;
pub mod task_splitter;
pub mod types;

pub use crate::backend::{create_backend, Backend, BackendKind};
pub use crate::config::{EstimatorConfig, SchedulerConfig};
pub use crate::error::{Error, Result};
pub use crate::functions::{parallel_map, parallel_timed_map};
pub use crate::parallel_function::{ParallelFunction, ParallelFunctionBuilder, SizeHint};
pub use crate::task_splitter::PartitionSpec;
pub use crate::types::{ArgValue, FunctionSignature, NamedArgs};
