use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;
use crate::types::NamedArgs;

/// 任务的终止状态，由 [`TaskResult::status`] 从结果推出
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    /// 已完成
    Completed,
    /// 执行失败，包含失败原因
    Failed(String),
    /// 开始执行前被取消
    Cancelled,
}

/// 分区任务：由调度器独占，提交时创建，结果被消费后销毁
#[derive(Debug, Clone)]
pub struct Task {
    /// 所属调用的唯一ID
    pub invocation_id: Uuid,
    /// 分区下标，从0开始、连续无空洞
    pub index: usize,
    /// 分区的实际大小（行数）
    pub partition_size: usize,
    /// 估计器为该分区请求的大小，未使用估计器时为 None
    pub requested_size: Option<usize>,
    /// 分区参数与未分区参数合并后的完整参数
    pub args: NamedArgs,
}

impl Task {
    pub fn new(invocation_id: Uuid, index: usize, partition_size: usize, args: NamedArgs) -> Self {
        Self {
            invocation_id,
            index,
            partition_size,
            requested_size: None,
            args,
        }
    }

    pub fn task_id(&self) -> String {
        format!("{}_partition_{}", self.invocation_id, self.index)
    }
}

/// 工作端产出的任务结果，由结果合并器恰好消费一次
#[derive(Debug)]
pub struct TaskResult<R> {
    pub index: usize,
    pub value: std::result::Result<R, Error>,
    /// 用户函数的计算耗时（纳秒）
    pub compute_ns: u64,
    /// 包含调度开销的任务耗时（纳秒）
    pub task_ns: u64,
    /// 相对调用开始时刻的入队时间（纳秒）
    pub enqueued_at_ns: u64,
    /// 相对调用开始时刻的出队（开始执行）时间（纳秒）
    pub started_at_ns: u64,
}

impl<R> TaskResult<R> {
    pub fn status(&self) -> TaskStatus {
        match &self.value {
            Ok(_) => TaskStatus::Completed,
            Err(Error::TaskCancelled(_)) => TaskStatus::Cancelled,
            Err(e) => TaskStatus::Failed(e.to_string()),
        }
    }
}
