// error.rs
// 定义调度框架通用的错误类型（分区、任务执行、合并、配置等）和Result类型。
use std::io;

use thiserror::Error;

/// 任务执行错误的原始来源（用户函数或后端返回的错误）
pub type TaskFailure = Box<dyn std::error::Error + Send + Sync + 'static>;

/// 框架通用错误类型
#[derive(Error, Debug)]
pub enum Error {
    /// 分区策略产出的元组元数/顺序与其拥有的参数不匹配，整个调用在派发任何分区前失败
    #[error("分区元数错误: {0}")]
    PartitionArity(String),

    /// 某个分区的计算失败，已取消兄弟任务
    #[error("分区 {index} 执行失败: {source}")]
    TaskExecution {
        index: usize,
        #[source]
        source: TaskFailure,
    },

    /// 任务在开始执行前被取消
    #[error("分区 {0} 已被取消")]
    TaskCancelled(usize),

    /// 合并策略与分区结果不兼容
    #[error("合并签名错误: {0}")]
    CombineSignature(String),

    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),

    /// 分区规格引用了函数签名中不存在的参数，或调用缺少参数
    #[error("未知参数: {0}")]
    UnknownArgument(String),

    /// 参数的实际类型与请求的类型不一致
    #[error("参数 `{name}` 类型错误: 期望 {expected}, 实际 {actual}")]
    ArgumentType {
        name: String,
        expected: &'static str,
        actual: &'static str,
    },

    /// 后端错误（已关闭、提交失败等）
    #[error("后端错误: {0}")]
    Backend(String),

    /// IO错误
    #[error("IO错误: {0}")]
    Io(#[from] io::Error),

    /// 序列化/反序列化错误
    #[error("序列化错误: {0}")]
    Serialization(String),
}

/// 通用结果类型
pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl Error {
    /// 将用户函数返回的 anyhow 错误包装为某个分区的执行错误
    pub fn task_execution(index: usize, err: anyhow::Error) -> Self {
        Error::TaskExecution {
            index,
            source: err.into(),
        }
    }

    /// 失败分区的下标（仅任务级错误有值）
    pub fn partition_index(&self) -> Option<usize> {
        match self {
            Error::TaskExecution { index, .. } | Error::TaskCancelled(index) => Some(*index),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_execution_keeps_index_and_source() {
        let err = Error::task_execution(3, anyhow::anyhow!("boom"));
        assert_eq!(err.partition_index(), Some(3));
        assert!(err.to_string().contains("boom"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "missing");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(err.partition_index(), None);
    }
}
