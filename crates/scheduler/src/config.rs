// config.rs
// 调度器全局配置结构体及其默认实现，包含后端选择、分区大小、性能分析和分区大小估计器参数。
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// 分区大小估计器配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    /// 最低并行效率，0.95 表示固定开销占比必须低于 5%
    pub min_parallelism_efficiency: f64,
    /// 开始拟合前需要的最少样本数
    pub learning_sample_count: usize,
    /// 样本缓冲区上限，同时也是收敛的样本数上限
    pub max_samples: usize,
    /// 最小分区大小
    pub min_partition_size: usize,
    /// 学习阶段探测的最大分区大小
    pub max_probe_size: usize,
    /// 单个分区的最小计算时间（纳秒），低于该值时调度开销不值得
    pub min_task_duration_ns: u64,
    /// 连续推荐值之间允许的相对变化
    pub convergence_tolerance: f64,
    /// 连续多少次稳定更新后进入收敛状态
    pub convergence_window: usize,
    /// 探测顺序的随机种子，None 时使用系统熵
    pub probe_seed: Option<u64>,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            min_parallelism_efficiency: 0.95,
            learning_sample_count: 5,
            max_samples: 100,
            min_partition_size: 1,
            max_probe_size: 256,
            min_task_duration_ns: 1_000_000,
            convergence_tolerance: 0.10,
            convergence_window: 3,
            probe_seed: None,
        }
    }
}

impl EstimatorConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.min_parallelism_efficiency > 0.0 && self.min_parallelism_efficiency < 1.0) {
            return Err(Error::Config(format!(
                "min_parallelism_efficiency 必须位于 (0, 1)，实际为 {}",
                self.min_parallelism_efficiency
            )));
        }
        if self.learning_sample_count < 2 {
            return Err(Error::Config("learning_sample_count 至少为 2".to_string()));
        }
        if self.max_samples < self.learning_sample_count {
            return Err(Error::Config(format!(
                "max_samples ({}) 不能小于 learning_sample_count ({})",
                self.max_samples, self.learning_sample_count
            )));
        }
        if self.min_partition_size == 0 || self.max_probe_size < self.min_partition_size {
            return Err(Error::Config(format!(
                "探测范围无效: [{}, {}]",
                self.min_partition_size, self.max_probe_size
            )));
        }
        if self.convergence_window == 0 || self.convergence_tolerance < 0.0 {
            return Err(Error::Config("收敛参数无效".to_string()));
        }
        Ok(())
    }
}

/// 调度器全局配置，控制后端、分区大小和性能分析
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// 后端名称，见 `backend::BACKEND_NAMES`
    pub backend: String,
    /// 后端最大并发任务数
    pub max_workers: usize,
    /// 固定分区大小，设置后不再运行估计器
    pub fixed_partition_size: Option<usize>,
    /// 估计器第一次探测使用的分区大小
    pub initial_partition_size: Option<usize>,
    /// 是否在每次调用后打印性能报告
    pub enable_profiling: bool,
    /// 分区追踪 CSV 的导出路径
    pub trace_export_path: Option<PathBuf>,
    /// 估计器参数
    pub estimator: EstimatorConfig,
}

impl Default for SchedulerConfig {
    /// 默认配置：本地线程池，工作线程数为可用核数减一（至少为1）
    fn default() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);
        Self {
            backend: "local_thread_pool".to_string(),
            max_workers: cores.saturating_sub(1).max(1),
            fixed_partition_size: None,
            initial_partition_size: None,
            enable_profiling: false,
            trace_export_path: None,
            estimator: EstimatorConfig::default(),
        }
    }
}

impl SchedulerConfig {
    /// 从 JSON 文件读取配置并校验
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::Config(format!("未找到配置文件 {}", path.display())));
        }
        let contents = fs::read_to_string(path)?;
        let config: SchedulerConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.fixed_partition_size.is_some() && self.initial_partition_size.is_some() {
            return Err(Error::Config(
                "fixed_partition_size 与 initial_partition_size 不能同时设置".to_string(),
            ));
        }
        if self.fixed_partition_size == Some(0) || self.initial_partition_size == Some(0) {
            return Err(Error::Config("分区大小必须大于 0".to_string()));
        }
        if self.max_workers == 0 {
            return Err(Error::Config("max_workers 必须大于 0".to_string()));
        }
        self.estimator.validate()
    }
}
