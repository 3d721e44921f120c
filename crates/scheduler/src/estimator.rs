// estimator.rs
// 分区大小估计器：根据已执行分区的耗时反馈在线拟合 f(s) = α + β/s，推荐下一次使用的分区大小。
//
// α 为每行的渐近计算代价，β 为每个任务的固定开销（调度、序列化、传输）。
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::EstimatorConfig;

/// 估计器生命周期阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EstimatorPhase {
    /// 主动探测不同的分区大小
    Learning,
    /// 推荐值已稳定，只做轻量的持续拟合
    Converged,
}

impl EstimatorPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            EstimatorPhase::Learning => "learning",
            EstimatorPhase::Converged => "converged",
        }
    }
}

/// 回归系数
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coefficients {
    /// 每行计算代价（纳秒）
    pub alpha: f64,
    /// 每个任务的固定开销（纳秒）
    pub beta: f64,
    /// 拟合优度 R²
    pub r2: f64,
    pub sample_count: usize,
}

impl Coefficients {
    /// 预测每行耗时 f(s)
    pub fn per_row(&self, partition_size: usize) -> f64 {
        self.alpha + self.beta / partition_size.max(1) as f64
    }

    /// 预测的固定开销占比 β / (f(s)·s)
    pub fn overhead_share(&self, partition_size: usize) -> f64 {
        let s = partition_size.max(1) as f64;
        self.beta / (self.alpha * s + self.beta)
    }
}

/// 一次估计的结果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PartitionSizeEstimate {
    pub value: usize,
    pub coefficients: Option<Coefficients>,
}

/// 一个已执行分区的观测值
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionSample {
    pub partition_size: usize,
    /// 该分区的总耗时（分区 + 计算 + 合并），纳秒
    pub duration_ns: u64,
}

/// 分区大小估计器接口
pub trait PartitionSizeEstimator: Send {
    fn add_sample(&mut self, sample: PartitionSample);

    fn phase(&self) -> EstimatorPhase;

    /// 推荐下一个分区大小，`dry_run` 时不推进探测游标
    fn estimate(&mut self, dry_run: bool) -> PartitionSizeEstimate;

    fn coefficients(&self) -> Option<Coefficients>;

    fn reset(&mut self);
}

/// 基于最小二乘的估计器：对 (1/s, 每行耗时) 做线性回归
pub struct LinearRegressionEstimator {
    config: EstimatorConfig,
    /// (分区大小, 每行耗时纳秒)，缓冲区满之后按分区大小排序
    samples: Vec<(usize, f64)>,
    total_samples: usize,
    probes: Vec<usize>,
    probe_cursor: usize,
    coefficients: Option<Coefficients>,
    recommendation: Option<usize>,
    recent: Vec<usize>,
    phase: EstimatorPhase,
}

impl LinearRegressionEstimator {
    pub fn new(config: EstimatorConfig) -> Self {
        let probes = probe_sizes(&config);
        Self {
            config,
            samples: Vec::new(),
            total_samples: 0,
            probes,
            probe_cursor: 0,
            coefficients: None,
            recommendation: None,
            recent: Vec::new(),
            phase: EstimatorPhase::Learning,
        }
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    fn store(&mut self, size: usize, per_row: f64) {
        if self.samples.len() < self.config.max_samples {
            self.samples.push((size, per_row));
            if self.samples.len() == self.config.max_samples {
                self.samples.sort_by_key(|(s, _)| *s);
            }
            return;
        }

        // 缓冲区已满：替换分区大小最接近的样本，保留学习阶段的早期样本
        let idx = self.samples.partition_point(|(s, _)| *s < size);
        let replace = if idx == 0 {
            0
        } else if idx >= self.samples.len() {
            self.samples.len() - 1
        } else {
            let left = self.samples[idx - 1].0;
            let right = self.samples[idx].0;
            if size - left < right - size {
                idx - 1
            } else {
                idx
            }
        };
        self.samples[replace] = (size, per_row);
    }

    fn refit(&mut self) {
        if self.samples.len() < self.config.learning_sample_count {
            return;
        }
        let Some(coefficients) = fit(&self.samples) else {
            debug!(
                samples = self.samples.len(),
                "估计器样本退化，无法拟合，继续使用回退分区大小"
            );
            self.coefficients = None;
            return;
        };
        self.coefficients = Some(coefficients);

        let size = select_partition_size(&coefficients, &self.config);
        self.recommendation = Some(size);
        self.recent.push(size);
        let window = self.config.convergence_window;
        if self.recent.len() > window + 1 {
            self.recent.remove(0);
        }

        if self.phase == EstimatorPhase::Learning && self.is_stable() {
            debug!(partition_size = size, "分区大小估计器已收敛");
            self.phase = EstimatorPhase::Converged;
        }
    }

    fn is_stable(&self) -> bool {
        if self.total_samples >= self.config.max_samples {
            return true;
        }
        let window = self.config.convergence_window;
        if self.recent.len() < window + 1 {
            return false;
        }
        self.recent.windows(2).all(|pair| {
            let (prev, next) = (pair[0] as f64, pair[1] as f64);
            (next - prev).abs() / prev.max(1.0) <= self.config.convergence_tolerance
        })
    }

    fn next_probe(&mut self, dry_run: bool) -> usize {
        let size = self.probes[self.probe_cursor % self.probes.len()];
        if !dry_run {
            self.probe_cursor = (self.probe_cursor + 1) % self.probes.len();
        }
        size
    }
}

impl PartitionSizeEstimator for LinearRegressionEstimator {
    fn add_sample(&mut self, sample: PartitionSample) {
        if sample.partition_size == 0 {
            debug!("丢弃零行样本");
            return;
        }
        if sample.duration_ns == 0 {
            debug!(
                partition_size = sample.partition_size,
                "样本耗时为零，信号不足，保持当前阶段"
            );
            return;
        }

        let per_row = sample.duration_ns as f64 / sample.partition_size as f64;
        self.store(sample.partition_size, per_row);
        self.total_samples += 1;
        self.refit();
    }

    fn phase(&self) -> EstimatorPhase {
        self.phase
    }

    fn estimate(&mut self, dry_run: bool) -> PartitionSizeEstimate {
        if let (Some(value), Some(coefficients)) = (self.recommendation, self.coefficients) {
            return PartitionSizeEstimate {
                value,
                coefficients: Some(coefficients),
            };
        }
        if self.phase == EstimatorPhase::Converged {
            if let Some(value) = self.recommendation {
                return PartitionSizeEstimate {
                    value,
                    coefficients: None,
                };
            }
        }
        PartitionSizeEstimate {
            value: self.next_probe(dry_run),
            coefficients: None,
        }
    }

    fn coefficients(&self) -> Option<Coefficients> {
        self.coefficients
    }

    fn reset(&mut self) {
        *self = LinearRegressionEstimator::new(self.config.clone());
    }
}

/// 学习阶段探测的分区大小：[min, max] 之间的 2 的幂，顺序打乱
fn probe_sizes(config: &EstimatorConfig) -> Vec<usize> {
    let mut sizes = Vec::new();
    let mut size = config.min_partition_size.max(1);
    while size <= config.max_probe_size {
        sizes.push(size);
        size = size.saturating_mul(2);
    }
    if sizes.is_empty() {
        sizes.push(config.min_partition_size.max(1));
    }
    let mut rng = match config.probe_seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    sizes.shuffle(&mut rng);
    sizes
}

/// 对 y = α + β·x（x = 1/s）做普通最小二乘；系数非正或 x 没有方差时视为退化
fn fit(samples: &[(usize, f64)]) -> Option<Coefficients> {
    let n = samples.len() as f64;
    if n < 2.0 {
        return None;
    }
    let xs: Vec<f64> = samples.iter().map(|(s, _)| 1.0 / *s as f64).collect();
    let ys: Vec<f64> = samples.iter().map(|(_, y)| *y).collect();
    let mean_x = xs.iter().sum::<f64>() / n;
    let mean_y = ys.iter().sum::<f64>() / n;

    let mut sxx = 0.0;
    let mut sxy = 0.0;
    for (x, y) in xs.iter().zip(&ys) {
        sxx += (x - mean_x) * (x - mean_x);
        sxy += (x - mean_x) * (y - mean_y);
    }
    if sxx <= f64::EPSILON {
        return None;
    }
    let beta = sxy / sxx;
    let alpha = mean_y - beta * mean_x;
    if !(alpha > 0.0 && beta > 0.0) || !alpha.is_finite() || !beta.is_finite() {
        return None;
    }

    let ss_tot: f64 = ys.iter().map(|y| (y - mean_y) * (y - mean_y)).sum();
    let ss_res: f64 = xs
        .iter()
        .zip(&ys)
        .map(|(x, y)| {
            let e = y - (alpha + beta * x);
            e * e
        })
        .sum();
    let r2 = if ss_tot > 0.0 { 1.0 - ss_res / ss_tot } else { 1.0 };

    Some(Coefficients {
        alpha,
        beta,
        r2,
        sample_count: samples.len(),
    })
}

/// 满足以下两个条件的最小分区大小：
/// 固定开销占比 β/(α·s+β) 低于 1 - min_parallelism_efficiency，
/// 且单个分区的预测计算时间 α·s+β 超过 min_task_duration_ns。
pub fn select_partition_size(coefficients: &Coefficients, config: &EstimatorConfig) -> usize {
    const MAX_SIZE: f64 = 1e12;

    let alpha = coefficients.alpha;
    let beta = coefficients.beta;
    let share = 1.0 - config.min_parallelism_efficiency;
    let min_duration = config.min_task_duration_ns as f64;

    let qualifies = |s: usize| {
        coefficients.overhead_share(s) < share && alpha * s as f64 + beta > min_duration
    };

    // 闭式解，再按浮点误差向两侧微调
    let by_overhead = beta * (1.0 - share) / (alpha * share);
    let by_duration = (min_duration - beta) / alpha;
    let mut size = (by_overhead.max(by_duration).max(0.0).min(MAX_SIZE).floor() as usize + 1)
        .max(config.min_partition_size.max(1));
    while !qualifies(size) && (size as f64) < MAX_SIZE {
        size += 1;
    }
    while size > config.min_partition_size.max(1) && qualifies(size - 1) {
        size -= 1;
    }
    size
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // 样本按完整的任务逐个原子地应用，即使持锁线程崩溃状态仍然一致
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 共享的估计器句柄：写入经由互斥锁串行化，读取可使用过期的快照
#[derive(Clone)]
pub struct EstimatorHandle {
    inner: Arc<Mutex<Box<dyn PartitionSizeEstimator>>>,
    snapshot_size: Arc<AtomicUsize>,
    snapshot_phase: Arc<AtomicU8>,
}

impl EstimatorHandle {
    pub fn new(estimator: Box<dyn PartitionSizeEstimator>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(estimator)),
            snapshot_size: Arc::new(AtomicUsize::new(0)),
            snapshot_phase: Arc::new(AtomicU8::new(0)),
        }
    }

    pub fn linear_regression(config: EstimatorConfig) -> Self {
        Self::new(Box::new(LinearRegressionEstimator::new(config)))
    }

    pub fn estimate(&self) -> PartitionSizeEstimate {
        let mut estimator = lock(&self.inner);
        let estimate = estimator.estimate(false);
        self.publish(estimate.value, estimator.phase());
        estimate
    }

    pub fn add_sample(&self, sample: PartitionSample) {
        let mut estimator = lock(&self.inner);
        estimator.add_sample(sample);
        let estimate = estimator.estimate(true);
        self.publish(estimate.value, estimator.phase());
    }

    pub fn phase(&self) -> EstimatorPhase {
        lock(&self.inner).phase()
    }

    pub fn coefficients(&self) -> Option<Coefficients> {
        lock(&self.inner).coefficients()
    }

    /// 不推进探测游标的估计
    pub fn peek(&self) -> PartitionSizeEstimate {
        lock(&self.inner).estimate(true)
    }

    /// 最近一次发布的（大小, 阶段），不加锁
    pub fn snapshot(&self) -> (usize, EstimatorPhase) {
        let phase = match self.snapshot_phase.load(Ordering::Acquire) {
            1 => EstimatorPhase::Converged,
            _ => EstimatorPhase::Learning,
        };
        (self.snapshot_size.load(Ordering::Acquire), phase)
    }

    pub fn reset(&self) {
        let mut estimator = lock(&self.inner);
        estimator.reset();
        self.publish(0, EstimatorPhase::Learning);
    }

    fn publish(&self, size: usize, phase: EstimatorPhase) {
        self.snapshot_size.store(size, Ordering::Release);
        let tag = match phase {
            EstimatorPhase::Learning => 0,
            EstimatorPhase::Converged => 1,
        };
        self.snapshot_phase.store(tag, Ordering::Release);
    }
}

/// 按调用点名称索引的估计器注册表，进程生命周期内不销毁，只在显式请求时重置
#[derive(Default)]
pub struct EstimatorRegistry {
    estimators: RwLock<HashMap<String, EstimatorHandle>>,
}

impl EstimatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 进程级默认注册表
    pub fn global() -> &'static EstimatorRegistry {
        static REGISTRY: OnceLock<EstimatorRegistry> = OnceLock::new();
        REGISTRY.get_or_init(EstimatorRegistry::new)
    }

    pub fn get_or_insert_with(
        &self,
        call_site: &str,
        factory: impl FnOnce() -> EstimatorHandle,
    ) -> EstimatorHandle {
        if let Some(handle) = self
            .estimators
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(call_site)
        {
            return handle.clone();
        }
        self.estimators
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(call_site.to_string())
            .or_insert_with(factory)
            .clone()
    }

    pub fn get(&self, call_site: &str) -> Option<EstimatorHandle> {
        self.estimators
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(call_site)
            .cloned()
    }

    /// 重置某个调用点的估计器，返回该调用点是否存在
    pub fn reset(&self, call_site: &str) -> bool {
        match self.get(call_site) {
            Some(handle) => {
                handle.reset();
                true
            }
            None => false,
        }
    }

    pub fn reset_all(&self) {
        let estimators = self
            .estimators
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        for handle in estimators.values() {
            handle.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALPHA: f64 = 100.0;
    const BETA: f64 = 1_000_000.0;

    fn config() -> EstimatorConfig {
        EstimatorConfig {
            probe_seed: Some(7),
            ..EstimatorConfig::default()
        }
    }

    fn sample(size: usize) -> PartitionSample {
        PartitionSample {
            partition_size: size,
            duration_ns: (ALPHA * size as f64 + BETA) as u64,
        }
    }

    #[test]
    fn test_probes_cover_log_range_before_fit() {
        let mut estimator = LinearRegressionEstimator::new(config());
        let mut seen: Vec<usize> = (0..9).map(|_| estimator.estimate(false).value).collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![1, 2, 4, 8, 16, 32, 64, 128, 256]);
        assert_eq!(estimator.phase(), EstimatorPhase::Learning);
    }

    #[test]
    fn test_dry_run_does_not_advance() {
        let mut estimator = LinearRegressionEstimator::new(config());
        let a = estimator.estimate(true).value;
        let b = estimator.estimate(true).value;
        assert_eq!(a, b);
    }

    #[test]
    fn test_fit_recovers_coefficients() {
        let samples: Vec<(usize, f64)> = [1usize, 4, 16, 64, 256]
            .iter()
            .map(|&s| (s, ALPHA + BETA / s as f64))
            .collect();
        let c = fit(&samples).unwrap();
        assert!((c.alpha - ALPHA).abs() < 1e-3);
        assert!((c.beta - BETA).abs() < 1e-3);
        assert!(c.r2 > 0.999);
    }

    #[test]
    fn test_selection_is_smallest_size_under_overhead_share() {
        let c = Coefficients {
            alpha: ALPHA,
            beta: BETA,
            r2: 1.0,
            sample_count: 5,
        };
        let cfg = config();
        let threshold = 1.0 - cfg.min_parallelism_efficiency;
        let size = select_partition_size(&c, &cfg);
        assert!(c.overhead_share(size) < threshold);
        assert!(c.overhead_share(size - 1) >= threshold);
    }

    #[test]
    fn test_selection_honors_min_task_duration() {
        let c = Coefficients {
            alpha: 10.0,
            beta: 10.0,
            r2: 1.0,
            sample_count: 5,
        };
        let cfg = config();
        let size = select_partition_size(&c, &cfg);
        assert!(c.alpha * size as f64 + c.beta > cfg.min_task_duration_ns as f64);
        assert!(c.overhead_share(size) < 0.05);
    }

    #[test]
    fn test_converges_and_stays_stable() {
        let mut estimator = LinearRegressionEstimator::new(config());
        for _ in 0..20 {
            let size = estimator.estimate(false).value;
            estimator.add_sample(sample(size));
        }
        assert_eq!(estimator.phase(), EstimatorPhase::Converged);

        let first = estimator.estimate(false);
        let c = first.coefficients.unwrap();
        assert!(c.overhead_share(first.value) <= 0.05);

        for _ in 0..10 {
            let size = estimator.estimate(false).value;
            estimator.add_sample(sample(size));
        }
        let later = estimator.estimate(false).value;
        let change = (later as f64 - first.value as f64).abs() / first.value as f64;
        assert!(change < 0.10);
    }

    #[test]
    fn test_degenerate_samples_keep_learning() {
        let mut estimator = LinearRegressionEstimator::new(config());
        for size in [1usize, 2, 4, 8, 16, 32] {
            estimator.add_sample(PartitionSample {
                partition_size: size,
                duration_ns: 0,
            });
            estimator.add_sample(PartitionSample {
                partition_size: 0,
                duration_ns: 10,
            });
        }
        assert_eq!(estimator.sample_count(), 0);
        assert_eq!(estimator.phase(), EstimatorPhase::Learning);
        assert!(estimator.coefficients().is_none());
    }

    #[test]
    fn test_constant_size_samples_are_degenerate() {
        let mut estimator = LinearRegressionEstimator::new(config());
        for _ in 0..10 {
            estimator.add_sample(sample(8));
        }
        assert!(estimator.coefficients().is_none());
        assert!(estimator.estimate(true).value >= 1);
    }

    #[test]
    fn test_buffer_is_capped() {
        let cfg = EstimatorConfig {
            max_samples: 10,
            ..config()
        };
        let mut estimator = LinearRegressionEstimator::new(cfg);
        for i in 0..50 {
            estimator.add_sample(sample(1 + i % 13));
        }
        assert_eq!(estimator.sample_count(), 10);
        assert_eq!(estimator.phase(), EstimatorPhase::Converged);
    }

    #[test]
    fn test_registry_shares_and_resets() {
        let registry = EstimatorRegistry::new();
        let a = registry.get_or_insert_with("site", || EstimatorHandle::linear_regression(config()));
        let b = registry.get_or_insert_with("site", || panic!("factory must not run twice"));
        for size in [1usize, 2, 4, 8, 16, 32, 64] {
            a.add_sample(sample(size));
        }
        assert!(b.coefficients().is_some());
        assert!(registry.reset("site"));
        assert!(b.coefficients().is_none());
        assert!(!registry.reset("other"));
    }
}
