// config_and_estimator.rs
// 集成测试：JSON 配置加载、分区追踪导出、估计器在合成负载下的收敛。
use std::fs;

use partition_scheduler::estimator::{
    EstimatorHandle, EstimatorPhase, EstimatorRegistry, PartitionSample,
};
use partition_scheduler::partition::ListChunks;
use partition_scheduler::profiler::TRACE_HEADER;
use partition_scheduler::result_merger::ListConcat;
use partition_scheduler::{
    EstimatorConfig, Error, NamedArgs, ParallelFunction, PartitionSpec, SchedulerConfig,
};

#[test]
fn test_config_from_json_drives_function() {
    let dir = tempfile::tempdir().unwrap();
    let trace_path = dir.path().join("trace.csv");
    let config_path = dir.path().join("scheduler.json");
    let json = serde_json::json!({
        "backend": "local_thread_pool",
        "max_workers": 2,
        "fixed_partition_size": 3,
        "trace_export_path": trace_path.to_str().unwrap(),
    });
    fs::write(&config_path, json.to_string()).unwrap();

    let config = SchedulerConfig::from_json_file(&config_path).unwrap();
    assert_eq!(config.fixed_partition_size, Some(3));
    assert_eq!(config.estimator, EstimatorConfig::default());

    let double = ParallelFunction::builder("it_config_double")
        .signature(["values"])
        .function(|args: &NamedArgs| -> anyhow::Result<Vec<i64>> {
            Ok(args.get::<Vec<i64>>("values")?.iter().map(|v| v * 2).collect())
        })
        .partition(PartitionSpec::all(ListChunks::<i64>::new()))
        .combine(ListConcat::<i64>::new())
        .config(&config)
        .build()
        .unwrap();

    let out = double
        .call(NamedArgs::new().with("values", (1..=9i64).collect::<Vec<_>>()))
        .unwrap();
    assert_eq!(out, vec![2, 4, 6, 8, 10, 12, 14, 16, 18]);

    let csv = fs::read_to_string(&trace_path).unwrap();
    let lines: Vec<&str> = csv.lines().collect();
    assert_eq!(lines[0], TRACE_HEADER);
    assert_eq!(lines.len(), 4);
    for (i, line) in lines[1..].iter().enumerate() {
        let fields: Vec<&str> = line.split(',').collect();
        assert_eq!(fields.len(), 7);
        assert_eq!(fields[0], i.to_string());
        assert_eq!(fields[2], "3");
    }
}

#[test]
fn test_invalid_config_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.json");
    fs::write(&path, r#"{"fixed_partition_size": 4, "initial_partition_size": 8}"#).unwrap();
    assert!(matches!(
        SchedulerConfig::from_json_file(&path),
        Err(Error::Config(_))
    ));

    fs::write(&path, "{ not json").unwrap();
    assert!(matches!(
        SchedulerConfig::from_json_file(&path),
        Err(Error::Serialization(_))
    ));

    assert!(matches!(
        SchedulerConfig::from_json_file(dir.path().join("missing.json")),
        Err(Error::Config(_))
    ));
}

#[test]
fn test_unknown_backend_fails_build() {
    let config = SchedulerConfig {
        backend: "dask".to_string(),
        ..SchedulerConfig::default()
    };
    let result = ParallelFunction::builder("it_bad_backend")
        .signature(["values"])
        .function(|args: &NamedArgs| -> anyhow::Result<Vec<i64>> {
            Ok(args.get::<Vec<i64>>("values")?.clone())
        })
        .partition(PartitionSpec::all(ListChunks::<i64>::new()))
        .combine(ListConcat::<i64>::new())
        .config(&config)
        .build();
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
fn test_estimator_converges_on_synthetic_workload() {
    // 每行 200ns，每个任务固定开销 2ms
    const ALPHA: f64 = 200.0;
    const BETA: f64 = 2_000_000.0;

    let config = EstimatorConfig {
        probe_seed: Some(42),
        ..EstimatorConfig::default()
    };
    let registry = EstimatorRegistry::new();
    let handle = registry.get_or_insert_with("synthetic", || {
        EstimatorHandle::linear_regression(config.clone())
    });

    for _ in 0..40 {
        let size = handle.estimate().value;
        handle.add_sample(PartitionSample {
            partition_size: size,
            duration_ns: (ALPHA * size as f64 + BETA) as u64,
        });
        if handle.phase() == EstimatorPhase::Converged {
            break;
        }
    }
    assert_eq!(handle.phase(), EstimatorPhase::Converged);

    let estimate = handle.estimate();
    let c = estimate.coefficients.unwrap();
    assert!((c.alpha - ALPHA).abs() / ALPHA < 0.01);
    assert!((c.beta - BETA).abs() / BETA < 0.01);
    assert!(c.overhead_share(estimate.value) < 1.0 - config.min_parallelism_efficiency);
    assert_eq!(handle.snapshot(), (estimate.value, EstimatorPhase::Converged));

    // 同一调用点共享同一个估计器
    let again = registry.get_or_insert_with("synthetic", || {
        EstimatorHandle::linear_regression(EstimatorConfig::default())
    });
    assert_eq!(again.phase(), EstimatorPhase::Converged);
    registry.reset_all();
    assert_eq!(again.phase(), EstimatorPhase::Learning);
}
