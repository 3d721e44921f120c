// logging.rs
// 日志初始化：基于 tracing-subscriber，RUST_LOG 环境变量优先于传入的级别。
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// 初始化输出到 stderr 的日志，进程内只能成功调用一次
pub fn init_logging(level: &str) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_names(true),
        )
        .try_init()
        .map_err(|e| anyhow::anyhow!("日志初始化失败: {}", e))?;

    tracing::debug!(level = %level, "日志已初始化");
    Ok(())
}

/// 测试和示例使用：已经初始化过时静默忽略
pub fn try_init_logging(level: &str) {
    let _ = init_logging(level);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_fails() {
        try_init_logging("info");
        assert!(init_logging("debug").is_err());
    }
}
