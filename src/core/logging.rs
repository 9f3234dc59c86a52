use tracing::metadata::LevelFilter;

pub const LOG_ENV: &str = "SHARD_CACHE_LOG";

/// Level from `SHARD_CACHE_LOG`, unless a caller-provided override is set.
#[must_use]
pub fn resolve_level(value: Option<&str>, override_level: Option<LevelFilter>) -> LevelFilter {
    override_level
        .or_else(|| value.and_then(|value| value.trim().parse().ok()))
        .unwrap_or(LevelFilter::INFO)
}

pub fn setup_logging(override_level: Option<LevelFilter>) {
    let env_value = std::env::var(LOG_ENV).ok();
    let filter = resolve_level(env_value.as_deref(), override_level);

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
