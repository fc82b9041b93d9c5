use super::*;

#[test]
fn defaults() {
    let opts = PoolOptions::default();
    assert_eq!(opts.worker_count, None);
    assert_eq!(opts.queue_capacity, None);
    assert!(opts.offload_enabled);
    assert!(opts.fail_open);
    assert_eq!(opts.stop_timeout(), Duration::from_secs(10));
}

#[test]
fn parse_from_toml() {
    let opts = PoolOptions::from_toml_str(
        r#"
        worker_count = 3
        queue_capacity = 64
        stop_timeout_secs = 2.5
        fail_open = false
        worker_log_level = "debug"
        "#,
    )
    .unwrap();
    assert_eq!(opts.worker_count, Some(3));
    assert_eq!(opts.queue_capacity, Some(64));
    assert_eq!(opts.stop_timeout(), Duration::from_secs_f64(2.5));
    assert!(!opts.fail_open);
    assert!(opts.offload_enabled, "unset fields keep their defaults");
    assert_eq!(opts.worker_log_level.as_deref(), Some("debug"));
}

#[test]
fn unknown_fields_are_rejected() {
    let err = PoolOptions::from_toml_str("workre_count = 3").unwrap_err();
    assert!(matches!(err, OptionsError::Parse(_)));
}

#[test]
fn worker_count_clamping() {
    let opts = PoolOptions::default();
    // Requested count wins but is clamped to cpus - 1.
    assert_eq!(opts.effective_worker_count(Some(2), 8), 2);
    assert_eq!(opts.effective_worker_count(Some(64), 8), 7);
    assert_eq!(opts.effective_worker_count(Some(0), 8), 1);
    // No request: default is cpus - 1, floor of one.
    assert_eq!(opts.effective_worker_count(None, 8), 7);
    assert_eq!(opts.effective_worker_count(None, 1), 1);

    // Configured count is the fallback for an unspecified request.
    let configured = PoolOptions {
        worker_count: Some(2),
        ..PoolOptions::default()
    };
    assert_eq!(configured.effective_worker_count(None, 8), 2);
    assert_eq!(configured.effective_worker_count(Some(4), 8), 4);
}
