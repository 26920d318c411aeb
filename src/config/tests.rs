use super::*;
use crate::cache::CacheConfig;

#[test]
fn defaults_match_documented_values() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

    assert_eq!(settings.logging.level, LevelFilter::INFO);
    assert!(matches!(settings.logging.format, LogFormat::Compact));
    assert_eq!(settings.redis.url, DEFAULT_REDIS_URL);
    assert_eq!(settings.redis.pool_size.get(), 16);
    assert_eq!(settings.redis.timeout, Duration::from_secs(5));
    assert_eq!(settings.cache.default_ttl_minutes.get(), 30);
    assert_eq!(settings.cache.long_ttl_hours.get(), 24);
    assert_eq!(settings.cache.max_key_locks.get(), 10_000);
    assert_eq!(settings.cache.lock_reclaim_interval_secs.get(), 120);
    assert_eq!(settings.cache.lock_idle_timeout_secs.get(), 300);
    assert_eq!(settings.cache.scan_batch_size.get(), 1000);
}

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.logging.level = Some("info".to_string());
    raw.redis.url = Some("redis://cache-a:6379".to_string());
    raw.cache.scan_batch_size = Some(200);

    let overrides = Overrides {
        log_level: Some("debug".to_string()),
        redis_url: Some("redis://cache-b:6379".to_string()),
        scan_batch_size: Some(50),
        ..Default::default()
    };

    raw.apply_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
    assert_eq!(settings.redis.url, "redis://cache-b:6379");
    assert_eq!(settings.cache.scan_batch_size.get(), 50);
}

#[test]
fn cli_json_logging_enforces_format() {
    let mut raw = RawSettings::default();
    let overrides = Overrides {
        log_json: Some(true),
        ..Default::default()
    };

    raw.apply_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert!(matches!(settings.logging.format, LogFormat::Json));
}

#[test]
fn zero_values_are_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.default_ttl_minutes = Some(0);

    let err = Settings::from_raw(raw).expect_err("zero ttl must fail");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "cache.default_ttl_minutes",
            ..
        }
    ));

    let mut raw = RawSettings::default();
    raw.redis.pool_size = Some(0);
    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn invalid_log_level_is_rejected() {
    let mut raw = RawSettings::default();
    raw.logging.level = Some("loud".to_string());

    let err = Settings::from_raw(raw).expect_err("bad level must fail");
    assert!(matches!(err, LoadError::Invalid { key: "logging.level", .. }));
}

#[test]
fn redis_url_requires_known_scheme() {
    let mut raw = RawSettings::default();
    raw.redis.url = Some("http://localhost:6379".to_string());
    assert!(Settings::from_raw(raw).is_err());

    let mut raw = RawSettings::default();
    raw.redis.url = Some("  rediss://secure:6380/2  ".to_string());
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.redis.url, "rediss://secure:6380/2");

    let mut raw = RawSettings::default();
    raw.redis.url = Some("   ".to_string());
    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn cache_settings_convert_to_runtime_config() {
    let mut raw = RawSettings::default();
    raw.cache.max_key_locks = Some(64);
    raw.cache.lock_timeout_ms = Some(250);

    let settings = Settings::from_raw(raw).expect("valid settings");
    let config = CacheConfig::from(&settings.cache);

    assert_eq!(config.max_key_locks, 64);
    assert_eq!(config.lock_timeout(), Duration::from_millis(250));
    assert_eq!(config.default_ttl(), Duration::from_secs(30 * 60));
}

#[test]
fn subcommands_parse() {
    let args = CliArgs::try_parse_from([
        "cascade-cache",
        "invalidate",
        "category",
        "--id",
        "5",
        "--cascade",
        "--redis-url",
        "redis://other:6379",
    ])
    .expect("valid args");

    assert_eq!(args.overrides.redis_url.as_deref(), Some("redis://other:6379"));
    match args.command {
        Command::Invalidate(invalidate) => {
            assert_eq!(invalidate.entity_type, "category");
            assert_eq!(invalidate.id, Some(5));
            assert!(invalidate.cascade);
            assert!(!invalidate.dry_run);
        }
        other => panic!("unexpected command: {other:?}"),
    }

    let args = CliArgs::try_parse_from(["cascade-cache", "keys"]).expect("valid args");
    match args.command {
        Command::Keys(keys) => assert_eq!(keys.pattern, "*"),
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
#[serial_test::serial]
fn environment_sits_between_files_and_cli() {
    let args = CliArgs::try_parse_from([
        "cascade-cache",
        "stats",
        "--cache-scan-batch-size",
        "25",
    ])
    .expect("valid args");

    // SAFETY: env-mutating tests are serialized.
    unsafe {
        std::env::set_var("CASCADE_CACHE__CACHE__SCAN_BATCH_SIZE", "500");
        std::env::set_var("CASCADE_CACHE__CACHE__LOCK_TIMEOUT_MS", "750");
    }
    let result = load(&args);
    unsafe {
        std::env::remove_var("CASCADE_CACHE__CACHE__SCAN_BATCH_SIZE");
        std::env::remove_var("CASCADE_CACHE__CACHE__LOCK_TIMEOUT_MS");
    }

    let settings = result.expect("valid settings");
    assert_eq!(settings.cache.scan_batch_size.get(), 25);
    assert_eq!(settings.cache.lock_timeout_ms.get(), 750);
}
