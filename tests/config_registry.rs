//! Process-wide configuration registry: configure / reset / explain.
//!
//! These tests share the global registry, so they serialize on a mutex.

use std::sync::Mutex;
use std::time::Duration;

use stkai_sdk::config::{
    self, AgentOverrides, AuthOverrides, Overrides, RateLimitOverrides, RqcOverrides,
};
use stkai_sdk::{ConfigSource, RateLimitPreset, RateLimitStrategy};

static REGISTRY_LOCK: Mutex<()> = Mutex::new(());

fn lock() -> std::sync::MutexGuard<'static, ()> {
    REGISTRY_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[test]
fn configure_reports_user_sources_and_leaves_the_rest() {
    let _guard = lock();
    config::reset();

    config::configure(
        Overrides {
            rqc: Some(RqcOverrides {
                request_timeout: Some(Duration::from_secs(90)),
                ..Default::default()
            }),
            agent: Some(AgentOverrides {
                base_url: Some("https://custom-agent.example.com".into()),
                ..Default::default()
            }),
            ..Default::default()
        },
        true,
    )
    .unwrap();

    let rows = config::explain();
    let row = |group: &str, option: &str| {
        rows.iter()
            .find(|r| r.group == group && r.option == option)
            .unwrap_or_else(|| panic!("missing {group}.{option}"))
            .clone()
    };

    assert_eq!(row("rqc", "request_timeout").value, "90s");
    assert_eq!(row("rqc", "request_timeout").source, ConfigSource::User);
    assert_eq!(row("agent", "base_url").source, ConfigSource::User);
    // Untouched fields keep their prior (default) source.
    assert_eq!(row("rqc", "poll_interval").source, ConfigSource::Default);
    assert_eq!(row("rate_limit", "enabled").source, ConfigSource::Default);

    config::reset();
}

#[test]
fn reset_restores_defaults() {
    let _guard = lock();

    config::configure(
        Overrides {
            rqc: Some(RqcOverrides {
                max_workers: Some(2),
                ..Default::default()
            }),
            ..Default::default()
        },
        true,
    )
    .unwrap();
    assert_eq!(config::current().rqc.max_workers.copied(), 2);

    config::reset();
    let snapshot = config::current();
    assert_eq!(snapshot.rqc.max_workers.copied(), 8);
    // Nothing in this environment sets STKAI_ variables, so everything is
    // back at its default source.
    assert_eq!(*snapshot.rqc.max_workers.source(), ConfigSource::Default);
}

#[test]
fn writes_are_visible_to_subsequent_reads() {
    let _guard = lock();
    config::reset();

    let before = config::current();
    config::configure(
        Overrides {
            auth: Some(AuthOverrides {
                client_id: Some("id".into()),
                client_secret: Some("secret".into()),
                ..Default::default()
            }),
            ..Default::default()
        },
        true,
    )
    .unwrap();

    // Old snapshots are unchanged; new reads observe the write.
    assert!(!before.auth.has_credentials());
    assert!(config::current().auth.has_credentials());

    config::reset();
    assert!(!config::current().auth.has_credentials());
}

#[test]
fn adaptive_preset_round_trips_through_explain() {
    let _guard = lock();
    config::reset();

    config::configure(
        Overrides {
            rate_limit: Some(RateLimitOverrides {
                enabled: Some(true),
                strategy: Some(RateLimitStrategy::Adaptive),
                preset: Some(RateLimitPreset::Optimistic),
                ..Default::default()
            }),
            ..Default::default()
        },
        true,
    )
    .unwrap();

    let snapshot = config::current();
    assert_eq!(snapshot.rate_limit.strategy.copied(), RateLimitStrategy::Adaptive);
    assert_eq!(snapshot.rate_limit.penalty_factor.copied(), 0.15);
    assert_eq!(snapshot.rate_limit.recovery_factor.copied(), 0.1);
    assert_eq!(*snapshot.rate_limit.penalty_factor.source(), ConfigSource::User);

    config::reset();
}

#[test]
fn invalid_overrides_are_rejected_and_leave_the_registry_intact() {
    let _guard = lock();
    config::reset();

    let result = config::configure(
        Overrides {
            rate_limit: Some(RateLimitOverrides {
                penalty_factor: Some(1.5),
                ..Default::default()
            }),
            ..Default::default()
        },
        true,
    );
    assert!(result.is_err());

    // The failed configure never published a snapshot.
    assert_eq!(config::current().rate_limit.penalty_factor.copied(), 0.3);
}
