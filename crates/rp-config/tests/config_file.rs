use std::io::Write;

use rp_config::{ConfigError, IngestConfig};

#[test]
fn test_partial_file_keeps_defaults() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[broker]
addresses = ["rabbitmq:5672"]
virtual_host = "reporting"

[topology]
queue_count = 3

[reclamation]
interval_secs = 120
"#
    )
    .unwrap();

    let config = IngestConfig::from_file(file.path()).unwrap();

    assert_eq!(config.broker.addresses, vec!["rabbitmq:5672"]);
    assert_eq!(config.broker.virtual_host, "reporting");
    assert_eq!(config.broker.username, "guest");
    assert_eq!(config.topology.queue_count, 3);
    assert_eq!(config.topology.parking_lot_ttl_days, 7);
    assert_eq!(config.consumer.prefetch_count, 10);
    assert_eq!(config.reclamation.interval_secs, 120);
    assert_eq!(config.reclamation.initial_delay_secs, 60);
}

#[test]
fn test_malformed_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[topology\nqueue_count = ").unwrap();

    let err = IngestConfig::from_file(file.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Parse { .. }));
}

#[test]
fn test_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let err = IngestConfig::from_file(&dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, ConfigError::Read { .. }));
}

#[test]
fn test_load_rejects_parking_lot_ttl_beyond_broker_limit() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[topology]\nparking_lot_ttl_days = 60").unwrap();

    let config = IngestConfig::from_file(file.path()).unwrap();
    assert_eq!(config.topology.parking_lot_ttl_days, 60);

    let err = IngestConfig::load(Some(file.path())).unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(ref msg) if msg.contains("parking_lot_ttl_days")));
}
