//! Configuration file tests: defaults, fallback address persistence and
//! preservation of keys owned by other tools.

use pillbox_core::{NotificationLevel, PillboxConfig};

#[test]
fn test_missing_file_yields_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = PillboxConfig::load(dir.path().join("absent.json")).unwrap();
    assert_eq!(config.pillbox_port, 8080);
    assert!(config.fallback_address().is_none());
}

#[test]
fn test_remember_device_round_trips_through_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("system_config.json");
    std::fs::write(
        &path,
        r#"{
            "sender_email": "host@example.com",
            "family_contacts": [
                {"name": "Ann", "email": "ann@example.com", "relationship": "Daughter", "notification_level": "all"}
            ]
        }"#,
    )
    .unwrap();

    let mut config = PillboxConfig::load(&path).unwrap();
    assert_eq!(config.family_contacts.len(), 1);
    assert_eq!(
        config.family_contacts[0].notification_level,
        NotificationLevel::All
    );

    config.remember_device(&path, "192.168.4.2", 8081).unwrap();
    assert_eq!(
        config.fallback_address(),
        Some(("192.168.4.2".to_string(), 8081))
    );

    let reloaded = PillboxConfig::load(&path).unwrap();
    assert_eq!(
        reloaded.fallback_address(),
        Some(("192.168.4.2".to_string(), 8081))
    );
    assert_eq!(
        reloaded.extra.get("sender_email").and_then(|v| v.as_str()),
        Some("host@example.com")
    );
    assert_eq!(reloaded.family_contacts.len(), 1);
}

#[test]
fn test_malformed_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.json");
    std::fs::write(&path, "{ not json").unwrap();
    assert!(PillboxConfig::load(&path).is_err());
}
