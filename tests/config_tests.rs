use eos_payload::config::*;
use eos_payload::device::DeviceId;
use eos_payload::drivers::DriverRegistry;

const FLIGHT_CONFIG: &str = r#"{
    "bus_address": "127.0.0.1:18830",
    "health_interval_secs": 5,
    "devices": [
        {
            "device_id": "RADIO",
            "name": "radio",
            "driver_class": "RadioDriver",
            "enabled": "true",
            "settings": { "link_bind": "0.0.0.0:7000", "ground_address": "10.0.0.2:7000" }
        },
        {
            "device_id": "VALVE",
            "driver_class": "ValveDriver",
            "enabled": "true"
        },
        {
            "device_id": "CUTDOWN",
            "name": "cutdown",
            "driver_class": "CutdownDriver",
            "enabled": true
        },
        {
            "device_id": "DOWNLINK",
            "name": "downlink",
            "driver_class": "DownlinkDriver",
            "enabled": "true"
        },
        {
            "device_id": "RADIO",
            "name": "second-radio",
            "driver_class": "RadioDriver",
            "enabled": "true",
            "settings": { "link_bind": "0.0.0.0:7001", "ground_address": "10.0.0.2:7001" }
        },
        {
            "device_id": "CAMERA",
            "name": "camera",
            "driver_class": "CameraDriver",
            "enabled": "true"
        },
        {
            "device_id": "NOT_A_DEVICE",
            "name": "mystery",
            "driver_class": "PingDriver",
            "enabled": "true"
        },
        {
            "device_id": "MISC_RADIO_1",
            "name": "bad name!",
            "driver_class": "PingDriver",
            "enabled": "true"
        }
    ]
}"#;

fn outcomes() -> Vec<DeviceOutcome> {
    let config = PayloadConfig::from_json(FLIGHT_CONFIG).unwrap();
    config.configure_devices(&DriverRegistry::builtin())
}

#[test]
fn test_top_level_settings() {
    let config = PayloadConfig::from_json(FLIGHT_CONFIG).unwrap();
    assert_eq!(config.bus_address, "127.0.0.1:18830");
    assert_eq!(config.health_interval().as_secs(), 5);
    assert_eq!(config.heartbeat_timeout().as_secs(), DEFAULT_HEARTBEAT_TIMEOUT_SECS);
    assert_eq!(config.devices.len(), 8);
}

#[test]
fn test_one_outcome_per_entry_in_file_order() {
    let outcomes = outcomes();
    assert_eq!(outcomes.len(), 8);

    match &outcomes[0] {
        DeviceOutcome::Valid(device) => {
            assert_eq!(device.device_id, DeviceId::Radio);
            assert_eq!(device.pretty_id.as_str(), "radio-003");
            assert_eq!(device.setting_str("ground_address"), Some("10.0.0.2:7000"));
        }
        other => panic!("expected radio to be valid, got {other:?}"),
    }

    match &outcomes[1] {
        DeviceOutcome::Valid(device) => {
            assert_eq!(device.name, "valve-driver");
            assert_eq!(device.pretty_id.as_str(), "valve-driver-005");
        }
        other => panic!("expected generated valve name, got {other:?}"),
    }
}

#[test]
fn test_enabled_must_be_the_string_true() {
    let outcomes = outcomes();
    assert!(matches!(&outcomes[2], DeviceOutcome::Disabled { name } if name == "cutdown"));
}

#[test]
fn test_invalid_entries_are_reported_not_fatal() {
    let outcomes = outcomes();

    assert!(matches!(
        &outcomes[3],
        DeviceOutcome::Invalid { reason: ConfigError::MissingSetting(key), .. } if key == "files"
    ));
    assert!(matches!(
        &outcomes[4],
        DeviceOutcome::Invalid { reason: ConfigError::DuplicateDeviceId(DeviceId::Radio), .. }
    ));
    assert!(matches!(
        &outcomes[5],
        DeviceOutcome::Invalid { reason: ConfigError::UnknownDriverClass(class), .. } if class == "CameraDriver"
    ));
    assert!(matches!(
        &outcomes[6],
        DeviceOutcome::Invalid { reason: ConfigError::UnknownDeviceId(id), .. } if id == "NOT_A_DEVICE"
    ));
}

#[test]
fn test_invalid_name_falls_back_to_class_name() {
    let outcomes = outcomes();
    match &outcomes[7] {
        DeviceOutcome::Valid(device) => {
            assert_eq!(device.name, "ping-driver");
            assert_eq!(device.pretty_id.as_str(), "ping-driver-010");
        }
        other => panic!("expected fallback name, got {other:?}"),
    }
}

#[test]
fn test_find_device_by_pretty_id() {
    let config = PayloadConfig::from_json(FLIGHT_CONFIG).unwrap();
    let registry = DriverRegistry::builtin();

    let radio = config.find_device(&registry, "radio-003").unwrap();
    assert_eq!(radio.driver_class, "RadioDriver");
    assert!(config.find_device(&registry, "cutdown-004").is_none());
    assert!(config.find_device(&registry, "second-radio-003").is_none());
}

#[test]
fn test_name_length_limit() {
    let long_name = "a".repeat(MAX_NAME_LEN + 1);
    let json = format!(
        r#"{{"devices": [{{"device_id": "GPS", "name": "{long_name}", "driver_class": "PingDriver", "enabled": "true"}}]}}"#
    );
    let config = PayloadConfig::from_json(&json).unwrap();
    let outcomes = config.configure_devices(&DriverRegistry::builtin());
    assert!(matches!(
        &outcomes[0],
        DeviceOutcome::Invalid { reason: ConfigError::NameTooLong(_), .. }
    ));
}

#[test]
fn test_malformed_file_is_an_error() {
    assert!(matches!(
        PayloadConfig::from_json("{\"devices\": ["),
        Err(ConfigError::Parse(_))
    ));
}
