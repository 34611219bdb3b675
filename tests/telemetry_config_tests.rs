//! Tests for TelemetryConfig and LogFormat.

use eventhub_processor::telemetry::{LogFormat, TelemetryConfig, init_logging, is_otel_enabled};

#[test]
fn test_log_format_copy() {
    let format = LogFormat::Json;
    let copied = format;
    assert_eq!(format, copied);
}

#[test]
fn test_log_format_default_is_pretty() {
    assert_eq!(LogFormat::default(), LogFormat::Pretty);
}

#[test]
fn test_log_format_parse_is_lenient() {
    assert_eq!("Json".parse::<LogFormat>().unwrap(), LogFormat::Json);
    assert_eq!("\tjson\n".parse::<LogFormat>().unwrap(), LogFormat::Json);
    assert_eq!("compact".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
}

#[test]
fn test_telemetry_config_custom_values() {
    let config = TelemetryConfig {
        service_name: "my-custom-service".to_string(),
        otlp_endpoint: "http://custom:4318".to_string(),
        log_format: LogFormat::Json,
    };

    assert_eq!(config.service_name, "my-custom-service");
    assert_eq!(config.otlp_endpoint, "http://custom:4318");
    assert_eq!(config.log_format, LogFormat::Json);
}

#[test]
fn test_second_global_subscriber_is_rejected() {
    // Whichever call comes first wins; the second must fail cleanly.
    let first = init_logging(LogFormat::Json);
    let second = init_logging(LogFormat::Pretty);
    assert!(first.is_ok());
    assert!(second.is_err());
}

#[test]
fn test_otel_feature_flag() {
    assert_eq!(is_otel_enabled(), cfg!(feature = "otel"));
}
