//! Error type tests

use soap_stream::{ConfigError, SoapError, TransportError};

#[test]
fn test_io_error_conversion() {
    let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "File not found");
    let error: SoapError = io_error.into();

    assert!(matches!(error, SoapError::Io(_)));
    assert!(error.to_string().contains("File not found"));
}

#[test]
fn test_retryable_transport_errors() {
    let timeout = TransportError::Timeout {
        url: "http://service.test/items.asmx".to_string(),
        timeout_seconds: 30,
    };
    let connection = TransportError::Connection {
        url: "http://service.test/items.asmx".to_string(),
        details: "connection refused".to_string(),
    };
    let stream = TransportError::Stream {
        details: "body closed early".to_string(),
    };

    assert!(timeout.is_retryable());
    assert!(connection.is_retryable());
    assert!(stream.is_retryable());
}

#[test]
fn test_non_retryable_transport_errors() {
    let challenge = TransportError::AuthenticationChallenge {
        realm: Some("items".to_string()),
    };
    let invalid = TransportError::InvalidRequest {
        details: "bad header".to_string(),
    };

    assert!(!challenge.is_retryable());
    assert!(!invalid.is_retryable());
    assert!(challenge.to_string().contains("items"));
}

#[test]
fn test_retries_exhausted_reports_attempts() {
    let error = SoapError::RetriesExhausted {
        attempts: 4,
        source: TransportError::Connection {
            url: "http://service.test/".to_string(),
            details: "reset".to_string(),
        },
    };

    assert_eq!(error.attempts(), Some(4));
    assert!(error.to_string().contains("4 attempt(s)"));
    assert!(error.partial_tree().is_none());
    assert_eq!(SoapError::RunInProgress.attempts(), None);
}

#[test]
fn test_config_error_conversion() {
    let error: SoapError = ConfigError::Validation("Timeout must be greater than 0".to_string()).into();

    let message = error.to_string();
    assert!(message.contains("Configuration error"));
    assert!(message.contains("Timeout"));
}
