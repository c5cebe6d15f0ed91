//! Error module tests

use crate::error::Error;

#[test]
fn test_node_not_found_error() {
    let error = Error::NodeNotFound("concept:rust".to_string());
    assert_eq!(error.code(), "E001");
    assert!(error.is_not_found());
    assert!(error.to_string().contains("concept:rust"));
    assert!(error.suggestion().is_some());
}

#[test]
fn test_task_not_found_error() {
    let error = Error::TaskNotFound("task:1".to_string());
    assert_eq!(error.code(), "E002");
    assert!(error.is_not_found());
    assert_eq!(error.suggestion(), None);
}

#[test]
fn test_validation_error() {
    let error = Error::validation("missing node_type");
    assert_eq!(error.code(), "E100");
    assert!(!error.is_not_found());
    assert!(error.to_string().contains("missing node_type"));
}

#[test]
fn test_conflict_error() {
    let error = Error::Conflict("task claimed elsewhere".to_string());
    assert_eq!(error.code(), "E200");
    assert!(error.is_conflict());
    assert_eq!(error.suggestion(), Some("retry the operation".to_string()));
}

#[test]
fn test_serialization_error_from() {
    let parse_error = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
    let error: Error = parse_error.into();
    assert_eq!(error.code(), "E401");
}

#[test]
fn test_io_error_is_transparent() {
    let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
    let error: Error = io.into();
    assert_eq!(error.code(), "E9999");
    assert_eq!(error.to_string(), "gone");
}
