//! Tests for error classification.

use super::*;

fn lock_lost() -> ClientError {
    ClientError::LockLost {
        lock_token: "token".to_string(),
    }
}

fn busy() -> ClientError {
    ClientError::Transient {
        message: "server busy".to_string(),
    }
}

#[test]
fn test_only_transient_errors_are_transient() {
    assert!(busy().is_transient());

    let others = [
        lock_lost(),
        ClientError::EntityNotFound {
            entity: "queue001".to_string(),
        },
        ClientError::SizeExceeded {
            size: 1000,
            max_size: 500,
        },
        ClientError::ConnectionClosed,
    ];
    for error in others {
        assert!(!error.is_transient(), "{} should not be transient", error);
    }
}

#[test]
fn test_fatal_classification() {
    assert!(ClientError::Unauthorized {
        message: "bad key".to_string(),
    }
    .is_fatal());
    assert!(ClientError::SessionLocked {
        session_id: "hello-session1".to_string(),
    }
    .is_fatal());

    assert!(!busy().is_fatal());
    assert!(!lock_lost().is_fatal());
    assert!(!ClientError::ConnectionClosed.is_fatal());
}

#[test]
fn test_lock_errors_require_receive() {
    assert!(lock_lost().requires_receive());
    assert!(ClientError::SessionLockLost {
        session_id: "s1".to_string(),
    }
    .requires_receive());

    assert!(!busy().requires_receive());
    assert!(!ClientError::ConnectionClosed.requires_receive());
}

#[test]
fn test_timed_out_is_transient() {
    let error = ClientError::timed_out("send", Duration::from_millis(250));

    assert!(error.is_transient());
    assert!(error.to_string().contains("send timed out"));
}

#[test]
fn test_nested_errors_display_transparently() {
    let error: ClientError = ValidationError::Required {
        field: "session_id".to_string(),
    }
    .into();

    assert_eq!(error.to_string(), "session_id must not be empty");
}
