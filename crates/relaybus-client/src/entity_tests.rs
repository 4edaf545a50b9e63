//! Tests for entity naming and addressing.

use super::*;

#[test]
fn test_entity_name_validation() {
    assert!(EntityName::new("queue001".to_string()).is_ok());
    assert!(EntityName::new("prefetch.dest_1".to_string()).is_ok());

    assert!(EntityName::new("".to_string()).is_err());
    assert!(EntityName::new("a".repeat(261)).is_err());
    assert!(EntityName::new("-leading".to_string()).is_err());
    assert!(EntityName::new("double--hyphen".to_string()).is_err());
    assert!(EntityName::new("slash/name".to_string()).is_err());
}

#[test]
fn test_display_formats() {
    let queue = EntityPath::queue("queue001".parse().unwrap());
    assert_eq!(queue.to_string(), "queue001");
    assert_eq!(queue.dead_letter().to_string(), "queue001/$deadletterqueue");

    let subscription =
        EntityPath::subscription("topic001".parse().unwrap(), "sub1".parse().unwrap());
    assert_eq!(subscription.to_string(), "topic001/subscriptions/sub1");
}

#[test]
fn test_parse_round_trips_through_display() {
    for raw in [
        "queue001",
        "queue001/$deadletterqueue",
        "topic001/subscriptions/sub1",
        "topic001/subscriptions/sub1/$deadletterqueue",
    ] {
        let path: EntityPath = raw.parse().unwrap();
        assert_eq!(path.to_string(), raw);
    }
}

#[test]
fn test_parse_rejects_invalid_segments() {
    assert!("".parse::<EntityPath>().is_err());
    assert!("topic001/subscriptions/".parse::<EntityPath>().is_err());
}

#[test]
fn test_send_and_receive_capabilities() {
    let queue = EntityPath::queue("q".parse().unwrap());
    let topic = EntityPath::topic("t".parse().unwrap());
    let subscription = EntityPath::subscription("t".parse().unwrap(), "s".parse().unwrap());

    assert!(queue.is_sendable());
    assert!(queue.is_receivable());
    assert!(topic.is_sendable());
    assert!(!topic.is_receivable());
    assert!(!subscription.is_sendable());
    assert!(subscription.is_receivable());

    let dlq = queue.dead_letter();
    assert!(!dlq.is_sendable());
    assert!(dlq.is_receivable());
    assert!(dlq.is_dead_letter());
    assert_eq!(dlq.main(), queue);
}
