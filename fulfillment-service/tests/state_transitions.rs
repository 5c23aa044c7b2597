use fulfillment_service::orders::{is_valid_transition, OrderStatus};

#[test]
fn pending_can_pay_or_cancel() {
    assert!(is_valid_transition(OrderStatus::Pending, OrderStatus::Paid));
    assert!(is_valid_transition(OrderStatus::Pending, OrderStatus::Cancelled));
    assert!(!is_valid_transition(OrderStatus::Pending, OrderStatus::Refunded));
}

#[test]
fn paid_can_only_refund() {
    assert!(is_valid_transition(OrderStatus::Paid, OrderStatus::Refunded));
    assert!(!is_valid_transition(OrderStatus::Paid, OrderStatus::Pending));
    assert!(!is_valid_transition(OrderStatus::Paid, OrderStatus::Cancelled));
}

#[test]
fn terminal_states_stay_terminal() {
    for terminal in [OrderStatus::Cancelled, OrderStatus::Refunded] {
        for target in [
            OrderStatus::Pending,
            OrderStatus::Paid,
            OrderStatus::Cancelled,
            OrderStatus::Refunded,
        ] {
            assert!(!is_valid_transition(terminal, target), "{terminal:?} -> {target:?}");
        }
    }
}

#[test]
fn status_round_trips_through_storage_form() {
    for status in [
        OrderStatus::Pending,
        OrderStatus::Paid,
        OrderStatus::Cancelled,
        OrderStatus::Refunded,
    ] {
        assert_eq!(OrderStatus::parse(status.as_str()), Some(status));
    }
    assert_eq!(OrderStatus::parse("PAID"), None);
    assert_eq!(OrderStatus::parse(""), None);
}
