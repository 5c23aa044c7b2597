use chrono::{Duration, Utc};
use fulfillment_service::promo::{evaluate, CandidateItem, PromoCode, PromoRejection};
use uuid::Uuid;

fn base_promo() -> PromoCode {
    PromoCode {
        id: Uuid::new_v4(),
        edition_id: Uuid::new_v4(),
        code: "LAUNCH20".to_string(),
        discount_type: "percentage".to_string(),
        value: 20,
        max_usage_count: None,
        max_usage_per_person: None,
        current_usage_count: 0,
        starts_at: None,
        expires_at: None,
        applicable_ticket_type_ids: Vec::new(),
        is_active: true,
    }
}

fn item(price_minor: i64, quantity: i32) -> CandidateItem {
    CandidateItem { ticket_type_id: Uuid::new_v4(), unit_price_minor: price_minor, quantity }
}

#[test]
fn percentage_discount_on_full_order() {
    // 20% of 2 x $50.00
    let discount = evaluate(&base_promo(), &[item(5000, 2)], 0, Utc::now()).unwrap();
    assert_eq!(discount.cents(), 2000);
}

#[test]
fn inactive_code_is_rejected() {
    let mut promo = base_promo();
    promo.is_active = false;
    let err = evaluate(&promo, &[item(5000, 1)], 0, Utc::now()).unwrap_err();
    assert_eq!(err, PromoRejection::Inactive);
}

#[test]
fn window_bounds_are_enforced() {
    let now = Utc::now();

    let mut not_started = base_promo();
    not_started.starts_at = Some(now + Duration::hours(1));
    assert_eq!(
        evaluate(&not_started, &[item(5000, 1)], 0, now).unwrap_err(),
        PromoRejection::NotStarted
    );

    let mut expired = base_promo();
    expired.expires_at = Some(now - Duration::hours(1));
    assert_eq!(
        evaluate(&expired, &[item(5000, 1)], 0, now).unwrap_err(),
        PromoRejection::Expired
    );
}

#[test]
fn global_cap_is_enforced() {
    let mut promo = base_promo();
    promo.max_usage_count = Some(5);
    promo.current_usage_count = 5;
    assert_eq!(
        evaluate(&promo, &[item(5000, 1)], 0, Utc::now()).unwrap_err(),
        PromoRejection::Exhausted
    );

    // One slot left is still accepted.
    promo.current_usage_count = 4;
    assert!(evaluate(&promo, &[item(5000, 1)], 0, Utc::now()).is_ok());
}

#[test]
fn per_person_cap_counts_prior_orders() {
    let mut promo = base_promo();
    promo.max_usage_per_person = Some(1);
    assert_eq!(
        evaluate(&promo, &[item(5000, 1)], 1, Utc::now()).unwrap_err(),
        PromoRejection::PerPersonLimit
    );
    assert!(evaluate(&promo, &[item(5000, 1)], 0, Utc::now()).is_ok());
}

#[test]
fn applicability_list_scopes_the_discount() {
    let vip = Uuid::new_v4();
    let standard = Uuid::new_v4();
    let mut promo = base_promo();
    promo.applicable_ticket_type_ids = vec![vip];

    let vip_item = CandidateItem { ticket_type_id: vip, unit_price_minor: 10_000, quantity: 1 };
    let std_item = CandidateItem { ticket_type_id: standard, unit_price_minor: 5_000, quantity: 2 };

    // Only the VIP line is discounted.
    let discount = evaluate(&promo, &[vip_item, std_item], 0, Utc::now()).unwrap();
    assert_eq!(discount.cents(), 2_000);

    // An order with no applicable line is rejected outright.
    assert_eq!(
        evaluate(&promo, &[std_item], 0, Utc::now()).unwrap_err(),
        PromoRejection::NotApplicable
    );
}

#[test]
fn empty_applicability_list_means_all_types() {
    let discount = evaluate(&base_promo(), &[item(1000, 1), item(2000, 1)], 0, Utc::now()).unwrap();
    assert_eq!(discount.cents(), 600);
}

#[test]
fn fixed_discount_clamps_at_item_total() {
    let mut promo = base_promo();
    promo.discount_type = "fixed".to_string();
    promo.value = 10_000; // $100 off a $30 order
    let discount = evaluate(&promo, &[item(1500, 2)], 0, Utc::now()).unwrap();
    assert_eq!(discount.cents(), 3000); // clamped, never negative
}

#[test]
fn free_code_zeroes_applicable_items() {
    let mut promo = base_promo();
    promo.discount_type = "free".to_string();
    let discount = evaluate(&promo, &[item(2500, 2)], 0, Utc::now()).unwrap();
    assert_eq!(discount.cents(), 5000);
}

#[test]
fn checks_short_circuit_in_order() {
    // An inactive, expired, exhausted code reports inactive first.
    let mut promo = base_promo();
    promo.is_active = false;
    promo.expires_at = Some(Utc::now() - Duration::hours(1));
    promo.max_usage_count = Some(1);
    promo.current_usage_count = 1;
    assert_eq!(
        evaluate(&promo, &[item(5000, 1)], 0, Utc::now()).unwrap_err(),
        PromoRejection::Inactive
    );
}

#[test]
fn unknown_discount_type_is_rejected() {
    let mut promo = base_promo();
    promo.discount_type = "bogo".to_string();
    assert_eq!(
        evaluate(&promo, &[item(5000, 1)], 0, Utc::now()).unwrap_err(),
        PromoRejection::BadDiscountType
    );
}
