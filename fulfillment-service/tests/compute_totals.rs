use common_money::Money;

#[test]
fn compute_discount_rounding_half_up() {
    // subtotal = $10.00, discount 15% = $1.50 exact -> total $8.50
    let subtotal = Money::from_cents(1000);
    let discount = subtotal.apply_bps(1500);
    assert_eq!(discount.cents(), 150);
    let total = subtotal.saturating_sub(discount);
    assert_eq!(total.cents(), 850);
}

#[test]
fn compute_odd_subtotal_rounds_half_up() {
    // 15% of $3.33 = 49.95 cents -> 50
    let subtotal = Money::from_cents(333);
    assert_eq!(subtotal.apply_bps(1500).cents(), 50);
    // 10% of $0.05 = 0.5 cents -> 1
    assert_eq!(Money::from_cents(5).apply_bps(1000).cents(), 1);
}

#[test]
fn compute_multi_line_snapshot_totals() {
    // 2 x $45.00 + 1 x $120.00 = $210.00
    let lines: [(i64, i32); 2] = [(4500, 2), (12000, 1)];
    let mut subtotal = Money::ZERO;
    for (unit_price, quantity) in lines {
        let line = Money::from_cents(unit_price).checked_mul(quantity as i64).unwrap();
        subtotal = subtotal.checked_add(line).unwrap();
    }
    assert_eq!(subtotal.cents(), 21000);

    // A fixed $25 code leaves $185.00.
    let total = subtotal.saturating_sub(Money::from_cents(2500));
    assert_eq!(total.cents(), 18500);
}

#[test]
fn discount_never_drives_total_negative() {
    let subtotal = Money::from_cents(900);
    let oversized = Money::from_cents(5000);
    assert_eq!(subtotal.saturating_sub(oversized), Money::ZERO);
}

#[test]
fn free_order_total_is_exactly_zero() {
    let subtotal = Money::from_cents(4400);
    let discount = subtotal.apply_bps(10_000); // 100%
    assert_eq!(discount, subtotal);
    assert!(subtotal.saturating_sub(discount).is_zero());
}
