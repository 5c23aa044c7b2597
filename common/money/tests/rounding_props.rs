use bigdecimal::BigDecimal;
use common_money::{normalize_scale, Money};
use proptest::prelude::*;
use std::str::FromStr;

proptest! {
    // Normalizing an already-2-decimal value is the identity regardless of mode.
    #[test]
    fn two_decimal_values_are_fixed_points(cents in -1_000_000i64..1_000_000) {
        let bd: BigDecimal = Money::from_cents(cents).into();
        prop_assert_eq!(normalize_scale(&bd), bd.clone());
    }

    // apply_bps never exceeds the undiscounted amount for fractions <= 100%.
    #[test]
    fn bps_fraction_bounded(cents in 0i64..10_000_000, bps in 0i64..=10_000) {
        let m = Money::from_cents(cents);
        let part = m.apply_bps(bps);
        prop_assert!(part.cents() >= 0);
        prop_assert!(part <= m);
    }

    // Half-up error is strictly less than one cent: |bps-exact - rounded| < 1 cent.
    #[test]
    fn bps_rounding_error_below_one_cent(cents in 0i64..1_000_000, bps in 0i64..=10_000) {
        let exact_num = cents as i128 * bps as i128; // in 1/10_000 cents
        let rounded = Money::from_cents(cents).apply_bps(bps).cents() as i128 * 10_000;
        prop_assert!((exact_num - rounded).abs() <= 5_000);
    }
}
