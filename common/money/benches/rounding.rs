use bigdecimal::BigDecimal;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::str::FromStr;

use common_money::{init_rounding_mode_from_env, normalize_scale, Money};

fn bench_half_up(c: &mut Criterion) {
    std::env::remove_var("MONEY_ROUNDING");
    init_rounding_mode_from_env();
    let samples: Vec<BigDecimal> = [
        "1.005",
        "2.675",
        "0.005",
        "-1.005",
        "-2.505",
        "12345",
        "19.90",
        "1000000.555",
        "-999999.995",
        "0.3349",
        "42.4242",
    ]
    .into_iter()
    .map(|s| BigDecimal::from_str(s).unwrap())
    .collect();
    c.bench_function("round_half_up_normalize", |b| {
        b.iter(|| {
            for v in &samples {
                black_box(normalize_scale(v));
            }
        });
    });
}

fn bench_discount_bps(c: &mut Criterion) {
    let amounts: Vec<Money> = (1..500).map(|i| Money::from_cents(i * 37)).collect();
    c.bench_function("discount_apply_bps", |b| {
        b.iter(|| {
            for m in &amounts {
                black_box(m.apply_bps(1500));
            }
        });
    });
}

criterion_group!(rounding, bench_half_up, bench_discount_bps);
criterion_main!(rounding);
