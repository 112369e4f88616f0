//! Performance benchmarks for clustering, allocation and backtests.
//!
//! Run with: cargo bench

use canopy::allocator::{AllocationInput, Allocator, HercAllocator, HrpAllocator};
use canopy::backtest::{BacktestConfig, Backtester};
use canopy::cash::CashMode;
use canopy::cluster::cluster;
use canopy::data::ReturnTable;
use canopy::distance::distance_matrix;
use canopy::stats::{correlation_from_covariance, covariance_matrix};
use canopy::types::{Algorithm, ClusterCount, Linkage};
use chrono::{Days, NaiveDate};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

/// Generate synthetic daily returns for `n_assets` risk assets plus a cash column.
fn generate_returns(days: usize, n_assets: usize) -> ReturnTable {
    let start = NaiveDate::from_ymd_opt(2015, 1, 1).unwrap();
    let dates = (0..days).map(|i| start + Days::new(i as u64)).collect();

    let mut columns: Vec<Vec<f64>> = (0..n_assets)
        .map(|a| {
            let beta = 0.5 + (a % 4) as f64 * 0.25;
            let freq = 0.3 + a as f64 * 0.17;
            (0..days)
                .map(|i| {
                    let t = i as f64;
                    let market = 0.008 * (t * 0.7).sin() + 0.003 * (t * 1.9).cos();
                    beta * market + 0.004 * (t * freq).sin()
                })
                .collect()
        })
        .collect();
    columns.push(vec![0.0001; days]);

    let mut symbols: Vec<String> = (0..n_assets).map(|a| format!("A{:02}", a)).collect();
    symbols.push("CASH".to_string());

    ReturnTable::new(dates, symbols, columns).unwrap()
}

fn covariance_for(n_assets: usize) -> Vec<Vec<f64>> {
    let returns = generate_returns(252, n_assets).without("CASH");
    covariance_matrix(&returns).unwrap()
}

/// Benchmark hierarchical clustering.
fn bench_clustering(c: &mut Criterion) {
    let mut group = c.benchmark_group("clustering");

    for n in [10, 25, 50, 100].iter() {
        let corr = correlation_from_covariance(&covariance_for(*n));
        let dist = distance_matrix(&corr).unwrap();

        for linkage in [Linkage::Single, Linkage::Ward] {
            group.bench_with_input(
                BenchmarkId::new(format!("{:?}", linkage).to_lowercase(), n),
                &dist,
                |b, dist| b.iter(|| cluster(black_box(dist), linkage)),
            );
        }
    }

    group.finish();
}

/// Benchmark HRP and HERC allocation on a prebuilt tree.
fn bench_allocation(c: &mut Criterion) {
    let mut group = c.benchmark_group("allocation");

    for n in [10, 50, 100].iter() {
        let cov = covariance_for(*n);
        let corr = correlation_from_covariance(&cov);
        let tree = cluster(&distance_matrix(&corr).unwrap(), Linkage::Average).unwrap();
        let order = tree.leaf_order();
        let input = AllocationInput::new(&tree, &order, &cov);

        let hrp = HrpAllocator::new();
        group.bench_with_input(BenchmarkId::new("hrp", n), &input, |b, input| {
            b.iter(|| hrp.allocate(black_box(input)))
        });

        let herc = HercAllocator::new(ClusterCount::MaxGap);
        group.bench_with_input(BenchmarkId::new("herc_max_gap", n), &input, |b, input| {
            b.iter(|| herc.allocate(black_box(input)))
        });
    }

    group.finish();
}

/// Benchmark full rolling backtests.
fn bench_backtest(c: &mut Criterion) {
    let mut group = c.benchmark_group("backtest");
    group.sample_size(10); // Fewer samples for slow benchmarks

    for days in [504, 1260, 2520].iter() {
        let returns = generate_returns(*days, 20);

        group.bench_with_input(BenchmarkId::new("herc_20_assets", days), &returns, |b, returns| {
            let config = BacktestConfig {
                algorithm: Algorithm::Herc,
                linkage: Linkage::Ward,
                cluster_count: ClusterCount::MaxGap,
                cash_mode: CashMode::VolTarget { target_vol: 0.10 },
                ..Default::default()
            };
            let backtester = Backtester::new(config);
            b.iter(|| backtester.run(black_box(returns)))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_clustering, bench_allocation, bench_backtest);

criterion_main!(benches);
