//! Canopy - hierarchical portfolio allocation and rolling backtests.
//!
//! # Overview
//!
//! Canopy builds long-only portfolios from the correlation structure of asset
//! returns, without inverting a covariance matrix:
//!
//! - **Clustering**: agglomerative clustering on correlation distance
//!   (single, average, complete and Ward linkage)
//! - **Quasi-diagonalization**: correlated assets placed next to each other
//! - **HRP**: recursive bisection in inverse proportion to cluster variance
//! - **HERC**: equal budget per top-level cluster, HRP inside each cluster
//! - **Cash control**: a fixed cash sleeve or annualized volatility targeting
//! - **Exposure limits**: per-asset caps with an optional core holding
//! - **Backtests**: month/quarter/year-end rebalancing, benchmark runs and
//!   performance analytics
//!
//! # Quick Start
//!
//! ```no_run
//! use canopy::{
//!     backtest::{BacktestConfig, Backtester},
//!     data::{load_prices_csv, ReturnMethod, ReturnTable},
//!     types::Algorithm,
//! };
//!
//! let prices = load_prices_csv("data/prices.csv", &Default::default()).unwrap();
//! let returns = ReturnTable::from_prices(&prices, ReturnMethod::Simple).unwrap();
//!
//! let config = BacktestConfig {
//!     algorithm: Algorithm::Herc,
//!     cash_symbol: "XEON".to_string(),
//!     ..Default::default()
//! };
//! let result = Backtester::new(config).run(&returns).unwrap();
//!
//! println!("Return: {:.2}%", result.total_return() * 100.0);
//! ```
//!
//! # Single allocation
//!
//! ```
//! use canopy::allocator::{AllocationInput, Allocator, HrpAllocator};
//! use canopy::cluster::cluster;
//! use canopy::distance::distance_matrix;
//! use canopy::stats::correlation_from_covariance;
//! use canopy::types::Linkage;
//!
//! let cov = vec![vec![0.04, 0.006], vec![0.006, 0.01]];
//! let corr = correlation_from_covariance(&cov);
//! let tree = cluster(&distance_matrix(&corr).unwrap(), Linkage::Single).unwrap();
//! let order = tree.leaf_order();
//!
//! let weights = HrpAllocator::new()
//!     .allocate(&AllocationInput::new(&tree, &order, &cov))
//!     .unwrap();
//! assert!((weights[0] - 0.2).abs() < 1e-12);
//! ```
//!
//! # Modules
//!
//! - [`types`]: Shared enums and value types (weights, equity points)
//! - [`data`]: Price and return tables, CSV loading
//! - [`stats`]: Covariance and correlation estimation
//! - [`distance`]: Correlation distance
//! - [`cluster`]: Hierarchical clustering, leaf order and tree cuts
//! - [`allocator`]: HRP and HERC allocators
//! - [`cash`]: Cash weight control
//! - [`constraints`]: Exposure limits
//! - [`backtest`]: Rolling rebalancing backtests
//! - [`analytics`]: Performance metrics and reporting
//! - [`config`]: TOML configuration file support

pub mod allocator;
pub mod analytics;
pub mod backtest;
pub mod cash;
pub mod cluster;
pub mod config;
pub mod constraints;
pub mod data;
pub mod distance;
pub mod error;
pub mod stats;
pub mod types;

// Re-exports for convenience
pub use allocator::{allocator_for, AllocationInput, Allocator, HercAllocator, HrpAllocator};
pub use analytics::{summary_table, BenchmarkMetrics, PerformanceMetrics};
pub use backtest::{
    BacktestConfig, BacktestResult, Backtester, BenchmarkComparison, Provenance, RebalanceRecord,
};
pub use cash::{CashAdjustment, CashController, CashMode};
pub use cluster::{cluster, ClusterSnapshot, ClusterTree};
pub use config::RunFileConfig;
pub use constraints::ExposureLimits;
pub use data::{load_prices_csv, PriceTable, ReturnMethod, ReturnTable};
pub use distance::distance_matrix;
pub use error::{AllocationError, Result};
pub use types::{
    Algorithm, ClusterCount, EquityPoint, ErrorPolicy, Linkage, PeriodState, RebalanceFrequency,
    WeightVector,
};
