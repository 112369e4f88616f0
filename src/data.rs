//! Price and return tables, and loading them from CSV files.
//!
//! The expected file layout is "wide": one date column followed by one
//! closing-price column per ticker, as produced by most market data exports.
//!
//! ```text
//! Date,SWDA,EMIM,XEON
//! 2024-01-02,88.10,29.41,140.01
//! 2024-01-03,87.65,29.20,140.02
//! ```

use crate::error::{AllocationError, Result};
use chrono::{NaiveDate, NaiveDateTime};
use csv::ReaderBuilder;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::ops::Range;
use std::path::Path;
use tracing::{debug, info, warn};

/// How prices are turned into returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReturnMethod {
    /// `p[t] / p[t-1] - 1`
    #[default]
    Simple,
    /// `ln(p[t] / p[t-1])`
    Log,
}

/// CSV loading configuration.
#[derive(Debug, Clone, Default)]
pub struct DataConfig {
    /// Date format string for parsing (e.g., "%Y-%m-%d"). Auto-detected when `None`.
    pub date_format: Option<String>,
    /// CSV delimiter character. If None, delimiter is auto-detected.
    pub delimiter: Option<u8>,
    /// Skip rows with unparsable dates or prices instead of failing.
    pub skip_invalid: bool,
}

/// Check the shared layout invariants of price and return tables.
fn validate_layout(dates: &[NaiveDate], symbols: &[String], columns: &[Vec<f64>]) -> Result<()> {
    if symbols.len() != columns.len() {
        return Err(AllocationError::InputError(format!(
            "{} symbols but {} columns",
            symbols.len(),
            columns.len()
        )));
    }

    let mut seen = HashSet::new();
    for symbol in symbols {
        if !seen.insert(symbol.as_str()) {
            return Err(AllocationError::InputError(format!(
                "Duplicate symbol: {}",
                symbol
            )));
        }
    }

    if let Some(w) = dates.windows(2).find(|w| w[1] <= w[0]) {
        return Err(AllocationError::InputError(format!(
            "Dates must be strictly increasing: {} followed by {}",
            w[0], w[1]
        )));
    }

    for (symbol, column) in symbols.iter().zip(columns) {
        if column.len() != dates.len() {
            return Err(AllocationError::InputError(format!(
                "Series {} has {} observations, index has {}",
                symbol,
                column.len(),
                dates.len()
            )));
        }
        if let Some(pos) = column.iter().position(|v| !v.is_finite()) {
            return Err(AllocationError::InputError(format!(
                "Series {} has a non-finite value on {}",
                symbol, dates[pos]
            )));
        }
    }

    Ok(())
}

/// Daily closing prices, one column per ticker, on a shared date index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceTable {
    dates: Vec<NaiveDate>,
    symbols: Vec<String>,
    columns: Vec<Vec<f64>>,
}

impl PriceTable {
    /// Create a price table; every price must be finite and strictly positive.
    pub fn new(dates: Vec<NaiveDate>, symbols: Vec<String>, columns: Vec<Vec<f64>>) -> Result<Self> {
        validate_layout(&dates, &symbols, &columns)?;
        for (symbol, column) in symbols.iter().zip(&columns) {
            if let Some(pos) = column.iter().position(|p| *p <= 0.0) {
                return Err(AllocationError::InputError(format!(
                    "Series {} has a non-positive price on {}",
                    symbol, dates[pos]
                )));
            }
        }
        Ok(Self {
            dates,
            symbols,
            columns,
        })
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    /// Prices for a symbol.
    pub fn column(&self, symbol: &str) -> Option<&[f64]> {
        self.symbols
            .iter()
            .position(|s| s == symbol)
            .map(|i| self.columns[i].as_slice())
    }

    /// Convert to returns; the first date is consumed.
    pub fn to_returns(&self, method: ReturnMethod) -> Result<ReturnTable> {
        ReturnTable::from_prices(self, method)
    }
}

/// Aligned daily return series, one column per asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReturnTable {
    dates: Vec<NaiveDate>,
    symbols: Vec<String>,
    columns: Vec<Vec<f64>>,
}

impl ReturnTable {
    /// Create a return table, checking alignment and finiteness.
    pub fn new(dates: Vec<NaiveDate>, symbols: Vec<String>, columns: Vec<Vec<f64>>) -> Result<Self> {
        validate_layout(&dates, &symbols, &columns)?;
        Ok(Self {
            dates,
            symbols,
            columns,
        })
    }

    /// Compute returns from a price table.
    pub fn from_prices(prices: &PriceTable, method: ReturnMethod) -> Result<Self> {
        if prices.len() < 2 {
            return Err(AllocationError::InsufficientHistory {
                available: prices.len(),
                required: 2,
            });
        }

        let columns = prices
            .columns
            .iter()
            .map(|col| {
                col.windows(2)
                    .map(|w| match method {
                        ReturnMethod::Simple => w[1] / w[0] - 1.0,
                        ReturnMethod::Log => (w[1] / w[0]).ln(),
                    })
                    .collect()
            })
            .collect();

        Self::new(prices.dates[1..].to_vec(), prices.symbols.clone(), columns)
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    /// Number of observations.
    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    /// Number of assets.
    pub fn n_assets(&self) -> usize {
        self.symbols.len()
    }

    /// Column position of a symbol.
    pub fn index_of(&self, symbol: &str) -> Option<usize> {
        self.symbols.iter().position(|s| s == symbol)
    }

    /// Returns for a symbol.
    pub fn column(&self, symbol: &str) -> Option<&[f64]> {
        self.index_of(symbol).map(|i| self.columns[i].as_slice())
    }

    /// All columns, in symbol order.
    pub fn columns(&self) -> &[Vec<f64>] {
        &self.columns
    }

    /// Index of a date in the table.
    pub fn position(&self, date: NaiveDate) -> Option<usize> {
        self.dates.binary_search(&date).ok()
    }

    /// Keep only the given symbols, in the given order.
    pub fn select(&self, symbols: &[String]) -> Result<ReturnTable> {
        let columns = symbols
            .iter()
            .map(|s| {
                self.column(s).map(<[f64]>::to_vec).ok_or_else(|| {
                    AllocationError::InputError(format!("Missing return series for symbol: {}", s))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(ReturnTable {
            dates: self.dates.clone(),
            symbols: symbols.to_vec(),
            columns,
        })
    }

    /// Every symbol except `excluded`, preserving order.
    pub fn without(&self, excluded: &str) -> ReturnTable {
        let (symbols, columns): (Vec<String>, Vec<Vec<f64>>) = self
            .symbols
            .iter()
            .zip(&self.columns)
            .filter(|(s, _)| s.as_str() != excluded)
            .map(|(s, c)| (s.clone(), c.clone()))
            .unzip();

        ReturnTable {
            dates: self.dates.clone(),
            symbols,
            columns,
        }
    }

    /// Rows in `range` as a new table.
    pub fn slice(&self, range: Range<usize>) -> ReturnTable {
        let end = range.end.min(self.len());
        let start = range.start.min(end);
        ReturnTable {
            dates: self.dates[start..end].to_vec(),
            symbols: self.symbols.clone(),
            columns: self
                .columns
                .iter()
                .map(|c| c[start..end].to_vec())
                .collect(),
        }
    }

    /// Trailing window of at most `len` rows ending at row `end` (inclusive).
    pub fn trailing(&self, end: usize, len: usize) -> ReturnTable {
        let stop = (end + 1).min(self.len());
        self.slice(stop.saturating_sub(len)..stop)
    }

    /// Returns of every asset on row `i`, in symbol order.
    pub fn row(&self, i: usize) -> Vec<f64> {
        self.columns.iter().map(|c| c[i]).collect()
    }
}

/// Detect the CSV delimiter from the first lines of the file.
///
/// Picks the candidate producing the same, largest, column count (at least two)
/// on every sampled line.
fn detect_delimiter(path: &Path) -> Result<u8> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let lines: Vec<String> = reader.lines().take(5).filter_map(|l| l.ok()).collect();

    if lines.is_empty() {
        return Ok(b',');
    }

    let delimiters = [b',', b'\t', b';', b'|'];
    let mut best_delimiter = b',';
    let mut best_score = 0;

    for &delim in &delimiters {
        let counts: Vec<usize> = lines
            .iter()
            .map(|line| line.as_bytes().iter().filter(|&&b| b == delim).count() + 1)
            .collect();

        let first_count = counts[0];
        if first_count >= 2 && counts.iter().all(|&c| c == first_count) && first_count > best_score {
            best_score = first_count;
            best_delimiter = delim;
        }
    }

    debug!(
        "Detected delimiter {:?} with {} fields",
        best_delimiter as char, best_score
    );
    Ok(best_delimiter)
}

/// Parse a date string with multiple format attempts.
pub fn parse_date(s: &str, format: Option<&str>) -> Result<NaiveDate> {
    let s = s.trim();

    if let Some(fmt) = format {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Ok(d);
        }
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(dt.date());
        }
    }

    let date_formats = [
        "%Y-%m-%d",
        "%Y/%m/%d",
        "%d-%m-%Y",
        "%d/%m/%Y",
        "%m/%d/%Y",
        "%d-%b-%Y",  // 15-Jan-2024
        "%d %b %Y",  // 15 Jan 2024
        "%b %d, %Y", // Jan 15, 2024
    ];
    for fmt in &date_formats {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Ok(d);
        }
    }

    let datetime_formats = [
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%dT%H:%M:%SZ",
        "%Y-%m-%dT%H:%M:%S%.fZ",
    ];
    for fmt in &datetime_formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(dt.date());
        }
    }

    Err(AllocationError::InputError(format!(
        "Could not parse date: '{}'",
        s
    )))
}

/// Load a wide price table (date column, then one column per ticker) from CSV.
pub fn load_prices_csv(path: impl AsRef<Path>, config: &DataConfig) -> Result<PriceTable> {
    let path = path.as_ref();
    info!("Loading prices from: {}", path.display());

    let delimiter = match config.delimiter {
        Some(d) => d,
        None => detect_delimiter(path)?,
    };

    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .delimiter(delimiter)
        .flexible(true)
        .from_path(path)?;

    let headers = reader.headers()?.clone();
    if headers.len() < 2 {
        return Err(AllocationError::InputError(format!(
            "{} needs a date column and at least one ticker column",
            path.display()
        )));
    }
    let symbols: Vec<String> = headers.iter().skip(1).map(|h| h.trim().to_string()).collect();

    let mut rows: Vec<(NaiveDate, Vec<f64>)> = Vec::new();
    let mut skipped = 0;

    for (row_num, record) in reader.records().enumerate() {
        let record = record?;
        let parsed = parse_date(record.get(0).unwrap_or_default(), config.date_format.as_deref())
            .and_then(|date| {
                let prices = record
                    .iter()
                    .skip(1)
                    .map(|field| {
                        field.trim().parse::<f64>().map_err(|_| {
                            AllocationError::InputError(format!(
                                "Invalid price '{}' on {}",
                                field, date
                            ))
                        })
                    })
                    .collect::<Result<Vec<f64>>>()?;
                if prices.len() != symbols.len() {
                    return Err(AllocationError::InputError(format!(
                        "Row for {} has {} prices, expected {}",
                        date,
                        prices.len(),
                        symbols.len()
                    )));
                }
                Ok((date, prices))
            });

        match parsed {
            Ok(row) => rows.push(row),
            Err(e) if config.skip_invalid => {
                debug!("Skipping row {}: {}", row_num + 1, e);
                skipped += 1;
            }
            Err(e) => return Err(e),
        }
    }

    if skipped > 0 {
        warn!("Skipped {} invalid rows", skipped);
    }

    rows.sort_by_key(|(date, _)| *date);
    let original_len = rows.len();
    rows.dedup_by_key(|(date, _)| *date);
    if rows.len() < original_len {
        warn!("Removed {} duplicate dates", original_len - rows.len());
    }

    if rows.is_empty() {
        return Err(AllocationError::InputError(format!(
            "No price rows in {}",
            path.display()
        )));
    }

    let dates: Vec<NaiveDate> = rows.iter().map(|(d, _)| *d).collect();
    let columns: Vec<Vec<f64>> = (0..symbols.len())
        .map(|j| rows.iter().map(|(_, prices)| prices[j]).collect())
        .collect();

    info!(
        "Loaded {} rows for {} tickers from {} to {}",
        dates.len(),
        symbols.len(),
        dates[0],
        dates[dates.len() - 1]
    );

    PriceTable::new(dates, symbols, columns)
}
