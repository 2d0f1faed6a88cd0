use chrono::NaiveDate;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

use crate::errors::{QuantrsError, QuantrsResult};

/// One daily OHLCV bar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceRow {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// A named, ordered feature vector. Order matters: it is what schema
/// alignment against a trained artifact operates on.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeatureVector {
    pub names: Vec<String>,
    pub values: Vec<f64>,
}

impl FeatureVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: f64) {
        self.names.push(name.into());
        // NaN/inf never enter a learner
        self.values.push(if value.is_finite() { value } else { 0.0 });
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| self.values[i])
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Align this vector to a trained model's feature schema: schema features
    /// missing here are filled with zero, live features outside the schema
    /// are dropped. Output order follows the schema, so the result is always
    /// shape-compatible with the model.
    pub fn aligned_to(&self, schema: &[String]) -> Vec<f64> {
        let lookup: HashMap<&str, f64> = self
            .names
            .iter()
            .map(|n| n.as_str())
            .zip(self.values.iter().copied())
            .collect();
        schema
            .iter()
            .map(|name| lookup.get(name.as_str()).copied().unwrap_or(0.0))
            .collect()
    }
}

/// External collaborator that owns all market data access. The lifecycle
/// manager itself never performs network I/O.
pub trait FeatureProvider: Send + Sync {
    /// Ordered (oldest first) OHLCV rows up to and including `as_of`.
    fn get_price_window(
        &self,
        ticker: &str,
        as_of: NaiveDate,
        lookback: u32,
    ) -> QuantrsResult<Vec<PriceRow>>;

    /// The live feature vector for `ticker` as of `as_of`.
    fn get_computed_features(&self, ticker: &str, as_of: NaiveDate) -> QuantrsResult<FeatureVector>;
}

/// Names of the derived features, in the order `compute_feature_row` emits
/// them. Kept as one list so training and serving cannot drift apart.
pub const FEATURE_NAMES: [&str; 10] = [
    "return_1d",
    "return_5d",
    "return_10d",
    "range_ratio",
    "close_position",
    "volume_ratio_5d",
    "sma5_ratio",
    "sma20_ratio",
    "volatility_10d",
    "gap_open",
];

/// Rows of history a single feature row needs behind it.
pub const MIN_FEATURE_WINDOW: usize = 21;

/// Compute one feature row from `rows[..=idx]` (oldest first). Returns None
/// when there is not enough history behind `idx`.
pub fn compute_feature_row(rows: &[PriceRow], idx: usize) -> Option<FeatureVector> {
    if idx + 1 < MIN_FEATURE_WINDOW || idx >= rows.len() {
        return None;
    }
    let cur = &rows[idx];
    let prev = &rows[idx - 1];
    if cur.close <= 0.0 || prev.close <= 0.0 {
        return None;
    }

    let pct = |later: f64, earlier: f64| {
        if earlier.abs() < f64::EPSILON {
            0.0
        } else {
            later / earlier - 1.0
        }
    };
    let sma = |span: usize| {
        let slice = &rows[idx + 1 - span..=idx];
        slice.iter().map(|r| r.close).sum::<f64>() / span as f64
    };

    let mut fv = FeatureVector::new();
    fv.push("return_1d", pct(cur.close, prev.close));
    fv.push("return_5d", pct(cur.close, rows[idx - 5].close));
    fv.push("return_10d", pct(cur.close, rows[idx - 10].close));

    let range = cur.high - cur.low;
    fv.push("range_ratio", if cur.close > 0.0 { range / cur.close } else { 0.0 });
    fv.push(
        "close_position",
        if range > 0.0 { (cur.close - cur.low) / range } else { 0.5 },
    );

    let vol5 = rows[idx - 4..=idx].iter().map(|r| r.volume).sum::<f64>() / 5.0;
    fv.push(
        "volume_ratio_5d",
        if vol5 > 0.0 { cur.volume / vol5 } else { 1.0 },
    );

    fv.push("sma5_ratio", pct(cur.close, sma(5)));
    fv.push("sma20_ratio", pct(cur.close, sma(20)));

    // stddev of daily returns over the trailing 10 sessions
    let returns: Vec<f64> = (idx - 9..=idx)
        .map(|i| pct(rows[i].close, rows[i - 1].close))
        .collect();
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let var = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64;
    fv.push("volatility_10d", var.sqrt());

    fv.push("gap_open", pct(cur.open, prev.close));

    Some(fv)
}

/// A supervised training set derived from a price window: one feature row
/// per usable day, binary label = close rises over `horizon` days.
#[derive(Debug, Clone)]
pub struct SupervisedSet {
    pub feature_names: Vec<String>,
    pub rows: Vec<Vec<f64>>,
    pub labels: Vec<f64>,
    pub dates: Vec<NaiveDate>,
}

impl SupervisedSet {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Build the chronological supervised set for one ticker.
pub fn build_supervised_set(
    provider: &dyn FeatureProvider,
    ticker: &str,
    as_of: NaiveDate,
    lookback: u32,
    horizon: u32,
) -> QuantrsResult<SupervisedSet> {
    let window = provider.get_price_window(ticker, as_of, lookback)?;
    let horizon = horizon as usize;
    if window.len() < MIN_FEATURE_WINDOW + horizon {
        return Err(QuantrsError::data(
            ticker,
            format!(
                "price window too short: {} rows, need at least {}",
                window.len(),
                MIN_FEATURE_WINDOW + horizon
            ),
        ));
    }

    let mut rows = Vec::new();
    let mut labels = Vec::new();
    let mut dates = Vec::new();
    for idx in 0..window.len() - horizon {
        let Some(fv) = compute_feature_row(&window, idx) else {
            continue;
        };
        let future = window[idx + horizon].close;
        labels.push(if future > window[idx].close { 1.0 } else { 0.0 });
        dates.push(window[idx].date);
        rows.push(fv.values);
    }

    debug!(
        "built supervised set for {}: {} rows x {} features",
        ticker,
        rows.len(),
        FEATURE_NAMES.len()
    );

    Ok(SupervisedSet {
        feature_names: FEATURE_NAMES.iter().map(|s| s.to_string()).collect(),
        rows,
        labels,
        dates,
    })
}

/// SQLite-backed provider reading a `daily_price` table:
/// (ticker TEXT, date TEXT 'YYYY-MM-DD', open/high/low/close/volume REAL).
pub struct DbFeatureProvider {
    conn: Mutex<Connection>,
}

impl DbFeatureProvider {
    pub fn open(path: impl AsRef<Path>) -> QuantrsResult<Self> {
        let conn = Connection::open(path.as_ref())
            .map_err(|e| QuantrsError::database("open daily db", e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> QuantrsResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| QuantrsError::database("open in-memory daily db", e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn init_schema(&self) -> QuantrsResult<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS daily_price (
                ticker TEXT NOT NULL,
                date TEXT NOT NULL,
                open REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                close REAL NOT NULL,
                volume REAL NOT NULL,
                PRIMARY KEY (ticker, date)
            )",
            [],
        )?;
        Ok(())
    }

    pub fn insert_row(&self, ticker: &str, row: &PriceRow) -> QuantrsResult<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO daily_price
             (ticker, date, open, high, low, close, volume)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            (
                ticker,
                row.date.format("%Y-%m-%d").to_string(),
                row.open,
                row.high,
                row.low,
                row.close,
                row.volume,
            ),
        )?;
        Ok(())
    }

    fn lock_conn(&self) -> QuantrsResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| QuantrsError::general("daily db connection lock poisoned"))
    }
}

impl FeatureProvider for DbFeatureProvider {
    fn get_price_window(
        &self,
        ticker: &str,
        as_of: NaiveDate,
        lookback: u32,
    ) -> QuantrsResult<Vec<PriceRow>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT date, open, high, low, close, volume FROM daily_price
             WHERE ticker = ? AND date <= ?
             ORDER BY date DESC LIMIT ?",
        )?;
        let mut rows: Vec<PriceRow> = stmt
            .query_map(
                (ticker, as_of.format("%Y-%m-%d").to_string(), lookback),
                |row| {
                    let date_str: String = row.get(0)?;
                    Ok((
                        date_str,
                        row.get::<_, f64>(1)?,
                        row.get::<_, f64>(2)?,
                        row.get::<_, f64>(3)?,
                        row.get::<_, f64>(4)?,
                        row.get::<_, f64>(5)?,
                    ))
                },
            )?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(|(date_str, open, high, low, close, volume)| {
                let date = NaiveDate::parse_from_str(&date_str, "%Y-%m-%d").map_err(|e| {
                    QuantrsError::parsing("daily_price.date", format!("{}: {}", date_str, e))
                })?;
                Ok(PriceRow {
                    date,
                    open,
                    high,
                    low,
                    close,
                    volume,
                })
            })
            .collect::<QuantrsResult<Vec<_>>>()?;

        // query returned newest first
        rows.reverse();
        Ok(rows)
    }

    fn get_computed_features(&self, ticker: &str, as_of: NaiveDate) -> QuantrsResult<FeatureVector> {
        let window = self.get_price_window(ticker, as_of, MIN_FEATURE_WINDOW as u32 + 10)?;
        if window.is_empty() {
            return Err(QuantrsError::data(ticker, "no price rows on or before as_of"));
        }
        compute_feature_row(&window, window.len() - 1).ok_or_else(|| {
            QuantrsError::data(
                ticker,
                format!("not enough history for features: {} rows", window.len()),
            )
        })
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;

    /// Deterministic synthetic provider used across the crate's tests.
    pub struct SyntheticProvider {
        pub rows: Vec<PriceRow>,
    }

    impl SyntheticProvider {
        /// Daily bars following a noisy sine drift; deterministic for a seed.
        pub fn new(days: usize, seed: u64) -> Self {
            let start = NaiveDate::from_ymd_opt(2022, 1, 3).expect("valid date");
            let mut rows = Vec::with_capacity(days);
            let mut price = 100.0_f64;
            let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
            for i in 0..days {
                // xorshift noise, cheap and reproducible
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                let noise = (state % 2001) as f64 / 1000.0 - 1.0;
                let drift = (i as f64 / 9.0).sin() * 0.8;
                price = (price + drift + noise * 0.6).max(5.0);
                let open = price * (1.0 + noise * 0.002);
                let high = price.max(open) * 1.01;
                let low = price.min(open) * 0.99;
                rows.push(PriceRow {
                    date: start + chrono::Days::new(i as u64),
                    open,
                    high,
                    low,
                    close: price,
                    volume: 1_000_000.0 + (state % 500_000) as f64,
                });
            }
            Self { rows }
        }
    }

    impl FeatureProvider for SyntheticProvider {
        fn get_price_window(
            &self,
            _ticker: &str,
            as_of: NaiveDate,
            lookback: u32,
        ) -> QuantrsResult<Vec<PriceRow>> {
            let mut window: Vec<PriceRow> = self
                .rows
                .iter()
                .filter(|r| r.date <= as_of)
                .cloned()
                .collect();
            let keep = lookback as usize;
            if window.len() > keep {
                window.drain(..window.len() - keep);
            }
            Ok(window)
        }

        fn get_computed_features(
            &self,
            ticker: &str,
            as_of: NaiveDate,
        ) -> QuantrsResult<FeatureVector> {
            let window = self.get_price_window(ticker, as_of, 64)?;
            if window.len() < MIN_FEATURE_WINDOW {
                return Err(QuantrsError::data(ticker, "not enough synthetic history"));
            }
            compute_feature_row(&window, window.len() - 1)
                .ok_or_else(|| QuantrsError::data(ticker, "feature row unavailable"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::SyntheticProvider;
    use super::*;

    #[test]
    fn test_alignment_fills_missing_and_drops_extra() {
        let mut fv = FeatureVector::new();
        fv.push("a", 1.0);
        fv.push("b", 2.0);
        fv.push("stray", 9.0);
        let schema = vec!["b".to_string(), "missing".to_string(), "a".to_string()];
        assert_eq!(fv.aligned_to(&schema), vec![2.0, 0.0, 1.0]);
    }

    #[test]
    fn test_non_finite_values_are_zeroed() {
        let mut fv = FeatureVector::new();
        fv.push("nan", f64::NAN);
        fv.push("inf", f64::INFINITY);
        assert_eq!(fv.values, vec![0.0, 0.0]);
    }

    #[test]
    fn test_supervised_set_is_chronological() {
        let provider = SyntheticProvider::new(200, 7);
        let as_of = provider.rows.last().expect("rows").date;
        let set = build_supervised_set(&provider, "TST", as_of, 200, 1).expect("builds");
        assert!(set.len() > 100);
        assert_eq!(set.rows[0].len(), FEATURE_NAMES.len());
        for pair in set.dates.windows(2) {
            assert!(pair[0] < pair[1], "dates must be strictly increasing");
        }
    }

    #[test]
    fn test_short_window_is_a_data_error() {
        let provider = SyntheticProvider::new(10, 7);
        let as_of = provider.rows.last().expect("rows").date;
        let err = build_supervised_set(&provider, "TST", as_of, 10, 1).unwrap_err();
        assert!(matches!(err, QuantrsError::Data { .. }));
    }

    #[test]
    fn test_db_provider_round_trip() {
        let provider = DbFeatureProvider::open_in_memory().expect("open");
        provider.init_schema().expect("schema");
        let synthetic = SyntheticProvider::new(60, 3);
        for row in &synthetic.rows {
            provider.insert_row("TST", row).expect("insert");
        }
        let as_of = synthetic.rows.last().expect("rows").date;
        let window = provider.get_price_window("TST", as_of, 30).expect("window");
        assert_eq!(window.len(), 30);
        assert!(window[0].date < window[29].date);
        let fv = provider.get_computed_features("TST", as_of).expect("features");
        assert_eq!(fv.names.len(), FEATURE_NAMES.len());
    }
}
