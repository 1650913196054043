use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::AggregateParams;
use crate::error::{PipelineError, StageResult};
use crate::trade::{Side, Trade};

/// Additive guard on the imbalance denominator; keeps the ratio total when a
/// window has no whale prints (the ratio is then exactly 0).
pub const IMBALANCE_EPS: f64 = 1e-9;

/// One right-open `[window_start, window_start + width)` bucket of a pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub pair: String,
    pub window_start: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub total_count: u64,
    pub total_size: f64,
    pub total_notional: f64,
    pub buy_count: u64,
    pub sell_count: u64,
    pub buy_notional: f64,
    pub sell_notional: f64,
    pub whale_buy_count: u64,
    pub whale_sell_count: u64,
    pub whale_buy_notional: f64,
    pub whale_sell_notional: f64,
    pub whale_imbalance: f64,
}

pub fn whale_imbalance(whale_buy_notional: f64, whale_sell_notional: f64) -> f64 {
    (whale_buy_notional - whale_sell_notional)
        / (whale_buy_notional + whale_sell_notional + IMBALANCE_EPS)
}

/// Start of the bucket containing `ts`, as epoch milliseconds.
pub fn window_floor_ms(ts: DateTime<Utc>, width_ms: i64) -> i64 {
    ts.timestamp_millis().div_euclid(width_ms) * width_ms
}

/// Running accumulator for the window currently being filled.
struct WindowAccumulator {
    start_ms: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    total_count: u64,
    total_size: f64,
    total_notional: f64,
    buy_count: u64,
    sell_count: u64,
    buy_notional: f64,
    sell_notional: f64,
    whale_buy_count: u64,
    whale_sell_count: u64,
    whale_buy_notional: f64,
    whale_sell_notional: f64,
}

impl WindowAccumulator {
    fn open_with(start_ms: i64, trade: &Trade) -> Self {
        Self {
            start_ms,
            open: trade.price,
            high: trade.price,
            low: trade.price,
            close: trade.price,
            total_count: 0,
            total_size: 0.0,
            total_notional: 0.0,
            buy_count: 0,
            sell_count: 0,
            buy_notional: 0.0,
            sell_notional: 0.0,
            whale_buy_count: 0,
            whale_sell_count: 0,
            whale_buy_notional: 0.0,
            whale_sell_notional: 0.0,
        }
    }

    fn push(&mut self, trade: &Trade, whale_usd: f64) {
        let notional = trade.notional();
        let is_whale = notional >= whale_usd;

        self.high = self.high.max(trade.price);
        self.low = self.low.min(trade.price);
        self.close = trade.price;
        self.total_count += 1;
        self.total_size += trade.size;
        self.total_notional += notional;

        match trade.side {
            Side::Buy => {
                self.buy_count += 1;
                self.buy_notional += notional;
                if is_whale {
                    self.whale_buy_count += 1;
                    self.whale_buy_notional += notional;
                }
            }
            Side::Sell => {
                self.sell_count += 1;
                self.sell_notional += notional;
                if is_whale {
                    self.whale_sell_count += 1;
                    self.whale_sell_notional += notional;
                }
            }
        }
    }

    fn finish(self, pair: &str) -> StageResult<Bar> {
        let window_start = DateTime::<Utc>::from_timestamp_millis(self.start_ms).ok_or_else(|| {
            PipelineError::data(format!(
                "window start {} ms is outside the representable range",
                self.start_ms
            ))
        })?;
        Ok(Bar {
            pair: pair.to_string(),
            window_start,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            total_count: self.total_count,
            total_size: self.total_size,
            total_notional: self.total_notional,
            buy_count: self.buy_count,
            sell_count: self.sell_count,
            buy_notional: self.buy_notional,
            sell_notional: self.sell_notional,
            whale_buy_count: self.whale_buy_count,
            whale_sell_count: self.whale_sell_count,
            whale_buy_notional: self.whale_buy_notional,
            whale_sell_notional: self.whale_sell_notional,
            whale_imbalance: whale_imbalance(self.whale_buy_notional, self.whale_sell_notional),
        })
    }
}

/// Bucket trades into fixed-width bars per pair.
///
/// Output is ordered by pair, then `window_start`. Trades of each pair are
/// stably re-sorted by timestamp first, so open/close are chronological even
/// when arrival order is not; prints sharing a timestamp keep their input
/// order. Windows without trades are not emitted.
pub fn aggregate(trades: &[Trade], params: &AggregateParams) -> StageResult<Vec<Bar>> {
    params.validate()?;
    let width_ms = params.bar_width.millis();

    let mut by_pair: BTreeMap<&str, Vec<&Trade>> = BTreeMap::new();
    for trade in trades {
        trade.validate()?;
        by_pair.entry(trade.pair.as_str()).or_default().push(trade);
    }

    let mut bars = Vec::new();
    for (pair, mut pair_trades) in by_pair {
        pair_trades.sort_by_key(|trade| trade.timestamp);

        let mut current: Option<WindowAccumulator> = None;
        for trade in pair_trades {
            let start_ms = window_floor_ms(trade.timestamp, width_ms);
            match current.as_mut() {
                Some(acc) if acc.start_ms == start_ms => acc.push(trade, params.whale_usd),
                _ => {
                    if let Some(done) = current.take() {
                        bars.push(done.finish(pair)?);
                    }
                    let mut acc = WindowAccumulator::open_with(start_ms, trade);
                    acc.push(trade, params.whale_usd);
                    current = Some(acc);
                }
            }
        }
        if let Some(done) = current {
            bars.push(done.finish(pair)?);
        }
    }

    Ok(bars)
}
