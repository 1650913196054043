use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exact, case-sensitive match on `buy` / `sell`.
impl FromStr for Side {
    type Err = PipelineError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "buy" => Ok(Side::Buy),
            "sell" => Ok(Side::Sell),
            other => Err(PipelineError::data(format!(
                "invalid trade side '{other}' (expected 'buy' or 'sell')"
            ))),
        }
    }
}

/// One deduplicated exchange print.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub pair: String,
    pub trade_id: i64,
    pub timestamp: DateTime<Utc>,
    pub price: f64,
    pub size: f64,
    pub side: Side,
}

impl Trade {
    pub fn notional(&self) -> f64 {
        self.price * self.size
    }

    pub(crate) fn validate(&self) -> Result<(), PipelineError> {
        if !(self.price.is_finite() && self.price > 0.0) {
            return Err(PipelineError::data(format!(
                "trade {} on {} has non-positive price {}",
                self.trade_id, self.pair, self.price
            )));
        }
        if !(self.size.is_finite() && self.size > 0.0) {
            return Err(PipelineError::data(format!(
                "trade {} on {} has non-positive size {}",
                self.trade_id, self.pair, self.size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_parsing_is_case_sensitive() {
        assert_eq!("buy".parse::<Side>().unwrap(), Side::Buy);
        assert_eq!("sell".parse::<Side>().unwrap(), Side::Sell);
        for raw in ["Buy", "SELL", "", "bid"] {
            let err = raw.parse::<Side>().expect_err("side should be rejected");
            assert!(matches!(err, PipelineError::Data(_)), "{raw}: {err}");
        }
    }
}
