//! Boundaries to the outside world
//!
//! `MarketDataPort` supplies reference prices and recorded/streamed ticks,
//! `OrderPort` executes market orders. Brokerage adapters live outside this
//! crate; the simulated broker here backs the backtester.

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

use crate::error::OrderError;
use crate::{Side, Symbol, Tick};

/// Source of reference prices and session ticks
pub trait MarketDataPort {
    fn get_previous_close(&self, symbol: &Symbol) -> Result<f64>;

    /// Time-ordered ticks for one symbol and session (finite, replayable)
    fn stream_ticks(&self, symbol: &Symbol, session_date: NaiveDate) -> Result<Vec<Tick>>;
}

/// Market order as handed to an `OrderPort`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: Symbol,
    pub side: Side,
    pub size: f64,
    /// Price that triggered the order; simulated brokers fill here
    pub reference_price: f64,
    pub timestamp: DateTime<Utc>,
}

/// Fill confirmation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub price: f64,
    pub timestamp: DateTime<Utc>,
}

/// Order execution
pub trait OrderPort: Send {
    fn submit_market_order(&mut self, order: &OrderRequest) -> Result<Fill, OrderError>;
}

/// Fills instantly at the reference price, optionally shifted by adverse slippage
#[derive(Debug, Clone, Default)]
pub struct SimulatedBroker {
    slippage_pct: f64,
    /// Symbols whose orders are rejected, for exercising rejection paths
    reject: HashSet<Symbol>,
    submitted: usize,
}

impl SimulatedBroker {
    pub fn new(slippage_pct: f64) -> Self {
        SimulatedBroker {
            slippage_pct,
            ..Default::default()
        }
    }

    pub fn rejecting(mut self, symbol: Symbol) -> Self {
        self.reject.insert(symbol);
        self
    }

    pub fn orders_submitted(&self) -> usize {
        self.submitted
    }
}

impl OrderPort for SimulatedBroker {
    fn submit_market_order(&mut self, order: &OrderRequest) -> Result<Fill, OrderError> {
        self.submitted += 1;
        if self.reject.contains(&order.symbol) {
            return Err(OrderError::Rejected {
                symbol: order.symbol.clone(),
                reason: "simulated rejection".to_string(),
            });
        }
        let price = match order.side {
            Side::Buy => order.reference_price * (1.0 + self.slippage_pct),
            Side::Sell => order.reference_price * (1.0 - self.slippage_pct),
        };
        debug!(
            symbol = %order.symbol,
            side = ?order.side,
            size = order.size,
            price,
            "Simulated fill"
        );
        Ok(Fill {
            price,
            timestamp: order.timestamp,
        })
    }
}
