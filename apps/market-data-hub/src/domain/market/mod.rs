//! Market Data Types
//!
//! Core domain types for market data: price ticks, order-book depth and
//! OHLC bars. These types are transport-agnostic and are the canonical
//! internal representation shared by the feed, the cache and the rule engine.
//!
//! Prices are `Decimal` but serialize as JSON numbers so that cached
//! snapshots can be compared numerically by notification rules.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// =============================================================================
// Timeframe
// =============================================================================

/// Bar interval for OHLC data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    /// One minute.
    #[serde(rename = "1m")]
    M1,
    /// Five minutes.
    #[serde(rename = "5m")]
    M5,
    /// Fifteen minutes.
    #[serde(rename = "15m")]
    M15,
    /// Thirty minutes.
    #[serde(rename = "30m")]
    M30,
    /// One hour.
    #[serde(rename = "1h")]
    H1,
    /// Four hours.
    #[serde(rename = "4h")]
    H4,
    /// One day.
    #[serde(rename = "1d")]
    D1,
}

impl Timeframe {
    /// Timeframes a single logical OHLC request fans out to by default.
    pub const DEFAULT_FAN_OUT: [Self; 4] = [Self::M1, Self::M5, Self::M15, Self::H1];

    /// Wire and cache-key representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::M30 => "30m",
            Self::H1 => "1h",
            Self::H4 => "4h",
            Self::D1 => "1d",
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a timeframe string is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown timeframe: {0}")]
pub struct UnknownTimeframe(pub String);

impl FromStr for Timeframe {
    type Err = UnknownTimeframe;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "1m" => Ok(Self::M1),
            "5m" => Ok(Self::M5),
            "15m" => Ok(Self::M15),
            "30m" => Ok(Self::M30),
            "1h" => Ok(Self::H1),
            "4h" => Ok(Self::H4),
            "1d" => Ok(Self::D1),
            other => Err(UnknownTimeframe(other.to_string())),
        }
    }
}

// =============================================================================
// Data Kind
// =============================================================================

/// Kind of market data stream. OHLC streams are further keyed by timeframe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DataKind {
    /// Best bid/ask price ticks.
    Price,
    /// Order-book depth snapshots.
    Depth,
    /// OHLC bars for one timeframe.
    Ohlc(Timeframe),
}

impl DataKind {
    /// Event type used in upstream `subscribe`/`unsubscribe` control messages.
    #[must_use]
    pub fn event_type(self) -> String {
        match self {
            Self::Price => "price".to_string(),
            Self::Depth => "depth".to_string(),
            Self::Ohlc(tf) => format!("ohlc_{tf}"),
        }
    }

    /// Cache key for a symbol of this kind.
    #[must_use]
    pub fn cache_key(self, symbol: &str) -> String {
        match self {
            Self::Price => format!("price:{symbol}"),
            Self::Depth => format!("depth:{symbol}"),
            Self::Ohlc(tf) => format!("ohlc:{symbol}:{tf}"),
        }
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Price => f.write_str("price"),
            Self::Depth => f.write_str("depth"),
            Self::Ohlc(tf) => write!(f, "ohlc:{tf}"),
        }
    }
}

// =============================================================================
// Payloads
// =============================================================================

/// A single price update for a symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceTick {
    /// Instrument symbol (e.g. `EURUSD`).
    pub symbol: String,
    /// Best bid.
    #[serde(with = "rust_decimal::serde::float")]
    pub bid: Decimal,
    /// Best ask.
    #[serde(with = "rust_decimal::serde::float")]
    pub ask: Decimal,
    /// Last traded price, when the feed provides one.
    #[serde(default, with = "rust_decimal::serde::float_option", skip_serializing_if = "Option::is_none")]
    pub last: Option<Decimal>,
    /// Traded volume, when the feed provides one.
    #[serde(default, with = "rust_decimal::serde::float_option", skip_serializing_if = "Option::is_none")]
    pub volume: Option<Decimal>,
    /// Exchange or feed timestamp.
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl PriceTick {
    /// Midpoint between bid and ask.
    #[must_use]
    pub fn mid(&self) -> Decimal {
        (self.bid + self.ask) / Decimal::TWO
    }

    /// Bid/ask spread.
    #[must_use]
    pub fn spread(&self) -> Decimal {
        self.ask - self.bid
    }
}

/// One price level of an order book.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthLevel {
    /// Level price.
    #[serde(with = "rust_decimal::serde::float")]
    pub price: Decimal,
    /// Resting size at this price.
    #[serde(with = "rust_decimal::serde::float")]
    pub size: Decimal,
}

/// Order-book depth snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthSnapshot {
    /// Instrument symbol.
    pub symbol: String,
    /// Bid levels, best first.
    #[serde(default)]
    pub bids: Vec<DepthLevel>,
    /// Ask levels, best first.
    #[serde(default)]
    pub asks: Vec<DepthLevel>,
    /// Snapshot timestamp.
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

/// OHLC bar for one timeframe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OhlcBar {
    /// Instrument symbol.
    pub symbol: String,
    /// Bar interval.
    pub timeframe: Timeframe,
    /// Open price.
    #[serde(with = "rust_decimal::serde::float")]
    pub open: Decimal,
    /// High price.
    #[serde(with = "rust_decimal::serde::float")]
    pub high: Decimal,
    /// Low price.
    #[serde(with = "rust_decimal::serde::float")]
    pub low: Decimal,
    /// Close price.
    #[serde(with = "rust_decimal::serde::float")]
    pub close: Decimal,
    /// Bar volume.
    #[serde(default, with = "rust_decimal::serde::float")]
    pub volume: Decimal,
    /// Bar open time.
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

// =============================================================================
// Market Frame
// =============================================================================

/// A decoded inbound data frame, routed by the multiplexer.
#[derive(Debug, Clone, PartialEq)]
pub enum MarketFrame {
    /// Price tick.
    Price(PriceTick),
    /// Depth snapshot.
    Depth(DepthSnapshot),
    /// OHLC bar.
    Ohlc(OhlcBar),
}

impl MarketFrame {
    /// Symbol the frame belongs to.
    #[must_use]
    pub fn symbol(&self) -> &str {
        match self {
            Self::Price(tick) => &tick.symbol,
            Self::Depth(depth) => &depth.symbol,
            Self::Ohlc(bar) => &bar.symbol,
        }
    }

    /// Stream kind of the frame.
    #[must_use]
    pub const fn kind(&self) -> DataKind {
        match self {
            Self::Price(_) => DataKind::Price,
            Self::Depth(_) => DataKind::Depth,
            Self::Ohlc(bar) => DataKind::Ohlc(bar.timeframe),
        }
    }

    /// Event type published on the bus (`market:{event_type}`).
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::Price(_) => "price_update",
            Self::Depth(_) => "depth_update",
            Self::Ohlc(_) => "ohlc_update",
        }
    }

    /// Payload as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if a decimal cannot be represented as a JSON number.
    pub fn to_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            Self::Price(tick) => serde_json::to_value(tick),
            Self::Depth(depth) => serde_json::to_value(depth),
            Self::Ohlc(bar) => serde_json::to_value(bar),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeframe_round_trips_through_str() {
        for tf in [
            Timeframe::M1,
            Timeframe::M5,
            Timeframe::M15,
            Timeframe::M30,
            Timeframe::H1,
            Timeframe::H4,
            Timeframe::D1,
        ] {
            assert_eq!(tf.as_str().parse::<Timeframe>().unwrap(), tf);
        }
        assert!("2w".parse::<Timeframe>().is_err());
    }

    #[test]
    fn cache_keys_follow_namespace() {
        assert_eq!(DataKind::Price.cache_key("EURUSD"), "price:EURUSD");
        assert_eq!(DataKind::Depth.cache_key("EURUSD"), "depth:EURUSD");
        assert_eq!(
            DataKind::Ohlc(Timeframe::M15).cache_key("EURUSD"),
            "ohlc:EURUSD:15m"
        );
    }

    #[test]
    fn event_types_for_control_messages() {
        assert_eq!(DataKind::Price.event_type(), "price");
        assert_eq!(DataKind::Ohlc(Timeframe::H1).event_type(), "ohlc_1h");
    }

    #[test]
    fn price_tick_serializes_prices_as_numbers() {
        let tick = PriceTick {
            symbol: "EURUSD".to_string(),
            bid: Decimal::new(11050, 4),
            ask: Decimal::new(11052, 4),
            last: None,
            volume: None,
            timestamp: Utc::now(),
        };

        let value = serde_json::to_value(&tick).unwrap();
        assert!(value["bid"].is_number());
        assert!((value["bid"].as_f64().unwrap() - 1.105).abs() < 1e-9);
        assert!(value.get("last").is_none());
    }

    #[test]
    fn price_tick_deserializes_from_feed_json() {
        let json = r#"{"symbol":"GBPUSD","bid":1.2701,"ask":1.2703}"#;
        let tick: PriceTick = serde_json::from_str(json).unwrap();
        assert_eq!(tick.symbol, "GBPUSD");
        assert_eq!(tick.spread(), Decimal::new(2, 4));
        assert_eq!(tick.mid(), Decimal::new(12702, 4));
    }

    #[test]
    fn frame_kind_includes_timeframe() {
        let bar = OhlcBar {
            symbol: "BTCUSD".to_string(),
            timeframe: Timeframe::M5,
            open: Decimal::ONE,
            high: Decimal::TWO,
            low: Decimal::ONE,
            close: Decimal::TWO,
            volume: Decimal::TEN,
            timestamp: Utc::now(),
        };
        let frame = MarketFrame::Ohlc(bar);
        assert_eq!(frame.kind(), DataKind::Ohlc(Timeframe::M5));
        assert_eq!(frame.symbol(), "BTCUSD");
        assert_eq!(frame.event_type(), "ohlc_update");
    }
}
