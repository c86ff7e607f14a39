//! Record Model
//!
//! The closed set of normalized record kinds stored in a catalog. Every kind
//! carries `ts_event` (venue time) and `ts_init` (the time the record entered the
//! platform); the merge orders exclusively by `ts_init`.
//!
//! Kinds are tagged once, at the catalog boundary, through [`DataClass`]. After
//! that every consumer goes through the [`RecordSchema`] capability instead of
//! inspecting types at runtime.

use crate::clock::Nanos;
use crate::error::CatalogError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub type InstrumentId = String;
pub type Price = f64;
pub type Size = f64;

/// Fixed overhead charged to every record: two timestamps plus a kind tag.
const RECORD_HEADER_BYTES: usize = 8 + 8 + 1;

/// Capability every record kind provides to the catalog and the merge engine.
pub trait RecordSchema {
    const DATA_CLASS: DataClass;

    fn ts_event(&self) -> Nanos;

    fn ts_init(&self) -> Nanos;

    /// Approximate serialized footprint in bytes, without serializing.
    fn estimated_size(&self) -> usize;

    fn instrument_id(&self) -> Option<&str> {
        None
    }
}

// =============================================================================
// DATA CLASSES
// =============================================================================

/// Registered record kinds. The string form is the catalog directory name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataClass {
    QuoteTick,
    TradeTick,
    Bar,
    OrderBookDelta,
    InstrumentStatusUpdate,
    NewsEvent,
}

impl DataClass {
    pub const ALL: [DataClass; 6] = [
        DataClass::QuoteTick,
        DataClass::TradeTick,
        DataClass::Bar,
        DataClass::OrderBookDelta,
        DataClass::InstrumentStatusUpdate,
        DataClass::NewsEvent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QuoteTick => "quote_tick",
            Self::TradeTick => "trade_tick",
            Self::Bar => "bar",
            Self::OrderBookDelta => "order_book_delta",
            Self::InstrumentStatusUpdate => "instrument_status_update",
            Self::NewsEvent => "news_event",
        }
    }

    /// Decode a partition payload of this class.
    pub fn decode(&self, payload: &str) -> serde_json::Result<Record> {
        Ok(match self {
            Self::QuoteTick => Record::QuoteTick(serde_json::from_str(payload)?),
            Self::TradeTick => Record::TradeTick(serde_json::from_str(payload)?),
            Self::Bar => Record::Bar(serde_json::from_str(payload)?),
            Self::OrderBookDelta => Record::OrderBookDelta(serde_json::from_str(payload)?),
            Self::InstrumentStatusUpdate => {
                Record::InstrumentStatusUpdate(serde_json::from_str(payload)?)
            }
            Self::NewsEvent => Record::NewsEvent(serde_json::from_str(payload)?),
        })
    }
}

impl fmt::Display for DataClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataClass {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DataClass::ALL
            .iter()
            .copied()
            .find(|class| class.as_str() == s)
            .ok_or_else(|| CatalogError::UnknownDataClass {
                name: s.to_string(),
            })
    }
}

// =============================================================================
// RECORD KINDS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteTick {
    pub instrument_id: InstrumentId,
    pub bid: Price,
    pub ask: Price,
    pub bid_size: Size,
    pub ask_size: Size,
    pub ts_event: Nanos,
    pub ts_init: Nanos,
}

impl RecordSchema for QuoteTick {
    const DATA_CLASS: DataClass = DataClass::QuoteTick;

    fn ts_event(&self) -> Nanos {
        self.ts_event
    }

    fn ts_init(&self) -> Nanos {
        self.ts_init
    }

    fn estimated_size(&self) -> usize {
        RECORD_HEADER_BYTES + self.instrument_id.len() + 4 * 8
    }

    fn instrument_id(&self) -> Option<&str> {
        Some(&self.instrument_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeTick {
    pub instrument_id: InstrumentId,
    pub price: Price,
    pub size: Size,
    pub aggressor_side: Side,
    pub trade_id: String,
    pub ts_event: Nanos,
    pub ts_init: Nanos,
}

impl RecordSchema for TradeTick {
    const DATA_CLASS: DataClass = DataClass::TradeTick;

    fn ts_event(&self) -> Nanos {
        self.ts_event
    }

    fn ts_init(&self) -> Nanos {
        self.ts_init
    }

    fn estimated_size(&self) -> usize {
        RECORD_HEADER_BYTES + self.instrument_id.len() + 2 * 8 + 1 + self.trade_id.len()
    }

    fn instrument_id(&self) -> Option<&str> {
        Some(&self.instrument_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub instrument_id: InstrumentId,
    /// Bar specification, e.g. `1-MINUTE-LAST`.
    pub spec: String,
    pub open: Price,
    pub high: Price,
    pub low: Price,
    pub close: Price,
    pub volume: Size,
    pub ts_event: Nanos,
    pub ts_init: Nanos,
}

impl RecordSchema for Bar {
    const DATA_CLASS: DataClass = DataClass::Bar;

    fn ts_event(&self) -> Nanos {
        self.ts_event
    }

    fn ts_init(&self) -> Nanos {
        self.ts_init
    }

    fn estimated_size(&self) -> usize {
        RECORD_HEADER_BYTES + self.instrument_id.len() + self.spec.len() + 5 * 8
    }

    fn instrument_id(&self) -> Option<&str> {
        Some(&self.instrument_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookAction {
    Add,
    Update,
    Delete,
    Clear,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBookDelta {
    pub instrument_id: InstrumentId,
    pub action: BookAction,
    pub side: Side,
    pub price: Price,
    pub size: Size,
    pub sequence: u64,
    pub ts_event: Nanos,
    pub ts_init: Nanos,
}

impl RecordSchema for OrderBookDelta {
    const DATA_CLASS: DataClass = DataClass::OrderBookDelta;

    fn ts_event(&self) -> Nanos {
        self.ts_event
    }

    fn ts_init(&self) -> Nanos {
        self.ts_init
    }

    fn estimated_size(&self) -> usize {
        RECORD_HEADER_BYTES + self.instrument_id.len() + 1 + 1 + 2 * 8 + 8
    }

    fn instrument_id(&self) -> Option<&str> {
        Some(&self.instrument_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarketStatus {
    PreOpen,
    Open,
    Halted,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentStatusUpdate {
    pub instrument_id: InstrumentId,
    pub status: MarketStatus,
    pub ts_event: Nanos,
    pub ts_init: Nanos,
}

impl RecordSchema for InstrumentStatusUpdate {
    const DATA_CLASS: DataClass = DataClass::InstrumentStatusUpdate;

    fn ts_event(&self) -> Nanos {
        self.ts_event
    }

    fn ts_init(&self) -> Nanos {
        self.ts_init
    }

    fn estimated_size(&self) -> usize {
        RECORD_HEADER_BYTES + self.instrument_id.len() + 1
    }

    fn instrument_id(&self) -> Option<&str> {
        Some(&self.instrument_id)
    }
}

/// Custom data published by a named client rather than tied to an instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewsEvent {
    pub name: String,
    pub impact: String,
    pub currency: String,
    pub ts_event: Nanos,
    pub ts_init: Nanos,
}

impl RecordSchema for NewsEvent {
    const DATA_CLASS: DataClass = DataClass::NewsEvent;

    fn ts_event(&self) -> Nanos {
        self.ts_event
    }

    fn ts_init(&self) -> Nanos {
        self.ts_init
    }

    fn estimated_size(&self) -> usize {
        RECORD_HEADER_BYTES + self.name.len() + self.impact.len() + self.currency.len()
    }
}

// =============================================================================
// TAGGED RECORD
// =============================================================================

/// One normalized record of any kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Record {
    QuoteTick(QuoteTick),
    TradeTick(TradeTick),
    Bar(Bar),
    OrderBookDelta(OrderBookDelta),
    InstrumentStatusUpdate(InstrumentStatusUpdate),
    NewsEvent(NewsEvent),
}

macro_rules! dispatch {
    ($self:expr, $rec:ident => $body:expr) => {
        match $self {
            Record::QuoteTick($rec) => $body,
            Record::TradeTick($rec) => $body,
            Record::Bar($rec) => $body,
            Record::OrderBookDelta($rec) => $body,
            Record::InstrumentStatusUpdate($rec) => $body,
            Record::NewsEvent($rec) => $body,
        }
    };
}

impl Record {
    pub fn data_class(&self) -> DataClass {
        match self {
            Record::QuoteTick(_) => QuoteTick::DATA_CLASS,
            Record::TradeTick(_) => TradeTick::DATA_CLASS,
            Record::Bar(_) => Bar::DATA_CLASS,
            Record::OrderBookDelta(_) => OrderBookDelta::DATA_CLASS,
            Record::InstrumentStatusUpdate(_) => InstrumentStatusUpdate::DATA_CLASS,
            Record::NewsEvent(_) => NewsEvent::DATA_CLASS,
        }
    }

    #[inline]
    pub fn ts_event(&self) -> Nanos {
        dispatch!(self, r => r.ts_event())
    }

    #[inline]
    pub fn ts_init(&self) -> Nanos {
        dispatch!(self, r => r.ts_init())
    }

    #[inline]
    pub fn estimated_size(&self) -> usize {
        dispatch!(self, r => r.estimated_size())
    }

    pub fn instrument_id(&self) -> Option<&str> {
        dispatch!(self, r => r.instrument_id())
    }

    /// Encode the untagged payload stored in a partition row.
    pub fn encode_payload(&self) -> serde_json::Result<String> {
        dispatch!(self, r => serde_json::to_string(r))
    }
}

impl From<QuoteTick> for Record {
    fn from(r: QuoteTick) -> Self {
        Record::QuoteTick(r)
    }
}

impl From<TradeTick> for Record {
    fn from(r: TradeTick) -> Self {
        Record::TradeTick(r)
    }
}

impl From<Bar> for Record {
    fn from(r: Bar) -> Self {
        Record::Bar(r)
    }
}

impl From<OrderBookDelta> for Record {
    fn from(r: OrderBookDelta) -> Self {
        Record::OrderBookDelta(r)
    }
}

impl From<InstrumentStatusUpdate> for Record {
    fn from(r: InstrumentStatusUpdate) -> Self {
        Record::InstrumentStatusUpdate(r)
    }
}

impl From<NewsEvent> for Record {
    fn from(r: NewsEvent) -> Self {
        Record::NewsEvent(r)
    }
}
