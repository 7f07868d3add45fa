//! Data models for terminal positions, mirror records, and the observer view.

mod position;
mod record;
mod view;

pub use position::{Deal, Order, Position, SymbolInfo, TradeSide};
pub use record::{
    duplicate_comment, is_duplicate_comment, short_id, CopyStatus, MirrorRecord, ReceiverCopy,
    RecordMap,
};
pub use view::{LegState, LegView, TradeView};
