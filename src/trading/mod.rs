//! Copy logic: configuration, sizing, and the reconciliation engine.

mod config;
mod copy_engine;
mod duplicator;
mod manual_close;
mod position_sizer;

pub use config::{AccountConfig, CopierConfig, ProviderConfig, ReceiverConfig, Settings};
pub use copy_engine::{CopyEngine, ReceiverHandle};
pub use position_sizer::PositionSizer;
