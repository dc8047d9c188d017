//! Domain types shared by the store, planner and writer

mod candle;
mod range;
mod timeframe;

pub use candle::{CandleRecord, SeriesKey};
pub use range::{step, steps, TimeRange};
pub use timeframe::Timeframe;
