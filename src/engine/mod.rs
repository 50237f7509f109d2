pub mod observer;
pub mod ticker_engine;

pub use observer::{ChannelObserver, LogObserver, NullObserver, SourceObserver};
pub use ticker_engine::TickerEngine;
