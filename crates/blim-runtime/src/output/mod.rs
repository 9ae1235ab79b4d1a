//! Script output capture pipeline.

mod collector;
mod drainer;
mod pipe;
mod record;

pub use collector::{
    CollectorError, CollectorMetrics, CollectorState, ErrorHandler, OutputCollector,
    PlainTextConsumer, DEFAULT_START_TIMEOUT, DEFAULT_STOP_TIMEOUT, MAX_BUFFER_SIZE,
};
pub use drainer::{OutputDrainer, DEFAULT_FINAL_DRAIN};
pub use pipe::{OutputPipe, PipeMetrics, RingPipe};
pub use record::{OutputRecord, OutputSource};
