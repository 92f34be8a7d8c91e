#![forbid(unsafe_code)]

//! Sampling engine internals: the time-windowed reservoir (Algorithm R over
//! trace or span units), the per-trace aggregator with LRU bounding, and the
//! wall-clock window controller.
//!
//! Each component guards its state with a single exclusive lock; contention
//! is dominated by PRNG draws and map operations, all of which are short.

pub mod aggregator;
pub mod reservoir;
pub mod window;

pub use aggregator::TraceAggregator;
pub use reservoir::{Reservoir, ReservoirSnapshot};
pub use window::{WindowController, WindowState};
