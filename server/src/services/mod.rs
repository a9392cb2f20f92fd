//! Service layer: relay fan-out, session write-through, checkpoints, and
//! the asynchronous checkpoint queue.

pub mod checkpoint;
pub mod persistence;
pub mod relay;
pub mod session;
