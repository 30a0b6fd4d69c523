pub mod lease;
pub mod redis;
pub mod scheduler;

pub use lease::LeaseRenewer;
pub use redis::Coordinator;
pub use scheduler::{ChunkMetrics, ChunkScheduler, ChunkState, ChunkStatus, Progress};
