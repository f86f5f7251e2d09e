pub mod args;
pub mod op;
pub mod ops;

pub use ops::{ExportBlobs, ExportRepo, Init, Inspect, Version};
