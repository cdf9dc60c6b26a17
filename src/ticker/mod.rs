pub mod bitmex;
pub mod pipeline;
pub mod types;
