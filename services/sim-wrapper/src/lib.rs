//! Splits building regions into simulation tiles, runs them on a pool of
//! leased backend projects and stitches the results back together.

pub mod api;
pub mod config;
pub mod crs;
pub mod error;
pub mod executor;
pub mod geometry;
pub mod georef;
pub mod job;
pub mod lease;
pub mod maintenance;
pub mod retry;
pub mod store;
pub mod task;
pub mod tiler;

#[cfg(test)]
mod testing;

pub use error::Error;
