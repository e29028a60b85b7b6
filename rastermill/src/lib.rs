//! Rastermill - asynchronous raster tile production.
//!
//! This library turns a client's read request over a raster into a set of
//! production tiles and produces them concurrently: sample data is read
//! from a pooled backing resource, missing derived tiles are computed on
//! demand and cached, and every piece is resampled into destination
//! arrays that stream back to the consumer as they finish.
//!
//! # Architecture
//!
//! ```text
//! submit(plan) ──► QueryDriver ──► Computer ──► compute pool ──► Writer ──► CacheStore
//!                      │               │
//!                      │               └────────── computed tiles ─┐
//!                      │                                           │
//!                      └── samples ──► Resampler ──► resample pool ┘
//!                                          │
//!                                          ▼
//!                                      Producer ──► QueryStream
//! ```
//!
//! Actors own their state and coordinate purely by message passing; CPU
//! work runs on bounded worker pools with priority admission and
//! cooperative cancellation. See [`engine::TileEngine`] for the entry
//! point.

pub mod actors;
pub mod cache;
pub mod engine;
pub mod footprint;
pub mod pool;
pub mod query;
pub mod resample;
pub mod source;
pub mod telemetry;
pub mod tile;

pub use engine::{EngineConfig, QueryStream, TileEngine};
pub use footprint::Footprint;
pub use query::{ChannelId, Interpolation, QueryId, QueryPlan};
pub use tile::{ArrayData, DstDtype, TileBuffer};
