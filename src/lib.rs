//! kinfeed: per-user feed cache with event-driven recomputation and live fan-out.

pub mod application;
pub mod broker;
pub mod cache;
pub mod config;
pub mod events;
pub mod feed;
pub mod infra;
