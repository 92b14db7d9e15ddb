//! Application services layer.

pub mod error;
pub mod feed;
pub mod friends;
pub mod posts;
pub mod repos;
