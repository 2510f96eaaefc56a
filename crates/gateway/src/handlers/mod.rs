//! API handlers module

pub mod articles;
pub mod health;
pub mod jobs;
