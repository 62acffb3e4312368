//! Device server daemon library.

pub mod cache;
pub mod config;
pub mod data;
pub mod devices;
pub mod dserver;
pub mod error;
pub mod events;
pub mod polling;
pub mod properties;
pub mod routes;
pub mod startup;
