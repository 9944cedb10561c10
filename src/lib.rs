//! Offline-first data layer: a local cache of remote collections, a durable queue of
//! writes made while offline, and the engine that replays them once connectivity returns.

pub mod cache;
pub mod client;
pub mod config;
pub mod event;
pub mod queue;
pub mod remote;
pub mod store;
pub mod sync;
