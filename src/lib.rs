//! Friend Circle - a feed aggregator for a circle of personal sites
//!
//! This crate periodically crawls the feeds of a remote friend list and
//! publishes one time-sorted JSON document of their latest articles. The
//! HTTP side serves that document and a secret-gated manual trigger, both
//! behind a per-client rate limiter.

pub mod config;
pub mod crawler;
pub mod error;
pub mod fetcher;
pub mod model;
pub mod ratelimit;
pub mod routes;
pub mod sanitize;
pub mod scheduler;
pub mod storage;
pub mod time;
