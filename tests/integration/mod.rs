//! Integration tests for Switchboard
//!
//! These tests drive the engine, the queue and the HTTP routes end to end
//! over scripted backends and mocked providers.

mod caching;
mod failover;
mod providers;
mod queue;
mod routes;
