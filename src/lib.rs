//! Client SDK for the Quill messaging platform.
//!
//! The crate is organized by transport surface:
//! - `rest`: bucketed request dispatcher for the rate-limited HTTP channel.
//! - `gateway`: persistent streaming connection and session state machine.
//! - `dispatch`: inbound packet interpretation and cache synchronization.
//! - `cache` / `model`: the minimal entity state the sync logic needs.
//! - `client`: root object owning lifecycle and the event surface.
//! - `retry`: shared retry and timeout utilities.

/// In-memory entity cache synchronized by the packet dispatcher.
pub mod cache;
/// Root client, lifecycle state machine, and event surface.
pub mod client;
/// Dispatch-packet interpretation and cache mutation.
pub mod dispatch;
/// Client-level events emitted to the host.
pub mod events;
/// Gateway websocket connection, heartbeat, and reconnect supervision.
pub mod gateway;
/// Minimal entity types used by cache synchronization.
pub mod model;
/// Rate-limit buckets and the HTTP request dispatcher.
pub mod rest;
/// Retry and timeout helpers used across the SDK.
pub mod retry;

pub use client::{Client, ClientConfig, ClientError, ConnectionState};
pub use events::Event;
pub use model::Snowflake;
