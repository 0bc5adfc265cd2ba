//! Shared records for the hush workspace.
//!
//! `models` holds the domain rows the store and indexer work on, `api` the
//! typed request/response bodies for every HTTP operation and `events` the
//! frames pushed over live channels.

pub mod api;
pub mod events;
pub mod models;
