//! Polling monitor for Binance copy-trading leads.
//!
//! The pipeline: [`fetch`] retries classified HTTP failures with exponential
//! backoff, [`extract`] pulls structured data out of the portal's embedded
//! hydration JSON and the history API envelope, [`store`] deduplicates
//! records by content fingerprint, and [`monitor`] drives the polling loops
//! that turn cycles into [`types::Alert`]s delivered by [`notify`].
//! [`binance::LeadApi`] is the injectable upstream surface the loops poll.

pub mod binance;
pub mod config;
pub mod extract;
pub mod fetch;
pub mod health;
pub mod monitor;
pub mod notify;
pub mod recorder;
pub mod store;
pub mod types;
