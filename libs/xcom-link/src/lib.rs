//! Xcom link
//!
//! Async transaction engine for one TCP connection to a Studer Xcom gateway.
//! A single owner task holds the socket and the pending-request table;
//! [`XcomLink`] handles talk to it over channels, so any number of tasks can
//! issue requests concurrently.
//!
//! ```no_run
//! use std::sync::Arc;
//! use xcom_link::{LinkConfig, RequestOptions, XcomLink};
//! use xcom_protocol::XcomDataset;
//!
//! # async fn run() -> xcom_protocol::Result<()> {
//! let catalog = XcomDataset::from_json(&std::fs::read_to_string("datapoints.json")?)?;
//! let link = XcomLink::new(LinkConfig::connect("192.168.1.20", 4001), Arc::new(catalog))?;
//! link.start().await?;
//! let power = link.request_value_nr(3023, "XT1", RequestOptions::default()).await?;
//! println!("XT1 output power: {power}");
//! link.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod diagnostics;
mod engine;
pub mod link;
pub mod menu;
pub mod transaction;

pub use config::{DuplicatePolicy, LinkConfig, LinkMode};
pub use diagnostics::LinkDiagnostics;
pub use link::{InfoReading, InfoReadings, RequestOptions, XcomLink};
pub use menu::MenuWalk;
pub use transaction::{MatchKey, TransactionState};
