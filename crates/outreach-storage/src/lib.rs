//! Outreach Storage - Record store abstraction
//!
//! Contacts and follow-up history are owned by the host application and
//! persisted through the [`RecordStore`] trait between runs.

pub mod store;

pub use store::{JsonFileStore, RecordStore};
