#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **journal-core** – Core abstractions for the durable event-sourcing
//! journal.
//!
//! This crate provides the row model, the `Serializer` contract,
//! configuration, the error taxonomy, and the sequential id generator
//! used throughout the journal. It sits at the core layer and defines
//! the contracts for event persistence without providing a concrete
//! storage driver.
//!
//! Storage drivers (e.g. `journal-sqlite`) implement [`Serializer`]'s
//! counterpart write/read pipelines against a concrete database in
//! separate crates that depend on this core abstraction.

pub mod config;
pub mod error;
pub mod id;
pub mod model;
pub mod payload;
pub mod serializer;

/// Convenient prelude for importing the most common types.
pub mod prelude {
    pub use crate::config::{JournalConfig, ProviderKind};
    pub use crate::error::JournalError;
    pub use crate::id::SequentialIdGenerator;
    pub use crate::model::{
        decode_csv_tags, encode_csv_tags, validate_tag, AtomicWrite, Envelope, EventSequence,
        JournalRow, MetadataRow, Ordering, PersistenceId, PersistentRepr, ReplayCompletion,
        SequenceNumber, TagMode, TagRow, CSV_TAG_SEPARATOR,
    };
    pub use crate::payload::{decode_payload, encode_payload};
    pub use crate::serializer::Serializer;
}
