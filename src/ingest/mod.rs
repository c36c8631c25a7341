//! Message Ingestion
//!
//! - **event_type**: type-code table and alert set
//! - **normalizer**: payload validation and mapping
//! - **dedup**: retransmission guard
//! - **router**: topic dispatch and the intake loop
//! - **error**: Error types

pub mod dedup;
pub mod error;
pub mod event_type;
pub mod normalizer;
pub mod router;

pub use dedup::{Deduplicator, Verdict};
pub use error::IngestError;
pub use event_type::{event_name, is_alert, LOCATION, UNKNOWN_EVENT};
pub use normalizer::{normalize_event, normalize_record, parse_object};
pub use router::{MessageRouter, RouteOutcome, RouterStats};
