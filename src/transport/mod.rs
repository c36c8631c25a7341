//! Broker Transport
//!
//! Resilient publish/subscribe session to the device broker.
//!
//! ## Architecture
//!
//! - **ConnectionManager**: owns state, subscriptions and reconnect policy
//! - **Connector / BrokerLink**: seam to a concrete client
//! - **MqttConnector**: rumqttc over mutual TLS
//! - **MemoryBroker**: in-process broker for tests and local runs
//!
//! ```text
//! device ─▶ broker ─▶ BrokerLink ─▶ supervisor ─▶ mpsc<InboundMessage> ─▶ router
//! ```

mod credentials;
mod error;
mod link;
mod manager;
mod memory;
mod mqtt;
mod state;

pub use credentials::{Credentials, TlsFiles, TlsMaterial};
pub use error::{TransportError, TransportResult};
pub use link::{BrokerLink, Connector, InboundMessage, LinkEvent, OpenedLink};
pub use manager::ConnectionManager;
pub use memory::{topic_matches, MemoryBroker};
pub use mqtt::MqttConnector;
pub use state::ConnectionState;
