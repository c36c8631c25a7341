//! Real-Time Alert Fan-out
//!
//! Pushes alert events to connected observers over WebSocket.
//!
//! ## Protocol
//!
//! Observers connect to `/ws` and receive:
//! - `{"type":"connected","session_id":"..."}` once
//! - every alert event as its stored JSON (`ID`, `DEVICE_ID`, `TS`, `Type`, ...)
//! - `{"type":"pong"}` in reply to `{"type":"ping"}`
//!
//! ```javascript
//! const ws = new WebSocket('ws://localhost:8085/ws');
//! ws.onmessage = (event) => {
//!   const msg = JSON.parse(event.data);
//!   if (msg.Alert) console.log('Alert from', msg.DEVICE_ID, msg.Event_Name);
//! };
//! ```

mod handler;
mod hub;
mod messages;

pub use handler::alert_stream;
pub use hub::{HubConfig, NotificationError, NotificationHub, Notifier, SessionId};
pub use messages::{ClientMessage, Frame, ServerMessage};
