//! Long-poll Instant Messaging Client Library
//!
//! The client engine of a web instant-messaging service: roster and
//! profile fetches, sending, and a long-poll loop that decodes pushed
//! envelopes, built on a small async event framework.
//!
//! # Features
//! - One-shot async events and join sets with listener callbacks
//! - Process-wide signal bus, scoped per session
//! - Buddy list, groups, presence, profiles, account numbers and avatars
//! - Roster management: marknames, categories, deletes and add requests
//! - Buddy and group messages with rich content (text, faces, images)
//! - Long-poll loop with a configurable retcode policy
//!
//! # Architecture
//! Requests are blocking HTTP calls run on a tokio worker pool:
//! - `Http` issues a request on a worker and completes an `AsyncEvent`
//! - `AsyncEventSet` joins several events; `orchestrator` sequences them
//! - `PollSession` owns a dedicated thread and publishes decoded envelopes
//! - Shared state sits behind `parking_lot` locks on the `Session`
//!
//! # Example
//! ```ignore
//! use std::sync::Arc;
//! use webim_client::{
//!     background_friends_info, background_msg_poll, ClientConfig, Credentials,
//!     ReqwestTransport, Session, SignalBus, SignalKind,
//! };
//!
//! let config = ClientConfig::default();
//! let transport = Arc::new(ReqwestTransport::new(config.request_timeout())?);
//! let session = Session::new(config, transport, SignalBus::global(), Credentials::default())?;
//! session.subscribe(SignalKind::BasicInfoReady, |_| println!("roster loaded"));
//! background_friends_info(&session)?;
//! let (poller, _handle) = background_msg_poll(&session)?;
//! ```

pub mod config;
pub mod content;
pub mod error;
pub mod event;
pub mod info;
pub mod json;
pub mod message;
pub mod orchestrator;
pub mod poll;
pub mod roster;
pub mod send;
pub mod session;
pub mod signal;
pub mod transport;
pub mod types;
pub mod worker;

#[cfg(test)]
mod testing;

// Re-export main types for convenience
pub use config::{ClientConfig, RetcodeAction, RetcodePolicy};
pub use content::{ChatKind, ContentRun, MessageContent};
pub use error::{ClientError, LoginError, ProgrammingError, ProtocolError, ResultCode, TransportError};
pub use event::{AsyncEvent, AsyncEventSet};
pub use info::{Contact, DeleteMode};
pub use message::{ChatMessage, Envelope};
pub use orchestrator::{
    background_friends_info, background_login, background_msg_drain, background_msg_poll,
    background_send, fetch_basic_info,
};
pub use poll::{PollSession, PollState};
pub use roster::{Buddy, Group, Roster};
pub use send::OutgoingMessage;
pub use session::{Authenticator, Credentials, Session};
pub use signal::{Signal, SignalBus, SignalKind};
pub use transport::{ReqwestTransport, Transport};
pub use types::{ClientId, EventId, SessionId};
