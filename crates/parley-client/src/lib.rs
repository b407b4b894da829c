//! Parley chat client.
//!
//! [`ChatClient`] drives one hub connection through
//! `disconnected -> connecting -> connected (-> reconnecting)*`, encrypts
//! outgoing envelopes once a pairwise E2EE session is negotiated, and reports
//! everything else through [`ClientEvents`].

pub mod client;
pub mod config;
pub mod e2ee;
pub mod error;
pub mod events;
pub mod state;
mod transport;

pub use client::ChatClient;
pub use config::{BackoffStrategy, ClientConfig};
pub use e2ee::E2eeInfo;
pub use error::ClientError;
pub use events::{ClientEvent, ClientEvents, ReceivedMessage};
pub use state::{ConnectionState, ConnectionStatus};
