//! Resilient session-oriented protocol client.
//!
//! One [`Session`] keeps an authenticated connection to a self-hosted service
//! alive: it opens a [`transport::Transport`], authenticates with credentials
//! from a [`credentials::CredentialManager`], correlates command responses,
//! fans server pushes out to subscribers, and mirrors pushed state in a local
//! cache that stays readable across reconnects.
//!
//! Wire formats are pluggable through [`codec::Codec`]: [`codec::JsonCodec`]
//! for duplex JSON push APIs and [`codec::RconCodec`] for the binary remote
//! console protocol. Stateless token-authenticated HTTP APIs use
//! [`http::TokenHttpClient`] instead of a session.

pub mod backoff;
pub mod cache;
pub mod codec;
pub mod config;
pub mod correlation;
pub mod credentials;
pub mod error;
pub mod http;
pub mod message;
pub mod registry;
pub mod session;
pub mod state;
pub mod transport;

pub use backoff::ReconnectPolicy;
pub use cache::{CachedEntity, StateCache};
pub use config::{ConfigError, Keepalive, SessionConfig};
pub use credentials::{Credential, CredentialManager, CredentialSource, TokenEndpoint, TokenExtraction};
pub use error::SessionError;
pub use http::{Method, TokenHttpClient, TokenPlacement};
pub use message::{Command, Event, EventValue, RequestId, WILDCARD_TOPIC};
pub use registry::SubscriptionHandle;
pub use session::Session;
pub use state::ConnectionState;
