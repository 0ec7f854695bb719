#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! forwarder library - the tunnel protocol and both ends built on it.
//!
//! - `tunnel` - wire codec, control packets, sessions and virtual connections
//! - `gateway` - public HTTP/WS listener, tunnel registration, client bridges
//! - `agent` - outbound tunnel client and local service dialer
//! - `auth` - shared-secret check and rotating tunnel route
//! - `config` - configuration loading

pub mod agent;
pub mod auth;
pub mod config;
pub mod gateway;
pub mod tunnel;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use gateway::{GatewayState, TunnelRegistry};
pub use tunnel::{TunnelError, TunnelSession, VirtualConnection};
