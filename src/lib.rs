//! # Iroh Locator
//!
//! This crate implements multicast discovery of named adapters, replica
//! groups, well-known objects and directory services. A client broadcasts a
//! query on every configured interface; nodes that know the answer reply
//! unicast. Directory operations and liveness probes then run over an
//! [`irpc`] service carried by [`iroh`] QUIC connections.
//!
//! The crate is split into modules that can be reused independently:
//!
//! - [`core`]: identifiers, endpoint sets and error types shared by every
//!   layer.
//! - [`protocol`]: the JSON datagrams exchanged over multicast and the
//!   [`LocatorProtocol`] RPC service definition.
//! - [`channel`]: the [`QueryChannel`] seam and its UDP multicast
//!   implementation.
//! - [`query`] and [`locator`]: the per-key query state machine and the
//!   pending query table that deduplicates concurrent lookups.
//! - [`registry`]: the in-memory adapter and replica group store.
//! - [`directory`]: resolution of (and calls to) the directory service.
//! - [`server`]: answering queries and RPCs from a registry.
//! - [`net`]: the iroh transport for RPCs.
//!
//! ## Getting started
//!
//! ```no_run
//! use anyhow::Result;
//! use iroh_locator::{bind_channels, Locator, LocatorConfig, MulticastConfig};
//!
//! # async fn launch() -> Result<()> {
//! let multicast = MulticastConfig::default();
//! let channels = bind_channels(multicast.group(), &multicast.interfaces)?;
//! let locator = Locator::new(LocatorConfig::default(), channels);
//! for channel in locator.channels() {
//!     channel.spawn_reply_loop(locator.downgrade());
//! }
//!
//! let endpoints = locator.resolve_adapter("Printer").await?;
//! println!("Printer is reachable at {endpoints}");
//! # Ok(())
//! # }
//! ```
//!
//! The binary in `src/main.rs` wires these pieces into a responder and a
//! handful of lookup commands.

pub mod channel;
pub mod config;
pub mod core;
pub mod directory;
pub mod locator;
pub mod net;
pub mod protocol;
pub mod query;
pub mod registry;
pub mod server;
pub mod timer;

pub use channel::{bind_channels, MulticastListener, QueryChannel, UdpChannel};
pub use config::{DirectoryConfig, LocatorConfig, MulticastConfig, ResponderConfig};
pub use core::{
    DirectoryReference, DiscoveryError, Endpoints, Identity, QueryKey, RequestId, RpcError,
};
pub use directory::{DirectoryResolver, DirectoryRpc, DirectoryTarget};
pub use locator::{Locator, PendingResolution, WeakLocator};
pub use net::{endpoint_descriptor, serve_rpc, IrohRpc, LOCATOR_ALPN};
pub use protocol::{DirectoryRequest, DirectoryResponse, LocatorProtocol};
pub use query::{QueryParams, Resolved};
pub use registry::{EntityProbe, Registry};
pub use server::{Responder, RpcService};
