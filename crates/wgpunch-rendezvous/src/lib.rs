//! # wgpunch rendezvous
//!
//! Out-of-band exchange of reflexive addresses between WireGuard peers,
//! keyed by public key.
//!
//! Neither peer knows in advance what public `ip:port` the other's NAT
//! will expose, so each publishes its own [`StunInfo`] to a shared
//! server and polls for the counterpart's. A quiescent peer can instead
//! hold a websocket open and be woken when somebody starts looking for
//! it.
//!
//! ## Architecture
//!
//! ```text
//!        ┌──────────────────────┐
//!        │  rendezvous server   │
//!        │  pubkey → StunInfo   │
//!        │  (20 s TTL, in-mem)  │
//!        └─────┬──────────┬─────┘
//!        POST / GET       │ ws wake-up
//!              │          │
//!        ┌─────┴────┐ ┌───┴──────┐
//!        │  peer A  │ │  peer B  │
//!        └──────────┘ └──────────┘
//! ```
//!
//! The public key is only a routing identifier at this layer; nothing
//! here is authenticated.

pub mod client;
pub mod proto;
pub mod server;

pub use client::{RendezvousClient, RendezvousError, WakeStream};
pub use proto::WakeMessage;
pub use server::{RendezvousServer, ServerConfig};

// Re-exported so consumers of the wire format need not depend on the
// NAT engine directly.
pub use wgpunch_nat::{NatKind, StunInfo};
