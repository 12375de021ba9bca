//! # wgpunch NAT engine
//!
//! NAT discovery and UDP hole punching for point-to-point WireGuard links.
//!
//! This crate provides:
//! - A STUN client (RFC 5389 Binding Request) for learning a socket's
//!   reflexive address
//! - NAT classification by probing two independent reflectors from the
//!   same socket
//! - Two hole-punching strategies that convert a classified peer pair
//!   into an acknowledged bidirectional UDP flow
//!
//! # NAT classes
//!
//! The engine collapses NAT behavior to two classes, which is all the
//! punching strategies can exploit:
//!
//! - **Easy**: endpoint-independent mapping; one public `ip:port`
//!   represents this peer to every destination
//! - **Hard**: mapping depends on the destination; every destination
//!   sees a different source port
//!
//! # Strategy selection
//!
//! | self \ peer | Easy | Hard |
//! |-------------|------|------|
//! | Easy | direct, no punching | [`guess_remote_port`] |
//! | Hard | [`guess_local_port`] | infeasible |
//!
//! # Example
//!
//! ```rust,no_run
//! use wgpunch_nat::{classify, NatKind, STUN_GOOGLE, STUN_VOIPGATE};
//! use tokio::net::UdpSocket;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let socket = UdpSocket::bind("0.0.0.0:0").await?;
//! let info = classify(&socket, STUN_GOOGLE, STUN_VOIPGATE).await?;
//! match info.nat_kind {
//!     NatKind::Easy => println!("reachable at {}:{}", info.public_ip, info.public_port),
//!     NatKind::Hard => println!("port-randomizing NAT at {}", info.public_ip),
//! }
//! # Ok(())
//! # }
//! ```

pub mod classify;
pub mod punch;
pub mod stun;

#[cfg(test)]
pub(crate) mod testutil;

pub use classify::{classify, NatKind, StunInfo};
pub use punch::{
    guess_local_port, guess_remote_port, simple_test, PortInfo, PunchError, RemoteGuessConfig,
};
pub use stun::{StunError, STUN_GOOGLE, STUN_VOIPGATE};
