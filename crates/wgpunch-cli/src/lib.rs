//! # wgpunch CLI support
//!
//! The orchestration layer behind the `wgpunch` binaries: one peering
//! attempt from a cold socket to a configured WireGuard endpoint.

pub mod orchestrate;

pub use orchestrate::{
    apply_route, resolve_route, resolve_route_with, select_strategy, PunchedRoute, ResolveConfig,
    Strategy, TraversalError,
};
