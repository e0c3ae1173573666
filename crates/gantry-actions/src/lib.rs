//! Client to the external Actions dispatch service
//!
//! The dispatch service assigns jobs to registered runners. This crate covers
//! the slice of its API the operator needs: deregistering a runner from a
//! scale set, authenticated with a token and routed through a configured
//! proxy when one is present.

#![deny(missing_docs)]

mod client;

pub use client::{
    DispatchClient, DispatchClientFactory, DispatchConfig, DispatchError,
    HttpDispatchClientFactory, ProxyEndpoint, ResolvedProxy,
};
