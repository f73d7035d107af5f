//! Link management and dispatch for linkmux.
//!
//! Sits between the multiplexer core and the callers: [`LinkService`] is the
//! public entry point, the [`LinkRegistry`] reference-counts connections per
//! device, and the [`Dispatcher`] moves events across the wire with one
//! writer/pump thread pair per link.

pub mod dispatcher;
pub mod error;
pub mod registry;
pub mod service;

pub use dispatcher::Dispatcher;
pub use error::{LinkError, Result};
pub use registry::LinkRegistry;
pub use service::LinkService;
