//! Gateway: the HTTP surface.
//!
//! One port serves the health probe, the subscription handshake, and one POST endpoint per
//! integration. Event endpoints answer immediately; accepted events run on their own tasks.

mod server;

pub use server::{router, run_gateway, GatewayState};
