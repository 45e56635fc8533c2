//! Router Module
//!
//! Lets several protocol servers share one listening port.

mod signature;
mod single_port;
mod table;

pub use signature::{ProtocolSignature, SignatureMatch};
pub use single_port::SinglePortRouter;
pub use table::{Resolution, Route, RoutingTable};
