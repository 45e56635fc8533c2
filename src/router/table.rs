//! Routing table
//!
//! Immutable list of (signature → protocol server) routes. Reconfiguration
//! builds a new table; a published table is never changed.

use crate::server::ProtocolServer;

use super::signature::{ProtocolSignature, SignatureMatch};

/// One signature and the server it leads to
#[derive(Debug, Clone)]
pub struct Route {
    signature: ProtocolSignature,
    server: ProtocolServer,
}

impl Route {
    pub fn new(signature: ProtocolSignature, server: ProtocolServer) -> Self {
        Self { signature, server }
    }

    /// Route to `server` by the signature of its protocol
    pub fn for_server(server: ProtocolServer) -> Self {
        Self::new(ProtocolSignature::for_protocol(server.protocol()), server)
    }

    pub fn signature(&self) -> ProtocolSignature {
        self.signature
    }

    pub fn server(&self) -> &ProtocolServer {
        &self.server
    }
}

/// Result of looking up a connection prefix
#[derive(Debug)]
pub enum Resolution<'a> {
    /// The first route whose signature matches
    Matched(&'a Route),

    /// Some signature might still match once more bytes arrive
    Undecided,

    /// No signature can ever match
    Unmatched,
}

/// Immutable set of routes
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    routes: Vec<Route>,
}

impl RoutingTable {
    pub fn new(routes: Vec<Route>) -> Self {
        Self { routes }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// A new table with `route` appended
    pub fn with_route(&self, route: Route) -> Self {
        let mut routes = self.routes.clone();
        routes.push(route);
        Self { routes }
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Find the destination for a connection starting with `prefix`
    pub fn resolve(&self, prefix: &[u8]) -> Resolution<'_> {
        let mut undecided = false;
        for route in &self.routes {
            match route.signature.matches(prefix) {
                SignatureMatch::Yes => return Resolution::Matched(route),
                SignatureMatch::Maybe => undecided = true,
                SignatureMatch::No => {}
            }
        }
        if undecided {
            Resolution::Undecided
        } else {
            Resolution::Unmatched
        }
    }
}
