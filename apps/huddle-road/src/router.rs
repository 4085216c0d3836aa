use std::collections::HashMap;

use futures::future::BoxFuture;
use huddle_proto::{kind, Envelope};

use crate::error::RouteError;
use crate::registry::ConnectionId;
use crate::server::SessionServer;

pub type HandlerFuture<'a> = BoxFuture<'a, Result<(), RouteError>>;

/// A handler gets the server context, the originating connection and the
/// parsed envelope.
pub type Handler = for<'a> fn(&'a mut SessionServer, ConnectionId, Envelope) -> HandlerFuture<'a>;

/// Type-keyed dispatch table for inbound envelopes.
#[derive(Default)]
pub struct MessageRouter {
    handlers: HashMap<&'static str, Handler>,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any handler already registered for `kind`.
    pub fn register(&mut self, kind: &'static str, handler: Handler) -> &mut Self {
        self.handlers.insert(kind, handler);
        self
    }

    pub fn handler(&self, kind: &str) -> Option<Handler> {
        self.handlers.get(kind).copied()
    }

    pub fn kinds(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.handlers.keys().copied()
    }

    pub fn with_default_handlers() -> Self {
        let mut router = Self::new();
        router
            .register(kind::AUTHENTICATE, on_authenticate)
            .register(kind::JOIN, on_join)
            .register(kind::LEAVE, on_leave)
            .register(kind::OFFER, on_relay)
            .register(kind::ANSWER, on_relay)
            .register(kind::ICE_CANDIDATE, on_relay)
            .register(kind::STREAM_ID_MAP, on_relay)
            .register(kind::MUTE_STATUS_CHANGED, on_relay);
        router
    }
}

fn on_authenticate(
    server: &mut SessionServer,
    connection_id: ConnectionId,
    envelope: Envelope,
) -> HandlerFuture<'_> {
    Box::pin(server.authenticate(connection_id, envelope))
}

fn on_join(
    server: &mut SessionServer,
    connection_id: ConnectionId,
    envelope: Envelope,
) -> HandlerFuture<'_> {
    Box::pin(server.join(connection_id, envelope))
}

fn on_leave(
    server: &mut SessionServer,
    connection_id: ConnectionId,
    _envelope: Envelope,
) -> HandlerFuture<'_> {
    Box::pin(async move {
        server.leave(connection_id).await;
        Ok(())
    })
}

fn on_relay(
    server: &mut SessionServer,
    connection_id: ConnectionId,
    envelope: Envelope,
) -> HandlerFuture<'_> {
    Box::pin(server.relay(connection_id, envelope))
}
