//! Application-facing handler registry.
//!
//! The decoded-message dispatch table is an external collaborator (see the
//! handler-registry design note): the core only needs to invoke it by
//! integer id. The source uses a mutable global singleton for this; folded
//! here into an explicit registry the application owns and passes in,
//! since Rust has no sanctioned mutable-global equivalent.

use std::collections::HashMap;

use crate::cursor::PacketCursor;
use crate::error::ConnectorError;

type Handler<Ctx> = Box<dyn Fn(&mut Ctx, Option<usize>, &mut PacketCursor) -> Result<(), ConnectorError>>;

/// Maps handler ids to application callbacks.
pub struct HandlerRegistry<Ctx> {
    handlers: HashMap<u32, Handler<Ctx>>,
}

impl<Ctx> HandlerRegistry<Ctx> {
    pub fn new() -> Self {
        Self { handlers: HashMap::new() }
    }

    pub fn register<F>(&mut self, id: u32, handler: F)
    where
        F: Fn(&mut Ctx, Option<usize>, &mut PacketCursor) -> Result<(), ConnectorError> + 'static,
    {
        self.handlers.insert(id, Box::new(handler));
    }

    /// Invoke the handler registered for `id`. An unknown id is an illegal
    /// message (see the illegal-message error kind), not a silent no-op.
    pub fn dispatch(
        &self,
        id: u32,
        ctx: &mut Ctx,
        sender_index: Option<usize>,
        cursor: &mut PacketCursor,
    ) -> Result<(), ConnectorError> {
        match self.handlers.get(&id) {
            Some(handler) => handler(ctx, sender_index, cursor),
            None => Err(ConnectorError::IllegalMessage),
        }
    }
}

impl<Ctx> Default for HandlerRegistry<Ctx> {
    fn default() -> Self {
        Self::new()
    }
}
