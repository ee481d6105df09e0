//! Channel-typed entry contracts.
//!
//! An [`EntryChannel`] tags a target state with the payload type a
//! transition must supply when entering through it. Channels are
//! declarative metadata, not nodes.

use crate::descriptor::short_type_name;
use crate::error::HandlerFault;
use crate::host::TransitionContext;
use crate::key::{DataKey, StateKey};
use crate::state::{InitialData, InitialDataFn};
use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;

/// A typed entry contract: entering `target` through this channel obliges
/// the source transition to supply a `P`.
pub struct EntryChannel<P> {
    target: StateKey,
    _payload: PhantomData<fn(P)>,
}

impl<P: Any + Send> EntryChannel<P> {
    pub fn new(target: &StateKey) -> Self {
        EntryChannel {
            target: target.clone(),
            _payload: PhantomData,
        }
    }

    /// Channel into a data state.
    pub fn for_data_state<D>(target: &DataKey<D>) -> Self {
        EntryChannel {
            target: target.key().clone(),
            _payload: PhantomData,
        }
    }

    pub fn target(&self) -> &StateKey {
        &self.target
    }

    /// Initial-data factory seeded from the entry payload.
    ///
    /// This is the single surface for channel-derived state data: hand the
    /// result to `data_state` and the target's data is computed from the
    /// payload each time the state is entered through this channel. A
    /// missing or mistyped payload surfaces as a fault.
    pub fn initial_data<D, F>(&self, f: F) -> InitialData<D>
    where
        D: Any + Send,
        P: Clone,
        F: Fn(&P, &mut TransitionContext<'_>) -> D + Send + Sync + 'static,
    {
        let init: InitialDataFn = Arc::new(move |ctx| {
            let payload = ctx
                .payload_ref::<P>()
                .cloned()
                .ok_or_else(|| HandlerFault::missing_payload(short_type_name::<P>()))?;
            Ok(Box::new(f(&payload, ctx)))
        });
        InitialData::from_fn(init)
    }
}

impl<P> Clone for EntryChannel<P> {
    fn clone(&self) -> Self {
        EntryChannel {
            target: self.target.clone(),
            _payload: PhantomData,
        }
    }
}

/// Typed access to the entry payload, handed to `on_enter_from_channel`
/// callbacks.
pub struct EntryPayload<P> {
    _payload: PhantomData<fn() -> P>,
}

impl<P: Any> EntryPayload<P> {
    pub(crate) fn new() -> Self {
        EntryPayload {
            _payload: PhantomData,
        }
    }

    /// Borrow of the payload supplied for this entry.
    pub fn peek<'c>(&self, ctx: &'c TransitionContext<'_>) -> Result<&'c P, HandlerFault> {
        ctx.payload_ref::<P>()
            .ok_or_else(|| HandlerFault::missing_payload(short_type_name::<P>()))
    }

    /// Takes the payload out of the context.
    pub fn take(&self, ctx: &mut TransitionContext<'_>) -> Result<P, HandlerFault> {
        ctx.take_payload()
    }
}

impl<P> Clone for EntryPayload<P> {
    fn clone(&self) -> Self {
        EntryPayload {
            _payload: PhantomData,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::testing::MemHost;

    #[derive(Debug, Clone, PartialEq)]
    struct Ticket {
        id: u32,
    }

    #[test]
    fn channel_seeds_initial_data_from_the_payload() {
        let target = StateKey::new("review");
        let chan: EntryChannel<Ticket> = EntryChannel::new(&target);
        let init = chan
            .initial_data(|ticket: &Ticket, _ctx| ticket.id * 2)
            .into_fn();

        let mut host = MemHost::default();
        let mut ctx = TransitionContext::new(target.clone(), &mut host)
            .with_payload(Box::new(Ticket { id: 21 }));

        let value = init(&mut ctx).unwrap();
        assert_eq!(value.downcast_ref::<u32>(), Some(&42));
    }

    #[test]
    fn missing_payload_is_a_fault() {
        let target = StateKey::new("review");
        let chan: EntryChannel<Ticket> = EntryChannel::new(&target);
        let init = chan
            .initial_data(|ticket: &Ticket, _ctx| ticket.id)
            .into_fn();

        let mut host = MemHost::default();
        let mut ctx = TransitionContext::new(target.clone(), &mut host);
        assert!(init(&mut ctx).is_err());
    }

    #[test]
    fn entry_payload_peek_and_take() {
        let payload: EntryPayload<Ticket> = EntryPayload::new();
        let mut host = MemHost::default();
        let mut ctx = TransitionContext::new(StateKey::new("s"), &mut host)
            .with_payload(Box::new(Ticket { id: 7 }));

        assert_eq!(payload.peek(&ctx).unwrap().id, 7);
        assert_eq!(payload.take(&mut ctx).unwrap(), Ticket { id: 7 });
        assert!(payload.peek(&ctx).is_err());
    }
}
