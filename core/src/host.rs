//! The runtime seam.
//!
//! The declarative layer never owns live state data, queues, or timers.
//! The executor injects a [`TreeHost`] and the contexts here wrap it for
//! handler code. The host is passed explicitly into every handler; it is
//! never a global.

use crate::error::HandlerFault;
use crate::eventual::Payload;
use crate::key::{DataKey, StateKey};
use std::any::Any;
use std::time::Duration;

/// Capabilities the executing runtime lends to handlers.
pub trait TreeHost: Send {
    /// The live data value of the named state, if any.
    fn state_data(&self, key: &StateKey) -> Option<&(dyn Any + Send)>;

    /// Mutable access to the live data value of the named state.
    fn state_data_mut(&mut self, key: &StateKey) -> Option<&mut (dyn Any + Send)>;

    /// Enqueues a message for dispatch after the current handler completes.
    fn post(&mut self, message: Payload);

    /// Enqueues a message after `delay`. The runtime cancels pending
    /// scheduled posts when the scheduling state is exited.
    fn schedule(&mut self, delay: Duration, message: Payload);
}

/// Typed access to per-state data, shared by both context flavors.
pub trait DataAccess {
    #[doc(hidden)]
    fn host(&self) -> &dyn TreeHost;

    #[doc(hidden)]
    fn host_mut(&mut self) -> &mut dyn TreeHost;

    /// Snapshot of the data value carried by the state identified by `key`.
    fn data<D: Any + Clone>(&self, key: &DataKey<D>) -> Option<D> {
        self.host()
            .state_data(key.key())
            .and_then(|value| value.downcast_ref::<D>())
            .cloned()
    }

    /// Applies `f` to the live data value of the state identified by `key`.
    fn update_data<D: Any>(
        &mut self,
        key: &DataKey<D>,
        f: impl FnOnce(&mut D),
    ) -> Result<(), HandlerFault> {
        let value = self
            .host_mut()
            .state_data_mut(key.key())
            .and_then(|value| value.downcast_mut::<D>())
            .ok_or_else(|| HandlerFault::missing_data(key.key(), std::any::type_name::<D>()))?;
        f(value);
        Ok(())
    }
}

/// Typed handle on a proper ancestor's data, handed to `*_with_data`
/// builder callbacks.
pub struct Ancestor<D> {
    key: DataKey<D>,
}

impl<D: Any + Send> Ancestor<D> {
    pub(crate) fn new(key: DataKey<D>) -> Self {
        Ancestor { key }
    }

    pub fn key(&self) -> &DataKey<D> {
        &self.key
    }

    /// Snapshot of the ancestor's current data value.
    pub fn get<C: DataAccess>(&self, ctx: &C) -> Result<D, HandlerFault>
    where
        D: Clone,
    {
        ctx.data(&self.key)
            .ok_or_else(|| HandlerFault::missing_data(self.key.key(), std::any::type_name::<D>()))
    }

    /// Applies `f` to the ancestor's live data value.
    pub fn update<C: DataAccess>(
        &self,
        ctx: &mut C,
        f: impl FnOnce(&mut D),
    ) -> Result<(), HandlerFault> {
        ctx.update_data(&self.key, f)
    }
}

impl<D> Clone for Ancestor<D> {
    fn clone(&self) -> Self {
        Ancestor {
            key: self.key.clone(),
        }
    }
}

/// Context handed to message handlers.
pub struct MessageContext<'h> {
    current: StateKey,
    host: &'h mut dyn TreeHost,
    staged: Option<Payload>,
}

impl<'h> MessageContext<'h> {
    pub fn new(current: StateKey, host: &'h mut dyn TreeHost) -> Self {
        MessageContext {
            current,
            host,
            staged: None,
        }
    }

    /// Key of the state whose handler is running.
    pub fn current(&self) -> &StateKey {
        &self.current
    }

    pub fn post<M: Any + Send>(&mut self, message: M) {
        self.host.post(Box::new(message));
    }

    pub fn schedule<M: Any + Send>(&mut self, delay: Duration, message: M) {
        self.host.schedule(delay, Box::new(message));
    }

    pub(crate) fn stage(&mut self, value: Payload) {
        self.staged = Some(value);
    }

    /// The value staged by an enclosing `when_result` success branch.
    pub fn staged_ref<T: Any>(&self) -> Option<&T> {
        self.staged.as_ref().and_then(|value| value.downcast_ref::<T>())
    }

    /// Takes the staged `when_result` value out of the context.
    pub fn take_staged<T: Any>(&mut self) -> Result<T, HandlerFault> {
        match self.staged.take() {
            Some(value) => match value.downcast::<T>() {
                Ok(value) => Ok(*value),
                Err(value) => {
                    self.staged = Some(value);
                    Err(HandlerFault::new(format!(
                        "staged value is not a '{}'",
                        std::any::type_name::<T>()
                    )))
                }
            },
            None => Err(HandlerFault::new("no value was staged")),
        }
    }
}

impl DataAccess for MessageContext<'_> {
    fn host(&self) -> &dyn TreeHost {
        &*self.host
    }

    fn host_mut(&mut self) -> &mut dyn TreeHost {
        &mut *self.host
    }
}

/// Context handed to entry and exit handlers, initial-data factories, and
/// initial-child resolvers.
pub struct TransitionContext<'h> {
    current: StateKey,
    host: &'h mut dyn TreeHost,
    payload: Option<Payload>,
    staged: Option<Payload>,
}

impl<'h> TransitionContext<'h> {
    pub fn new(current: StateKey, host: &'h mut dyn TreeHost) -> Self {
        TransitionContext {
            current,
            host,
            payload: None,
            staged: None,
        }
    }

    /// Attaches the channel payload supplied by the transition being taken.
    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Key of the state being entered or exited.
    pub fn current(&self) -> &StateKey {
        &self.current
    }

    pub fn post<M: Any + Send>(&mut self, message: M) {
        self.host.post(Box::new(message));
    }

    pub fn schedule<M: Any + Send>(&mut self, delay: Duration, message: M) {
        self.host.schedule(delay, Box::new(message));
    }

    /// Borrow of the entry payload, when one was supplied and matches `P`.
    pub fn payload_ref<P: Any>(&self) -> Option<&P> {
        self.payload.as_ref().and_then(|value| value.downcast_ref::<P>())
    }

    /// Takes the entry payload out of the context.
    pub fn take_payload<P: Any>(&mut self) -> Result<P, HandlerFault> {
        match self.payload.take() {
            Some(value) => match value.downcast::<P>() {
                Ok(value) => Ok(*value),
                Err(value) => {
                    self.payload = Some(value);
                    Err(HandlerFault::missing_payload(std::any::type_name::<P>()))
                }
            },
            None => Err(HandlerFault::missing_payload(std::any::type_name::<P>())),
        }
    }

    pub(crate) fn stage(&mut self, value: Payload) {
        self.staged = Some(value);
    }

    /// The value staged by an enclosing `when_result` success branch.
    pub fn staged_ref<T: Any>(&self) -> Option<&T> {
        self.staged.as_ref().and_then(|value| value.downcast_ref::<T>())
    }
}

impl DataAccess for TransitionContext<'_> {
    fn host(&self) -> &dyn TreeHost {
        &*self.host
    }

    fn host_mut(&mut self) -> &mut dyn TreeHost {
        &mut *self.host
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;

    /// In-memory host used across the crate's tests.
    #[derive(Default)]
    pub(crate) struct MemHost {
        pub(crate) data: HashMap<StateKey, Box<dyn Any + Send>>,
        pub(crate) posted: Vec<Payload>,
        pub(crate) scheduled: Vec<(Duration, Payload)>,
    }

    impl MemHost {
        pub(crate) fn with_data<D: Any + Send>(mut self, key: &StateKey, value: D) -> Self {
            self.data.insert(key.clone(), Box::new(value));
            self
        }
    }

    impl TreeHost for MemHost {
        fn state_data(&self, key: &StateKey) -> Option<&(dyn Any + Send)> {
            self.data.get(key).map(|value| &**value)
        }

        fn state_data_mut(&mut self, key: &StateKey) -> Option<&mut (dyn Any + Send)> {
            self.data.get_mut(key).map(|value| &mut **value)
        }

        fn post(&mut self, message: Payload) {
            self.posted.push(message);
        }

        fn schedule(&mut self, delay: Duration, message: Payload) {
            self.scheduled.push((delay, message));
        }
    }
}
