//! Either-immediate-or-deferred values.
//!
//! Handlers and guard predicates may finish synchronously or hand back a
//! future. [`Step`] represents both shapes behind one type, and its bind
//! combinators continue synchronously whenever the value is already
//! resolved. Materialization itself never constructs a deferred step.

use crate::error::HandlerFault;
use crate::key::StateKey;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

/// Boxed future used by deferred steps.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A value that is either already resolved or still being computed.
pub enum Step<'a, T> {
    Ready(T),
    Deferred(BoxFuture<'a, T>),
}

/// The user-facing shape of [`Step`]: deferred work owns everything it
/// touches, so closures handed to the builders return `Eventual`.
pub type Eventual<T> = Step<'static, T>;

impl<'a, T: Send + 'a> Step<'a, T> {
    pub fn ready(value: T) -> Self {
        Step::Ready(value)
    }

    pub fn deferred(fut: impl Future<Output = T> + Send + 'a) -> Self {
        Step::Deferred(Box::pin(fut))
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Step::Ready(_))
    }

    /// The resolved value, if no suspension was needed.
    pub fn now(self) -> Option<T> {
        match self {
            Step::Ready(value) => Some(value),
            Step::Deferred(_) => None,
        }
    }

    pub fn map<U: Send + 'a>(self, f: impl FnOnce(T) -> U + Send + 'a) -> Step<'a, U> {
        match self {
            Step::Ready(value) => Step::Ready(f(value)),
            Step::Deferred(fut) => Step::Deferred(Box::pin(async move { f(fut.await) })),
        }
    }

    /// Monadic bind: continues synchronously when the value is ready,
    /// otherwise chains the continuation onto the in-flight future.
    pub fn and_then<U: Send + 'a>(
        self,
        f: impl FnOnce(T) -> Step<'a, U> + Send + 'a,
    ) -> Step<'a, U> {
        match self {
            Step::Ready(value) => f(value),
            Step::Deferred(fut) => {
                Step::Deferred(Box::pin(async move { f(fut.await).resolve().await }))
            }
        }
    }

    /// Awaits the value, completing immediately for ready steps.
    pub async fn resolve(self) -> T {
        match self {
            Step::Ready(value) => value,
            Step::Deferred(fut) => fut.await,
        }
    }
}

impl<'a, T: fmt::Debug> fmt::Debug for Step<'a, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Ready(value) => f.debug_tuple("Ready").field(value).finish(),
            Step::Deferred(_) => f.write_str("Deferred(..)"),
        }
    }
}

/// Type-erased value moved across a transition (channel payloads, staged
/// `when_result` successes, state data instances).
pub type Payload = Box<dyn Any + Send>;

/// Result of an entry or exit action.
pub type ActionResult = Result<(), HandlerFault>;

/// What a message handler tells the executor to do.
#[derive(Debug)]
pub enum Disposition {
    /// Exit to the named state. `payload` carries the channel payload when
    /// the target is entered through one.
    GoTo {
        target: StateKey,
        payload: Option<Payload>,
    },
    /// Exit and re-enter the current state.
    GoToSelf,
    /// Consume the message without transitioning.
    Stay,
    /// Not handled here; the executor escalates to the parent state.
    Unhandled,
    /// The handler failed; the executor surfaces the fault.
    Fault(HandlerFault),
}

impl Disposition {
    pub fn go_to(target: StateKey) -> Self {
        Disposition::GoTo {
            target,
            payload: None,
        }
    }

    pub fn is_unhandled(&self) -> bool {
        matches!(self, Disposition::Unhandled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_chains_stay_synchronous() {
        let step = Step::ready(20).map(|n| n + 1).and_then(|n| Step::ready(n * 2));
        assert_eq!(step.now(), Some(42));
    }

    #[test]
    fn deferred_is_not_inspectable() {
        let step: Eventual<i32> = Step::deferred(async { 7 });
        assert!(!step.is_ready());
        assert!(step.now().is_none());
    }

    #[tokio::test]
    async fn deferred_chains_resolve() {
        let step: Eventual<i32> = Step::deferred(async { 20 })
            .and_then(|n| Step::deferred(async move { n + 1 }))
            .map(|n| n * 2);
        assert_eq!(step.resolve().await, 42);
    }

    #[tokio::test]
    async fn mixed_chain_resolves() {
        let step: Eventual<i32> = Step::ready(1).and_then(|n| Step::deferred(async move { n + 41 }));
        assert_eq!(step.resolve().await, 42);
    }
}
