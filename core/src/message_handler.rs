//! Fluent builders for message handlers.
//!
//! A builder is handed to the `on_message` family of state-builder calls;
//! its finishing methods pick the handler kind and every finisher converts
//! into a [`MessageHandlerDescriptor`] via [`IntoMessageHandler`]. The
//! message type threads through the chain so every closure sees `&M`.

use crate::channel::EntryChannel;
use crate::descriptor::{
    short_type_name, ConditionInfo, MessageActionFn, MessageGuardArm, MessageGuardFn,
    MessageHandlerBody, MessageHandlerDescriptor, MessageHandlerInfo, MessageHandlerKind,
    MessagePayloadFn, MessageProducerFn, OpenMessageHandlerFn,
};
use crate::error::HandlerFault;
use crate::eventual::{ActionResult, Disposition, Eventual, Payload, Step};
use crate::host::MessageContext;
use crate::key::{DataKey, StateKey};
use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;

/// Finishing half of the message-handler builders.
pub trait IntoMessageHandler {
    fn into_descriptor(self) -> MessageHandlerDescriptor;
}

impl IntoMessageHandler for MessageHandlerDescriptor {
    fn into_descriptor(self) -> MessageHandlerDescriptor {
        self
    }
}

fn typed_action<M: Any + Send + Sync>(
    f: impl Fn(&M, &mut MessageContext<'_>) -> Eventual<ActionResult> + Send + Sync + 'static,
) -> MessageActionFn {
    Arc::new(move |message, ctx| match message.downcast_ref::<M>() {
        Some(message) => f(message, ctx),
        None => Step::ready(Err(HandlerFault::wrong_message_type(short_type_name::<M>()))),
    })
}

fn typed_guard<M: Any + Send + Sync>(
    f: impl Fn(&M, &mut MessageContext<'_>) -> Eventual<bool> + Send + Sync + 'static,
) -> MessageGuardFn {
    Arc::new(move |message, ctx| match message.downcast_ref::<M>() {
        Some(message) => f(message, ctx),
        None => Step::ready(false),
    })
}

/// Entry point of the fluent chain for messages of type `M`.
pub struct MessageHandlerBuilder<M> {
    message_type: String,
    message_name: Option<String>,
    _message: PhantomData<fn(&M)>,
}

impl<M: Any + Send + Sync> MessageHandlerBuilder<M> {
    pub(crate) fn new(message_name: Option<String>) -> Self {
        MessageHandlerBuilder {
            message_type: short_type_name::<M>().to_string(),
            message_name,
            _message: PhantomData,
        }
    }

    fn seed(&self, kind: MessageHandlerKind) -> MessageHandlerInfo {
        let mut info = MessageHandlerInfo::new(kind, self.message_type.clone());
        info.message_name = self.message_name.clone();
        info
    }

    fn nested(&self) -> MessageHandlerBuilder<M> {
        MessageHandlerBuilder {
            message_type: self.message_type.clone(),
            message_name: self.message_name.clone(),
            _message: PhantomData,
        }
    }

    /// Transition to `target` when this message arrives.
    pub fn go_to(self, target: &StateKey) -> MessageHandlerDecl<M> {
        let mut info = self.seed(MessageHandlerKind::GoTo);
        info.go_to_target = Some(target.clone());
        MessageHandlerDecl {
            info,
            shape: DeclShape::GoTo {
                target: target.clone(),
                payload: None,
            },
            actions: Vec::new(),
            _message: PhantomData,
        }
    }

    /// Transition to a data state.
    pub fn go_to_data<D>(self, target: &DataKey<D>) -> MessageHandlerDecl<M> {
        let key = target.key().clone();
        self.go_to(&key)
    }

    /// Transition through a channel, deriving its payload from the message.
    pub fn go_to_channel<P, F>(self, channel: &EntryChannel<P>, payload: F) -> MessageHandlerDecl<M>
    where
        P: Any + Send,
        F: Fn(&M, &mut MessageContext<'_>) -> P + Send + Sync + 'static,
    {
        let mut decl = self.go_to(channel.target());
        let derive: MessagePayloadFn = Arc::new(move |message, ctx| {
            let message = message
                .downcast_ref::<M>()
                .ok_or_else(|| HandlerFault::wrong_message_type(short_type_name::<M>()))?;
            Ok(Box::new(payload(message, ctx)) as Payload)
        });
        if let DeclShape::GoTo { payload, .. } = &mut decl.shape {
            *payload = Some(derive);
        }
        decl
    }

    /// Exit and re-enter the current state.
    pub fn go_to_self(self) -> MessageHandlerDecl<M> {
        MessageHandlerDecl {
            info: self.seed(MessageHandlerKind::GoToSelf),
            shape: DeclShape::GoToSelf,
            actions: Vec::new(),
            _message: PhantomData,
        }
    }

    /// Consume the message without transitioning.
    pub fn stay(self) -> MessageHandlerDecl<M> {
        MessageHandlerDecl {
            info: self.seed(MessageHandlerKind::Stay),
            shape: DeclShape::Stay,
            actions: Vec::new(),
            _message: PhantomData,
        }
    }

    /// Explicitly leave the message for the parent state.
    pub fn unhandled(self) -> UnhandledMessageHandler<M> {
        UnhandledMessageHandler {
            info: self.seed(MessageHandlerKind::Unhandled),
            _message: PhantomData,
        }
    }

    /// Guarded alternatives, evaluated in declaration order.
    pub fn when(
        self,
        configure: impl FnOnce(WhenMessageHandler<M>) -> WhenMessageHandler<M>,
    ) -> WhenMessageHandler<M> {
        let info = self.seed(MessageHandlerKind::When);
        configure(WhenMessageHandler {
            builder: self,
            info,
            arms: Vec::new(),
            otherwise: None,
            _message: PhantomData,
        })
    }

    /// Runs a fallible producer; its success value is staged into the
    /// context for the `on_ok` handler.
    pub fn when_result<T, F, B>(
        self,
        label: &str,
        producer: F,
        on_ok: impl FnOnce(MessageHandlerBuilder<M>) -> B,
    ) -> WhenResultMessageHandler<M>
    where
        T: Any + Send,
        F: Fn(&M, &mut MessageContext<'_>) -> Eventual<Result<T, HandlerFault>>
            + Send
            + Sync
            + 'static,
        B: IntoMessageHandler,
    {
        let mut info = self.seed(MessageHandlerKind::WhenResult);
        info.label = Some(label.to_string());

        let (ok_info, ok_body) = on_ok(self.nested()).into_descriptor().parts();
        info.on_success = Some(Box::new(ok_info));

        let producer: MessageProducerFn = Arc::new(move |message, ctx| {
            match message.downcast_ref::<M>() {
                Some(message) => producer(message, ctx)
                    .map(|result| result.map(|value| Box::new(value) as Payload)),
                None => Step::ready(Err(HandlerFault::wrong_message_type(short_type_name::<M>()))),
            }
        });

        WhenResultMessageHandler {
            builder: self,
            info,
            producer,
            on_ok: ok_body,
            on_err: None,
            _message: PhantomData,
        }
    }

    /// Installs an opaque handler that decides the disposition itself.
    pub fn handler<F>(self, f: F) -> OpaqueMessageHandler<M>
    where
        F: Fn(&M, &mut MessageContext<'_>) -> Eventual<Disposition> + Send + Sync + 'static,
    {
        let open: OpenMessageHandlerFn = Arc::new(move |message, ctx| {
            match message.downcast_ref::<M>() {
                Some(message) => f(message, ctx),
                None => Step::ready(Disposition::Fault(HandlerFault::wrong_message_type(
                    short_type_name::<M>(),
                ))),
            }
        });
        OpaqueMessageHandler {
            info: self.seed(MessageHandlerKind::Handler),
            open,
            _message: PhantomData,
        }
    }
}

enum DeclShape {
    GoTo {
        target: StateKey,
        payload: Option<MessagePayloadFn>,
    },
    GoToSelf,
    Stay,
}

/// A `go_to`, `go_to_self`, or `stay` declaration accumulating actions.
pub struct MessageHandlerDecl<M> {
    info: MessageHandlerInfo,
    shape: DeclShape,
    actions: Vec<MessageActionFn>,
    _message: PhantomData<fn(&M)>,
}

impl<M: Any + Send + Sync> MessageHandlerDecl<M> {
    /// Runs `f` while the message is handled, before the transition.
    pub fn action(
        mut self,
        label: &str,
        f: impl Fn(&M, &mut MessageContext<'_>) + Send + Sync + 'static,
    ) -> Self {
        self.info.actions.push(label.to_string());
        self.actions.push(typed_action::<M>(move |message, ctx| {
            f(message, ctx);
            Step::ready(Ok(()))
        }));
        self
    }

    /// Like [`action`](Self::action), but the action may defer or fault.
    pub fn action_eventual(
        mut self,
        label: &str,
        f: impl Fn(&M, &mut MessageContext<'_>) -> Eventual<ActionResult> + Send + Sync + 'static,
    ) -> Self {
        self.info.actions.push(label.to_string());
        self.actions.push(typed_action::<M>(f));
        self
    }

    pub fn label(mut self, label: &str) -> Self {
        self.info.label = Some(label.to_string());
        self
    }

    pub fn meta(mut self, key: &str, value: &str) -> Self {
        self.info.metadata.insert(key.to_string(), value.to_string());
        self
    }
}

impl<M: Any + Send + Sync> IntoMessageHandler for MessageHandlerDecl<M> {
    fn into_descriptor(self) -> MessageHandlerDescriptor {
        let body = match self.shape {
            DeclShape::GoTo { target, payload } => MessageHandlerBody::GoTo {
                target,
                payload,
                actions: self.actions,
            },
            DeclShape::GoToSelf => MessageHandlerBody::GoToSelf {
                actions: self.actions,
            },
            DeclShape::Stay => MessageHandlerBody::Stay {
                actions: self.actions,
            },
        };
        MessageHandlerDescriptor::new(self.info, body)
    }
}

/// An explicit `unhandled` declaration.
pub struct UnhandledMessageHandler<M> {
    info: MessageHandlerInfo,
    _message: PhantomData<fn(&M)>,
}

impl<M: Any + Send + Sync> UnhandledMessageHandler<M> {
    pub fn label(mut self, label: &str) -> Self {
        self.info.label = Some(label.to_string());
        self
    }
}

impl<M: Any + Send + Sync> IntoMessageHandler for UnhandledMessageHandler<M> {
    fn into_descriptor(self) -> MessageHandlerDescriptor {
        MessageHandlerDescriptor::new(self.info, MessageHandlerBody::Unhandled)
    }
}

/// A guarded `when` composition under construction.
pub struct WhenMessageHandler<M> {
    builder: MessageHandlerBuilder<M>,
    info: MessageHandlerInfo,
    arms: Vec<MessageGuardArm>,
    otherwise: Option<Arc<MessageHandlerBody>>,
    _message: PhantomData<fn(&M)>,
}

impl<M: Any + Send + Sync> WhenMessageHandler<M> {
    /// Adds a guarded alternative. The first satisfied predicate wins.
    pub fn cond<B>(
        self,
        label: &str,
        predicate: impl Fn(&M, &mut MessageContext<'_>) -> bool + Send + Sync + 'static,
        build: impl FnOnce(MessageHandlerBuilder<M>) -> B,
    ) -> Self
    where
        B: IntoMessageHandler,
    {
        self.cond_eventual(
            label,
            move |message, ctx| Step::ready(predicate(message, ctx)),
            build,
        )
    }

    /// Adds a guarded alternative whose predicate may defer.
    pub fn cond_eventual<B>(
        mut self,
        label: &str,
        predicate: impl Fn(&M, &mut MessageContext<'_>) -> Eventual<bool> + Send + Sync + 'static,
        build: impl FnOnce(MessageHandlerBuilder<M>) -> B,
    ) -> Self
    where
        B: IntoMessageHandler,
    {
        let (info, body) = build(self.builder.nested()).into_descriptor().parts();
        self.info.conditions.push(ConditionInfo {
            label: Some(label.to_string()),
            when_true: Box::new(info),
        });
        self.arms.push(MessageGuardArm {
            predicate: typed_guard::<M>(predicate),
            when_true: body,
        });
        self
    }

    /// Handler to run when no predicate is satisfied. Without one, a miss
    /// reports the message unhandled.
    pub fn otherwise<B>(mut self, build: impl FnOnce(MessageHandlerBuilder<M>) -> B) -> Self
    where
        B: IntoMessageHandler,
    {
        let (info, body) = build(self.builder.nested()).into_descriptor().parts();
        self.info.otherwise = Some(Box::new(info));
        self.otherwise = Some(body);
        self
    }

    pub fn label(mut self, label: &str) -> Self {
        self.info.label = Some(label.to_string());
        self
    }
}

impl<M: Any + Send + Sync> IntoMessageHandler for WhenMessageHandler<M> {
    fn into_descriptor(self) -> MessageHandlerDescriptor {
        MessageHandlerDescriptor::new(
            self.info,
            MessageHandlerBody::When {
                arms: self.arms,
                otherwise: self.otherwise,
            },
        )
    }
}

/// A `when_result` composition under construction.
pub struct WhenResultMessageHandler<M> {
    builder: MessageHandlerBuilder<M>,
    info: MessageHandlerInfo,
    producer: MessageProducerFn,
    on_ok: Arc<MessageHandlerBody>,
    on_err: Option<Arc<MessageHandlerBody>>,
    _message: PhantomData<fn(&M)>,
}

impl<M: Any + Send + Sync> WhenResultMessageHandler<M> {
    /// Error continuation; without one, producer errors surface as faults.
    /// The fault is staged into the context for the continuation.
    pub fn on_error<B>(mut self, build: impl FnOnce(MessageHandlerBuilder<M>) -> B) -> Self
    where
        B: IntoMessageHandler,
    {
        let (info, body) = build(self.builder.nested()).into_descriptor().parts();
        self.info.on_error = Some(Box::new(info));
        self.on_err = Some(body);
        self
    }
}

impl<M: Any + Send + Sync> IntoMessageHandler for WhenResultMessageHandler<M> {
    fn into_descriptor(self) -> MessageHandlerDescriptor {
        MessageHandlerDescriptor::new(
            self.info,
            MessageHandlerBody::WhenResult {
                producer: self.producer,
                on_ok: self.on_ok,
                on_err: self.on_err,
            },
        )
    }
}

/// An opaque handler declaration.
pub struct OpaqueMessageHandler<M> {
    info: MessageHandlerInfo,
    open: OpenMessageHandlerFn,
    _message: PhantomData<fn(&M)>,
}

impl<M: Any + Send + Sync> OpaqueMessageHandler<M> {
    pub fn label(mut self, label: &str) -> Self {
        self.info.label = Some(label.to_string());
        self
    }
}

impl<M: Any + Send + Sync> IntoMessageHandler for OpaqueMessageHandler<M> {
    fn into_descriptor(self) -> MessageHandlerDescriptor {
        MessageHandlerDescriptor::new(self.info, MessageHandlerBody::Open(self.open))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::testing::MemHost;

    #[derive(Debug)]
    struct Ping(u32);

    fn builder() -> MessageHandlerBuilder<Ping> {
        MessageHandlerBuilder::new(None)
    }

    #[test]
    fn go_to_records_target_and_actions_on_the_info() {
        let descriptor = builder()
            .go_to(&StateKey::new("next"))
            .action("notify", |_ping, _ctx| {})
            .label("advance")
            .into_descriptor();

        let info = descriptor.info();
        assert_eq!(info.kind, MessageHandlerKind::GoTo);
        assert_eq!(info.message_type, "Ping");
        assert_eq!(info.go_to_target, Some(StateKey::new("next")));
        assert_eq!(info.actions, vec!["notify".to_string()]);
        assert_eq!(info.label.as_deref(), Some("advance"));
    }

    #[test]
    fn handler_executes_through_the_factory() {
        let descriptor = builder()
            .go_to(&StateKey::new("next"))
            .into_descriptor();
        let handler = descriptor.make_handler();

        let mut host = MemHost::default();
        let mut ctx = MessageContext::new(StateKey::new("here"), &mut host);
        let disposition = handler.handle(&Ping(1), &mut ctx).now().unwrap();
        assert!(matches!(
            disposition,
            Disposition::GoTo { target, .. } if target.name() == "next"
        ));
    }

    #[test]
    fn channel_payload_is_derived_from_the_message() {
        let chan: EntryChannel<u32> = EntryChannel::new(&StateKey::new("review"));
        let descriptor = builder()
            .go_to_channel(&chan, |ping, _ctx| ping.0 * 2)
            .into_descriptor();
        let handler = descriptor.make_handler();

        let mut host = MemHost::default();
        let mut ctx = MessageContext::new(StateKey::new("here"), &mut host);
        match handler.handle(&Ping(21), &mut ctx).now().unwrap() {
            Disposition::GoTo { target, payload } => {
                assert_eq!(target.name(), "review");
                assert_eq!(payload.unwrap().downcast_ref::<u32>(), Some(&42));
            }
            other => panic!("unexpected disposition: {other:?}"),
        }
    }

    #[test]
    fn when_builds_condition_infos_in_order() {
        let descriptor = builder()
            .when(|w| {
                w.cond("small", |ping, _| ping.0 < 10, |m| m.go_to(&StateKey::new("low")))
                    .cond("large", |ping, _| ping.0 >= 10, |m| m.go_to(&StateKey::new("high")))
                    .otherwise(|m| m.unhandled())
            })
            .into_descriptor();

        let info = descriptor.info();
        assert_eq!(info.kind, MessageHandlerKind::When);
        let labels: Vec<_> = info
            .conditions
            .iter()
            .map(|c| c.label.clone().unwrap())
            .collect();
        assert_eq!(labels, vec!["small", "large"]);
        assert_eq!(
            descriptor.transition_targets(),
            vec![StateKey::new("low"), StateKey::new("high")]
        );

        let handler = descriptor.make_handler();
        let mut host = MemHost::default();
        let mut ctx = MessageContext::new(StateKey::new("here"), &mut host);
        let disposition = handler.handle(&Ping(3), &mut ctx).now().unwrap();
        assert!(matches!(
            disposition,
            Disposition::GoTo { target, .. } if target.name() == "low"
        ));
    }

    #[test]
    fn when_result_routes_success_and_stages_the_value() {
        let descriptor = builder()
            .when_result(
                "parse",
                |ping: &Ping, _ctx| Step::ready(Ok(ping.0 + 1)),
                |ok| {
                    ok.stay().action("check", |_ping, ctx| {
                        assert_eq!(ctx.staged_ref::<u32>(), Some(&8));
                    })
                },
            )
            .into_descriptor();

        assert_eq!(descriptor.info().kind, MessageHandlerKind::WhenResult);
        assert!(descriptor.info().on_success.is_some());

        let handler = descriptor.make_handler();
        let mut host = MemHost::default();
        let mut ctx = MessageContext::new(StateKey::new("here"), &mut host);
        let disposition = handler.handle(&Ping(7), &mut ctx).now().unwrap();
        assert!(matches!(disposition, Disposition::Stay));
    }

    #[test]
    fn opaque_handler_controls_the_disposition() {
        let descriptor = builder()
            .handler(|ping, _ctx| {
                if ping.0 == 0 {
                    Step::ready(Disposition::Stay)
                } else {
                    Step::ready(Disposition::Unhandled)
                }
            })
            .into_descriptor();
        assert_eq!(descriptor.info().kind, MessageHandlerKind::Handler);

        let handler = descriptor.make_handler();
        let mut host = MemHost::default();
        let mut ctx = MessageContext::new(StateKey::new("here"), &mut host);
        assert!(matches!(
            handler.handle(&Ping(0), &mut ctx).now().unwrap(),
            Disposition::Stay
        ));
        assert!(handler.handle(&Ping(1), &mut ctx).now().unwrap().is_unhandled());
    }
}
