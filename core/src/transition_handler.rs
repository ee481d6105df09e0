//! Fluent builders for entry and exit handlers.
//!
//! Actions accumulate into a single descriptor; `post`, `schedule`, and
//! `update_data` are recorded on the info for rendering and compiled into
//! the action sequence for execution.

use crate::descriptor::{
    short_type_name, TransitionActionFn, TransitionConditionInfo, TransitionGuardArm,
    TransitionGuardFn, TransitionHandlerBody, TransitionHandlerDescriptor, TransitionHandlerInfo,
    TransitionHandlerKind, TransitionProducerFn,
};
use crate::error::HandlerFault;
use crate::eventual::{ActionResult, Eventual, Payload, Step};
use crate::host::{DataAccess, TransitionContext};
use crate::key::DataKey;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

/// Finishing half of the transition-handler builders.
pub trait IntoTransitionHandler {
    fn into_descriptor(self) -> TransitionHandlerDescriptor;
}

impl IntoTransitionHandler for TransitionHandlerDescriptor {
    fn into_descriptor(self) -> TransitionHandlerDescriptor {
        self
    }
}

/// Entry point of the fluent chain for entry/exit handlers.
pub struct TransitionHandlerBuilder {
    info: TransitionHandlerInfo,
    actions: Vec<TransitionActionFn>,
    first_kind: Option<TransitionHandlerKind>,
}

impl TransitionHandlerBuilder {
    pub(crate) fn new() -> Self {
        TransitionHandlerBuilder {
            info: TransitionHandlerInfo::new(TransitionHandlerKind::Run),
            actions: Vec::new(),
            first_kind: None,
        }
    }

    fn push(&mut self, kind: TransitionHandlerKind, label: String, action: TransitionActionFn) {
        if self.first_kind.is_none() {
            self.first_kind = Some(kind);
        }
        self.info.actions.push(label);
        self.actions.push(action);
    }

    /// Runs `f` during the transition.
    pub fn run(
        mut self,
        label: &str,
        f: impl Fn(&mut TransitionContext<'_>) + Send + Sync + 'static,
    ) -> Self {
        self.push(
            TransitionHandlerKind::Run,
            label.to_string(),
            Arc::new(move |ctx| {
                f(ctx);
                Step::ready(Ok(()))
            }),
        );
        self
    }

    /// Like [`run`](Self::run), but the action may defer or fault.
    pub fn run_eventual(
        mut self,
        label: &str,
        f: impl Fn(&mut TransitionContext<'_>) -> Eventual<ActionResult> + Send + Sync + 'static,
    ) -> Self {
        self.push(TransitionHandlerKind::Run, label.to_string(), Arc::new(f));
        self
    }

    /// Posts a message produced by `f` once the transition completes.
    pub fn post<Msg: Any + Send>(
        mut self,
        f: impl Fn(&mut TransitionContext<'_>) -> Msg + Send + Sync + 'static,
    ) -> Self {
        let message_type = short_type_name::<Msg>();
        self.info.post_message_type = Some(message_type.to_string());
        self.push(
            TransitionHandlerKind::Post,
            format!("post({message_type})"),
            Arc::new(move |ctx| {
                let message = f(ctx);
                ctx.post(message);
                Step::ready(Ok(()))
            }),
        );
        self
    }

    /// Schedules a message after `delay`. The runtime cancels it when the
    /// scheduling state is exited.
    pub fn schedule<Msg: Any + Send>(
        mut self,
        delay: Duration,
        f: impl Fn(&mut TransitionContext<'_>) -> Msg + Send + Sync + 'static,
    ) -> Self {
        let message_type = short_type_name::<Msg>();
        self.info.post_message_type = Some(message_type.to_string());
        self.push(
            TransitionHandlerKind::Schedule,
            format!("schedule({message_type})"),
            Arc::new(move |ctx| {
                let message = f(ctx);
                ctx.schedule(delay, message);
                Step::ready(Ok(()))
            }),
        );
        self
    }

    /// Rewrites the data value of the state identified by `key`.
    pub fn update_data<D: Any>(
        mut self,
        key: &DataKey<D>,
        label: &str,
        f: impl Fn(&mut D) + Send + Sync + 'static,
    ) -> Self {
        self.info.update_data_type = Some(short_type_name::<D>().to_string());
        let key = key.clone();
        self.push(
            TransitionHandlerKind::UpdateData,
            label.to_string(),
            Arc::new(move |ctx| Step::ready(ctx.update_data(&key, |value| f(value)))),
        );
        self
    }

    /// Guarded alternatives, evaluated in declaration order. A miss is a
    /// no-op for transitions.
    pub fn when(
        self,
        configure: impl FnOnce(TransitionWhenHandler) -> TransitionWhenHandler,
    ) -> TransitionWhenHandler {
        configure(TransitionWhenHandler {
            info: TransitionHandlerInfo::new(TransitionHandlerKind::When),
            arms: Vec::new(),
            otherwise: None,
        })
    }

    /// Runs a fallible producer; its success value is staged into the
    /// context for the `on_ok` handler.
    pub fn when_result<T, F, B>(
        self,
        label: &str,
        producer: F,
        on_ok: impl FnOnce(TransitionHandlerBuilder) -> B,
    ) -> TransitionWhenResultHandler
    where
        T: Any + Send,
        F: Fn(&mut TransitionContext<'_>) -> Eventual<Result<T, HandlerFault>>
            + Send
            + Sync
            + 'static,
        B: IntoTransitionHandler,
    {
        let mut info = TransitionHandlerInfo::new(TransitionHandlerKind::WhenResult);
        info.label = Some(label.to_string());

        let (ok_info, ok_body) = on_ok(TransitionHandlerBuilder::new())
            .into_descriptor()
            .parts();
        info.on_success = Some(Box::new(ok_info));

        let producer: TransitionProducerFn = Arc::new(move |ctx| {
            producer(ctx).map(|result| result.map(|value| Box::new(value) as Payload))
        });

        TransitionWhenResultHandler {
            info,
            producer,
            on_ok: ok_body,
            on_err: None,
        }
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

impl IntoTransitionHandler for TransitionHandlerBuilder {
    fn into_descriptor(mut self) -> TransitionHandlerDescriptor {
        // A single action keeps its own kind; mixed sequences read as `run`.
        if self.actions.len() == 1 {
            if let Some(kind) = self.first_kind {
                self.info.kind = kind;
            }
        }
        TransitionHandlerDescriptor::new(self.info, TransitionHandlerBody::Sequence(self.actions))
    }
}

/// A guarded transition `when` composition under construction.
pub struct TransitionWhenHandler {
    info: TransitionHandlerInfo,
    arms: Vec<TransitionGuardArm>,
    otherwise: Option<Arc<TransitionHandlerBody>>,
}

impl TransitionWhenHandler {
    pub fn cond<B>(
        self,
        label: &str,
        predicate: impl Fn(&mut TransitionContext<'_>) -> bool + Send + Sync + 'static,
        build: impl FnOnce(TransitionHandlerBuilder) -> B,
    ) -> Self
    where
        B: IntoTransitionHandler,
    {
        self.cond_eventual(label, move |ctx| Step::ready(predicate(ctx)), build)
    }

    pub fn cond_eventual<B>(
        mut self,
        label: &str,
        predicate: impl Fn(&mut TransitionContext<'_>) -> Eventual<bool> + Send + Sync + 'static,
        build: impl FnOnce(TransitionHandlerBuilder) -> B,
    ) -> Self
    where
        B: IntoTransitionHandler,
    {
        let (info, body) = build(TransitionHandlerBuilder::new())
            .into_descriptor()
            .parts();
        self.info.conditions.push(TransitionConditionInfo {
            label: Some(label.to_string()),
            when_true: Box::new(info),
        });
        let predicate: TransitionGuardFn = Arc::new(predicate);
        self.arms.push(TransitionGuardArm {
            predicate,
            when_true: body,
        });
        self
    }

    pub fn otherwise<B>(mut self, build: impl FnOnce(TransitionHandlerBuilder) -> B) -> Self
    where
        B: IntoTransitionHandler,
    {
        let (info, body) = build(TransitionHandlerBuilder::new())
            .into_descriptor()
            .parts();
        self.info.otherwise = Some(Box::new(info));
        self.otherwise = Some(body);
        self
    }

    pub fn label(mut self, label: &str) -> Self {
        self.info.label = Some(label.to_string());
        self
    }
}

impl IntoTransitionHandler for TransitionWhenHandler {
    fn into_descriptor(self) -> TransitionHandlerDescriptor {
        TransitionHandlerDescriptor::new(
            self.info,
            TransitionHandlerBody::When {
                arms: self.arms,
                otherwise: self.otherwise,
            },
        )
    }
}

/// A transition `when_result` composition under construction.
pub struct TransitionWhenResultHandler {
    info: TransitionHandlerInfo,
    producer: TransitionProducerFn,
    on_ok: Arc<TransitionHandlerBody>,
    on_err: Option<Arc<TransitionHandlerBody>>,
}

impl TransitionWhenResultHandler {
    /// Error continuation; without one, producer errors surface as faults.
    pub fn on_error<B>(mut self, build: impl FnOnce(TransitionHandlerBuilder) -> B) -> Self
    where
        B: IntoTransitionHandler,
    {
        let (info, body) = build(TransitionHandlerBuilder::new())
            .into_descriptor()
            .parts();
        self.info.on_error = Some(Box::new(info));
        self.on_err = Some(body);
        self
    }
}

impl IntoTransitionHandler for TransitionWhenResultHandler {
    fn into_descriptor(self) -> TransitionHandlerDescriptor {
        TransitionHandlerDescriptor::new(
            self.info,
            TransitionHandlerBody::WhenResult {
                producer: self.producer,
                on_ok: self.on_ok,
                on_err: self.on_err,
            },
        )
    }
}

/// Wraps an open-coded handler function into a descriptor.
pub(crate) fn open_coded(
    f: impl Fn(&mut TransitionContext<'_>) -> Eventual<ActionResult> + Send + Sync + 'static,
    label: Option<&str>,
) -> TransitionHandlerDescriptor {
    let mut info = TransitionHandlerInfo::new(TransitionHandlerKind::Run);
    info.label = label.map(str::to_string);
    if let Some(label) = label {
        info.actions.push(label.to_string());
    }
    TransitionHandlerDescriptor::new(info, TransitionHandlerBody::Sequence(vec![Arc::new(f)]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::testing::MemHost;
    use crate::key::StateKey;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn ctx_over(host: &mut MemHost) -> TransitionContext<'_> {
        TransitionContext::new(StateKey::new("s"), host)
    }

    #[test]
    fn actions_run_in_declaration_order() {
        let order = Arc::new(AtomicU32::new(0));
        let first = Arc::clone(&order);
        let second = Arc::clone(&order);

        let descriptor = TransitionHandlerBuilder::new()
            .run("first", move |_| {
                first.compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst).unwrap();
            })
            .run("second", move |_| {
                second.compare_exchange(1, 2, Ordering::SeqCst, Ordering::SeqCst).unwrap();
            })
            .into_descriptor();

        assert_eq!(descriptor.info().kind, TransitionHandlerKind::Run);
        assert_eq!(descriptor.info().actions, vec!["first", "second"]);

        let handler = descriptor.make_handler();
        let mut host = MemHost::default();
        let mut ctx = ctx_over(&mut host);
        handler.run(&mut ctx).now().unwrap().unwrap();
        assert_eq!(order.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn a_single_post_keeps_its_kind() {
        #[derive(Debug)]
        struct Tick;

        let descriptor = TransitionHandlerBuilder::new()
            .post(|_ctx| Tick)
            .into_descriptor();
        assert_eq!(descriptor.info().kind, TransitionHandlerKind::Post);
        assert_eq!(descriptor.info().post_message_type.as_deref(), Some("Tick"));

        let handler = descriptor.make_handler();
        let mut host = MemHost::default();
        let mut ctx = ctx_over(&mut host);
        handler.run(&mut ctx).now().unwrap().unwrap();
        assert_eq!(host.posted.len(), 1);
    }

    #[test]
    fn schedule_reaches_the_host_with_its_delay() {
        #[derive(Debug)]
        struct Expire;

        let descriptor = TransitionHandlerBuilder::new()
            .schedule(Duration::from_secs(30), |_ctx| Expire)
            .into_descriptor();
        assert_eq!(descriptor.info().kind, TransitionHandlerKind::Schedule);

        let handler = descriptor.make_handler();
        let mut host = MemHost::default();
        let mut ctx = ctx_over(&mut host);
        handler.run(&mut ctx).now().unwrap().unwrap();
        assert_eq!(host.scheduled[0].0, Duration::from_secs(30));
    }

    #[test]
    fn update_data_rewrites_the_live_value() {
        let key: DataKey<u32> = DataKey::new("counter");
        let descriptor = TransitionHandlerBuilder::new()
            .update_data(&key, "bump", |n| *n += 1)
            .into_descriptor();
        assert_eq!(descriptor.info().kind, TransitionHandlerKind::UpdateData);
        assert_eq!(descriptor.info().update_data_type.as_deref(), Some("u32"));

        let handler = descriptor.make_handler();
        let mut host = MemHost::default().with_data(key.key(), 7u32);
        let mut ctx = TransitionContext::new(key.key().clone(), &mut host);
        handler.run(&mut ctx).now().unwrap().unwrap();
        assert_eq!(
            host.data[key.key()].downcast_ref::<u32>(),
            Some(&8)
        );
    }

    #[test]
    fn when_misses_are_noops() {
        let descriptor = TransitionHandlerBuilder::new()
            .when(|w| {
                w.cond("never", |_| false, |t| {
                    t.run("unreached", |_| panic!("guard must not fire"))
                })
            })
            .into_descriptor();

        let handler = descriptor.make_handler();
        let mut host = MemHost::default();
        let mut ctx = ctx_over(&mut host);
        assert!(handler.run(&mut ctx).now().unwrap().is_ok());
    }

    #[test]
    fn when_result_error_faults_without_continuation() {
        let descriptor = TransitionHandlerBuilder::new()
            .when_result(
                "load",
                |_ctx| Eventual::ready(Err::<u32, _>(HandlerFault::new("nope"))),
                |ok| ok.run("unreached", |_| panic!("success branch must not fire")),
            )
            .into_descriptor();

        let handler = descriptor.make_handler();
        let mut host = MemHost::default();
        let mut ctx = ctx_over(&mut host);
        let result = handler.run(&mut ctx).now().unwrap();
        assert_eq!(result.unwrap_err().message(), "nope");
    }
}
