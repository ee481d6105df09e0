//! Declarative handler descriptions.
//!
//! A descriptor pairs an inspectable [`MessageHandlerInfo`] /
//! [`TransitionHandlerInfo`] record with the handler behavior itself. The
//! info tree alone is enough to render a diagram and to check `go_to`
//! targets; the behavior is a tagged variant per handler kind, interpreted
//! on dispatch. Interpretation stays synchronous until a guard, action, or
//! producer actually defers.

use crate::error::HandlerFault;
use crate::eventual::{ActionResult, Disposition, Eventual, Payload, Step};
use crate::host::{MessageContext, TransitionContext};
use crate::key::StateKey;
use serde::Serialize;
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Guard predicate over an incoming message.
pub type MessageGuardFn =
    Arc<dyn Fn(&(dyn Any + Send + Sync), &mut MessageContext<'_>) -> Eventual<bool> + Send + Sync>;

/// Side-effecting action run while handling a message.
pub type MessageActionFn = Arc<
    dyn Fn(&(dyn Any + Send + Sync), &mut MessageContext<'_>) -> Eventual<ActionResult>
        + Send
        + Sync,
>;

/// Derives the channel payload accompanying a `go_to`.
pub type MessagePayloadFn = Arc<
    dyn Fn(&(dyn Any + Send + Sync), &mut MessageContext<'_>) -> Result<Payload, HandlerFault>
        + Send
        + Sync,
>;

/// Open-coded message handler installed via `handle_on_message`.
pub type OpenMessageHandlerFn = Arc<
    dyn Fn(&(dyn Any + Send + Sync), &mut MessageContext<'_>) -> Eventual<Disposition>
        + Send
        + Sync,
>;

/// Fallible producer feeding a `when_result` composition.
pub type MessageProducerFn = Arc<
    dyn Fn(
            &(dyn Any + Send + Sync),
            &mut MessageContext<'_>,
        ) -> Eventual<Result<Payload, HandlerFault>>
        + Send
        + Sync,
>;

/// Side-effecting action run on entry or exit.
pub type TransitionActionFn =
    Arc<dyn Fn(&mut TransitionContext<'_>) -> Eventual<ActionResult> + Send + Sync>;

/// Guard predicate over a transition context.
pub type TransitionGuardFn =
    Arc<dyn Fn(&mut TransitionContext<'_>) -> Eventual<bool> + Send + Sync>;

/// Fallible producer feeding a transition-side `when_result`.
pub type TransitionProducerFn = Arc<
    dyn Fn(&mut TransitionContext<'_>) -> Eventual<Result<Payload, HandlerFault>> + Send + Sync,
>;

/// Extracts the final identifier of a type path for display.
pub(crate) fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    full.rsplit("::").next().unwrap_or(full)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageHandlerKind {
    GoTo,
    GoToSelf,
    Stay,
    Unhandled,
    When,
    WhenResult,
    Handler,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionHandlerKind {
    Run,
    Post,
    Schedule,
    UpdateData,
    When,
    WhenResult,
}

/// Inspectable description of one message handler.
#[derive(Debug, Clone, Serialize)]
pub struct MessageHandlerInfo {
    pub kind: MessageHandlerKind,
    /// Name of the message type this handler is keyed by.
    pub message_type: String,
    /// Display name of the message value, for value-keyed handlers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub actions: Vec<String>,
    pub conditions: Vec<ConditionInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub otherwise: Option<Box<MessageHandlerInfo>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_success: Option<Box<MessageHandlerInfo>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_error: Option<Box<MessageHandlerInfo>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub go_to_target: Option<StateKey>,
    pub metadata: BTreeMap<String, String>,
}

/// One guarded alternative of a `when` composition.
#[derive(Debug, Clone, Serialize)]
pub struct ConditionInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub when_true: Box<MessageHandlerInfo>,
}

impl MessageHandlerInfo {
    pub(crate) fn new(kind: MessageHandlerKind, message_type: impl Into<String>) -> Self {
        MessageHandlerInfo {
            kind,
            message_type: message_type.into(),
            message_name: None,
            label: None,
            actions: Vec::new(),
            conditions: Vec::new(),
            otherwise: None,
            on_success: None,
            on_error: None,
            go_to_target: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Every `go_to` target reachable from this handler, including targets
    /// nested under guards and result branches.
    pub fn transition_targets(&self) -> Vec<StateKey> {
        let mut targets = Vec::new();
        self.collect_targets(&mut targets);
        targets
    }

    fn collect_targets(&self, out: &mut Vec<StateKey>) {
        if let Some(target) = &self.go_to_target {
            out.push(target.clone());
        }
        for condition in &self.conditions {
            condition.when_true.collect_targets(out);
        }
        for nested in [&self.otherwise, &self.on_success, &self.on_error]
            .into_iter()
            .flatten()
        {
            nested.collect_targets(out);
        }
    }
}

/// Inspectable description of one entry or exit handler.
#[derive(Debug, Clone, Serialize)]
pub struct TransitionHandlerInfo {
    pub kind: TransitionHandlerKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub actions: Vec<String>,
    pub conditions: Vec<TransitionConditionInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub otherwise: Option<Box<TransitionHandlerInfo>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_success: Option<Box<TransitionHandlerInfo>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_error: Option<Box<TransitionHandlerInfo>>,
    /// Type of the message a `post` or `schedule` action emits.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_message_type: Option<String>,
    /// Type of the state data an `update_data` action rewrites.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_data_type: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransitionConditionInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub when_true: Box<TransitionHandlerInfo>,
}

impl TransitionHandlerInfo {
    pub(crate) fn new(kind: TransitionHandlerKind) -> Self {
        TransitionHandlerInfo {
            kind,
            label: None,
            actions: Vec::new(),
            conditions: Vec::new(),
            otherwise: None,
            on_success: None,
            on_error: None,
            post_message_type: None,
            update_data_type: None,
            metadata: BTreeMap::new(),
        }
    }
}

pub(crate) struct MessageGuardArm {
    pub(crate) predicate: MessageGuardFn,
    pub(crate) when_true: Arc<MessageHandlerBody>,
}

/// Tagged behavior of a message handler, one variant per kind.
pub(crate) enum MessageHandlerBody {
    GoTo {
        target: StateKey,
        payload: Option<MessagePayloadFn>,
        actions: Vec<MessageActionFn>,
    },
    GoToSelf {
        actions: Vec<MessageActionFn>,
    },
    Stay {
        actions: Vec<MessageActionFn>,
    },
    Unhandled,
    When {
        arms: Vec<MessageGuardArm>,
        otherwise: Option<Arc<MessageHandlerBody>>,
    },
    WhenResult {
        producer: MessageProducerFn,
        on_ok: Arc<MessageHandlerBody>,
        on_err: Option<Arc<MessageHandlerBody>>,
    },
    Open(OpenMessageHandlerFn),
}

pub(crate) struct TransitionGuardArm {
    pub(crate) predicate: TransitionGuardFn,
    pub(crate) when_true: Arc<TransitionHandlerBody>,
}

/// Tagged behavior of an entry/exit handler. `post`, `schedule`, and
/// `update_data` are compiled into the action sequence by the builders.
pub(crate) enum TransitionHandlerBody {
    Sequence(Vec<TransitionActionFn>),
    When {
        arms: Vec<TransitionGuardArm>,
        otherwise: Option<Arc<TransitionHandlerBody>>,
    },
    WhenResult {
        producer: TransitionProducerFn,
        on_ok: Arc<TransitionHandlerBody>,
        on_err: Option<Arc<TransitionHandlerBody>>,
    },
}

/// A message handler as declared: info plus the factory for its
/// executable form.
pub struct MessageHandlerDescriptor {
    info: MessageHandlerInfo,
    body: Arc<MessageHandlerBody>,
}

impl MessageHandlerDescriptor {
    pub(crate) fn new(info: MessageHandlerInfo, body: MessageHandlerBody) -> Self {
        MessageHandlerDescriptor {
            info,
            body: Arc::new(body),
        }
    }

    pub fn info(&self) -> &MessageHandlerInfo {
        &self.info
    }

    pub(crate) fn parts(&self) -> (MessageHandlerInfo, Arc<MessageHandlerBody>) {
        (self.info.clone(), Arc::clone(&self.body))
    }

    /// Produces the executable handler for this description.
    pub fn make_handler(&self) -> MessageHandler {
        MessageHandler {
            body: Arc::clone(&self.body),
        }
    }

    /// Every `go_to` target this handler can name.
    pub fn transition_targets(&self) -> Vec<StateKey> {
        self.info.transition_targets()
    }
}

impl Clone for MessageHandlerDescriptor {
    fn clone(&self) -> Self {
        MessageHandlerDescriptor {
            info: self.info.clone(),
            body: Arc::clone(&self.body),
        }
    }
}

impl fmt::Debug for MessageHandlerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageHandlerDescriptor")
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

/// Executable form of a [`MessageHandlerDescriptor`].
#[derive(Clone)]
pub struct MessageHandler {
    body: Arc<MessageHandlerBody>,
}

impl MessageHandler {
    pub fn handle<'a>(
        &'a self,
        message: &'a (dyn Any + Send + Sync),
        ctx: &'a mut MessageContext<'_>,
    ) -> Step<'a, Disposition> {
        run_message_body(&self.body, message, ctx)
    }
}

/// An entry/exit handler as declared: info plus the factory for its
/// executable form.
pub struct TransitionHandlerDescriptor {
    info: TransitionHandlerInfo,
    body: Arc<TransitionHandlerBody>,
}

impl TransitionHandlerDescriptor {
    pub(crate) fn new(info: TransitionHandlerInfo, body: TransitionHandlerBody) -> Self {
        TransitionHandlerDescriptor {
            info,
            body: Arc::new(body),
        }
    }

    pub fn info(&self) -> &TransitionHandlerInfo {
        &self.info
    }

    pub(crate) fn parts(&self) -> (TransitionHandlerInfo, Arc<TransitionHandlerBody>) {
        (self.info.clone(), Arc::clone(&self.body))
    }

    pub fn make_handler(&self) -> TransitionHandler {
        TransitionHandler {
            body: Arc::clone(&self.body),
        }
    }
}

impl Clone for TransitionHandlerDescriptor {
    fn clone(&self) -> Self {
        TransitionHandlerDescriptor {
            info: self.info.clone(),
            body: Arc::clone(&self.body),
        }
    }
}

impl fmt::Debug for TransitionHandlerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransitionHandlerDescriptor")
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

/// Executable form of a [`TransitionHandlerDescriptor`].
#[derive(Clone)]
pub struct TransitionHandler {
    body: Arc<TransitionHandlerBody>,
}

impl TransitionHandler {
    pub fn run<'a>(&'a self, ctx: &'a mut TransitionContext<'_>) -> Step<'a, ActionResult> {
        run_transition_body(&self.body, ctx)
    }
}

// ---------------------------------------------------------------------------
// Interpretation
// ---------------------------------------------------------------------------

pub(crate) fn run_message_body<'a>(
    body: &'a MessageHandlerBody,
    message: &'a (dyn Any + Send + Sync),
    ctx: &'a mut MessageContext<'_>,
) -> Step<'a, Disposition> {
    match body {
        MessageHandlerBody::GoTo {
            target,
            payload,
            actions,
        } => {
            let target = target.clone();
            let payload = payload.clone();
            run_message_actions_then(actions, message, ctx, move |message, ctx| {
                let payload = match &payload {
                    Some(derive) => match derive(message, ctx) {
                        Ok(value) => Some(value),
                        Err(fault) => return Disposition::Fault(fault),
                    },
                    None => None,
                };
                Disposition::GoTo { target, payload }
            })
        }
        MessageHandlerBody::GoToSelf { actions } => {
            run_message_actions_then(actions, message, ctx, |_, _| Disposition::GoToSelf)
        }
        MessageHandlerBody::Stay { actions } => {
            run_message_actions_then(actions, message, ctx, |_, _| Disposition::Stay)
        }
        MessageHandlerBody::Unhandled => Step::Ready(Disposition::Unhandled),
        MessageHandlerBody::When { arms, otherwise } => {
            run_message_when(arms, otherwise.as_deref(), message, ctx)
        }
        MessageHandlerBody::WhenResult {
            producer,
            on_ok,
            on_err,
        } => match producer(message, &mut *ctx) {
            Step::Ready(result) => {
                finish_message_result(result, on_ok, on_err.as_deref(), message, ctx)
            }
            Step::Deferred(fut) => Step::Deferred(Box::pin(async move {
                let result = fut.await;
                finish_message_result(result, on_ok, on_err.as_deref(), message, &mut *ctx)
                    .resolve()
                    .await
            })),
        },
        MessageHandlerBody::Open(handler) => match handler(message, &mut *ctx) {
            Step::Ready(disposition) => Step::Ready(disposition),
            Step::Deferred(fut) => Step::Deferred(fut),
        },
    }
}

fn run_message_actions_then<'a, F>(
    actions: &'a [MessageActionFn],
    message: &'a (dyn Any + Send + Sync),
    ctx: &'a mut MessageContext<'_>,
    finish: F,
) -> Step<'a, Disposition>
where
    F: FnOnce(&(dyn Any + Send + Sync), &mut MessageContext<'_>) -> Disposition + Send + 'a,
{
    let mut idx = 0;
    while idx < actions.len() {
        match actions[idx](message, &mut *ctx) {
            Step::Ready(Ok(())) => idx += 1,
            Step::Ready(Err(fault)) => return Step::Ready(Disposition::Fault(fault)),
            Step::Deferred(fut) => {
                let rest = idx + 1;
                return Step::Deferred(Box::pin(async move {
                    if let Err(fault) = fut.await {
                        return Disposition::Fault(fault);
                    }
                    for action in &actions[rest..] {
                        if let Err(fault) = action(message, &mut *ctx).resolve().await {
                            return Disposition::Fault(fault);
                        }
                    }
                    finish(message, &mut *ctx)
                }));
            }
        }
    }
    Step::Ready(finish(message, ctx))
}

fn run_message_when<'a>(
    arms: &'a [MessageGuardArm],
    otherwise: Option<&'a MessageHandlerBody>,
    message: &'a (dyn Any + Send + Sync),
    ctx: &'a mut MessageContext<'_>,
) -> Step<'a, Disposition> {
    let mut idx = 0;
    while idx < arms.len() {
        match (arms[idx].predicate)(message, &mut *ctx) {
            Step::Ready(true) => return run_message_body(&arms[idx].when_true, message, ctx),
            Step::Ready(false) => idx += 1,
            Step::Deferred(fut) => {
                return Step::Deferred(Box::pin(async move {
                    let mut hit = fut.await;
                    let mut i = idx;
                    loop {
                        if hit {
                            return run_message_body(&arms[i].when_true, message, &mut *ctx)
                                .resolve()
                                .await;
                        }
                        i += 1;
                        if i >= arms.len() {
                            break;
                        }
                        hit = (arms[i].predicate)(message, &mut *ctx).resolve().await;
                    }
                    match otherwise {
                        Some(body) => run_message_body(body, message, &mut *ctx).resolve().await,
                        None => Disposition::Unhandled,
                    }
                }));
            }
        }
    }
    match otherwise {
        Some(body) => run_message_body(body, message, ctx),
        None => Step::Ready(Disposition::Unhandled),
    }
}

fn finish_message_result<'a>(
    result: Result<Payload, HandlerFault>,
    on_ok: &'a MessageHandlerBody,
    on_err: Option<&'a MessageHandlerBody>,
    message: &'a (dyn Any + Send + Sync),
    ctx: &'a mut MessageContext<'_>,
) -> Step<'a, Disposition> {
    match result {
        Ok(value) => {
            ctx.stage(value);
            run_message_body(on_ok, message, ctx)
        }
        Err(fault) => match on_err {
            Some(body) => {
                ctx.stage(Box::new(fault));
                run_message_body(body, message, ctx)
            }
            None => Step::Ready(Disposition::Fault(fault)),
        },
    }
}

pub(crate) fn run_transition_body<'a>(
    body: &'a TransitionHandlerBody,
    ctx: &'a mut TransitionContext<'_>,
) -> Step<'a, ActionResult> {
    match body {
        TransitionHandlerBody::Sequence(actions) => run_transition_actions(actions, 0, ctx),
        TransitionHandlerBody::When { arms, otherwise } => {
            run_transition_when(arms, otherwise.as_deref(), ctx)
        }
        TransitionHandlerBody::WhenResult {
            producer,
            on_ok,
            on_err,
        } => match producer(&mut *ctx) {
            Step::Ready(result) => finish_transition_result(result, on_ok, on_err.as_deref(), ctx),
            Step::Deferred(fut) => Step::Deferred(Box::pin(async move {
                let result = fut.await;
                finish_transition_result(result, on_ok, on_err.as_deref(), &mut *ctx)
                    .resolve()
                    .await
            })),
        },
    }
}

fn run_transition_actions<'a>(
    actions: &'a [TransitionActionFn],
    start: usize,
    ctx: &'a mut TransitionContext<'_>,
) -> Step<'a, ActionResult> {
    let mut idx = start;
    while idx < actions.len() {
        match actions[idx](&mut *ctx) {
            Step::Ready(Ok(())) => idx += 1,
            Step::Ready(Err(fault)) => return Step::Ready(Err(fault)),
            Step::Deferred(fut) => {
                let rest = idx + 1;
                return Step::Deferred(Box::pin(async move {
                    fut.await?;
                    for action in &actions[rest..] {
                        action(&mut *ctx).resolve().await?;
                    }
                    Ok(())
                }));
            }
        }
    }
    Step::Ready(Ok(()))
}

fn run_transition_when<'a>(
    arms: &'a [TransitionGuardArm],
    otherwise: Option<&'a TransitionHandlerBody>,
    ctx: &'a mut TransitionContext<'_>,
) -> Step<'a, ActionResult> {
    let mut idx = 0;
    while idx < arms.len() {
        match (arms[idx].predicate)(&mut *ctx) {
            Step::Ready(true) => return run_transition_body(&arms[idx].when_true, ctx),
            Step::Ready(false) => idx += 1,
            Step::Deferred(fut) => {
                return Step::Deferred(Box::pin(async move {
                    let mut hit = fut.await;
                    let mut i = idx;
                    loop {
                        if hit {
                            return run_transition_body(&arms[i].when_true, &mut *ctx)
                                .resolve()
                                .await;
                        }
                        i += 1;
                        if i >= arms.len() {
                            break;
                        }
                        hit = (arms[i].predicate)(&mut *ctx).resolve().await;
                    }
                    match otherwise {
                        Some(body) => run_transition_body(body, &mut *ctx).resolve().await,
                        None => Ok(()),
                    }
                }));
            }
        }
    }
    match otherwise {
        Some(body) => run_transition_body(body, ctx),
        None => Step::Ready(Ok(())),
    }
}

fn finish_transition_result<'a>(
    result: Result<Payload, HandlerFault>,
    on_ok: &'a TransitionHandlerBody,
    on_err: Option<&'a TransitionHandlerBody>,
    ctx: &'a mut TransitionContext<'_>,
) -> Step<'a, ActionResult> {
    match result {
        Ok(value) => {
            ctx.stage(value);
            run_transition_body(on_ok, ctx)
        }
        Err(fault) => match on_err {
            Some(body) => {
                ctx.stage(Box::new(fault));
                run_transition_body(body, ctx)
            }
            None => Step::Ready(Err(fault)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::testing::MemHost;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ctx_over(host: &mut MemHost) -> MessageContext<'_> {
        MessageContext::new(StateKey::new("s1"), host)
    }

    fn goto_body(target: &str, actions: Vec<MessageActionFn>) -> MessageHandlerBody {
        MessageHandlerBody::GoTo {
            target: StateKey::new(target),
            payload: None,
            actions,
        }
    }

    #[test]
    fn goto_runs_actions_before_resolving() {
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&hits);
        let action: MessageActionFn = Arc::new(move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
            Step::ready(Ok(()))
        });

        let body = goto_body("s2", vec![action]);
        let mut host = MemHost::default();
        let mut ctx = ctx_over(&mut host);

        let disposition = run_message_body(&body, &0u8, &mut ctx).now().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(matches!(
            disposition,
            Disposition::GoTo { target, .. } if target.name() == "s2"
        ));
    }

    #[test]
    fn action_fault_short_circuits() {
        let failing: MessageActionFn =
            Arc::new(|_, _| Step::ready(Err(HandlerFault::new("boom"))));
        let unreachable: MessageActionFn = Arc::new(|_, _| panic!("must not run"));

        let body = goto_body("s2", vec![failing, unreachable]);
        let mut host = MemHost::default();
        let mut ctx = ctx_over(&mut host);

        let disposition = run_message_body(&body, &0u8, &mut ctx).now().unwrap();
        assert!(matches!(disposition, Disposition::Fault(fault) if fault.message() == "boom"));
    }

    #[test]
    fn when_picks_the_first_satisfied_arm() {
        let body = MessageHandlerBody::When {
            arms: vec![
                MessageGuardArm {
                    predicate: Arc::new(|_, _| Step::ready(false)),
                    when_true: Arc::new(goto_body("skipped", Vec::new())),
                },
                MessageGuardArm {
                    predicate: Arc::new(|_, _| Step::ready(true)),
                    when_true: Arc::new(goto_body("chosen", Vec::new())),
                },
                MessageGuardArm {
                    predicate: Arc::new(|_, _| panic!("evaluation must stop at the first hit")),
                    when_true: Arc::new(goto_body("late", Vec::new())),
                },
            ],
            otherwise: None,
        };

        let mut host = MemHost::default();
        let mut ctx = ctx_over(&mut host);
        let disposition = run_message_body(&body, &0u8, &mut ctx).now().unwrap();
        assert!(matches!(
            disposition,
            Disposition::GoTo { target, .. } if target.name() == "chosen"
        ));
    }

    #[test]
    fn when_without_a_hit_is_unhandled() {
        let body = MessageHandlerBody::When {
            arms: vec![MessageGuardArm {
                predicate: Arc::new(|_, _| Step::ready(false)),
                when_true: Arc::new(goto_body("skipped", Vec::new())),
            }],
            otherwise: None,
        };

        let mut host = MemHost::default();
        let mut ctx = ctx_over(&mut host);
        let disposition = run_message_body(&body, &0u8, &mut ctx).now().unwrap();
        assert!(disposition.is_unhandled());
    }

    #[tokio::test]
    async fn deferred_guards_keep_declaration_order() {
        let body = MessageHandlerBody::When {
            arms: vec![
                MessageGuardArm {
                    predicate: Arc::new(|_, _| Step::deferred(async { false })),
                    when_true: Arc::new(goto_body("skipped", Vec::new())),
                },
                MessageGuardArm {
                    predicate: Arc::new(|_, _| Step::ready(true)),
                    when_true: Arc::new(goto_body("chosen", Vec::new())),
                },
            ],
            otherwise: None,
        };

        let mut host = MemHost::default();
        let mut ctx = ctx_over(&mut host);
        let step = run_message_body(&body, &0u8, &mut ctx);
        assert!(!step.is_ready());
        let disposition = step.resolve().await;
        assert!(matches!(
            disposition,
            Disposition::GoTo { target, .. } if target.name() == "chosen"
        ));
    }

    #[test]
    fn when_result_success_stages_the_value() {
        let stay_with_check: MessageActionFn = Arc::new(|_, ctx| {
            assert_eq!(ctx.staged_ref::<u32>(), Some(&99));
            Step::ready(Ok(()))
        });
        let body = MessageHandlerBody::WhenResult {
            producer: Arc::new(|_, _| Step::ready(Ok(Box::new(99u32) as Payload))),
            on_ok: Arc::new(MessageHandlerBody::Stay {
                actions: vec![stay_with_check],
            }),
            on_err: None,
        };

        let mut host = MemHost::default();
        let mut ctx = ctx_over(&mut host);
        let disposition = run_message_body(&body, &0u8, &mut ctx).now().unwrap();
        assert!(matches!(disposition, Disposition::Stay));
    }

    #[test]
    fn when_result_error_without_continuation_faults() {
        let body = MessageHandlerBody::WhenResult {
            producer: Arc::new(|_, _| Step::ready(Err(HandlerFault::new("load failed")))),
            on_ok: Arc::new(MessageHandlerBody::Stay { actions: Vec::new() }),
            on_err: None,
        };

        let mut host = MemHost::default();
        let mut ctx = ctx_over(&mut host);
        let disposition = run_message_body(&body, &0u8, &mut ctx).now().unwrap();
        assert!(matches!(
            disposition,
            Disposition::Fault(fault) if fault.message() == "load failed"
        ));
    }

    #[test]
    fn nested_targets_are_collected() {
        let mut leaf = MessageHandlerInfo::new(MessageHandlerKind::GoTo, "Msg");
        leaf.go_to_target = Some(StateKey::new("deep"));
        let mut top = MessageHandlerInfo::new(MessageHandlerKind::When, "Msg");
        top.conditions.push(ConditionInfo {
            label: Some("ready".into()),
            when_true: Box::new(leaf),
        });
        let mut other = MessageHandlerInfo::new(MessageHandlerKind::GoTo, "Msg");
        other.go_to_target = Some(StateKey::new("fallback"));
        top.otherwise = Some(Box::new(other));

        let targets = top.transition_targets();
        assert_eq!(targets, vec![StateKey::new("deep"), StateKey::new("fallback")]);
    }
}
