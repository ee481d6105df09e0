//! Per-state declaration and the executable state it materializes into.
//!
//! A [`StateBuilder`] is handed to the user's `build_fn` callback during
//! registration and accumulates parentage, data, filters, and handlers.
//! Handler slots accumulate monotonically; `on_enter`/`on_exit` are single
//! slots where the latest declaration wins, and a repeated `on_message`
//! for the same message type replaces the earlier entry.

use crate::channel::{EntryChannel, EntryPayload};
use crate::codec::StateDataCodec;
use crate::descriptor::{
    short_type_name, MessageHandlerDescriptor, MessageHandlerInfo, MessageHandlerKind,
    OpenMessageHandlerFn, TransitionHandlerDescriptor,
};
use crate::error::HandlerFault;
use crate::eventual::{ActionResult, Disposition, Eventual, Payload, Step};
use crate::host::{Ancestor, MessageContext, TransitionContext};
use crate::key::{DataKey, StateKey};
use crate::message_handler::{IntoMessageHandler, MessageHandlerBuilder};
use crate::transition_handler::{open_coded, IntoTransitionHandler, TransitionHandlerBuilder};
use std::any::{Any, TypeId};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// Factory producing a state's initial data value on entry.
pub type InitialDataFn =
    Arc<dyn Fn(&mut TransitionContext<'_>) -> Result<Payload, HandlerFault> + Send + Sync>;

/// Typed initial-data factory handed to `data_state`. Built from a plain
/// closure over the transition context, or seeded from a channel payload
/// via `EntryChannel::initial_data`.
pub struct InitialData<D> {
    init: InitialDataFn,
    _data: std::marker::PhantomData<fn() -> D>,
}

impl<D: Any + Send> InitialData<D> {
    pub fn new(f: impl Fn(&mut TransitionContext<'_>) -> D + Send + Sync + 'static) -> Self {
        InitialData {
            init: Arc::new(move |ctx| Ok(Box::new(f(ctx)) as Payload)),
            _data: std::marker::PhantomData,
        }
    }

    /// Factory that may fault instead of producing a value.
    pub fn try_new(
        f: impl Fn(&mut TransitionContext<'_>) -> Result<D, HandlerFault> + Send + Sync + 'static,
    ) -> Self {
        InitialData {
            init: Arc::new(move |ctx| f(ctx).map(|value| Box::new(value) as Payload)),
            _data: std::marker::PhantomData,
        }
    }

    pub(crate) fn from_fn(init: InitialDataFn) -> Self {
        InitialData {
            init,
            _data: std::marker::PhantomData,
        }
    }

    pub(crate) fn into_fn(self) -> InitialDataFn {
        self.init
    }
}

/// How a non-leaf state picks the child to enter.
#[derive(Clone)]
pub enum InitialChild {
    /// A statically-known child key, checked at materialization.
    Fixed(StateKey),
    /// An opaque resolver consulted at runtime; not statically checked.
    Resolver(Arc<dyn Fn(&mut TransitionContext<'_>) -> StateKey + Send + Sync>),
}

impl InitialChild {
    pub fn fixed_target(&self) -> Option<&StateKey> {
        match self {
            InitialChild::Fixed(key) => Some(key),
            InitialChild::Resolver(_) => None,
        }
    }

    pub fn resolve(&self, ctx: &mut TransitionContext<'_>) -> StateKey {
        match self {
            InitialChild::Fixed(key) => key.clone(),
            InitialChild::Resolver(resolve) => resolve(ctx),
        }
    }
}

impl fmt::Debug for InitialChild {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitialChild::Fixed(key) => write!(f, "Fixed({key})"),
            InitialChild::Resolver(_) => f.write_str("Resolver(..)"),
        }
    }
}

/// Opaque per-state marker interpreted by the executing runtime.
pub trait StateFilter: Send + Sync {
    fn name(&self) -> &str;
}

/// Message the runtime posts into a machine state when its nested machine
/// reports completion.
#[derive(Debug)]
pub struct MachineDone {
    pub machine: StateKey,
}

pub(crate) type MachineIntakeFn = Arc<dyn Fn(&mut TransitionContext<'_>) -> Payload + Send + Sync>;
pub(crate) type MachineIsDoneFn = Arc<dyn Fn(&(dyn Any + Send)) -> bool + Send + Sync>;
pub(crate) type ValueMatcherFn = Arc<dyn Fn(&(dyn Any + Send + Sync)) -> bool + Send + Sync>;

pub(crate) struct DataSlot {
    pub(crate) type_name: String,
    pub(crate) init: InitialDataFn,
}

pub(crate) struct ValueHandler {
    pub(crate) matcher: ValueMatcherFn,
    pub(crate) descriptor: MessageHandlerDescriptor,
}

/// Per-state accumulator consumed inside a registration's `build_fn`.
pub struct StateBuilder {
    key: StateKey,
    is_final: bool,
    parent: Option<StateKey>,
    initial_child: Option<InitialChild>,
    data: Option<DataSlot>,
    on_enter: Option<TransitionHandlerDescriptor>,
    on_exit: Option<TransitionHandlerDescriptor>,
    typed_handlers: Vec<(TypeId, MessageHandlerDescriptor)>,
    value_handlers: Vec<ValueHandler>,
    open_handler: Option<(OpenMessageHandlerFn, MessageHandlerInfo)>,
    machine_intake: Option<MachineIntakeFn>,
    machine_is_done: Option<MachineIsDoneFn>,
    machine_done: Option<MessageHandlerDescriptor>,
    codec: Option<Arc<dyn StateDataCodec>>,
    filters: Vec<Arc<dyn StateFilter>>,
    metadata: BTreeMap<String, String>,
}

impl StateBuilder {
    pub(crate) fn new(key: StateKey, is_final: bool) -> Self {
        StateBuilder {
            key,
            is_final,
            parent: None,
            initial_child: None,
            data: None,
            on_enter: None,
            on_exit: None,
            typed_handlers: Vec::new(),
            value_handlers: Vec::new(),
            open_handler: None,
            machine_intake: None,
            machine_is_done: None,
            machine_done: None,
            codec: None,
            filters: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn key(&self) -> &StateKey {
        &self.key
    }

    /// Declares this state's parent. Without one the state attaches to
    /// the root.
    pub fn parent(&mut self, key: &StateKey) -> &mut Self {
        self.parent = Some(key.clone());
        self
    }

    /// Statically-known initial child, validated at materialization.
    pub fn initial_child(&mut self, key: &StateKey) -> &mut Self {
        self.initial_child = Some(InitialChild::Fixed(key.clone()));
        self
    }

    /// Runtime-resolved initial child. Skipped by static validation but
    /// reachable when the state is entered.
    pub fn initial_child_resolver(
        &mut self,
        f: impl Fn(&mut TransitionContext<'_>) -> StateKey + Send + Sync + 'static,
    ) -> &mut Self {
        self.initial_child = Some(InitialChild::Resolver(Arc::new(f)));
        self
    }

    // --- entry / exit ------------------------------------------------------

    /// Sets the single entry handler; a later declaration wins.
    pub fn on_enter<B: IntoTransitionHandler>(
        &mut self,
        build: impl FnOnce(TransitionHandlerBuilder) -> B,
    ) -> &mut Self {
        self.on_enter = Some(build(TransitionHandlerBuilder::new()).into_descriptor());
        self
    }

    /// Entry handler with typed access to an ancestor data state.
    pub fn on_enter_with_data<DAnc: Any + Send, B: IntoTransitionHandler>(
        &mut self,
        ancestor: &DataKey<DAnc>,
        build: impl FnOnce(TransitionHandlerBuilder, Ancestor<DAnc>) -> B,
    ) -> &mut Self {
        let handle = Ancestor::new(ancestor.clone());
        self.on_enter = Some(build(TransitionHandlerBuilder::new(), handle).into_descriptor());
        self
    }

    /// Entry handler obliged to consume the channel's payload type.
    pub fn on_enter_from_channel<P: Any + Send, B: IntoTransitionHandler>(
        &mut self,
        _channel: &EntryChannel<P>,
        build: impl FnOnce(TransitionHandlerBuilder, EntryPayload<P>) -> B,
    ) -> &mut Self {
        self.on_enter =
            Some(build(TransitionHandlerBuilder::new(), EntryPayload::new()).into_descriptor());
        self
    }

    /// Installs an open-coded entry handler.
    pub fn handle_on_enter(
        &mut self,
        f: impl Fn(&mut TransitionContext<'_>) -> Eventual<ActionResult> + Send + Sync + 'static,
        label: Option<&str>,
    ) -> &mut Self {
        self.on_enter = Some(open_coded(f, label));
        self
    }

    /// Sets the single exit handler; a later declaration wins.
    pub fn on_exit<B: IntoTransitionHandler>(
        &mut self,
        build: impl FnOnce(TransitionHandlerBuilder) -> B,
    ) -> &mut Self {
        self.on_exit = Some(build(TransitionHandlerBuilder::new()).into_descriptor());
        self
    }

    /// Exit handler with typed access to an ancestor data state.
    pub fn on_exit_with_data<DAnc: Any + Send, B: IntoTransitionHandler>(
        &mut self,
        ancestor: &DataKey<DAnc>,
        build: impl FnOnce(TransitionHandlerBuilder, Ancestor<DAnc>) -> B,
    ) -> &mut Self {
        let handle = Ancestor::new(ancestor.clone());
        self.on_exit = Some(build(TransitionHandlerBuilder::new(), handle).into_descriptor());
        self
    }

    /// Installs an open-coded exit handler.
    pub fn handle_on_exit(
        &mut self,
        f: impl Fn(&mut TransitionContext<'_>) -> Eventual<ActionResult> + Send + Sync + 'static,
        label: Option<&str>,
    ) -> &mut Self {
        self.on_exit = Some(open_coded(f, label));
        self
    }

    // --- messages ----------------------------------------------------------

    /// Registers a handler keyed by the message type `M`. Registering the
    /// same type again replaces the earlier handler.
    pub fn on_message<M, B>(
        &mut self,
        build: impl FnOnce(MessageHandlerBuilder<M>) -> B,
    ) -> &mut Self
    where
        M: Any + Send + Sync,
        B: IntoMessageHandler,
    {
        let descriptor = build(MessageHandlerBuilder::new(None)).into_descriptor();
        self.insert_typed(TypeId::of::<M>(), descriptor);
        self
    }

    /// Type-keyed handler with typed access to an ancestor data state.
    pub fn on_message_with_data<M, DAnc, B>(
        &mut self,
        ancestor: &DataKey<DAnc>,
        build: impl FnOnce(MessageHandlerBuilder<M>, Ancestor<DAnc>) -> B,
    ) -> &mut Self
    where
        M: Any + Send + Sync,
        DAnc: Any + Send,
        B: IntoMessageHandler,
    {
        let handle = Ancestor::new(ancestor.clone());
        let descriptor = build(MessageHandlerBuilder::new(None), handle).into_descriptor();
        self.insert_typed(TypeId::of::<M>(), descriptor);
        self
    }

    /// Registers a handler keyed by equality with a message value. Value
    /// matchers run before the type-keyed lookup, in declaration order.
    pub fn on_message_value<M, B>(
        &mut self,
        value: M,
        build: impl FnOnce(MessageHandlerBuilder<M>) -> B,
        name: Option<&str>,
    ) -> &mut Self
    where
        M: PartialEq + Any + Send + Sync,
        B: IntoMessageHandler,
    {
        let descriptor =
            build(MessageHandlerBuilder::new(name.map(str::to_string))).into_descriptor();
        let matcher: ValueMatcherFn = Arc::new(move |message| {
            message.downcast_ref::<M>().is_some_and(|m| *m == value)
        });
        self.value_handlers.push(ValueHandler { matcher, descriptor });
        self
    }

    /// Installs an open-coded fallthrough handler. Mutually exclusive with
    /// the keyed map: when present it wins and the map is unused.
    pub fn handle_on_message(
        &mut self,
        f: impl Fn(&(dyn Any + Send + Sync), &mut MessageContext<'_>) -> Eventual<Disposition>
            + Send
            + Sync
            + 'static,
    ) -> &mut Self {
        let info = MessageHandlerInfo::new(MessageHandlerKind::Handler, "any");
        self.open_handler = Some((Arc::new(f), info));
        self
    }

    // --- nested machine ----------------------------------------------------

    /// Handler for the nested machine's completion message. Required on
    /// machine states.
    pub fn on_machine_done<B>(
        &mut self,
        build: impl FnOnce(MessageHandlerBuilder<MachineDone>) -> B,
    ) -> &mut Self
    where
        B: IntoMessageHandler,
    {
        self.machine_done = Some(build(MessageHandlerBuilder::new(None)).into_descriptor());
        self
    }

    /// Refines completion detection for the nested machine. Without one,
    /// any completion report counts as done.
    pub fn machine_is_done(
        &mut self,
        f: impl Fn(&(dyn Any + Send)) -> bool + Send + Sync + 'static,
    ) -> &mut Self {
        self.machine_is_done = Some(Arc::new(f));
        self
    }

    // --- passthroughs ------------------------------------------------------

    pub fn codec(&mut self, codec: Arc<dyn StateDataCodec>) -> &mut Self {
        self.codec = Some(codec);
        self
    }

    pub fn filter(&mut self, filter: Arc<dyn StateFilter>) -> &mut Self {
        self.filters.push(filter);
        self
    }

    pub fn metadata(&mut self, key: &str, value: &str) -> &mut Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    // --- crate-internal ----------------------------------------------------

    fn insert_typed(&mut self, type_id: TypeId, descriptor: MessageHandlerDescriptor) {
        match self.typed_handlers.iter_mut().find(|(id, _)| *id == type_id) {
            Some((_, existing)) => *existing = descriptor,
            None => self.typed_handlers.push((type_id, descriptor)),
        }
    }

    pub(crate) fn set_data<D: Any + Send>(&mut self, init: InitialDataFn) {
        self.data = Some(DataSlot {
            type_name: short_type_name::<D>().to_string(),
            init,
        });
    }

    pub(crate) fn set_machine_intake(&mut self, intake: MachineIntakeFn) {
        self.machine_intake = Some(intake);
    }

    pub(crate) fn is_final(&self) -> bool {
        self.is_final
    }

    pub(crate) fn declared_parent(&self) -> Option<&StateKey> {
        self.parent.as_ref()
    }

    pub(crate) fn declared_initial_child(&self) -> Option<&InitialChild> {
        self.initial_child.as_ref()
    }

    pub(crate) fn is_machine(&self) -> bool {
        self.machine_intake.is_some()
    }

    pub(crate) fn machine_done_descriptor(&self) -> Option<&MessageHandlerDescriptor> {
        self.machine_done.as_ref()
    }

    pub(crate) fn data_type_name(&self) -> Option<&str> {
        self.data.as_ref().map(|slot| slot.type_name.as_str())
    }

    pub(crate) fn codec_ref(&self) -> Option<&Arc<dyn StateDataCodec>> {
        self.codec.as_ref()
    }

    pub(crate) fn filters_ref(&self) -> &[Arc<dyn StateFilter>] {
        &self.filters
    }

    pub(crate) fn metadata_ref(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    pub(crate) fn on_enter_descriptor(&self) -> Option<&TransitionHandlerDescriptor> {
        self.on_enter.as_ref()
    }

    pub(crate) fn on_exit_descriptor(&self) -> Option<&TransitionHandlerDescriptor> {
        self.on_exit.as_ref()
    }

    /// All message-handler descriptors, typed first, then value-keyed,
    /// then the machine-done handler.
    pub(crate) fn message_descriptors(&self) -> impl Iterator<Item = &MessageHandlerDescriptor> {
        self.typed_handlers
            .iter()
            .map(|(_, descriptor)| descriptor)
            .chain(self.value_handlers.iter().map(|handler| &handler.descriptor))
            .chain(self.machine_done.iter())
    }

    pub(crate) fn open_handler_info(&self) -> Option<&MessageHandlerInfo> {
        self.open_handler.as_ref().map(|(_, info)| info)
    }

    /// Every `go_to` target any of this state's handlers can name.
    pub(crate) fn transition_targets(&self) -> Vec<StateKey> {
        self.message_descriptors()
            .flat_map(|descriptor| descriptor.transition_targets())
            .collect()
    }

    /// Builds the executable state consumed by the runtime.
    pub(crate) fn runtime_state(&self, key: StateKey) -> TreeState {
        let mut by_type: HashMap<TypeId, crate::descriptor::MessageHandler> = self
            .typed_handlers
            .iter()
            .map(|(type_id, descriptor)| (*type_id, descriptor.make_handler()))
            .collect();
        if let Some(done) = &self.machine_done {
            by_type.insert(TypeId::of::<MachineDone>(), done.make_handler());
        }

        TreeState {
            key,
            is_final: self.is_final,
            on_enter: self.on_enter.as_ref().map(|d| d.make_handler()),
            on_exit: self.on_exit.as_ref().map(|d| d.make_handler()),
            open: self.open_handler.as_ref().map(|(f, _)| Arc::clone(f)),
            by_value: self
                .value_handlers
                .iter()
                .map(|handler| (Arc::clone(&handler.matcher), handler.descriptor.make_handler()))
                .collect(),
            by_type,
            initial_data: self.data.as_ref().map(|slot| Arc::clone(&slot.init)),
            machine_intake: self.machine_intake.clone(),
            machine_is_done: self.machine_is_done.clone(),
        }
    }
}

/// The executable state a materialized node wraps: entry/exit handlers,
/// the message dispatcher, and the initial-data factory.
pub struct TreeState {
    key: StateKey,
    is_final: bool,
    on_enter: Option<crate::descriptor::TransitionHandler>,
    on_exit: Option<crate::descriptor::TransitionHandler>,
    open: Option<OpenMessageHandlerFn>,
    by_value: Vec<(ValueMatcherFn, crate::descriptor::MessageHandler)>,
    by_type: HashMap<TypeId, crate::descriptor::MessageHandler>,
    initial_data: Option<InitialDataFn>,
    machine_intake: Option<MachineIntakeFn>,
    machine_is_done: Option<MachineIsDoneFn>,
}

impl TreeState {
    pub fn key(&self) -> &StateKey {
        &self.key
    }

    pub fn is_final(&self) -> bool {
        self.is_final
    }

    pub fn has_data(&self) -> bool {
        self.initial_data.is_some()
    }

    pub fn is_machine(&self) -> bool {
        self.machine_intake.is_some()
    }

    /// Runs the entry handler; a missing handler is a no-op.
    pub fn enter<'a>(&'a self, ctx: &'a mut TransitionContext<'_>) -> Step<'a, ActionResult> {
        match &self.on_enter {
            Some(handler) => handler.run(ctx),
            None => Step::Ready(Ok(())),
        }
    }

    /// Runs the exit handler; a missing handler is a no-op.
    pub fn exit<'a>(&'a self, ctx: &'a mut TransitionContext<'_>) -> Step<'a, ActionResult> {
        match &self.on_exit {
            Some(handler) => handler.run(ctx),
            None => Step::Ready(Ok(())),
        }
    }

    /// Dispatches a message: the open-coded handler wins outright, then
    /// value matchers in declaration order, then the exact runtime type.
    /// No subtype coercion is attempted.
    pub fn handle<'a>(
        &'a self,
        message: &'a (dyn Any + Send + Sync),
        ctx: &'a mut MessageContext<'_>,
    ) -> Step<'a, Disposition> {
        if let Some(open) = &self.open {
            return match open(message, &mut *ctx) {
                Step::Ready(disposition) => Step::Ready(disposition),
                Step::Deferred(fut) => Step::Deferred(fut),
            };
        }
        for (matcher, handler) in &self.by_value {
            if matcher(message) {
                return handler.handle(message, ctx);
            }
        }
        if let Some(handler) = self.by_type.get(&message.type_id()) {
            return handler.handle(message, ctx);
        }
        Step::Ready(Disposition::Unhandled)
    }

    /// Produces the initial data value, for data states.
    pub fn initial_data(
        &self,
        ctx: &mut TransitionContext<'_>,
    ) -> Option<Result<Payload, HandlerFault>> {
        self.initial_data.as_ref().map(|init| init(ctx))
    }

    /// Creates the nested machine handle, for machine states.
    pub fn nested_machine(&self, ctx: &mut TransitionContext<'_>) -> Option<Payload> {
        self.machine_intake.as_ref().map(|intake| intake(ctx))
    }

    /// Whether a nested machine's status report counts as completion.
    pub fn machine_done_matches(&self, status: &(dyn Any + Send)) -> bool {
        match &self.machine_is_done {
            Some(is_done) => is_done(status),
            None => true,
        }
    }
}

impl fmt::Debug for TreeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TreeState")
            .field("key", &self.key)
            .field("is_final", &self.is_final)
            .field("typed_handlers", &self.by_type.len())
            .field("value_handlers", &self.by_value.len())
            .finish_non_exhaustive()
    }
}
