//! Top-level registrar and materializer for state trees.
//!
//! A [`TreeBuilder`] accumulates state declarations, each mutable only
//! through its registration's `build_fn`. `materialize` runs the
//! structural validator and then emits nodes through the node-build
//! protocol; the builder itself is not consumed, and re-materializing an
//! unchanged builder yields a structurally equal tree.

use crate::build::{NodeBuilderFn, NodeKind, TreeBuildContext, TreeNodeBuildInfo};
use crate::error::TreeDefinitionError;
use crate::eventual::Payload;
use crate::host::TransitionContext;
use crate::key::{DataKey, StateKey};
use crate::state::{InitialChild, InitialData, MachineIntakeFn, StateBuilder, TreeState};
use crate::validate::{self, Plan};
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

/// Declarative registrar for one state tree.
pub struct TreeBuilder {
    log_name: String,
    root_key: StateKey,
    implicit_initial_child: Option<StateKey>,
    index: HashMap<StateKey, usize>,
    records: Vec<StateBuilder>,
}

impl TreeBuilder {
    /// Builder with an implicit root under the reserved sentinel key.
    /// `initial_child` must be declared as a root-level state before
    /// materialization.
    pub fn new(initial_child: &StateKey) -> Self {
        TreeBuilder {
            log_name: "state-tree".to_string(),
            root_key: StateKey::reserved_root(),
            implicit_initial_child: Some(initial_child.clone()),
            index: HashMap::new(),
            records: Vec::new(),
        }
    }

    /// Builder with an explicit, user-keyed root.
    pub fn new_with_root(
        root: &StateKey,
        initial_child: &StateKey,
        build: impl FnOnce(&mut StateBuilder),
    ) -> Self {
        let mut tree = TreeBuilder {
            log_name: "state-tree".to_string(),
            root_key: root.clone(),
            implicit_initial_child: None,
            index: HashMap::new(),
            records: Vec::new(),
        };
        let mut record = StateBuilder::new(root.clone(), false);
        build(&mut record);
        record.initial_child(initial_child);
        tree.index.insert(root.clone(), 0);
        tree.records.push(record);
        tree
    }

    /// Builder whose explicit root carries data of type `D`.
    pub fn new_with_data_root<D: Any + Send>(
        root: &DataKey<D>,
        initial_data: InitialData<D>,
        initial_child: &StateKey,
        build: impl FnOnce(&mut StateBuilder),
    ) -> Self {
        let mut tree = TreeBuilder {
            log_name: "state-tree".to_string(),
            root_key: root.key().clone(),
            implicit_initial_child: None,
            index: HashMap::new(),
            records: Vec::new(),
        };
        let mut record = StateBuilder::new(root.key().clone(), false);
        record.set_data::<D>(initial_data.into_fn());
        build(&mut record);
        record.initial_child(initial_child);
        tree.index.insert(root.key().clone(), 0);
        tree.records.push(record);
        tree
    }

    /// Name used to tag this builder's tracing output.
    pub fn with_log_name(mut self, name: &str) -> Self {
        self.log_name = name.to_string();
        self
    }

    pub fn log_name(&self) -> &str {
        &self.log_name
    }

    // --- registration ------------------------------------------------------

    /// Registers a plain state. A key may be registered once; duplicates
    /// are rejected eagerly and leave the builder unchanged.
    pub fn state(
        &mut self,
        key: &StateKey,
        build: impl FnOnce(&mut StateBuilder),
    ) -> Result<(), TreeDefinitionError> {
        self.register(key.clone(), false, build)
    }

    /// Registers a state carrying data of type `D`.
    pub fn data_state<D: Any + Send>(
        &mut self,
        key: &DataKey<D>,
        initial_data: InitialData<D>,
        build: impl FnOnce(&mut StateBuilder),
    ) -> Result<(), TreeDefinitionError> {
        let init = initial_data.into_fn();
        self.register(key.key().clone(), false, move |record| {
            record.set_data::<D>(init);
            build(record);
        })
    }

    /// Registers a final leaf.
    pub fn final_state(
        &mut self,
        key: &StateKey,
        build: impl FnOnce(&mut StateBuilder),
    ) -> Result<(), TreeDefinitionError> {
        self.register(key.clone(), true, build)
    }

    /// Registers a final leaf carrying data of type `D`.
    pub fn final_data_state<D: Any + Send>(
        &mut self,
        key: &DataKey<D>,
        initial_data: InitialData<D>,
        build: impl FnOnce(&mut StateBuilder),
    ) -> Result<(), TreeDefinitionError> {
        let init = initial_data.into_fn();
        self.register(key.key().clone(), true, move |record| {
            record.set_data::<D>(init);
            build(record);
        })
    }

    /// Registers a state hosting a nested sub-machine. `intake` produces
    /// the machine handle when the state is entered; the `build_fn` must
    /// install `on_machine_done`.
    pub fn machine_state<N: Any + Send>(
        &mut self,
        key: &StateKey,
        intake: impl Fn(&mut TransitionContext<'_>) -> N + Send + Sync + 'static,
        build: impl FnOnce(&mut StateBuilder),
    ) -> Result<(), TreeDefinitionError> {
        let intake: MachineIntakeFn = Arc::new(move |ctx| Box::new(intake(ctx)) as Payload);
        self.register(key.clone(), false, move |record| {
            record.set_machine_intake(intake);
            build(record);
        })
    }

    fn register(
        &mut self,
        key: StateKey,
        is_final: bool,
        build: impl FnOnce(&mut StateBuilder),
    ) -> Result<(), TreeDefinitionError> {
        if self.index.contains_key(&key) {
            return Err(TreeDefinitionError::DuplicateState { key });
        }
        let mut record = StateBuilder::new(key.clone(), is_final);
        build(&mut record);
        self.index.insert(key, self.records.len());
        self.records.push(record);
        Ok(())
    }

    // --- materialization ---------------------------------------------------

    /// Validates the declarations and emits the root node through the
    /// node-build protocol, recursing over children in declaration order.
    pub fn materialize<C: TreeBuildContext>(
        &self,
        ctx: &mut C,
    ) -> Result<C::Node, TreeDefinitionError> {
        let plan = validate::check(self)?;
        let span = tracing::debug_span!("materialize", tree = %self.log_name).entered();
        tracing::debug!(
            states = self.records.len(),
            root = %plan.root,
            "materializing validated state tree"
        );
        let info = self.node_info(&plan, &plan.root);
        let node = ctx.build_root(info);
        drop(span);
        node
    }

    fn node_info<'t, C: TreeBuildContext>(
        &'t self,
        plan: &'t Plan,
        key: &StateKey,
    ) -> TreeNodeBuildInfo<'t, C> {
        let children: &[StateKey] = plan
            .children
            .get(key)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let record = self.record(key);
        let is_final = record.is_some_and(StateBuilder::is_final);

        let kind = if key == &plan.root {
            NodeKind::Root
        } else if children.is_empty() {
            NodeKind::Leaf { is_final }
        } else {
            NodeKind::Interior
        };

        let initial_child = match record {
            Some(record) => record.declared_initial_child().cloned(),
            // The implicit root has no record; its initial child comes
            // from the constructor.
            None => self.implicit_initial_child.clone().map(InitialChild::Fixed),
        };

        let state_factory: Box<dyn FnOnce(StateKey) -> TreeState + Send + 't> = match record {
            Some(record) => Box::new(move |key| record.runtime_state(key)),
            None => Box::new(|key| StateBuilder::new(key.clone(), false).runtime_state(key)),
        };

        let child_builders: Vec<NodeBuilderFn<'t, C>> = children
            .iter()
            .map(|child| {
                let child = child.clone();
                let builder: NodeBuilderFn<'t, C> = Box::new(move |ctx: &mut C| {
                    let info = self.node_info(plan, &child);
                    if info.kind.is_leaf() {
                        ctx.build_leaf(info)
                    } else {
                        ctx.build_interior(info)
                    }
                });
                builder
            })
            .collect();

        TreeNodeBuildInfo {
            key: key.clone(),
            kind,
            state_factory,
            initial_child,
            child_builders,
            codec: record.and_then(|r| r.codec_ref().cloned()),
            filters: record.map(|r| r.filters_ref().to_vec()).unwrap_or_default(),
            metadata: record.map(|r| r.metadata_ref().clone()).unwrap_or_default(),
        }
    }

    // --- crate-internal ----------------------------------------------------

    pub(crate) fn root_key(&self) -> &StateKey {
        &self.root_key
    }

    pub(crate) fn implicit_initial_child(&self) -> Option<&StateKey> {
        self.implicit_initial_child.as_ref()
    }

    pub(crate) fn records(&self) -> impl Iterator<Item = &StateBuilder> {
        self.records.iter()
    }

    pub(crate) fn record(&self, key: &StateKey) -> Option<&StateBuilder> {
        self.index.get(key).map(|index| &self.records[*index])
    }

    pub(crate) fn is_declared(&self, key: &StateKey) -> bool {
        self.index.contains_key(key)
    }
}
