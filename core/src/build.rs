//! The node-build protocol.
//!
//! The core never creates runtime node objects itself. Materialization
//! hands each node's description to a [`TreeBuildContext`] supplied by the
//! executing runtime, which may build an executable tree, a pure-metadata
//! rendering, or anything else. The context must register nodes uniquely
//! by key.

use crate::codec::StateDataCodec;
use crate::error::TreeDefinitionError;
use crate::key::StateKey;
use crate::state::{InitialChild, StateFilter, TreeState};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Position of a node in the materialized tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Root,
    Interior,
    Leaf { is_final: bool },
}

impl NodeKind {
    pub fn is_leaf(&self) -> bool {
        matches!(self, NodeKind::Leaf { .. })
    }
}

/// Deferred construction of one child node, run by the build context.
pub type NodeBuilderFn<'t, C> = Box<
    dyn FnOnce(&mut C) -> Result<<C as TreeBuildContext>::Node, TreeDefinitionError> + 't,
>;

/// Collaborator that turns node descriptions into runtime nodes.
pub trait TreeBuildContext: Sized {
    type Node;

    fn build_root(
        &mut self,
        info: TreeNodeBuildInfo<'_, Self>,
    ) -> Result<Self::Node, TreeDefinitionError>;

    fn build_interior(
        &mut self,
        info: TreeNodeBuildInfo<'_, Self>,
    ) -> Result<Self::Node, TreeDefinitionError>;

    fn build_leaf(
        &mut self,
        info: TreeNodeBuildInfo<'_, Self>,
    ) -> Result<Self::Node, TreeDefinitionError>;
}

/// Everything the build context needs to construct one node.
pub struct TreeNodeBuildInfo<'t, C: TreeBuildContext> {
    pub key: StateKey,
    pub kind: NodeKind,
    /// Produces the executable state wrapping the descriptor-derived
    /// handlers.
    pub state_factory: Box<dyn FnOnce(StateKey) -> TreeState + Send + 't>,
    pub initial_child: Option<InitialChild>,
    /// Child constructions in declaration order.
    pub child_builders: Vec<NodeBuilderFn<'t, C>>,
    pub codec: Option<Arc<dyn StateDataCodec>>,
    pub filters: Vec<Arc<dyn StateFilter>>,
    pub metadata: BTreeMap<String, String>,
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashSet;

    /// Node shape produced by the in-memory build context used in tests.
    #[derive(Debug)]
    pub(crate) struct TestNode {
        pub(crate) key: StateKey,
        pub(crate) kind: NodeKind,
        pub(crate) state: TreeState,
        pub(crate) initial_child: Option<InitialChild>,
        pub(crate) children: Vec<TestNode>,
    }

    impl TestNode {
        pub(crate) fn find(&self, name: &str) -> Option<&TestNode> {
            if self.key.name() == name {
                return Some(self);
            }
            self.children.iter().find_map(|child| child.find(name))
        }

        pub(crate) fn child_names(&self) -> Vec<&str> {
            self.children.iter().map(|c| c.key.name()).collect()
        }
    }

    /// Build context that assembles [`TestNode`] values and enforces the
    /// register-once-per-key protocol rule.
    #[derive(Default)]
    pub(crate) struct RecordingContext {
        registered: HashSet<StateKey>,
    }

    impl RecordingContext {
        fn build(
            &mut self,
            info: TreeNodeBuildInfo<'_, Self>,
        ) -> Result<TestNode, TreeDefinitionError> {
            if !self.registered.insert(info.key.clone()) {
                return Err(TreeDefinitionError::DuplicateState {
                    key: info.key.clone(),
                });
            }
            let state = (info.state_factory)(info.key.clone());
            let mut children = Vec::new();
            for child in info.child_builders {
                children.push(child(self)?);
            }
            Ok(TestNode {
                key: info.key,
                kind: info.kind,
                state,
                initial_child: info.initial_child,
                children,
            })
        }
    }

    impl TreeBuildContext for RecordingContext {
        type Node = TestNode;

        fn build_root(
            &mut self,
            info: TreeNodeBuildInfo<'_, Self>,
        ) -> Result<Self::Node, TreeDefinitionError> {
            self.build(info)
        }

        fn build_interior(
            &mut self,
            info: TreeNodeBuildInfo<'_, Self>,
        ) -> Result<Self::Node, TreeDefinitionError> {
            self.build(info)
        }

        fn build_leaf(
            &mut self,
            info: TreeNodeBuildInfo<'_, Self>,
        ) -> Result<Self::Node, TreeDefinitionError> {
            self.build(info)
        }
    }
}
