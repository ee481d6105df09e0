//! Structural well-formedness checks run at materialization.

use crate::error::TreeDefinitionError;
use crate::key::StateKey;
use crate::state::InitialChild;
use crate::tree::TreeBuilder;
use std::collections::{HashMap, HashSet};

/// The validated shape of a tree: effective parentage and child order.
pub(crate) struct Plan {
    pub(crate) root: StateKey,
    pub(crate) children: HashMap<StateKey, Vec<StateKey>>,
    pub(crate) parents: HashMap<StateKey, StateKey>,
}

pub(crate) fn check(tree: &TreeBuilder) -> Result<Plan, TreeDefinitionError> {
    let root = tree.root_key().clone();

    // Named parents must be declared states.
    for record in tree.records() {
        if record.key() == &root {
            continue;
        }
        if let Some(parent) = record.declared_parent() {
            if parent != &root && !tree.is_declared(parent) {
                return Err(TreeDefinitionError::UnknownParent {
                    key: record.key().clone(),
                    parent: parent.clone(),
                });
            }
        }
    }

    // Effective parentage: parentless states attach to the root. Children
    // keep declaration order. A final parent is rejected from either side.
    let mut parents: HashMap<StateKey, StateKey> = HashMap::new();
    let mut children: HashMap<StateKey, Vec<StateKey>> = HashMap::new();
    children.insert(root.clone(), Vec::new());
    for record in tree.records() {
        children.entry(record.key().clone()).or_default();
    }
    for record in tree.records() {
        if record.key() == &root {
            continue;
        }
        let parent = record
            .declared_parent()
            .cloned()
            .unwrap_or_else(|| root.clone());
        if tree.record(&parent).is_some_and(|p| p.is_final()) {
            return Err(TreeDefinitionError::FinalAsParent {
                key: record.key().clone(),
                parent,
            });
        }
        parents.insert(record.key().clone(), parent.clone());
        children.entry(parent).or_default().push(record.key().clone());
    }

    // The implicit root's initial child must be a root-level state.
    if let Some(target) = tree.implicit_initial_child() {
        match tree.record(target) {
            None => {
                return Err(TreeDefinitionError::UnknownInitialChild {
                    key: root.clone(),
                    target: target.clone(),
                });
            }
            Some(record) => {
                if let Some(parent) = record.declared_parent() {
                    if parent != &root {
                        return Err(TreeDefinitionError::ImplicitRootInitialChildHasParent {
                            target: target.clone(),
                            parent: parent.clone(),
                        });
                    }
                }
            }
        }
    }

    // Initial children: required on non-leaf non-final states; a declared
    // fixed target must exist and must name this state as its parent.
    for record in tree.records() {
        let key = record.key();
        match record.declared_initial_child() {
            None => {
                if !children[key].is_empty() && !record.is_final() {
                    return Err(TreeDefinitionError::MissingInitialChild { key: key.clone() });
                }
            }
            Some(InitialChild::Fixed(target)) => {
                if !tree.is_declared(target) {
                    return Err(TreeDefinitionError::UnknownInitialChild {
                        key: key.clone(),
                        target: target.clone(),
                    });
                }
                let actual = parents.get(target).unwrap_or(&root);
                if actual != key {
                    return Err(TreeDefinitionError::InitialChildParentMismatch {
                        key: key.clone(),
                        target: target.clone(),
                        actual: actual.clone(),
                    });
                }
            }
            Some(InitialChild::Resolver(_)) => {
                tracing::debug!(
                    state = %key,
                    "initial child is resolved at runtime; skipping static checks"
                );
            }
        }
    }

    // Every go_to target across all descriptors names a declared state.
    for record in tree.records() {
        for target in record.transition_targets() {
            if target != root && !tree.is_declared(&target) {
                return Err(TreeDefinitionError::UnknownTransitionTarget {
                    key: record.key().clone(),
                    target,
                });
            }
        }
    }

    // Walk parent edges from every state; revisiting a key is a cycle.
    let mut verified: HashSet<StateKey> = HashSet::new();
    verified.insert(root.clone());
    for record in tree.records() {
        let mut seen: HashSet<StateKey> = HashSet::new();
        let mut path: Vec<StateKey> = Vec::new();
        let mut current = record.key().clone();
        while !verified.contains(&current) {
            if !seen.insert(current.clone()) {
                return Err(TreeDefinitionError::ParentCycle {
                    key: record.key().clone(),
                    offender: current,
                });
            }
            path.push(current.clone());
            match parents.get(&current) {
                Some(parent) => current = parent.clone(),
                None => break,
            }
        }
        verified.extend(path);
    }

    // Machine states must say what happens when their machine is done.
    for record in tree.records() {
        if record.is_machine() && record.machine_done_descriptor().is_none() {
            return Err(TreeDefinitionError::MissingMachineDoneHandler {
                key: record.key().clone(),
            });
        }
    }

    Ok(Plan {
        root,
        children,
        parents,
    })
}
