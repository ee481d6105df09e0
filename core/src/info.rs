//! Serializable structural view of a declared tree.
//!
//! Diagram tooling consumes this instead of executing anything: the
//! handler infos carried here are the same records the validator walks.

use crate::build::NodeKind;
use crate::descriptor::{MessageHandlerInfo, TransitionHandlerInfo};
use crate::error::TreeDefinitionError;
use crate::key::StateKey;
use crate::tree::TreeBuilder;
use crate::validate;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize)]
pub struct TreeInfo {
    pub name: String,
    pub root: StateKey,
    pub states: Vec<StateInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StateInfo {
    pub key: StateKey,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<StateKey>,
    pub children: Vec<StateKey>,
    pub kind: NodeKind,
    pub is_final: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_enter: Option<TransitionHandlerInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_exit: Option<TransitionHandlerInfo>,
    pub message_handlers: Vec<MessageHandlerInfo>,
    pub metadata: BTreeMap<String, String>,
}

impl TreeBuilder {
    /// Validates the declarations and extracts the structural view, with
    /// states listed root-first in declaration order.
    pub fn info_graph(&self) -> Result<TreeInfo, TreeDefinitionError> {
        let plan = validate::check(self)?;
        let mut states = Vec::with_capacity(self.records().count() + 1);

        let root_children = plan.children.get(&plan.root).cloned().unwrap_or_default();
        if self.record(&plan.root).is_none() {
            // Implicit root: no record, no handlers.
            states.push(StateInfo {
                key: plan.root.clone(),
                parent: None,
                children: root_children.clone(),
                kind: NodeKind::Root,
                is_final: false,
                data_type: None,
                on_enter: None,
                on_exit: None,
                message_handlers: Vec::new(),
                metadata: BTreeMap::new(),
            });
        }

        for record in self.records() {
            let key = record.key().clone();
            let children = plan.children.get(&key).cloned().unwrap_or_default();
            let kind = if key == plan.root {
                NodeKind::Root
            } else if children.is_empty() {
                NodeKind::Leaf {
                    is_final: record.is_final(),
                }
            } else {
                NodeKind::Interior
            };

            let mut message_handlers: Vec<MessageHandlerInfo> = record
                .message_descriptors()
                .map(|descriptor| descriptor.info().clone())
                .collect();
            if let Some(open) = record.open_handler_info() {
                message_handlers.push(open.clone());
            }

            states.push(StateInfo {
                parent: plan.parents.get(&key).cloned(),
                children,
                kind,
                is_final: record.is_final(),
                data_type: record.data_type_name().map(str::to_string),
                on_enter: record.on_enter_descriptor().map(|d| d.info().clone()),
                on_exit: record.on_exit_descriptor().map(|d| d.info().clone()),
                message_handlers,
                metadata: record.metadata_ref().clone(),
                key,
            });
        }

        Ok(TreeInfo {
            name: self.log_name().to_string(),
            root: plan.root,
            states,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::RESERVED_ROOT_NAME;

    #[test]
    fn info_graph_lists_root_first_with_handler_infos() {
        let s1 = StateKey::new("s1");
        let s2 = StateKey::new("s2");

        let mut tree = TreeBuilder::new(&s1).with_log_name("doc-flow");
        tree.state(&s1, |s| {
            s.initial_child(&s2)
                .on_enter(|t| t.run("announce", |_| {}));
            s.on_message::<u32, _>(|m| m.go_to(&s2));
        })
        .unwrap();
        tree.state(&s2, |s| {
            s.parent(&s1);
        })
        .unwrap();

        let info = tree.info_graph().unwrap();
        assert_eq!(info.name, "doc-flow");
        assert_eq!(info.root.name(), RESERVED_ROOT_NAME);
        assert_eq!(info.states[0].key.name(), RESERVED_ROOT_NAME);
        assert_eq!(info.states[0].children, vec![s1.clone()]);

        let s1_info = info.states.iter().find(|s| s.key == s1).unwrap();
        assert_eq!(s1_info.kind, NodeKind::Interior);
        assert!(s1_info.on_enter.is_some());
        assert_eq!(s1_info.message_handlers.len(), 1);
        assert_eq!(
            s1_info.message_handlers[0].go_to_target,
            Some(s2.clone())
        );

        // The whole view serializes for diagram tooling.
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["states"][0]["kind"], "root");
    }

    #[test]
    fn info_graph_rejects_an_invalid_tree() {
        let s1 = StateKey::new("s1");
        let ghost = StateKey::new("ghost");

        let mut tree = TreeBuilder::new(&s1);
        tree.state(&s1, |s| {
            s.parent(&ghost);
        })
        .unwrap();

        assert!(tree.info_graph().is_err());
    }
}
