#![forbid(unsafe_code)]

//! arbor-core: declarative builders and validation for hierarchical state
//! trees.
//!
//! A tree is described as data: states with typed per-state data, initial
//! children, entry/exit handlers, guarded message handlers, channel-typed
//! entries, and nested sub-machines. `TreeBuilder::materialize` validates
//! the description and emits an executable node graph through the
//! node-build protocol; execution itself belongs to the consuming runtime.

pub mod build;
pub mod channel;
pub mod codec;
pub mod descriptor;
pub mod error;
pub mod eventual;
pub mod host;
pub mod info;
pub mod key;
pub mod message_handler;
pub mod state;
pub mod transition_handler;
pub mod tree;
mod validate;

pub use build::{NodeBuilderFn, NodeKind, TreeBuildContext, TreeNodeBuildInfo};
pub use channel::{EntryChannel, EntryPayload};
pub use codec::{JsonCodec, StateDataCodec};
pub use descriptor::{
    MessageHandler, MessageHandlerDescriptor, MessageHandlerInfo, MessageHandlerKind,
    TransitionHandler, TransitionHandlerDescriptor, TransitionHandlerInfo, TransitionHandlerKind,
};
pub use error::{HandlerFault, TreeDefinitionError};
pub use eventual::{ActionResult, BoxFuture, Disposition, Eventual, Payload, Step};
pub use host::{Ancestor, DataAccess, MessageContext, TransitionContext, TreeHost};
pub use info::{StateInfo, TreeInfo};
pub use key::{DataKey, StateKey, RESERVED_ROOT_NAME};
pub use message_handler::{IntoMessageHandler, MessageHandlerBuilder};
pub use state::{InitialChild, InitialData, MachineDone, StateBuilder, StateFilter, TreeState};
pub use transition_handler::{IntoTransitionHandler, TransitionHandlerBuilder};
pub use tree::TreeBuilder;

pub mod prelude {
    pub use crate::build::{NodeKind, TreeBuildContext, TreeNodeBuildInfo};
    pub use crate::channel::EntryChannel;
    pub use crate::error::{HandlerFault, TreeDefinitionError};
    pub use crate::eventual::{Disposition, Eventual, Step};
    pub use crate::host::{DataAccess, MessageContext, TransitionContext, TreeHost};
    pub use crate::key::{DataKey, StateKey};
    pub use crate::state::{InitialData, MachineDone, StateBuilder, TreeState};
    pub use crate::tree::TreeBuilder;
}
