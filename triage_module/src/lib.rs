pub mod cases;
pub mod locks;
pub mod normalize;
pub mod org_state;
pub mod pull;

pub(crate) mod util;

mod msgs;

pub use msgs::{
    is_valid_keyword, match_labels, ActionEngine, ActionKind, Activity, Actor, Label,
    LabelRegistry, Message, MessageAction, MessageType, Outgoing, TriageError, TriageStore,
};
pub use pull::{PullResult, PullTask, PULL_TASK_NAME};
