mod engine;
mod labels;
mod matcher;
mod store;
mod types;

pub use engine::ActionEngine;
pub use labels::{is_valid_keyword, LabelRegistry};
pub use matcher::match_labels;
pub use store::TriageStore;
pub use types::{
    ActionKind, Activity, Actor, Label, Message, MessageAction, MessageType, Outgoing, TriageError,
};
