//! GRIP handler: turns instructed origin responses into held client
//! connections and drives them from published items.

pub mod engine;
pub mod hold;
pub mod instruct;
pub mod item;
pub mod jsonpatch;
pub mod lastids;
pub mod sequencer;
pub mod subs;

pub use engine::{HandlerConfig, HandlerEngine};
pub use hold::{HoldCommand, HoldOutcome, HoldSession};
pub use instruct::{Channel, HoldMode, Instruct, InstructError};
pub use item::{PublishFormat, PublishItem, WsMessageKind};
pub use lastids::PublishLastIds;
pub use sequencer::Sequencer;
pub use subs::{SubscriptionEvent, SubscriptionRegistry};
