pub mod events;
pub mod loop_;

pub use events::{BroadcastSink, EventSink, LoopEvent, NullSink};
pub use loop_::{Approver, LoopError, LoopOutcome, ToolLoop, ToolLoopParams};
