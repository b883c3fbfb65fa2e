pub mod chunker;
pub mod queue;
pub mod view;

pub use chunker::{chunk_message, chunk_with_footer};
pub use queue::{OutboundSender, start_outbound};
pub use view::{PresenceUpdater, StatusView};
