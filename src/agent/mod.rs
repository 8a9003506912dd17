pub mod conversation;
pub mod feedback;
pub mod loop_;
pub mod metrics;
pub mod patching;

pub use conversation::{Conversation, Message, ToolReply};
pub use feedback::{FailureKind, PatchFeedback};
pub use loop_::{run_repair_loop, LoopHandles, RunOutcome};
pub use metrics::{Metrics, Phase};
