//! Call-center orchestration core: the static dialplan, the conversation
//! service contract, and the coordinator that ties them together.

pub mod conversation;
pub mod coordinator;
pub mod dialplan;

pub use conversation::{ConversationService, StartCallOutcome, StartCallRequest};
pub use coordinator::{CallCoordinator, CallSession, CoordinatorError, EndOutcome};
pub use dialplan::{Dialplan, DialplanError, Resolution, Routes};
