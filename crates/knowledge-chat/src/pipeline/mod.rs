//! The conversational request pipeline: coordination, agent strategies and
//! answer delivery.

pub mod agents;
pub mod background;
pub mod cancel_registry;
pub mod coordinator;
pub mod response_channel;

pub use agents::{AgentKind, AgentRunner, RequestContext};
pub use background::spawn_detached;
pub use cancel_registry::{CancelRegistration, CancelRegistry};
pub use coordinator::{AcceptedRequest, ChatRequest, PipelineDeps, RequestCoordinator};
pub use response_channel::{
    BatchChannel, CompletionCallback, ReplyFailure, ReplyInit, ReplyOutcome, ResponseChannel, ResponseContent,
    StreamingChannel,
};
