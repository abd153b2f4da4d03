pub mod engine;
pub mod routing;

pub use engine::{
    ConversationFlow, LifecycleAction, LifecycleContext, LifecycleEngine, LifecycleError,
    SendTrigger, StandardFlow, TransitionOutcome,
};
pub use routing::{classify_inbound, InboundSignal};
