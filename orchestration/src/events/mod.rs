//! In-process event routing.
//!
//! The dispatcher subscribes to a stream and routes each entry to the
//! handlers registered for its event type; the result waiter correlates
//! task results back to blocked callers without polling.

mod dispatcher;
mod handlers;
mod waiter;

pub use dispatcher::EventDispatcher;
pub use handlers::{
    next_gate, AgentBlockedHandler, AgentErrorHandler, EmergencyStopHandler, GateCompleteHandler,
    HandlerResult, SessionPauseHandler, SignalHandler,
};
pub use waiter::ResultWaiter;
