//! # Supervisor Messages
//!
//! Requests the controller sends to a service supervisor, each carrying a
//! one-shot channel for the reply.

use crate::descriptor::ServiceId;
use crate::error::SupervisorError;
use crate::propagate::RenderedConfig;
use crate::state::ServiceState;
use tokio::sync::oneshot;

/// Type alias for the one-shot response channel used by supervisors.
pub type Response<T> = oneshot::Sender<Result<T, SupervisorError>>;

/// Lifecycle commands for one service.
///
/// - **Start**: `Pending -> Starting` with the rendered configuration. The
///   reply only acknowledges the request; progress is observed through
///   state events.
/// - **Stop**: cancel whatever is in flight and stop the instance. Replies
///   with the state the service ended in (`Stopped`, or `Failed` if it had
///   already failed for good).
/// - **Block**: a dependency failed; the service stays `Pending` and records
///   the cause.
/// - **Fail**: a dependency failed after this service was launched; stop it
///   and mark it terminally failed.
#[derive(Debug)]
pub enum SupervisorRequest {
    Start {
        config: RenderedConfig,
        respond_to: Response<()>,
    },
    Stop {
        respond_to: Response<ServiceState>,
    },
    Block {
        cause: ServiceId,
        respond_to: Response<()>,
    },
    Fail {
        cause: ServiceId,
        respond_to: Response<ServiceState>,
    },
}
