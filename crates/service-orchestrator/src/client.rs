//! # Supervisor Client
//!
//! Typed handle for sending [`SupervisorRequest`]s to one supervisor task.

use crate::descriptor::ServiceId;
use crate::error::SupervisorError;
use crate::message::SupervisorRequest;
use crate::propagate::RenderedConfig;
use crate::state::ServiceState;
use tokio::sync::{mpsc, oneshot};
use tracing::instrument;

/// Cheap to clone: holds only the service id and a sender.
#[derive(Clone, Debug)]
pub struct SupervisorClient {
    id: ServiceId,
    sender: mpsc::Sender<SupervisorRequest>,
}

impl SupervisorClient {
    pub fn new(id: ServiceId, sender: mpsc::Sender<SupervisorRequest>) -> Self {
        Self { id, sender }
    }

    pub fn id(&self) -> &ServiceId {
        &self.id
    }

    #[instrument(skip(self, config), fields(service = %self.id))]
    pub async fn start(&self, config: RenderedConfig) -> Result<(), SupervisorError> {
        let (respond_to, response) = oneshot::channel();
        self.sender
            .send(SupervisorRequest::Start { config, respond_to })
            .await
            .map_err(|_| SupervisorError::ActorClosed)?;
        response.await.map_err(|_| SupervisorError::ActorDropped)?
    }

    #[instrument(skip(self), fields(service = %self.id))]
    pub async fn stop(&self) -> Result<ServiceState, SupervisorError> {
        let (respond_to, response) = oneshot::channel();
        self.sender
            .send(SupervisorRequest::Stop { respond_to })
            .await
            .map_err(|_| SupervisorError::ActorClosed)?;
        response.await.map_err(|_| SupervisorError::ActorDropped)?
    }

    #[instrument(skip(self), fields(service = %self.id))]
    pub async fn block(&self, cause: ServiceId) -> Result<(), SupervisorError> {
        let (respond_to, response) = oneshot::channel();
        self.sender
            .send(SupervisorRequest::Block { cause, respond_to })
            .await
            .map_err(|_| SupervisorError::ActorClosed)?;
        response.await.map_err(|_| SupervisorError::ActorDropped)?
    }

    #[instrument(skip(self), fields(service = %self.id))]
    pub async fn fail(&self, cause: ServiceId) -> Result<ServiceState, SupervisorError> {
        let (respond_to, response) = oneshot::channel();
        self.sender
            .send(SupervisorRequest::Fail { cause, respond_to })
            .await
            .map_err(|_| SupervisorError::ActorClosed)?;
        response.await.map_err(|_| SupervisorError::ActorDropped)?
    }
}
