use async_trait::async_trait;

use crate::api::ApiError;
use crate::models::{AgendaResponse, Event, EventFilter, Resource};

/// Fetches the full server listing of one resource type.
#[async_trait]
pub trait ListSource<R: Resource>: Send + Sync {
    async fn list(&self) -> Result<Vec<R>, ApiError>;
}

#[async_trait]
pub trait EventSource: Send + Sync {
    async fn list_events(&self, filter: &EventFilter) -> Result<Vec<Event>, ApiError>;

    async fn upcoming_events(&self, limit: usize) -> Result<Vec<Event>, ApiError>;

    async fn get_event(&self, id: &str) -> Result<Event, ApiError>;
}

/// The signed-in user's agenda.
#[async_trait]
pub trait AgendaSource: Send + Sync {
    async fn get_agenda(&self) -> Result<AgendaResponse, ApiError>;
}
