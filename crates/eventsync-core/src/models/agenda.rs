use serde::{Deserialize, Serialize};

/// Per-user agenda as kept in the local store, keyed by `userId`.
///
/// The store does not enforce that an event id sits in only one set; the
/// `mark_*` helpers apply the same moves the server makes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgendaSnapshot {
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(default)]
    pub attending: Vec<String>,
    #[serde(default)]
    pub interested: Vec<String>,
}

impl AgendaSnapshot {
    pub fn empty(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Self::default()
        }
    }

    pub fn is_attending(&self, event_id: &str) -> bool {
        self.attending.iter().any(|id| id == event_id)
    }

    pub fn is_interested(&self, event_id: &str) -> bool {
        self.interested.iter().any(|id| id == event_id)
    }

    pub fn mark_attending(&mut self, event_id: &str) {
        self.interested.retain(|id| id != event_id);
        if !self.is_attending(event_id) {
            self.attending.push(event_id.to_string());
        }
    }

    pub fn mark_interested(&mut self, event_id: &str) {
        self.attending.retain(|id| id != event_id);
        if !self.is_interested(event_id) {
            self.interested.push(event_id.to_string());
        }
    }

    /// Drop the event from both sets (also what "not going" means locally).
    pub fn remove_event(&mut self, event_id: &str) {
        self.attending.retain(|id| id != event_id);
        self.interested.retain(|id| id != event_id);
    }
}

/// Agenda as returned by `GET /agenda`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgendaResponse {
    #[serde(rename = "_id")]
    pub id: String,
    pub user_id: String,
    #[serde(default)]
    pub attending: Vec<String>,
    #[serde(default)]
    pub interested: Vec<String>,
    #[serde(default)]
    pub not_going: Vec<String>,
    #[serde(default)]
    pub created_routes: Vec<String>,
    #[serde(default)]
    pub completed_routes: Vec<String>,
}

impl From<AgendaResponse> for AgendaSnapshot {
    fn from(response: AgendaResponse) -> Self {
        Self {
            user_id: response.user_id,
            attending: response.attending,
            interested: response.interested,
        }
    }
}
