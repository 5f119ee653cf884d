use serde::{Deserialize, Serialize};

use super::{Coordinates, Resource, ResourceKind, ALERTS_STALE_AFTER};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertType {
    /// Street closure
    Cierre,
    /// Detour
    Desvio,
    Congestion,
}

impl std::fmt::Display for AlertType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertType::Cierre => write!(f, "Closure"),
            AlertType::Desvio => write!(f, "Detour"),
            AlertType::Congestion => write!(f, "Congestion"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    #[serde(rename = "_id")]
    pub id: String,
    pub title: String,
    pub description: String,
    #[serde(rename = "type")]
    pub alert_type: AlertType,
    pub location: String,
    pub coordinates: Coordinates,
    pub start_date: String,
    pub end_date: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    /// Drives the `by-active` index.
    #[serde(default)]
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

impl Resource for Alert {
    const KIND: ResourceKind = ResourceKind::Alert;
    const STALE_AFTER: std::time::Duration = ALERTS_STALE_AFTER;

    fn key(&self) -> &str {
        &self.id
    }
}
