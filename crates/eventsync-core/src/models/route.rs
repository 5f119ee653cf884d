use serde::{Deserialize, Serialize};

use super::{Coordinates, Resource, ResourceKind, REFERENCE_STALE_AFTER};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteCategory {
    Gastronomica,
    Cultural,
    Religiosa,
    Aventura,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteDifficulty {
    Facil,
    Moderada,
    Dificil,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteStop {
    pub name: String,
    pub coordinates: Coordinates,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
    pub description: String,
    pub category: RouteCategory,
    /// Free text such as "4 horas".
    pub duration: String,
    /// Free text such as "2.5 km".
    pub distance: String,
    pub difficulty: RouteDifficulty,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    /// Ids of related events.
    #[serde(default)]
    pub events: Vec<String>,
    #[serde(default)]
    pub stops: Vec<RouteStop>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

impl Resource for Route {
    const KIND: ResourceKind = ResourceKind::Route;
    const STALE_AFTER: std::time::Duration = REFERENCE_STALE_AFTER;

    fn key(&self) -> &str {
        &self.id
    }
}
