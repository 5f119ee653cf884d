//! Data models for the event-discovery backend.
//!
//! One canonical shape per resource type, shared by the network, cache and
//! caller layers:
//!
//! - `Event`: calendar events with location and itinerary
//! - `Alert`: traffic alerts (closures, detours, congestion)
//! - `Route`: tourist routes with ordered stops
//! - `User`: user profiles and roles
//! - `AgendaSnapshot`: per-user attending/interested event ids

pub mod agenda;
pub mod alert;
pub mod event;
pub mod route;
pub mod user;

use std::time::Duration;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::store::Collection;

pub use agenda::{AgendaResponse, AgendaSnapshot};
pub use alert::{Alert, AlertType};
pub use event::{Event, EventCategory, EventFilter, ItineraryItem};
pub use route::{Route, RouteCategory, RouteDifficulty, RouteStop};
pub use user::{User, UserRole};

/// Key prefix for records created locally and not yet confirmed by the server.
pub const PROVISIONAL_KEY_PREFIX: &str = "temp-";

/// Alerts change often; keep them fresh for only a few seconds.
pub const ALERTS_STALE_AFTER: Duration = Duration::from_secs(10);

/// Reference data (events, routes, users) changes slowly.
pub const REFERENCE_STALE_AFTER: Duration = Duration::from_secs(5 * 60);

/// Provisional key for a locally created record. `unique` must not repeat,
/// e.g. a `<millis>-<random>` id.
pub fn provisional_key(unique: &str) -> String {
    format!("{}{}", PROVISIONAL_KEY_PREFIX, unique)
}

pub fn is_provisional_key(key: &str) -> bool {
    key.starts_with(PROVISIONAL_KEY_PREFIX)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

/// The cached resource types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Event,
    Alert,
    Route,
    User,
}

impl ResourceKind {
    pub fn collection(&self) -> Collection {
        match self {
            ResourceKind::Event => Collection::Events,
            ResourceKind::Alert => Collection::Alerts,
            ResourceKind::Route => Collection::Routes,
            ResourceKind::User => Collection::Users,
        }
    }
}

/// A server resource mirrored in a local collection.
pub trait Resource: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const KIND: ResourceKind;

    /// How long a successful network result is served without re-fetching.
    const STALE_AFTER: Duration;

    /// Index used to order full listings, if the collection has one.
    const NATURAL_INDEX: Option<&'static str> = None;

    fn key(&self) -> &str;

    fn is_provisional(&self) -> bool {
        is_provisional_key(self.key())
    }
}
