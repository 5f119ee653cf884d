use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Coordinates, Resource, ResourceKind, REFERENCE_STALE_AFTER};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventCategory {
    Cultural,
    Religioso,
    Gastronomico,
    Artistico,
    Tradicional,
}

impl EventCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventCategory::Cultural => "cultural",
            EventCategory::Religioso => "religioso",
            EventCategory::Gastronomico => "gastronomico",
            EventCategory::Artistico => "artistico",
            EventCategory::Tradicional => "tradicional",
        }
    }
}

impl std::fmt::Display for EventCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cultural" => Ok(EventCategory::Cultural),
            "religioso" => Ok(EventCategory::Religioso),
            "gastronomico" => Ok(EventCategory::Gastronomico),
            "artistico" => Ok(EventCategory::Artistico),
            "tradicional" => Ok(EventCategory::Tradicional),
            other => Err(format!("unknown event category '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItineraryItem {
    pub time: String,
    pub activity: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "_id")]
    pub id: String,
    pub title: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub long_description: Option<String>,
    /// Start date as sent by the server (ISO 8601); the `by-date` index sorts on it.
    pub date: String,
    pub time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    pub coordinates: Coordinates,
    pub category: EventCategory,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
    // Some endpoints return image_url instead of image_id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default)]
    pub gallery: Vec<String>,
    #[serde(default)]
    pub itinerary: Vec<ItineraryItem>,
    #[serde(default)]
    pub closed_streets: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl Event {
    /// Parse the start date. Accepts RFC 3339, a naive date-time, or a bare date.
    pub fn starts_at(&self) -> Option<NaiveDateTime> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(&self.date) {
            return Some(dt.naive_utc());
        }
        for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
            if let Ok(dt) = NaiveDateTime::parse_from_str(&self.date, format) {
                return Some(dt);
            }
        }
        NaiveDate::parse_from_str(&self.date, "%Y-%m-%d")
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
    }

    /// Whether the event starts at or after `now`. Unparseable dates are not upcoming.
    pub fn is_upcoming(&self, now: DateTime<Utc>) -> bool {
        self.starts_at()
            .map(|start| start >= now.naive_utc())
            .unwrap_or(false)
    }
}

impl Resource for Event {
    const KIND: ResourceKind = ResourceKind::Event;
    const STALE_AFTER: std::time::Duration = REFERENCE_STALE_AFTER;
    const NATURAL_INDEX: Option<&'static str> = Some("by-date");

    fn key(&self) -> &str {
        &self.id
    }
}

/// Filters for event listings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct EventFilter {
    pub category: Option<EventCategory>,
    pub date: Option<String>,
    pub search: Option<String>,
}

impl EventFilter {
    pub fn category(category: EventCategory) -> Self {
        Self {
            category: Some(category),
            ..Self::default()
        }
    }

    /// Narrow searches (by date or text) are not mirrored into the local cache.
    pub fn is_cacheable(&self) -> bool {
        self.date.is_none() && self.search.is_none()
    }

    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if let Some(category) = self.category {
            pairs.push(("category", category.to_string()));
        }
        if let Some(ref date) = self.date {
            pairs.push(("date", date.clone()));
        }
        if let Some(ref search) = self.search {
            pairs.push(("search", search.clone()));
        }
        pairs
    }

    /// Apply the filter to cached events. Only the category can be checked offline.
    pub fn matches_offline(&self, event: &Event) -> bool {
        self.category.map(|c| c == event.category).unwrap_or(true)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample(id: &str, date: &str) -> Event {
        serde_json::from_value(serde_json::json!({
            "_id": id,
            "title": "Festival de Luces",
            "description": "El Centro Historico se ilumina",
            "date": date,
            "time": "18:00",
            "location": "Centro Historico",
            "coordinates": {"lat": -2.897, "lng": -79.004},
            "category": "cultural"
        }))
        .unwrap()
    }

    #[test]
    fn test_parse_server_event() {
        let json = r#"{"_id":"65a1","title":"Pase del Nino","description":"Desfile tradicional","date":"2025-12-24T09:00:00","time":"09:00","location":"Centro","coordinates":{"lat":-2.9,"lng":-79.0},"category":"tradicional","image_url":"/api/v1/images/abc","itinerary":[{"time":"09:00","activity":"Salida"}],"testimonials":[]}"#;
        let event: Event = serde_json::from_str(json).expect("Failed to parse event JSON");
        assert_eq!(event.id, "65a1");
        assert_eq!(event.category, EventCategory::Tradicional);
        assert_eq!(event.itinerary.len(), 1);
        assert!(event.gallery.is_empty());
        assert_eq!(event.key(), "65a1");
    }

    #[test]
    fn test_serializes_id_as_underscore_id() {
        let value = serde_json::to_value(sample("e1", "2025-01-01")).unwrap();
        assert_eq!(value["_id"], "e1");
        assert!(value.get("long_description").is_none());
    }

    #[test]
    fn test_starts_at_formats() {
        assert!(sample("a", "2025-12-24T18:00:00").starts_at().is_some());
        assert!(sample("b", "2025-12-24T18:00:00.123").starts_at().is_some());
        assert!(sample("c", "2025-12-24T18:00:00Z").starts_at().is_some());
        assert!(sample("d", "2025-12-24").starts_at().is_some());
        assert!(sample("e", "next tuesday").starts_at().is_none());
    }

    #[test]
    fn test_is_upcoming() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        assert!(sample("a", "2025-06-01T12:00:00").is_upcoming(now));
        assert!(sample("b", "2025-07-01").is_upcoming(now));
        assert!(!sample("c", "2025-05-31T23:59:59").is_upcoming(now));
        assert!(!sample("d", "TBD").is_upcoming(now));
    }

    #[test]
    fn test_filter_cacheability_and_query() {
        let filter = EventFilter::category(EventCategory::Gastronomico);
        assert!(filter.is_cacheable());
        assert_eq!(filter.query_pairs(), vec![("category", "gastronomico".to_string())]);

        let search = EventFilter {
            search: Some("luces".to_string()),
            ..EventFilter::default()
        };
        assert!(!search.is_cacheable());
    }

    #[test]
    fn test_category_round_trip_from_str() {
        assert_eq!("Cultural".parse::<EventCategory>(), Ok(EventCategory::Cultural));
        assert!("sports".parse::<EventCategory>().is_err());
    }
}
