#![allow(dead_code)]

use eventsync_core::models::{Alert, Event, Route};
use serde_json::{json, Value};

/// Base URL of a local port nothing listens on.
pub fn unreachable_base_url() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    format!("http://127.0.0.1:{}/api/v1", port)
}

pub fn event_json(id: &str, date: &str, title: &str) -> Value {
    json!({
        "_id": id,
        "title": title,
        "description": "Fiesta en el centro",
        "date": date,
        "time": "19:00",
        "location": "Parque Calderon",
        "coordinates": {"lat": -2.8975, "lng": -79.0045},
        "category": "cultural",
        "closed_streets": ["Simon Bolivar"]
    })
}

pub fn event(id: &str, date: &str, title: &str) -> Event {
    serde_json::from_value(event_json(id, date, title)).unwrap()
}

pub fn alert(id: &str, active: bool) -> Alert {
    serde_json::from_value(json!({
        "_id": id,
        "title": format!("Alerta {}", id),
        "description": "",
        "type": "cierre",
        "location": "Calle Larga",
        "coordinates": {"lat": -2.9, "lng": -79.0},
        "start_date": "2025-12-24T08:00:00",
        "end_date": "2025-12-24T20:00:00",
        "is_active": active
    }))
    .unwrap()
}

pub fn route_payload(name: &str) -> Value {
    json!({
        "name": name,
        "description": "Recorrido por iglesias",
        "category": "religiosa",
        "duration": "3 horas",
        "distance": "4 km",
        "difficulty": "moderada",
        "stops": [{"name": "Catedral", "coordinates": {"lat": -2.897, "lng": -79.004}}]
    })
}

pub fn route(id: &str, name: &str) -> Route {
    let mut value = route_payload(name);
    value["_id"] = json!(id);
    serde_json::from_value(value).unwrap()
}
