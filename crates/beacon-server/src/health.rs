//! Serving status and the HTTP health endpoint

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServingStatus {
    Serving,
    NotServing,
    ServiceUnknown,
}

impl ServingStatus {
    fn http_status(self) -> StatusCode {
        match self {
            Self::Serving => StatusCode::OK,
            Self::NotServing => StatusCode::SERVICE_UNAVAILABLE,
            Self::ServiceUnknown => StatusCode::NOT_FOUND,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ServingStatus,
}

/// Per-service serving status shared with the health endpoint
#[derive(Clone, Default)]
pub struct HealthReporter {
    statuses: Arc<DashMap<String, ServingStatus>>,
}

impl HealthReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_serving(&self, service: &str) {
        self.set(service, ServingStatus::Serving);
    }

    pub fn set_not_serving(&self, service: &str) {
        self.set(service, ServingStatus::NotServing);
    }

    pub fn status(&self, service: &str) -> ServingStatus {
        self.statuses
            .get(service)
            .map(|s| *s)
            .unwrap_or(ServingStatus::ServiceUnknown)
    }

    /// Serving only while every known service is serving
    pub fn overall(&self) -> ServingStatus {
        if self
            .statuses
            .iter()
            .all(|entry| *entry.value() == ServingStatus::Serving)
        {
            ServingStatus::Serving
        } else {
            ServingStatus::NotServing
        }
    }

    /// Mark every service as not serving so checks fail before deregistration
    pub fn shutdown(&self) {
        for mut entry in self.statuses.iter_mut() {
            *entry.value_mut() = ServingStatus::NotServing;
        }
        info!("health reporter shut down");
    }

    fn set(&self, service: &str, status: ServingStatus) {
        let previous = self.statuses.insert(service.to_string(), status);
        if previous != Some(status) {
            info!(%service, ?status, "serving status changed");
        }
    }

    /// `GET /health` and `GET /health/:service`
    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(overall_health))
            .route("/health/:service", get(service_health))
            .with_state(self.clone())
    }
}

async fn overall_health(
    State(reporter): State<HealthReporter>,
) -> (StatusCode, Json<HealthResponse>) {
    respond(reporter.overall())
}

async fn service_health(
    State(reporter): State<HealthReporter>,
    Path(service): Path<String>,
) -> (StatusCode, Json<HealthResponse>) {
    respond(reporter.status(&service))
}

fn respond(status: ServingStatus) -> (StatusCode, Json<HealthResponse>) {
    (status.http_status(), Json(HealthResponse { status }))
}
