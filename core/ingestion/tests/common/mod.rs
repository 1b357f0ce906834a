#![allow(dead_code)]

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
};
use jarvis_composer::{PromptRenderer, ReplyFailurePolicy, ReplySynthesizer};
use jarvis_ingestion::{
    build_router, AppState, Clock, Database, KeyVault, ManualClock, ServiceConfig,
    WakeWordDetector,
};
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceExt;

/// 2025-11-07T00:00:00Z
pub const T0: f64 = 1_762_473_600.0;

pub struct TestApp {
    pub state: AppState,
    pub clock: Arc<ManualClock>,
}

pub fn test_app() -> TestApp {
    test_app_with_policy(ReplyFailurePolicy::Fallback)
}

/// App with an in-memory store, a manual clock and no reply providers
pub fn test_app_with_policy(policy: ReplyFailurePolicy) -> TestApp {
    test_app_with_db(Database::in_memory().unwrap(), policy)
}

pub fn test_app_with_db(db: Database, policy: ReplyFailurePolicy) -> TestApp {
    let config = ServiceConfig::from_lookup(|_: &str| None).unwrap();
    let clock = Arc::new(ManualClock::new(T0));
    let dyn_clock: Arc<dyn Clock> = clock.clone();

    let state = AppState::assemble(
        &config,
        db,
        WakeWordDetector::for_assistant("Jarvis", &[]).unwrap(),
        ReplySynthesizer::new(Vec::new(), PromptRenderer::default(), policy),
        KeyVault::ephemeral(),
        dyn_clock,
    );

    TestApp { state, clock }
}

impl TestApp {
    pub async fn send(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        headers: &[(&str, &str)],
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().uri(uri).method(method);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }

        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(serde_json::to_string(&body).unwrap()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = build_router(self.state.clone())
            .oneshot(request)
            .await
            .unwrap();
        let status = response.status();

        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };

        (status, json)
    }

    pub async fn get(&self, uri: &str) -> (StatusCode, Value) {
        self.send(Method::GET, uri, None, &[]).await
    }

    pub async fn post(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        self.send(Method::POST, uri, Some(body), &[]).await
    }
}
