//! Shared test utilities

#![allow(dead_code)]

use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use serde_json::Value;
use tokio::task::JoinHandle;
use tower::ServiceExt;

use outpost_gateway::api::ApiServerBuilder;
use outpost_gateway::store::StoreEvent;
use outpost_gateway::{Broker, Config, MemoryStore, SharedStore, StorePath};

/// Gateway wired to an in-process store
pub struct TestGateway {
    pub store: MemoryStore,
    pub broker: Broker,
    pub router: Router,
}

/// Set up a gateway with default configuration
#[must_use]
pub fn gateway() -> TestGateway {
    gateway_with(&Config::default())
}

/// Set up a gateway with the given configuration
#[must_use]
pub fn gateway_with(config: &Config) -> TestGateway {
    let store = MemoryStore::new();
    let broker = Broker::new(Arc::new(store.clone()), config);
    let router = ApiServerBuilder::new(broker.clone())
        .rate_limit(config.server.rate_limit_per_minute)
        .build()
        .router();
    TestGateway {
        store,
        broker,
        router,
    }
}

/// Build a request with an optional JSON body
pub fn request(method: &str, uri: &str, body: Option<&Value>) -> Request<Body> {
    let builder = Request::builder().method(method).uri(uri);
    match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .expect("valid request"),
        None => builder.body(Body::empty()).expect("valid request"),
    }
}

/// Send one request and decode the JSON response
pub async fn send(router: &Router, method: &str, uri: &str, body: Option<&Value>) -> (StatusCode, Value) {
    let response = router
        .clone()
        .oneshot(request(method, uri, body))
        .await
        .expect("router never fails");
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("JSON body")
    };
    (status, json)
}

/// Play a device that answers the next request of `kind` with `answer`
///
/// Resolves to the request the device saw.
pub fn answer_next(store: &MemoryStore, device: &str, kind: &str, answer: Value) -> JoinHandle<Value> {
    let store = store.clone();
    let requests = StorePath::parse(&format!("requests/{device}/{kind}")).expect("path");
    let responses = StorePath::parse(&format!("responses/{device}/{kind}")).expect("path");

    tokio::spawn(async move {
        let mut sub = store.watch_value(&requests).await.expect("watch");
        loop {
            match sub.next().await {
                Some(Ok(StoreEvent::Value(Some(request)))) => {
                    let mut response = answer.clone();
                    response["requestId"] = request["requestId"].clone();
                    store.set(&responses, response).await.expect("answer");
                    return request;
                }
                Some(Ok(_)) => {}
                other => panic!("request watch ended: {other:?}"),
            }
        }
    })
}

/// Commands queued for `device`, oldest first
#[must_use]
pub fn queued_commands(store: &MemoryStore, device: &str) -> Vec<Value> {
    let dump = store.dump();
    let Some(log) = dump["commands"][device].as_object() else {
        return Vec::new();
    };
    let mut keys: Vec<&String> = log.keys().collect();
    keys.sort();
    keys.into_iter().map(|k| log[k].clone()).collect()
}
