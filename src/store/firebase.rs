//! Firebase Realtime Database backend
//!
//! Plain operations map onto the REST API (`PUT`/`PATCH`/`POST`/`DELETE` on
//! `<path>.json`). Subscriptions use the streaming endpoint: a `GET` with
//! `Accept: text/event-stream` that emits `put`/`patch` events relative to the
//! watched path. Each subscription keeps a local view of its subtree and turns
//! those events into [`StoreEvent`]s.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Url;
use reqwest::header::ACCEPT;
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use super::{SharedStore, StoreEvent, StorePath, Subscription, tree};
use crate::{Error, Result};

/// Connect timeout for every request
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Firebase backend configuration
#[derive(Debug, Clone)]
pub struct FirebaseConfig {
    /// Database URL, e.g. `https://my-app-default-rtdb.firebaseio.com`
    pub database_url: String,
    /// Database secret or ID token passed as the `auth` query parameter
    pub auth_token: Option<String>,
}

/// Store backed by a Firebase Realtime Database
#[derive(Debug, Clone)]
pub struct FirebaseStore {
    client: reqwest::Client,
    base_url: Url,
    auth_token: Option<String>,
}

/// Body of a streaming `put`/`patch` event
#[derive(Debug, Deserialize)]
struct EventBody {
    path: String,
    #[serde(default)]
    data: Value,
}

/// Response of a `POST` (push)
#[derive(Debug, Deserialize)]
struct PushResponse {
    name: String,
}

impl FirebaseStore {
    /// Create a client for the configured database
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the URL is empty or the HTTP client cannot be built
    pub fn new(config: FirebaseConfig) -> Result<Self> {
        let raw = config.database_url.trim().trim_end_matches('/');
        if raw.is_empty() {
            return Err(Error::Config("firebase database URL is required".to_string()));
        }
        let base_url = Url::parse(raw)
            .map_err(|e| Error::Config(format!("invalid firebase database URL '{raw}': {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(Error::Config(format!("firebase database URL '{raw}' cannot hold paths")));
        }

        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url,
            auth_token: config.auth_token.filter(|t| !t.is_empty()),
        })
    }

    /// REST URL of `path`; every segment is percent-encoded
    fn url(&self, path: &StorePath) -> Result<Url> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|()| Error::Config(format!("firebase database URL '{}' cannot hold paths", self.base_url)))?;
            segments.pop_if_empty();
            match path.segments().split_last() {
                None => {
                    segments.push(".json");
                }
                Some((last, parents)) => {
                    segments.extend(parents);
                    segments.push(&format!("{last}.json"));
                }
            }
        }
        Ok(url)
    }

    fn with_auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_token {
            Some(token) => request.query(&[("auth", token.as_str())]),
            None => request,
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        self.with_auth(request)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| Error::StoreUnavailable(format!("firebase request failed: {e}")))
    }

    async fn watch(&self, path: &StorePath, children: bool) -> Result<Subscription> {
        let response = self
            .send(self.client.get(self.url(path)?).header(ACCEPT, "text/event-stream"))
            .await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let label = path.to_string();
        tracing::debug!(path = %label, children, "firebase stream opened");

        let task = tokio::spawn(pump_events(response, children, tx, label));
        Ok(Subscription::new(rx, move || task.abort()))
    }
}

#[async_trait]
impl SharedStore for FirebaseStore {
    fn backend(&self) -> &'static str {
        "firebase"
    }

    async fn get(&self, path: &StorePath) -> Result<Option<Value>> {
        let value: Value = self
            .send(self.client.get(self.url(path)?))
            .await?
            .json()
            .await
            .map_err(|e| Error::StoreUnavailable(format!("invalid firebase response: {e}")))?;
        Ok(if value.is_null() { None } else { Some(value) })
    }

    async fn set(&self, path: &StorePath, value: Value) -> Result<()> {
        self.send(self.client.put(self.url(path)?).json(&value)).await?;
        Ok(())
    }

    async fn update(&self, path: &StorePath, fields: Map<String, Value>) -> Result<()> {
        self.send(self.client.patch(self.url(path)?).json(&fields)).await?;
        Ok(())
    }

    async fn push(&self, path: &StorePath, value: Value) -> Result<String> {
        let pushed: PushResponse = self
            .send(self.client.post(self.url(path)?).json(&value))
            .await?
            .json()
            .await
            .map_err(|e| Error::StoreUnavailable(format!("invalid firebase push response: {e}")))?;
        Ok(pushed.name)
    }

    async fn remove(&self, path: &StorePath) -> Result<()> {
        self.send(self.client.delete(self.url(path)?)).await?;
        Ok(())
    }

    async fn watch_value(&self, path: &StorePath) -> Result<Subscription> {
        self.watch(path, false).await
    }

    async fn watch_children(&self, path: &StorePath) -> Result<Subscription> {
        self.watch(path, true).await
    }

    async fn ping(&self) -> Result<()> {
        self.send(
            self.client
                .get(self.url(&StorePath::root())?)
                .query(&[("shallow", "true")]),
        )
        .await?;
        Ok(())
    }
}

/// Translate a streaming response into subscription events until it ends
async fn pump_events(
    response: reqwest::Response,
    children: bool,
    tx: mpsc::UnboundedSender<Result<StoreEvent>>,
    label: String,
) {
    let mut view = StreamView::new(children);
    let mut parser = SseParser::default();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                let _ = tx.send(Err(Error::StoreUnavailable(format!(
                    "firebase stream for {label} failed: {e}"
                ))));
                return;
            }
        };

        for event in parser.feed(&chunk) {
            match event.event.as_str() {
                "put" | "patch" => {
                    let body: EventBody = match serde_json::from_str(&event.data) {
                        Ok(body) => body,
                        Err(e) => {
                            tracing::warn!(path = %label, error = %e, "malformed firebase event");
                            continue;
                        }
                    };
                    for out in view.apply(event.event == "patch", body) {
                        if tx.send(Ok(out)).is_err() {
                            return;
                        }
                    }
                }
                "keep-alive" => {}
                "cancel" | "auth_revoked" => {
                    let _ = tx.send(Err(Error::StoreUnavailable(format!(
                        "firebase stream for {label} ended: {}",
                        event.event
                    ))));
                    return;
                }
                other => tracing::trace!(path = %label, event = other, "ignored firebase event"),
            }
        }
    }

    let _ = tx.send(Err(Error::StoreUnavailable(format!(
        "firebase stream for {label} closed"
    ))));
}

/// Local copy of a watched subtree
#[derive(Debug)]
struct StreamView {
    root: Value,
    children: bool,
    last_value: Option<Option<Value>>,
    known: BTreeSet<String>,
}

impl StreamView {
    const fn new(children: bool) -> Self {
        Self {
            root: Value::Null,
            children,
            last_value: None,
            known: BTreeSet::new(),
        }
    }

    fn apply(&mut self, patch: bool, body: EventBody) -> Vec<StoreEvent> {
        let segments: Vec<String> = body
            .path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .collect();

        if patch {
            if let Value::Object(fields) = body.data {
                tree::merge_at(&mut self.root, &segments, fields);
            }
        } else {
            tree::set_at(&mut self.root, &segments, body.data);
        }

        if self.children {
            let keys = tree::child_keys(&self.root, &[]);
            let added: Vec<StoreEvent> = keys
                .iter()
                .filter(|k| !self.known.contains(*k))
                .map(|key| StoreEvent::ChildAdded {
                    key: key.clone(),
                    value: self.root.get(key).cloned().unwrap_or(Value::Null),
                })
                .collect();
            self.known = keys.into_iter().collect();
            added
        } else {
            let current = tree::get_at(&self.root, &[]).cloned();
            if self.last_value.as_ref() == Some(&current) {
                return Vec::new();
            }
            self.last_value = Some(current.clone());
            vec![StoreEvent::Value(current)]
        }
    }
}

/// One server-sent event
#[derive(Debug, PartialEq, Eq)]
struct SseEvent {
    event: String,
    data: String,
}

/// Incremental `text/event-stream` parser
#[derive(Debug, Default)]
struct SseParser {
    buf: Vec<u8>,
    event: String,
    data: String,
}

impl SseParser {
    fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buf.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if !self.event.is_empty() || !self.data.is_empty() {
                    events.push(SseEvent {
                        event: std::mem::take(&mut self.event),
                        data: std::mem::take(&mut self.data),
                    });
                }
            } else if let Some(name) = line.strip_prefix("event:") {
                self.event = name.trim().to_string();
            } else if let Some(data) = line.strip_prefix("data:") {
                if !self.data.is_empty() {
                    self.data.push('\n');
                }
                self.data.push_str(data.trim_start());
            }
        }

        events
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parser_handles_split_chunks() {
        let mut parser = SseParser::default();
        assert!(parser.feed(b"event: put\r\ndata: {\"path\":\"/\",").is_empty());
        let events = parser.feed(b"\"data\":null}\r\n\r\nevent: keep-alive\ndata: null\n\n");
        assert_eq!(
            events,
            vec![
                SseEvent {
                    event: "put".to_string(),
                    data: r#"{"path":"/","data":null}"#.to_string(),
                },
                SseEvent {
                    event: "keep-alive".to_string(),
                    data: "null".to_string(),
                },
            ]
        );
    }

    #[test]
    fn value_view_applies_put_and_patch() {
        let mut view = StreamView::new(false);

        let first = view.apply(false, EventBody { path: "/".into(), data: Value::Null });
        assert_eq!(first, vec![StoreEvent::Value(None)]);

        let put = view.apply(
            false,
            EventBody { path: "/".into(), data: json!({"requestId": "7", "smsList": []}) },
        );
        assert_eq!(put, vec![StoreEvent::Value(Some(json!({"requestId": "7", "smsList": []})))]);

        let patch = view.apply(true, EventBody { path: "/".into(), data: json!({"requestId": "8"}) });
        assert_eq!(
            patch,
            vec![StoreEvent::Value(Some(json!({"requestId": "8", "smsList": []})))]
        );

        // Re-delivery of the same state is suppressed
        let repeat = view.apply(true, EventBody { path: "/".into(), data: json!({"requestId": "8"}) });
        assert!(repeat.is_empty());
    }

    #[test]
    fn child_view_reports_new_keys_only() {
        let mut view = StreamView::new(true);
        let initial = view.apply(false, EventBody { path: "/".into(), data: json!({"-a": {"n": 1}}) });
        assert_eq!(initial.len(), 1);

        let appended = view.apply(false, EventBody { path: "/-b".into(), data: json!({"n": 2}) });
        assert_eq!(
            appended,
            vec![StoreEvent::ChildAdded { key: "-b".to_string(), value: json!({"n": 2}) }]
        );

        let edited = view.apply(false, EventBody { path: "/-a/n".into(), data: json!(5) });
        assert!(edited.is_empty());
    }

    #[test]
    fn rejects_empty_database_url() {
        let err = FirebaseStore::new(FirebaseConfig {
            database_url: "  ".to_string(),
            auth_token: None,
        })
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn builds_rest_urls() {
        let store = FirebaseStore::new(FirebaseConfig {
            database_url: "https://example.firebaseio.com/".to_string(),
            auth_token: Some(String::new()),
        })
        .unwrap();
        assert!(store.auth_token.is_none());
        assert_eq!(
            store.url(&StorePath::parse("requests/dev1/sms").unwrap()).unwrap().as_str(),
            "https://example.firebaseio.com/requests/dev1/sms.json"
        );
        assert_eq!(
            store.url(&StorePath::root()).unwrap().as_str(),
            "https://example.firebaseio.com/.json"
        );
    }

    #[test]
    fn url_escapes_segments() {
        let store = FirebaseStore::new(FirebaseConfig {
            database_url: "https://example.firebaseio.com".to_string(),
            auth_token: None,
        })
        .unwrap();
        let path = StorePath::new("requests").unwrap().child("dev?1 %").unwrap().child("sms").unwrap();

        let url = store.url(&path).unwrap();
        assert_eq!(url.path(), "/requests/dev%3F1%20%25/sms.json");
        assert_eq!(url.query(), None);
        assert_eq!(url.path_segments().unwrap().count(), 3);
    }

    #[test]
    fn rejects_unparsable_database_url() {
        let err = FirebaseStore::new(FirebaseConfig {
            database_url: "not a url".to_string(),
            auth_token: None,
        })
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
