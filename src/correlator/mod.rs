//! Request/response correlation over the shared store
//!
//! A wait writes one request into the device's request slot for its kind and
//! watches the matching response slot. Only a response echoing the request's
//! ID resolves the wait; anything else is a leftover from an earlier request
//! and is left alone.
//!
//! ```text
//!  operator ──await_response──▶ requests/{device}/{kind}  = {requestId, ...params}
//!                                         │ device drains, works, answers
//!  operator ◀── Reply ───────── responses/{device}/{kind} = {requestId, ...result}
//! ```

pub mod flight;
pub mod kind;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};
use tokio::time::Instant;

pub use flight::SingleFlight;
pub use kind::RequestKind;

use crate::store::{
    SharedStoreRef, StoreEvent, StorePath, now_ms, server_timestamp, validate_segment,
};
use crate::{Error, Result};

/// Store node holding the per-kind request slots
pub const REQUESTS_ROOT: &str = "requests";

/// Store node holding the per-kind response slots
pub const RESPONSES_ROOT: &str = "responses";

/// Response member echoing the request ID
const REQUEST_ID_FIELD: &str = "requestId";

/// Identifier tying a response to the request that asked for it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl RequestId {
    /// Numeric value
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Whether a response's `requestId` member refers to this request
    ///
    /// Devices echo the ID either as the string it was sent as or as a number.
    fn matches(self, echoed: &Value) -> bool {
        match echoed {
            Value::String(s) => s.parse::<u64>().is_ok_and(|n| n == self.0),
            Value::Number(n) => n.as_u64() == Some(self.0),
            _ => false,
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for RequestId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Strictly increasing request IDs
///
/// Seeded from the wall clock (milliseconds) and never lower than it, so IDs
/// stay ahead of those issued by an earlier run of the process.
#[derive(Debug)]
pub struct RequestIds {
    last: AtomicU64,
}

impl Default for RequestIds {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestIds {
    /// Create a generator seeded with the current time
    #[must_use]
    pub fn new() -> Self {
        Self {
            last: AtomicU64::new(wall_clock_ms().saturating_sub(1)),
        }
    }

    /// Issue the next ID
    pub fn next_id(&self) -> RequestId {
        let floor = wall_clock_ms();
        let mut issued = 0;
        // The closure always returns Some, so the update cannot fail
        let _ = self.last.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |prev| {
            issued = prev.saturating_add(1).max(floor);
            Some(issued)
        });
        RequestId(issued)
    }
}

fn wall_clock_ms() -> u64 {
    u64::try_from(now_ms()).unwrap_or_default()
}

/// A device's answer to one request
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    /// ID of the request this answers
    pub request_id: RequestId,
    /// Response members other than the echoed ID
    pub payload: Map<String, Value>,
    /// Time from call to match
    pub elapsed: Duration,
}

impl Reply {
    /// Result member for `kind`, if the device included it
    #[must_use]
    pub fn result(&self, kind: RequestKind) -> Option<&Value> {
        self.payload.get(kind.result_field())
    }
}

/// Issues requests and waits for the matching responses
#[derive(Debug)]
pub struct Correlator {
    store: SharedStoreRef,
    ids: RequestIds,
    flights: SingleFlight<(String, RequestKind)>,
    timeouts: HashMap<RequestKind, Duration>,
}

impl Correlator {
    /// Create a correlator with the default per-kind timeouts
    #[must_use]
    pub fn new(store: SharedStoreRef) -> Self {
        Self {
            store,
            ids: RequestIds::new(),
            flights: SingleFlight::new(),
            timeouts: HashMap::new(),
        }
    }

    /// Override the default wait window for `kind`
    #[must_use]
    pub fn with_timeout(mut self, kind: RequestKind, timeout: Duration) -> Self {
        self.timeouts.insert(kind, timeout);
        self
    }

    /// Wait window used when the caller does not pass one
    #[must_use]
    pub fn timeout_for(&self, kind: RequestKind) -> Duration {
        self.timeouts
            .get(&kind)
            .copied()
            .unwrap_or_else(|| kind.default_timeout())
    }

    /// Number of `(device, kind)` keys with a wait in progress or queued
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.flights.in_flight()
    }

    /// Ask `device_id` for `kind` and wait for its answer
    ///
    /// `params` must be a JSON object (or null); its members are written next
    /// to the request ID. Calls for the same `(device_id, kind)` run one at a
    /// time; `timeout` covers the time spent queued behind an earlier call.
    ///
    /// # Errors
    ///
    /// - `Error::Validation` for a bad device ID or non-object params
    /// - `Error::TimedOut` if no matching response arrives in time
    /// - `Error::StoreUnavailable` if the store rejects a write or the
    ///   subscription fails
    pub async fn await_response(
        &self,
        device_id: &str,
        kind: RequestKind,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Reply> {
        validate_segment(device_id)?;
        let mut record = match params {
            Value::Null => Map::new(),
            Value::Object(map) => map,
            other => {
                return Err(Error::Validation(format!(
                    "request params must be an object, got {other}"
                )));
            }
        };

        let started = Instant::now();
        let deadline = started + timeout.unwrap_or_else(|| self.timeout_for(kind));
        let timed_out = || Error::TimedOut {
            device_id: device_id.to_string(),
            kind,
            elapsed: started.elapsed(),
        };

        let Some(_flight) = self
            .flights
            .acquire_until((device_id.to_string(), kind), deadline)
            .await
        else {
            tracing::warn!(device_id = %device_id, kind = %kind, "timed out queued behind an earlier request");
            return Err(timed_out());
        };

        let request_id = self.ids.next_id();
        let request_path = StorePath::new(REQUESTS_ROOT)?
            .child(device_id)?
            .child(kind.as_str())?;
        let response_path = StorePath::new(RESPONSES_ROOT)?
            .child(device_id)?
            .child(kind.as_str())?;

        // Watch before writing so a fast device cannot answer unseen
        let mut subscription = self.store.watch_value(&response_path).await?;

        record.insert(REQUEST_ID_FIELD.to_string(), Value::from(request_id.to_string()));
        record.insert("timestamp".to_string(), server_timestamp());
        self.store.set(&request_path, Value::Object(record)).await?;

        tracing::debug!(device_id = %device_id, kind = %kind, request_id = %request_id, "request issued");

        let outcome = loop {
            tokio::select! {
                biased;
                event = subscription.next() => match event {
                    Some(Ok(StoreEvent::Value(Some(response)))) => {
                        if let Some(payload) = take_match(request_id, response) {
                            break Ok(payload);
                        }
                        tracing::debug!(
                            device_id = %device_id,
                            kind = %kind,
                            request_id = %request_id,
                            "stale response ignored"
                        );
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Err(e),
                    None => {
                        break Err(Error::StoreUnavailable(format!(
                            "response subscription for {response_path} closed"
                        )));
                    }
                },
                () = tokio::time::sleep_until(deadline) => break Err(timed_out()),
            }
        };
        drop(subscription);

        let payload = match outcome {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(
                    device_id = %device_id,
                    kind = %kind,
                    request_id = %request_id,
                    elapsed = ?started.elapsed(),
                    error = %e,
                    "request failed"
                );
                return Err(e);
            }
        };

        // Consume the response; the data is already in hand, so a failed
        // delete only leaves a stale entry the next wait will ignore
        if let Err(e) = self.store.remove(&response_path).await {
            tracing::warn!(path = %response_path, error = %e, "failed to consume response");
        }

        let elapsed = started.elapsed();
        tracing::info!(
            device_id = %device_id,
            kind = %kind,
            request_id = %request_id,
            elapsed = ?elapsed,
            "response received"
        );

        Ok(Reply {
            request_id,
            payload,
            elapsed,
        })
    }
}

/// Strip the echoed ID from `response` if it answers `request_id`
fn take_match(request_id: RequestId, response: Value) -> Option<Map<String, Value>> {
    let Value::Object(mut members) = response else {
        return None;
    };
    if !members
        .get(REQUEST_ID_FIELD)
        .is_some_and(|echoed| request_id.matches(echoed))
    {
        return None;
    }
    members.remove(REQUEST_ID_FIELD);
    Some(members)
}
