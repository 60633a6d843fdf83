//! JSON tree helpers shared by the store backends
//!
//! Both backends keep (a view of) the database as one `serde_json::Value`
//! tree. Empty objects and nulls are pruned so that "absent" has exactly one
//! representation, matching the hosted database's behaviour.

use serde_json::{Map, Value};

/// Placeholder key the store replaces with its own clock
const SERVER_VALUE_KEY: &str = ".sv";

/// Value that resolves to the store's current time (Unix milliseconds) on write
#[must_use]
pub fn server_timestamp() -> Value {
    serde_json::json!({ SERVER_VALUE_KEY: "timestamp" })
}

/// Read the value at `segments`, if any
#[must_use]
pub fn get_at<'a>(root: &'a Value, segments: &[String]) -> Option<&'a Value> {
    let mut node = root;
    for segment in segments {
        node = node.as_object()?.get(segment)?;
    }
    if node.is_null() { None } else { Some(node) }
}

/// Replace the value at `segments`; `Value::Null` removes it
pub fn set_at(root: &mut Value, segments: &[String], value: Value) {
    let Some((last, parents)) = segments.split_last() else {
        *root = prune(value);
        return;
    };

    let value = prune(value);
    if value.is_null() {
        remove_at(root, segments);
        return;
    }

    let mut node = root;
    for segment in parents {
        node = ensure_object(node)
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    ensure_object(node).insert(last.clone(), value);
}

/// Shallow-merge `fields` into the object at `segments`
///
/// Null members remove the corresponding child.
pub fn merge_at(root: &mut Value, segments: &[String], fields: Map<String, Value>) {
    for (key, value) in fields {
        let mut child = segments.to_vec();
        child.push(key);
        set_at(root, &child, value);
    }
}

/// Remove the value at `segments`, pruning parents left empty
pub fn remove_at(root: &mut Value, segments: &[String]) {
    let Some((last, parents)) = segments.split_last() else {
        *root = Value::Null;
        return;
    };

    if let Some(parent) = get_object_mut(root, parents) {
        parent.remove(last);
    }

    // Prune empty ancestors bottom-up
    for depth in (0..parents.len()).rev() {
        let (prefix, key) = (&parents[..depth], &parents[depth]);
        let Some(parent) = get_object_mut(root, prefix) else {
            break;
        };
        let empty = parent
            .get(key)
            .is_some_and(|v| v.as_object().is_some_and(Map::is_empty));
        if !empty {
            break;
        }
        parent.remove(key);
    }
}

/// Keys of the object at `segments`, in store order (lexicographic)
#[must_use]
pub fn child_keys(root: &Value, segments: &[String]) -> Vec<String> {
    let mut keys: Vec<String> = get_at(root, segments)
        .and_then(Value::as_object)
        .map(|obj| obj.keys().cloned().collect())
        .unwrap_or_default();
    keys.sort();
    keys
}

/// Replace every server-value placeholder in `value` with `now_ms`
#[must_use]
pub fn resolve_server_values(value: Value, now_ms: i64) -> Value {
    match value {
        Value::Object(map) if is_timestamp_placeholder(&map) => Value::from(now_ms),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, resolve_server_values(v, now_ms)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|v| resolve_server_values(v, now_ms))
                .collect(),
        ),
        other => other,
    }
}

fn is_timestamp_placeholder(map: &Map<String, Value>) -> bool {
    map.len() == 1 && map.get(SERVER_VALUE_KEY).and_then(Value::as_str) == Some("timestamp")
}

/// Drop nulls and empty objects recursively
fn prune(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let pruned: Map<String, Value> = map
                .into_iter()
                .map(|(k, v)| (k, prune(v)))
                .filter(|(_, v)| !v.is_null())
                .collect();
            if pruned.is_empty() {
                Value::Null
            } else {
                Value::Object(pruned)
            }
        }
        other => other,
    }
}

fn ensure_object(node: &mut Value) -> &mut Map<String, Value> {
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    match node {
        Value::Object(map) => map,
        _ => unreachable!("node was just replaced with an object"),
    }
}

fn get_object_mut<'a>(root: &'a mut Value, segments: &[String]) -> Option<&'a mut Map<String, Value>> {
    let mut node = root;
    for segment in segments {
        node = node.as_object_mut()?.get_mut(segment)?;
    }
    node.as_object_mut()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn segs(raw: &str) -> Vec<String> {
        raw.split('/').map(ToString::to_string).collect()
    }

    #[test]
    fn set_creates_intermediate_objects() {
        let mut root = Value::Null;
        set_at(&mut root, &segs("requests/dev1/sms"), json!({"requestId": "1"}));
        assert_eq!(root, json!({"requests": {"dev1": {"sms": {"requestId": "1"}}}}));
        assert_eq!(
            get_at(&root, &segs("requests/dev1/sms/requestId")),
            Some(&json!("1"))
        );
    }

    #[test]
    fn remove_prunes_empty_parents() {
        let mut root = json!({"responses": {"dev1": {"sms": {"requestId": "1"}}}, "keep": 1});
        remove_at(&mut root, &segs("responses/dev1/sms"));
        assert_eq!(root, json!({"keep": 1}));
    }

    #[test]
    fn setting_null_or_empty_removes() {
        let mut root = json!({"a": {"b": 1, "c": 2}});
        set_at(&mut root, &segs("a/b"), Value::Null);
        set_at(&mut root, &segs("a/c"), json!({}));
        assert_eq!(root, json!({}));
        assert!(get_at(&root, &segs("a")).is_none());
    }

    #[test]
    fn merge_is_shallow() {
        let mut root = json!({"d": {"info": {"model": "x"}, "online": false}});
        let fields = json!({"online": true, "lastSeen": 5}).as_object().cloned().unwrap();
        merge_at(&mut root, &segs("d"), fields);
        assert_eq!(root, json!({"d": {"info": {"model": "x"}, "online": true, "lastSeen": 5}}));
    }

    #[test]
    fn resolves_nested_timestamps() {
        let value = json!({"timestamp": server_timestamp(), "inner": [server_timestamp()], "n": 1});
        assert_eq!(
            resolve_server_values(value, 42),
            json!({"timestamp": 42, "inner": [42], "n": 1})
        );
    }

    #[test]
    fn child_keys_are_sorted() {
        let root = json!({"c": {"b": 1, "a": 2, "c": 3}});
        assert_eq!(child_keys(&root, &segs("c")), ["a", "b", "c"]);
        assert!(child_keys(&root, &segs("missing")).is_empty());
    }
}
