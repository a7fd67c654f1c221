use serde_json::{Map, Value};

/// Computes an RFC 7396 JSON merge patch that, applied to `live`, advances it
/// toward `desired` while leaving alone any field `desired` did not itself
/// change relative to `previous`. This is what lets externally-mutated
/// fields (defaulted by an admission webhook, a HorizontalPodAutoscaler
/// bumping replicas, etc.) survive repeated synthesis as long as the
/// synthesizer output didn't also touch them.
///
/// `previous` and `desired` are manifests emitted on two consecutive
/// syntheses (or `desired` alone, with `previous` empty, on first apply).
/// `live` is the object currently on the cluster.
pub fn three_way_merge_patch(previous: &Value, desired: &Value, live: &Value) -> Value {
    match (previous, desired, live) {
        (Value::Object(previous), Value::Object(desired), Value::Object(live)) => {
            Value::Object(three_way_merge_object(previous, desired, live))
        }
        // Non-object nodes can't be merged structurally; a real change forces
        // the desired value wholesale.
        _ => {
            if desired != live {
                desired.clone()
            } else {
                Value::Object(Map::new())
            }
        }
    }
}

fn three_way_merge_object(
    previous: &Map<String, Value>,
    desired: &Map<String, Value>,
    live: &Map<String, Value>,
) -> Map<String, Value> {
    let mut patch = Map::new();

    for (key, desired_value) in desired {
        match previous.get(key) {
            None => {
                // Key newly introduced by this synthesis.
                if live.get(key) != Some(desired_value) {
                    patch.insert(key.clone(), desired_value.clone());
                }
            }
            Some(previous_value) if previous_value == desired_value => {
                // Synthesizer didn't touch this field; leave live's value
                // (possibly drifted externally) untouched.
            }
            Some(previous_value) => {
                let live_value = live.get(key).unwrap_or(&Value::Null);
                match (previous_value, desired_value, live_value) {
                    (Value::Object(p), Value::Object(d), Value::Object(l)) => {
                        let nested = three_way_merge_object(p, d, l);
                        if !nested.is_empty() {
                            patch.insert(key.clone(), Value::Object(nested));
                        }
                    }
                    _ => {
                        if live_value != desired_value {
                            patch.insert(key.clone(), desired_value.clone());
                        }
                    }
                }
            }
        }
    }

    for key in previous.keys() {
        if !desired.contains_key(key) && live.contains_key(key) {
            patch.insert(key.clone(), Value::Null);
        }
    }

    patch
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_when_nothing_changed() {
        let m = json!({"spec": {"replicas": 3}});
        let patch = three_way_merge_patch(&m, &m, &m);
        assert_eq!(patch, json!({}));
    }

    #[test]
    fn untouched_field_ignores_external_drift() {
        let previous = json!({"spec": {"replicas": 3, "image": "a"}});
        let desired = json!({"spec": {"replicas": 3, "image": "b"}});
        // HPA bumped replicas externally; synthesizer never touched replicas.
        let live = json!({"spec": {"replicas": 7, "image": "a"}});
        let patch = three_way_merge_patch(&previous, &desired, &live);
        assert_eq!(patch, json!({"spec": {"image": "b"}}));
    }

    #[test]
    fn removed_field_nulls_out() {
        let previous = json!({"spec": {"replicas": 3, "extra": "x"}});
        let desired = json!({"spec": {"replicas": 3}});
        let live = json!({"spec": {"replicas": 3, "extra": "x"}});
        let patch = three_way_merge_patch(&previous, &desired, &live);
        assert_eq!(patch, json!({"spec": {"extra": Value::Null}}));
    }

    #[test]
    fn new_field_on_first_apply() {
        let previous = json!({});
        let desired = json!({"spec": {"replicas": 3}});
        let live = json!({});
        let patch = three_way_merge_patch(&previous, &desired, &live);
        assert_eq!(patch, json!({"spec": {"replicas": 3}}));
    }
}
