use serde_json::Value;

/// Read a value out of a nested payload with a path of the form `a.b.c`.
///
/// Every segment walks one level down: into a mapping by key, or into a
/// sequence by a numeric index. Any missing key, out of range index or
/// scalar in the middle of the path makes the whole lookup return `None`,
/// there are no partial results.
pub fn lookup<'a>(payload: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(payload, |current, segment| match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment
                .parse::<usize>()
                .ok()
                .and_then(|index| items.get(index)),
            _ => None,
        })
}

/// Same as [lookup], but falls back to `default` when the path is absent.
pub fn lookup_or<'a>(payload: &'a Value, path: &str, default: &'a Value) -> &'a Value {
    lookup(payload, path).unwrap_or(default)
}

/// Look up a string value, ignoring values of any other type.
pub fn lookup_str<'a>(payload: &'a Value, path: &str) -> Option<&'a str> {
    lookup(payload, path).and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn it_should_find_nested_values() {
        let payload = json!({"a": {"b": {"c": "d"}}});

        assert_eq!(Some(&json!("d")), lookup(&payload, "a.b.c"));
        assert_eq!(Some(&json!({"c": "d"})), lookup(&payload, "a.b"));
    }

    #[test]
    fn it_should_return_none_for_missing_keys() {
        let payload = json!({"a": {"b": {"c": "d"}}});

        assert_eq!(None, lookup(&payload, "a.b.x"));
        assert_eq!(None, lookup(&payload, "x.b.c"));
    }

    #[test]
    fn it_should_return_none_if_the_path_overruns_a_leaf() {
        let payload = json!({"a": {"b": {"c": "d"}}});

        assert_eq!(None, lookup(&payload, "a.b.c.d"));
    }

    #[test]
    fn it_should_not_fail_on_malformed_paths() {
        let payload = json!({"a": {"b": {"c": "d"}}});

        assert_eq!(None, lookup(&payload, ""));
        assert_eq!(None, lookup(&payload, "..."));
        assert_eq!(None, lookup(&payload, "a..c"));
        assert_eq!(None, lookup(&json!(null), "a.b"));
    }

    #[test]
    fn it_should_index_into_sequences() {
        let payload = json!({"commits": [{"id": "abc"}, {"id": "def"}]});

        assert_eq!(Some("def"), lookup_str(&payload, "commits.1.id"));
        assert_eq!(None, lookup(&payload, "commits.2.id"));
        assert_eq!(None, lookup(&payload, "commits.first.id"));
    }

    #[test]
    fn it_should_fall_back_to_the_default() {
        let payload = json!({"repository": {}});
        let default = json!("master");

        assert_eq!(
            &default,
            lookup_or(&payload, "repository.default_branch", &default)
        );
    }
}
