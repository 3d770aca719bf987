use crate::event::EventView;
use std::{collections::HashMap, path::Path};

/// Variables copied from the payload, for scripts written against push events.
const PAYLOAD_VARIABLES: [(&str, &str); 5] = [
    ("GWH_REF", "ref"),
    ("GWH_BEFORE", "before"),
    ("GWH_AFTER", "after"),
    ("GWH_PUSHER_NAME", "pusher.name"),
    ("GWH_PUSHER_EMAIL", "pusher.email"),
];

/// Build the environment of one action: the base environment with the event
/// variables on top.
///
/// Payload variables missing from the event are removed, so they can't leak in
/// from the base environment.
pub fn build_environment(
    base: &HashMap<String, String>,
    event: &EventView,
    event_file: &Path,
    cache_dir: Option<&Path>,
) -> HashMap<String, String> {
    let mut env = base.clone();

    env.insert("GWH_EVENT_TYPE".to_string(), event.event_type().to_string());
    env.insert(
        "GWH_EVENT_FILE".to_string(),
        event_file.to_string_lossy().to_string(),
    );
    match cache_dir {
        Some(cache_dir) => {
            env.insert(
                "GWH_CACHE_DIR".to_string(),
                cache_dir.to_string_lossy().to_string(),
            );
        }
        None => {
            env.remove("GWH_CACHE_DIR");
        }
    }

    for (variable, path) in PAYLOAD_VARIABLES {
        match event.field(path) {
            Some(value) => env.insert(variable.to_string(), value.to_string()),
            None => env.remove(variable),
        };
    }

    env
}
