//! Docker list filters

use crate::api::types::{Container, ContainerState, Network, Volume};
use std::collections::HashMap;

/// Decoded `filters` query parameter: key to accepted values
pub type Filters = HashMap<String, Vec<String>>;

/// Decode Docker filter JSON.
///
/// Accepts both `{"label":{"k=v":true}}` and the legacy `{"label":["k=v"]}`.
/// Malformed input yields no filters.
pub fn parse_filters(raw: &str) -> Filters {
    if raw.is_empty() {
        return Filters::new();
    }
    if let Ok(map) = serde_json::from_str::<HashMap<String, HashMap<String, bool>>>(raw) {
        return map
            .into_iter()
            .map(|(k, vals)| (k, vals.into_keys().collect()))
            .collect();
    }
    serde_json::from_str::<Filters>(raw).unwrap_or_default()
}

fn labels_match(labels: &HashMap<String, String>, wanted: &[String]) -> bool {
    wanted.iter().all(|v| match v.split_once('=') {
        Some((k, val)) => labels.get(k).map(String::as_str) == Some(val),
        None => labels.contains_key(v),
    })
}

fn any_eq(values: &[String], actual: &str) -> bool {
    values.iter().any(|v| v == actual)
}

/// Whether a container matches `id`, `name`, `status` and `label` filters
pub fn match_container(c: &Container, filters: &Filters) -> bool {
    filters.iter().all(|(key, values)| match key.as_str() {
        "id" => values.iter().any(|v| c.id.starts_with(v.as_str())),
        "name" => {
            let bare = c.name.trim_start_matches('/');
            values.iter().any(|v| v == bare || *v == c.name)
        }
        "status" => any_eq(values, &c.state.status),
        "label" => labels_match(&c.config.labels, values),
        _ => true,
    })
}

/// Whether a network matches `name`, `id`, `driver` and `label` filters
pub fn match_network(n: &Network, filters: &Filters) -> bool {
    filters.iter().all(|(key, values)| match key.as_str() {
        "name" => any_eq(values, &n.name),
        "id" => values.iter().any(|v| n.id.starts_with(v.as_str())),
        "driver" => any_eq(values, &n.driver),
        "label" => labels_match(&n.labels, values),
        _ => true,
    })
}

/// Whether a network matches prune filters (labels only)
pub fn match_network_prune(n: &Network, filters: &Filters) -> bool {
    filters
        .get("label")
        .map(|values| labels_match(&n.labels, values))
        .unwrap_or(true)
}

/// Whether a volume matches `name`, `driver` and `label` filters
pub fn match_volume(v: &Volume, filters: &Filters) -> bool {
    filters.iter().all(|(key, values)| match key.as_str() {
        "name" => any_eq(values, &v.name),
        "driver" => any_eq(values, &v.driver),
        "label" => labels_match(&v.labels, values),
        _ => true,
    })
}

/// Human-readable container status for list output
pub fn format_status(state: &ContainerState) -> String {
    match state.status.as_str() {
        "created" => "Created".to_string(),
        "running" => "Up Less than a second".to_string(),
        "paused" => "Up Less than a second (Paused)".to_string(),
        "exited" => format!("Exited ({})", state.exit_code),
        "dead" => "Dead".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn container() -> Container {
        let mut c = Container {
            id: "abcdef".to_string(),
            name: "/web".to_string(),
            ..Default::default()
        };
        c.state.status = "running".to_string();
        c.config.labels.insert("app".to_string(), "shop".to_string());
        c
    }

    #[test]
    fn test_parse_filters_both_formats() {
        let modern = parse_filters(r#"{"label":{"a=b":true}}"#);
        assert_eq!(modern["label"], vec!["a=b"]);
        let legacy = parse_filters(r#"{"dangling":["true"]}"#);
        assert_eq!(legacy["dangling"], vec!["true"]);
        assert!(parse_filters("garbage").is_empty());
        assert!(parse_filters("").is_empty());
    }

    #[test]
    fn test_match_container_filters() {
        let c = container();
        let f = parse_filters(r#"{"name":["web"],"status":["running"],"label":["app=shop"]}"#);
        assert!(match_container(&c, &f));
        let f = parse_filters(r#"{"label":["app=other"]}"#);
        assert!(!match_container(&c, &f));
        let f = parse_filters(r#"{"label":["app"],"id":["abc"]}"#);
        assert!(match_container(&c, &f));
        let f = parse_filters(r#"{"status":["exited"]}"#);
        assert!(!match_container(&c, &f));
    }

    #[test]
    fn test_match_volume_and_network() {
        let v = Volume {
            name: "data".to_string(),
            driver: "local".to_string(),
            ..Default::default()
        };
        assert!(match_volume(&v, &parse_filters(r#"{"driver":["local"]}"#)));
        assert!(!match_volume(&v, &parse_filters(r#"{"name":["other"]}"#)));

        let n = Network {
            name: "my-net".to_string(),
            driver: "bridge".to_string(),
            ..Default::default()
        };
        assert!(match_network(&n, &parse_filters(r#"{"driver":["bridge"]}"#)));
        assert!(!match_network_prune(&n, &parse_filters(r#"{"label":["x"]}"#)));
    }

    #[test]
    fn test_format_status() {
        let mut s = ContainerState {
            status: "exited".to_string(),
            exit_code: 2,
            ..Default::default()
        };
        assert_eq!(format_status(&s), "Exited (2)");
        s.status = "created".to_string();
        assert_eq!(format_status(&s), "Created");
    }
}
