use std::collections::{HashMap, HashSet};
use std::str::FromStr;

use serde_json::Value as JsonValue;

use crate::runtime::model::json::helpers::parse_id_value;
use crate::runtime::model::ElementId;
use crate::WireflowError;

/// How much of the active configuration a deploy replaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentType {
    Full,
    Nodes,
    Flows,
    Reload,
}

impl FromStr for DeploymentType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "full" => Ok(DeploymentType::Full),
            "nodes" => Ok(DeploymentType::Nodes),
            "flows" => Ok(DeploymentType::Flows),
            "reload" => Ok(DeploymentType::Reload),
            _ => Err(WireflowError::BadArgument("deployment_type").into()),
        }
    }
}

impl DeploymentType {
    pub fn is_incremental(&self) -> bool {
        matches!(self, DeploymentType::Nodes | DeploymentType::Flows)
    }
}

/// The categorised difference between two flows documents.
#[derive(Debug, Default, Clone)]
pub struct ConfigDiff {
    pub added: HashSet<ElementId>,
    pub removed: HashSet<ElementId>,
    pub changed: HashSet<ElementId>,
    pub rewired: HashSet<ElementId>,
    pub linked: HashSet<ElementId>,
}

impl ConfigDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty() && self.rewired.is_empty()
    }

    /// Every id whose node must stop before the new config applies.
    pub fn stop_set(&self) -> HashSet<ElementId> {
        self.changed.union(&self.removed).copied().collect()
    }

    /// Every id whose node must (re)start after the new config applies.
    pub fn start_set(&self) -> HashSet<ElementId> {
        self.added.union(&self.changed).copied().collect()
    }
}

/// Properties the editor writes for its own canvas bookkeeping. They never
/// affect runtime behavior, so record equality ignores them.
const EDITOR_ONLY_KEYS: &[&str] = &["x", "y", "w", "h", "selected", "moved", "dirty"];

fn strip_for_compare(record: &JsonValue, strip_wires: bool) -> JsonValue {
    match record.as_object() {
        Some(obj) => {
            let filtered: serde_json::Map<String, JsonValue> = obj
                .iter()
                .filter(|(k, _)| !EDITOR_ONLY_KEYS.contains(&k.as_str()))
                .filter(|(k, _)| !(strip_wires && k.as_str() == "wires"))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            JsonValue::Object(filtered)
        }
        None => record.clone(),
    }
}

fn index_by_id(config: &[JsonValue]) -> HashMap<ElementId, &JsonValue> {
    config.iter().filter_map(|jv| jv.get("id").and_then(parse_id_value).map(|id| (id, jv))).collect()
}

fn wire_neighbours(record: &JsonValue) -> Vec<ElementId> {
    let mut out = Vec::new();
    if let Some(wires) = record.get("wires").and_then(|x| x.as_array()) {
        for port in wires.iter().filter_map(|p| p.as_array()) {
            out.extend(port.iter().filter_map(parse_id_value));
        }
    }
    if let Some(links) = record.get("links").and_then(|x| x.as_array()) {
        out.extend(links.iter().filter_map(parse_id_value));
    }
    out
}

/// Computes the deployment diff between the active config and an incoming
/// one. `full`/`reload` deploys replace everything: every old id is
/// `removed`, every new id is `added`.
pub fn diff_configs(old_config: &[JsonValue], new_config: &[JsonValue], dtype: DeploymentType) -> ConfigDiff {
    let old_index = index_by_id(old_config);
    let new_index = index_by_id(new_config);

    let mut diff = ConfigDiff::default();

    if !dtype.is_incremental() {
        diff.removed = old_index.keys().copied().collect();
        diff.added = new_index.keys().copied().collect();
        return diff;
    }

    for (id, new_record) in new_index.iter() {
        match old_index.get(id) {
            None => {
                diff.added.insert(*id);
            }
            Some(old_record) => {
                let old_body = strip_for_compare(old_record, true);
                let new_body = strip_for_compare(new_record, true);
                if old_body != new_body {
                    diff.changed.insert(*id);
                } else if old_record.get("wires") != new_record.get("wires") {
                    diff.rewired.insert(*id);
                }
            }
        }
    }

    for id in old_index.keys() {
        if !new_index.contains_key(id) {
            diff.removed.insert(*id);
        }
    }

    // Nodes wired to a touched node: their ports need rebuilding even
    // though their own record is unchanged.
    let touched: HashSet<ElementId> = diff
        .added
        .iter()
        .chain(diff.changed.iter())
        .chain(diff.rewired.iter())
        .chain(diff.removed.iter())
        .copied()
        .collect();

    for (id, record) in new_index.iter() {
        if touched.contains(id) {
            continue;
        }
        let neighbours = wire_neighbours(record);
        if neighbours.iter().any(|n| touched.contains(n)) {
            diff.linked.insert(*id);
        }
    }

    diff
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn id(s: &str) -> ElementId {
        s.parse().unwrap()
    }

    #[test]
    fn test_full_deploy_replaces_everything() {
        let old_cfg = vec![json!({"id": "1", "type": "inject"})];
        let new_cfg = vec![json!({"id": "1", "type": "inject"}), json!({"id": "2", "type": "debug"})];
        let diff = diff_configs(&old_cfg, &new_cfg, DeploymentType::Full);
        assert_eq!(diff.removed, HashSet::from([id("1")]));
        assert_eq!(diff.added, HashSet::from([id("1"), id("2")]));
    }

    #[test]
    fn test_editor_only_keys_are_ignored() {
        let old_cfg = vec![json!({"id": "1", "type": "inject", "x": 100, "y": 100})];
        let new_cfg = vec![json!({"id": "1", "type": "inject", "x": 250, "y": 80, "selected": true})];
        let diff = diff_configs(&old_cfg, &new_cfg, DeploymentType::Nodes);
        assert!(diff.is_empty());
    }

    #[test]
    fn test_changed_vs_rewired() {
        let old_cfg = vec![
            json!({"id": "1", "type": "inject", "topic": "a", "wires": [["2"]]}),
            json!({"id": "2", "type": "debug", "wires": []}),
        ];
        let new_cfg = vec![
            json!({"id": "1", "type": "inject", "topic": "b", "wires": [["2"]]}),
            json!({"id": "2", "type": "debug", "wires": []}),
        ];
        let diff = diff_configs(&old_cfg, &new_cfg, DeploymentType::Nodes);
        assert_eq!(diff.changed, HashSet::from([id("1")]));
        assert!(diff.rewired.is_empty());

        let rewired_cfg = vec![
            json!({"id": "1", "type": "inject", "topic": "a", "wires": [[]]}),
            json!({"id": "2", "type": "debug", "wires": []}),
        ];
        let diff = diff_configs(&old_cfg, &rewired_cfg, DeploymentType::Nodes);
        assert!(diff.changed.is_empty());
        assert_eq!(diff.rewired, HashSet::from([id("1")]));
    }

    #[test]
    fn test_added_removed_and_linked() {
        let old_cfg = vec![
            json!({"id": "100", "type": "tab"}),
            json!({"id": "1", "type": "inject", "z": "100", "wires": [["2"]]}),
            json!({"id": "2", "type": "debug", "z": "100", "wires": []}),
        ];
        let new_cfg = vec![
            json!({"id": "100", "type": "tab"}),
            json!({"id": "1", "type": "inject", "z": "100", "wires": [["3"]]}),
            json!({"id": "3", "type": "debug", "z": "100", "wires": []}),
        ];
        let diff = diff_configs(&old_cfg, &new_cfg, DeploymentType::Nodes);
        assert_eq!(diff.added, HashSet::from([id("3")]));
        assert_eq!(diff.removed, HashSet::from([id("2")]));
        assert_eq!(diff.rewired, HashSet::from([id("1")]));
        assert!(diff.changed.is_empty());
    }

    #[test]
    fn test_linked_nodes_point_at_touched_nodes() {
        let old_cfg = vec![
            json!({"id": "1", "type": "inject", "wires": [["2"]]}),
            json!({"id": "2", "type": "change", "rules": [], "wires": []}),
        ];
        let new_cfg = vec![
            json!({"id": "1", "type": "inject", "wires": [["2"]]}),
            json!({"id": "2", "type": "change", "rules": [{"t": "set"}], "wires": []}),
        ];
        let diff = diff_configs(&old_cfg, &new_cfg, DeploymentType::Nodes);
        assert_eq!(diff.changed, HashSet::from([id("2")]));
        assert_eq!(diff.linked, HashSet::from([id("1")]));
    }
}
