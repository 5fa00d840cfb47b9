//! Attribute diff between desired and observed state.
//!
//! Compares every desired key of a resource against its observed state and
//! reports the keys that do not hold. Keys that cannot be observed are listed
//! separately so they can surface as warnings instead of failures.

use std::fmt;

use serde::Serialize;

use crate::config::{AttrValue, ContentHasher, ResourceKind};
use crate::control::ObservedState;
use crate::desired::{CONFIG_HASH_KEY, Resource};

/// Keys that may take time to hold after an action succeeds.
pub const EVENTUAL_KEYS: &[&str] = &["port", "endpoint"];

/// A desired key that does not hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Mismatch {
    /// Attribute key.
    pub key: String,
    /// Desired value.
    pub desired: AttrValue,
    /// Observed value, if any.
    pub observed: Option<AttrValue>,
}

/// Difference between a resource's desired and observed state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AttributeDiff {
    /// Keys that do not hold.
    pub mismatches: Vec<Mismatch>,
    /// Declared keys the probe cannot observe.
    pub unobservable: Vec<String>,
}

impl Mismatch {
    /// Returns true if this key is expected to hold only eventually.
    #[must_use]
    pub fn is_eventual(&self) -> bool {
        EVENTUAL_KEYS.contains(&self.key.as_str())
    }
}

impl AttributeDiff {
    /// Computes the diff for `resource` against `observed`.
    #[must_use]
    pub fn compute(resource: &Resource, observed: &ObservedState) -> Self {
        let mut diff = Self::default();
        let present = resource.wants_present();

        for (key, desired) in &resource.desired {
            match key.as_str() {
                "installed" | "running" | "present" => {
                    let actual = observed.flag(key);
                    if desired.as_bool() != Some(actual) {
                        diff.push(key, desired, Some(AttrValue::Bool(actual)));
                    }
                }
                CONFIG_HASH_KEY => {
                    let matches = match (desired.as_text(), observed.config_hash()) {
                        (Some(want), Some(have)) => ContentHasher::hashes_match(want, have),
                        _ => false,
                    };
                    if present && !matches {
                        diff.push(key, desired, observed.get(key).cloned());
                    }
                }
                "port" | "endpoint" if resource.kind != ResourceKind::Index => {
                    if present && observed.get(key) != Some(desired) {
                        diff.push(key, desired, observed.get(key).cloned());
                    }
                }
                // index creation parameters are passed on create and never read back
                _ => diff.unobservable.push(key.clone()),
            }
        }

        diff
    }

    fn push(&mut self, key: &str, desired: &AttrValue, observed: Option<AttrValue>) {
        self.mismatches.push(Mismatch {
            key: key.to_string(),
            desired: desired.clone(),
            observed,
        });
    }

    /// Returns true if every observable desired key holds.
    #[must_use]
    pub fn is_converged(&self) -> bool {
        self.mismatches.is_empty()
    }

    /// Returns true if there are mismatches and all of them are eventual.
    #[must_use]
    pub fn only_eventual(&self) -> bool {
        !self.mismatches.is_empty() && self.mismatches.iter().all(Mismatch::is_eventual)
    }

    /// Returns this diff without eventual mismatches.
    #[must_use]
    pub fn without_eventual(mut self) -> Self {
        self.mismatches.retain(|m| !m.is_eventual());
        self
    }

    /// Returns a one-line summary of the mismatches.
    #[must_use]
    pub fn summary(&self) -> String {
        self.mismatches
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |value: &AttrValue| {
            if self.key == CONFIG_HASH_KEY {
                value
                    .as_text()
                    .map_or_else(|| value.to_string(), ContentHasher::short_hash)
            } else {
                value.to_string()
            }
        };

        match &self.observed {
            Some(observed) => write!(
                f,
                "{}: want {}, got {}",
                self.key,
                show(&self.desired),
                show(observed)
            ),
            None => write!(f, "{}: want {}, not observed", self.key, show(&self.desired)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn resource(kind: ResourceKind, desired: &[(&str, AttrValue)]) -> Resource {
        Resource {
            kind,
            name: String::from("r"),
            desired: desired
                .iter()
                .map(|(k, v)| ((*k).to_string(), v.clone()))
                .collect(),
            depends_on: vec![],
            notify: vec![],
            config_file: None,
            payload: None,
        }
    }

    fn observed(attrs: &[(&str, AttrValue)]) -> ObservedState {
        let attrs: BTreeMap<String, AttrValue> = attrs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect();
        ObservedState {
            present: attrs
                .get("installed")
                .or_else(|| attrs.get("present"))
                .and_then(AttrValue::as_bool)
                .unwrap_or(false),
            attrs,
            note: None,
        }
    }

    #[test]
    fn test_service_mismatches() {
        let core = resource(
            ResourceKind::Service,
            &[
                ("installed", true.into()),
                ("running", true.into()),
                ("port", AttrValue::Int(8089)),
            ],
        );
        let actual = observed(&[("installed", true.into()), ("running", false.into())]);

        let diff = AttributeDiff::compute(&core, &actual);
        let keys: Vec<&str> = diff.mismatches.iter().map(|m| m.key.as_str()).collect();
        assert_eq!(keys, vec!["port", "running"]);
        assert!(!diff.only_eventual());
        assert_eq!(diff.clone().without_eventual().mismatches.len(), 1);
    }

    #[test]
    fn test_only_eventual() {
        let core = resource(
            ResourceKind::Service,
            &[
                ("installed", true.into()),
                ("running", true.into()),
                ("endpoint", AttrValue::from("https://127.0.0.1:8089/")),
            ],
        );
        let actual = observed(&[("installed", true.into()), ("running", true.into())]);

        let diff = AttributeDiff::compute(&core, &actual);
        assert!(diff.only_eventual());
        assert!(diff.summary().contains("endpoint: want https://127.0.0.1:8089/, not observed"));
    }

    #[test]
    fn test_absent_resource_ignores_hash_and_port() {
        let input = resource(
            ResourceKind::Input,
            &[("present", false.into()), ("port", AttrValue::Int(9997))],
        );
        let actual = observed(&[("present", false.into())]);

        assert!(AttributeDiff::compute(&input, &actual).is_converged());
    }

    #[test]
    fn test_hash_mismatch_is_shortened() {
        let hash = ContentHasher::new().hash_payload("a");
        let other = ContentHasher::new().hash_payload("b");
        let input = resource(
            ResourceKind::Input,
            &[("present", true.into()), (CONFIG_HASH_KEY, AttrValue::Text(hash.clone()))],
        );
        let actual = observed(&[("present", true.into()), (CONFIG_HASH_KEY, AttrValue::Text(other))]);

        let diff = AttributeDiff::compute(&input, &actual);
        assert_eq!(diff.mismatches.len(), 1);
        assert!(diff.summary().contains(&ContentHasher::short_hash(&hash)));
        assert!(!diff.summary().contains(&hash));
    }

    #[test]
    fn test_port_checked_without_running_flag() {
        let core = resource(
            ResourceKind::Service,
            &[
                ("installed", true.into()),
                ("port", AttrValue::Int(9997)),
                ("endpoint", AttrValue::from("http://127.0.0.1:1/")),
            ],
        );
        let actual = observed(&[("installed", true.into()), ("running", false.into())]);

        let diff = AttributeDiff::compute(&core, &actual);
        let keys: Vec<&str> = diff.mismatches.iter().map(|m| m.key.as_str()).collect();
        assert_eq!(keys, vec!["endpoint", "port"]);
        assert!(diff.only_eventual());
    }

    #[test]
    fn test_index_params_and_unobservable_keys() {
        let main = resource(
            ResourceKind::Index,
            &[
                ("present", true.into()),
                ("maxDataSize", AttrValue::from("auto")),
                ("port", AttrValue::Int(9997)),
            ],
        );
        let diff = AttributeDiff::compute(&main, &observed(&[("present", true.into())]));
        assert!(diff.is_converged());
        assert_eq!(diff.unobservable, vec!["maxDataSize", "port"]);

        let app = resource(
            ResourceKind::DeploymentApp,
            &[("present", true.into()), ("serverclass", AttrValue::from("linux"))],
        );
        let diff = AttributeDiff::compute(&app, &observed(&[("present", true.into())]));
        assert!(diff.is_converged());
        assert_eq!(diff.unobservable, vec!["serverclass"]);
    }
}
