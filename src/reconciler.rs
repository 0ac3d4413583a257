//! Keeps a check bundle's declared metrics and per-metric tags in line with
//! what the process actually emits.
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

use crate::api::types::{CheckBundle, CheckBundleMetric, MetricStatus, MetricType};
use crate::api::CheckApi;
use crate::error::{Error, Result};

/// Declared type and status of an emitted metric.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricMeta {
    pub metric_type: MetricType,
    pub status: MetricStatus,
}

impl MetricMeta {
    pub fn new(metric_type: MetricType) -> Self {
        Self {
            metric_type,
            status: MetricStatus::Active,
        }
    }
}

/// Metric name -> declared meta. Names are opaque and never normalized.
pub type MetricSnapshot = BTreeMap<String, MetricMeta>;

/// Metric name -> full tag list the metric should carry.
pub type TagOverrides = BTreeMap<String, Vec<String>>;

/// What differs between a bundle and the observed metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdatePlan {
    pub new_metrics: Vec<String>,
    pub changed_metrics: Vec<String>,
    pub retagged_metrics: Vec<String>,
    pub forced: bool,
}

impl UpdatePlan {
    pub fn is_empty(&self) -> bool {
        !self.forced
            && self.new_metrics.is_empty()
            && self.changed_metrics.is_empty()
            && self.retagged_metrics.is_empty()
    }
}

fn same_tags(a: &[String], b: &[String]) -> bool {
    a.iter().collect::<BTreeSet<_>>() == b.iter().collect::<BTreeSet<_>>()
}

/// Compares `snapshot` and `tags` against `bundle` without touching it.
/// Tags for metrics that are neither declared nor emitted are dropped;
/// setting tags never creates a metric.
pub fn plan(
    bundle: &CheckBundle,
    snapshot: &MetricSnapshot,
    tags: &TagOverrides,
    force: bool,
) -> UpdatePlan {
    let mut plan = UpdatePlan {
        forced: force,
        ..Default::default()
    };

    for (name, meta) in snapshot {
        match bundle.metric(name) {
            None => plan.new_metrics.push(name.clone()),
            Some(declared)
                if declared.metric_type != meta.metric_type || declared.status != meta.status =>
            {
                plan.changed_metrics.push(name.clone())
            }
            Some(_) => {}
        }
    }

    for (name, wanted) in tags {
        let current: &[String] = match bundle.metric(name) {
            Some(declared) => &declared.tags,
            None if snapshot.contains_key(name) => &[],
            None => continue,
        };
        if !same_tags(current, wanted) {
            plan.retagged_metrics.push(name.clone());
        }
    }

    plan
}

/// Returns a copy of `bundle` with every difference from `plan` applied:
/// declared metrics keep their position and only take the new type/status,
/// new metrics are appended, tags replace the metric's tag list.
pub fn merge(bundle: &CheckBundle, snapshot: &MetricSnapshot, tags: &TagOverrides) -> CheckBundle {
    let mut merged = bundle.clone();

    for metric in merged.metrics.iter_mut() {
        if let Some(meta) = snapshot.get(&metric.name) {
            metric.metric_type = meta.metric_type;
            metric.status = meta.status;
        }
    }

    for (name, meta) in snapshot {
        if bundle.metric(name).is_none() {
            merged.metrics.push(CheckBundleMetric {
                name: name.clone(),
                metric_type: meta.metric_type,
                status: meta.status,
                tags: Vec::new(),
                units: None,
            });
        }
    }

    for (name, wanted) in tags {
        if let Some(metric) = merged.metrics.iter_mut().find(|m| &m.name == name) {
            metric.tags = wanted.clone();
        }
    }

    merged
}

/// A bundle deleted behind our back is a failed update, not a lookup miss.
fn missing_bundle(e: Error) -> Error {
    if e.is_not_found() {
        Error::Backend(e.to_string())
    } else {
        e
    }
}

pub struct CheckReconciler<'a> {
    api: &'a dyn CheckApi,
}

impl<'a> CheckReconciler<'a> {
    pub fn new(api: &'a dyn CheckApi) -> Self {
        Self { api }
    }

    /// Pushes an update when `cached` differs from the observed metrics or
    /// `force` is set. The bundle is re-fetched first so edits made elsewhere
    /// survive. Returns the backend's copy after an update, `None` when
    /// nothing needed sending.
    pub async fn reconcile(
        &self,
        cached: &CheckBundle,
        snapshot: &MetricSnapshot,
        tags: &TagOverrides,
        force: bool,
    ) -> Result<Option<CheckBundle>> {
        let plan = plan(cached, snapshot, tags, force);
        if plan.is_empty() {
            debug!("Check bundle already up to date.");
            return Ok(None);
        }
        debug!(?plan, "Check bundle needs an update.");

        let cid = cached
            .cid
            .clone()
            .ok_or_else(|| Error::Backend("cached check bundle has no cid".to_string()))?;
        let fresh = self
            .api
            .get_check_bundle(&cid)
            .await
            .map_err(missing_bundle)?;
        let payload = merge(&fresh, snapshot, tags);
        let updated = self
            .api
            .update_check_bundle(&cid, &payload)
            .await
            .map_err(missing_bundle)?;

        info!(
            bundle = %cid,
            new_metrics = plan.new_metrics.len(),
            changed_metrics = plan.changed_metrics.len(),
            retagged_metrics = plan.retagged_metrics.len(),
            forced = plan.forced,
            "Updated check bundle."
        );
        Ok(Some(updated))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::memory::Operation;
    use crate::api::InMemoryApi;
    use crate::fixtures;

    fn snapshot(names: &[&str]) -> MetricSnapshot {
        names
            .iter()
            .map(|n| (n.to_string(), MetricMeta::default()))
            .collect()
    }

    #[test]
    fn unchanged_snapshot_plans_nothing() {
        let bundle = fixtures::bundle();
        assert!(plan(&bundle, &snapshot(&["elmo"]), &TagOverrides::new(), false).is_empty());
        assert!(plan(&bundle, &MetricSnapshot::new(), &TagOverrides::new(), false).is_empty());
        assert!(!plan(&bundle, &MetricSnapshot::new(), &TagOverrides::new(), true).is_empty());
    }

    #[test]
    fn type_and_status_changes_are_detected() {
        let bundle = fixtures::bundle();
        let mut snap = MetricSnapshot::new();
        snap.insert(
            "elmo".into(),
            MetricMeta {
                metric_type: MetricType::Histogram,
                status: MetricStatus::Active,
            },
        );
        let p = plan(&bundle, &snap, &TagOverrides::new(), false);
        assert_eq!(p.changed_metrics, vec!["elmo".to_string()]);

        let merged = merge(&bundle, &snap, &TagOverrides::new());
        assert_eq!(merged.metrics.len(), 1);
        assert_eq!(merged.metrics[0].metric_type, MetricType::Histogram);
    }

    #[test]
    fn tags_compare_as_sets() {
        let mut bundle = fixtures::bundle();
        bundle.metrics[0].tags = vec!["a:1".into(), "b:2".into()];

        let mut tags = TagOverrides::new();
        tags.insert("elmo".into(), vec!["b:2".into(), "a:1".into()]);
        assert!(plan(&bundle, &MetricSnapshot::new(), &tags, false).is_empty());

        tags.insert("elmo".into(), vec!["cat:tag".into()]);
        let p = plan(&bundle, &MetricSnapshot::new(), &tags, false);
        assert_eq!(p.retagged_metrics, vec!["elmo".to_string()]);
    }

    #[test]
    fn tags_never_create_metrics() {
        let bundle = fixtures::bundle();
        let mut tags = TagOverrides::new();
        tags.insert("ghost".into(), vec!["cat:tag".into()]);
        assert!(plan(&bundle, &MetricSnapshot::new(), &tags, false).is_empty());

        let merged = merge(&bundle, &MetricSnapshot::new(), &tags);
        assert!(merged.metric("ghost").is_none());
    }

    #[test]
    fn new_metric_gets_its_tags() {
        let bundle = fixtures::bundle();
        let mut tags = TagOverrides::new();
        tags.insert("fresh".into(), vec!["cat:tag".into()]);
        let merged = merge(&bundle, &snapshot(&["fresh"]), &tags);
        assert_eq!(merged.metric("fresh").unwrap().tags, vec!["cat:tag".to_string()]);
        assert_eq!(merged.metrics[0].name, "elmo");
    }

    #[tokio::test]
    async fn new_metric_name_is_sent_verbatim() {
        let api = fixtures::api();
        let cached = fixtures::bundle();
        let updated = CheckReconciler::new(&api)
            .reconcile(&cached, &snapshot(&["elmo", "test`metric"]), &TagOverrides::new(), false)
            .await
            .unwrap()
            .unwrap();

        let payloads = api.updated();
        assert_eq!(payloads.len(), 1);
        let names: Vec<&str> = payloads[0].metrics.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["elmo", "test`metric"]);
        let json = serde_json::to_string(&payloads[0]).unwrap();
        assert!(json.contains("\"test`metric\""));

        let added = updated.metric("test`metric").unwrap();
        assert_eq!(added.metric_type, MetricType::Numeric);
        assert_eq!(added.status, MetricStatus::Active);
    }

    #[tokio::test]
    async fn no_change_means_no_traffic() {
        let api = fixtures::api();
        let result = CheckReconciler::new(&api)
            .reconcile(&fixtures::bundle(), &snapshot(&["elmo"]), &TagOverrides::new(), false)
            .await
            .unwrap();
        assert!(result.is_none());
        assert_eq!(api.calls().total(), 0);
    }

    #[tokio::test]
    async fn remote_edits_survive_update() {
        let mut remote = fixtures::bundle();
        remote.metrics.push(CheckBundleMetric {
            name: "added_in_ui".into(),
            metric_type: MetricType::Text,
            status: MetricStatus::Available,
            tags: Vec::new(),
            units: None,
        });
        let api = fixtures::api().with_bundle(remote);

        CheckReconciler::new(&api)
            .reconcile(&fixtures::bundle(), &snapshot(&["new_one"]), &TagOverrides::new(), false)
            .await
            .unwrap();

        let sent = &api.updated()[0];
        assert!(sent.metric("added_in_ui").is_some());
        assert!(sent.metric("new_one").is_some());
        assert!(sent.metric("elmo").is_some());
    }

    #[tokio::test]
    async fn deleted_bundle_is_backend_error() {
        let api = InMemoryApi::new();
        let err = CheckReconciler::new(&api)
            .reconcile(&fixtures::bundle(), &snapshot(&["new_one"]), &TagOverrides::new(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Backend(_)));
        assert_eq!(api.calls().update_check_bundle, 0);
    }

    #[tokio::test]
    async fn update_failure_is_backend_error() {
        let api = fixtures::api();
        api.fail(Operation::UpdateCheckBundle);
        let err = CheckReconciler::new(&api)
            .reconcile(&fixtures::bundle(), &snapshot(&["new_one"]), &TagOverrides::new(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Backend(_)));
    }
}
