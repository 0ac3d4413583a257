use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::api::types::{CheckBundle, MetricStatus};
use crate::api::{CheckApi, HttpApi};
use crate::broker::{Prober, TcpProber};
use crate::config::CheckManagerConfig;
use crate::error::{Error, Result};
use crate::reconciler::{CheckReconciler, MetricSnapshot, TagOverrides};
use crate::resolver::{CheckResolver, Trap};

/// Lifecycle of a [`CheckManager`].
///
/// `Uninitialized -> Resolving -> Ready` on success, `Resolving -> Failed`
/// on a resolver error (the next call retries), and `Uninitialized ->
/// Disabled` when the manager may not talk to the backend and has no fixed
/// submission URL. `Disabled` is terminal; `Ready` lasts until the trap is
/// reset.
#[derive(Debug, Clone, PartialEq)]
pub enum ManagerState {
    Uninitialized,
    Resolving,
    Ready(Trap),
    Failed(String),
    Disabled,
}

impl ManagerState {
    pub fn trap(&self) -> Option<&Trap> {
        match self {
            ManagerState::Ready(trap) => Some(trap),
            _ => None,
        }
    }
}

/// Resolves the trap for this process and keeps the check's metric list in
/// sync. Calls must be serialized by the owner; nothing here locks.
pub struct CheckManager {
    config: CheckManagerConfig,
    api: Arc<dyn CheckApi>,
    prober: Arc<dyn Prober>,
    state: ManagerState,
    bundle: Option<CheckBundle>,
    inventory: HashMap<String, bool>,
    pending_tags: TagOverrides,
    force_update: bool,
}

impl CheckManager {
    /// Manager talking to the configured REST endpoint.
    pub fn new(config: CheckManagerConfig) -> Result<Self> {
        config.validate()?;
        let api = Arc::new(HttpApi::new(&config.api)?);
        Ok(Self::with_api(config, api))
    }

    pub fn with_api(config: CheckManagerConfig, api: Arc<dyn CheckApi>) -> Self {
        let force_update = config.check.force_update;
        Self {
            config,
            api,
            prober: Arc::new(TcpProber),
            state: ManagerState::Uninitialized,
            bundle: None,
            inventory: HashMap::new(),
            pending_tags: TagOverrides::new(),
            force_update,
        }
    }

    pub fn with_prober(mut self, prober: Arc<dyn Prober>) -> Self {
        self.prober = prober;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn state(&self) -> &ManagerState {
        &self.state
    }

    pub fn trap(&self) -> Option<&Trap> {
        self.state.trap()
    }

    pub fn check_bundle(&self) -> Option<&CheckBundle> {
        self.bundle.as_ref()
    }

    /// Resolves the trap once and returns the cached one afterwards.
    pub async fn ensure_initialized(&mut self) -> Result<Trap> {
        match &self.state {
            ManagerState::Ready(trap) => return Ok(trap.clone()),
            ManagerState::Disabled => return Err(Error::ManagerDisabled),
            ManagerState::Uninitialized | ManagerState::Failed(_) | ManagerState::Resolving => {}
        }

        self.state = ManagerState::Resolving;
        let result = CheckResolver::new(
            self.api.as_ref(),
            self.prober.as_ref(),
            &self.config.check,
            &self.config.broker,
        )
        .resolve(self.config.enabled)
        .await;

        match result {
            Ok(resolution) => {
                if let Some(bundle) = resolution.bundle {
                    self.set_bundle(bundle);
                }
                self.state = ManagerState::Ready(resolution.trap.clone());
                Ok(resolution.trap)
            }
            Err(Error::ManagerDisabled) => {
                debug!("Check manager disabled, trap not initialized.");
                self.state = ManagerState::Disabled;
                Err(Error::ManagerDisabled)
            }
            Err(e) => {
                warn!(error = %e, "Unable to initialize trap, will retry.");
                self.state = ManagerState::Failed(e.to_string());
                Err(e)
            }
        }
    }

    /// Drops the resolved trap and cached bundle so the next call resolves
    /// again.
    pub fn reset_trap(&mut self) {
        if self.state == ManagerState::Disabled {
            return;
        }
        self.state = ManagerState::Uninitialized;
        self.bundle = None;
        self.inventory.clear();
    }

    /// Re-resolves when the trap is older than the configured maximum age.
    pub async fn refresh_trap(&mut self) -> Result<Trap> {
        let max_age = self.config.check.max_url_age();
        if let Some(trap) = self.state.trap() {
            if trap.resolved_at.elapsed() >= max_age {
                info!(url = %trap.url, "Trap url expired, refreshing.");
                self.reset_trap();
            }
        }
        self.ensure_initialized().await
    }

    /// Brings the check bundle in line with `snapshot`, tags queued through
    /// [`CheckManager::add_metric_tags`] and `tags` (which win on conflict).
    /// A no-op while disabled or without a resolved bundle.
    pub async fn reconcile(&mut self, snapshot: &MetricSnapshot, tags: &TagOverrides) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        let Some(cached) = self.bundle.as_ref() else {
            debug!("No check bundle, skipping reconcile.");
            return Ok(());
        };

        let mut all_tags = self.pending_tags.clone();
        all_tags.extend(tags.iter().map(|(k, v)| (k.clone(), v.clone())));

        // Metrics deactivated on the backend stay as declared unless forced.
        let mut observed = snapshot.clone();
        for (name, meta) in observed.iter_mut() {
            if self.should_activate_metric(name) {
                continue;
            }
            if let Some(declared) = cached.metric(name) {
                meta.status = declared.status;
            }
        }

        let updated = CheckReconciler::new(self.api.as_ref())
            .reconcile(cached, &observed, &all_tags, self.force_update)
            .await?;

        self.force_update = false;
        if let Some(bundle) = updated {
            self.pending_tags.clear();
            self.set_bundle(bundle);
        } else if !self.pending_tags.is_empty() {
            let waiting: Vec<&String> = self.pending_tags.keys().collect();
            debug!(metrics = ?waiting, "Keeping queued tags until their metrics are declared.");
        }
        Ok(())
    }

    /// Requests an update on the next reconcile even if nothing changed.
    pub fn force_update(&mut self) {
        self.force_update = true;
    }

    /// Queues tags for `metric`, replacing its tag list or appending the tags
    /// it lacks. Returns whether anything changed.
    pub fn add_metric_tags(&mut self, metric: &str, tags: &[String], append: bool) -> bool {
        if append && tags.is_empty() {
            return false;
        }
        let current = self
            .pending_tags
            .get(metric)
            .cloned()
            .or_else(|| {
                self.bundle
                    .as_ref()
                    .and_then(|b| b.metric(metric))
                    .map(|m| m.tags.clone())
            })
            .unwrap_or_default();

        let new_tags = if append {
            let mut merged = current.clone();
            for tag in tags {
                if !merged.contains(tag) {
                    merged.push(tag.clone());
                }
            }
            merged
        } else {
            tags.to_vec()
        };

        if new_tags == current {
            return false;
        }
        debug!(metric = %metric, tags = ?new_tags, "Queued metric tags.");
        self.pending_tags.insert(metric.to_string(), new_tags);
        true
    }

    /// Whether the check declares `metric` as active.
    pub fn is_metric_active(&self, metric: &str) -> bool {
        self.inventory.get(metric).copied().unwrap_or(false)
    }

    /// Whether `metric` should be (re)declared active: unknown metrics
    /// always, inactive ones only with forced activation.
    pub fn should_activate_metric(&self, metric: &str) -> bool {
        match self.inventory.get(metric) {
            None => true,
            Some(false) => self.config.check.force_metric_activation,
            Some(true) => false,
        }
    }

    fn set_bundle(&mut self, bundle: CheckBundle) {
        self.inventory = bundle
            .metrics
            .iter()
            .map(|m| (m.name.clone(), m.status == MetricStatus::Active))
            .collect();
        self.bundle = Some(bundle);
    }
}
