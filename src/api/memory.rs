//! In-process [`CheckApi`] holding canned records.
//!
//! Behaves like the backend for the operations the check manager uses:
//! creation assigns ids, a check UUID and a submission URL on the first
//! bound broker; updates replace the stored bundle. Every call is counted and
//! individual operations can be made to fail.
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;
use uuid::Uuid;

use super::types::{
    Broker, BrokerCid, BundleCid, Check, CheckBundle, CheckCid, CheckDetails, STATUS_ACTIVE,
};
use super::{BundleQuery, CheckApi};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    GetCheck,
    GetCheckBundle,
    SearchCheckBundles,
    CreateCheckBundle,
    UpdateCheckBundle,
    ListBrokers,
    GetBroker,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub get_check: usize,
    pub get_check_bundle: usize,
    pub search_check_bundles: usize,
    pub create_check_bundle: usize,
    pub update_check_bundle: usize,
    pub list_brokers: usize,
    pub get_broker: usize,
}

impl CallCounts {
    pub fn total(&self) -> usize {
        self.get_check
            + self.get_check_bundle
            + self.search_check_bundles
            + self.create_check_bundle
            + self.update_check_bundle
            + self.list_brokers
            + self.get_broker
    }
}

#[derive(Default)]
struct Store {
    checks: BTreeMap<u64, Check>,
    bundles: BTreeMap<u64, CheckBundle>,
    brokers: Vec<(Broker, Vec<String>)>,
    failing: HashSet<Operation>,
    calls: CallCounts,
    created: Vec<CheckBundle>,
    updated: Vec<CheckBundle>,
}

#[derive(Default)]
pub struct InMemoryApi {
    store: Mutex<Store>,
}

impl InMemoryApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_check(self, check: Check) -> Self {
        if let Some(id) = check.cid.id() {
            self.lock().checks.insert(id, check);
        }
        self
    }

    pub fn with_bundle(self, bundle: CheckBundle) -> Self {
        if let Some(id) = bundle.cid.as_ref().and_then(BundleCid::id) {
            self.lock().bundles.insert(id, bundle);
        }
        self
    }

    pub fn with_broker(self, broker: Broker, tags: &[&str]) -> Self {
        let tags = tags.iter().map(|t| t.to_string()).collect();
        self.lock().brokers.push((broker, tags));
        self
    }

    /// Makes every subsequent call of `op` fail with a backend error.
    pub fn fail(&self, op: Operation) {
        self.lock().failing.insert(op);
    }

    pub fn recover(&self, op: Operation) {
        self.lock().failing.remove(&op);
    }

    pub fn calls(&self) -> CallCounts {
        self.lock().calls
    }

    /// Payloads received by `create_check_bundle`, in call order.
    pub fn created(&self) -> Vec<CheckBundle> {
        self.lock().created.clone()
    }

    /// Payloads received by `update_check_bundle`, in call order.
    pub fn updated(&self) -> Vec<CheckBundle> {
        self.lock().updated.clone()
    }

    pub fn bundle(&self, id: u64) -> Option<CheckBundle> {
        self.lock().bundles.get(&id).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Store> {
        // A panic while holding the lock leaves only test data behind.
        self.store.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn enter(&self, op: Operation) -> Result<std::sync::MutexGuard<'_, Store>> {
        let mut store = self.lock();
        let calls = &mut store.calls;
        match op {
            Operation::GetCheck => calls.get_check += 1,
            Operation::GetCheckBundle => calls.get_check_bundle += 1,
            Operation::SearchCheckBundles => calls.search_check_bundles += 1,
            Operation::CreateCheckBundle => calls.create_check_bundle += 1,
            Operation::UpdateCheckBundle => calls.update_check_bundle += 1,
            Operation::ListBrokers => calls.list_brokers += 1,
            Operation::GetBroker => calls.get_broker += 1,
        }
        if store.failing.contains(&op) {
            return Err(Error::Backend(format!("{op:?} failed")));
        }
        Ok(store)
    }
}

fn submission_url(broker: Option<&Broker>, check_type: &str, uuid: &str, secret: &str) -> String {
    let detail = broker.and_then(|b| b.details.iter().find(|d| d.is_active()));
    let host = detail
        .and_then(|d| d.external_host.clone().or_else(|| d.ip.clone()))
        .unwrap_or_else(|| "127.0.0.1".to_string());
    let port = detail
        .and_then(|d| d.external_port.or(d.port))
        .unwrap_or(43191);
    format!("http://{host}:{port}/module/{check_type}/{uuid}/{secret}")
}

#[async_trait]
impl CheckApi for InMemoryApi {
    async fn get_check(&self, id: u64) -> Result<Check> {
        let store = self.enter(Operation::GetCheck)?;
        store
            .checks
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(CheckCid::from_id(id).to_string()))
    }

    async fn get_check_bundle(&self, cid: &BundleCid) -> Result<CheckBundle> {
        let store = self.enter(Operation::GetCheckBundle)?;
        cid.id()
            .and_then(|id| store.bundles.get(&id).cloned())
            .ok_or_else(|| Error::NotFound(cid.to_string()))
    }

    async fn search_check_bundles(&self, query: &BundleQuery) -> Result<Vec<CheckBundle>> {
        let store = self.enter(Operation::SearchCheckBundles)?;
        Ok(store
            .bundles
            .values()
            .filter(|b| query.matches(b))
            .cloned()
            .collect())
    }

    async fn create_check_bundle(&self, bundle: &CheckBundle) -> Result<CheckBundle> {
        let mut store = self.enter(Operation::CreateCheckBundle)?;
        store.created.push(bundle.clone());

        let id = store
            .bundles
            .keys()
            .chain(store.checks.keys())
            .max()
            .map_or(1, |max| max + 1);
        let uuid = Uuid::new_v4().to_string();
        let secret = bundle.config.secret.clone().unwrap_or_default();
        let broker = bundle
            .brokers
            .first()
            .and_then(|cid| store.brokers.iter().find(|(b, _)| &b.cid == cid))
            .map(|(b, _)| b);
        let url = submission_url(broker, &bundle.check_type, &uuid, &secret);

        let mut created = bundle.clone();
        created.cid = Some(BundleCid::from_id(id));
        created.checks = vec![CheckCid::from_id(id)];
        created.check_uuids = vec![uuid.clone()];
        created.config.submission_url = Some(url.clone());
        if created.status.is_empty() {
            created.status = STATUS_ACTIVE.to_string();
        }

        let check = Check {
            cid: CheckCid::from_id(id),
            active: true,
            broker: bundle.brokers.first().cloned().unwrap_or_else(|| BrokerCid::from("")),
            check_bundle: BundleCid::from_id(id),
            check_uuid: uuid,
            details: CheckDetails {
                submission_url: Some(url),
            },
        };
        store.checks.insert(id, check);
        store.bundles.insert(id, created.clone());
        Ok(created)
    }

    async fn update_check_bundle(
        &self,
        cid: &BundleCid,
        bundle: &CheckBundle,
    ) -> Result<CheckBundle> {
        let mut store = self.enter(Operation::UpdateCheckBundle)?;
        store.updated.push(bundle.clone());

        let id = cid
            .id()
            .filter(|id| store.bundles.contains_key(id))
            .ok_or_else(|| Error::NotFound(cid.to_string()))?;
        let mut stored = bundle.clone();
        stored.cid = Some(cid.clone());
        store.bundles.insert(id, stored.clone());
        Ok(stored)
    }

    async fn list_brokers(&self, select_tags: &[String]) -> Result<Vec<Broker>> {
        let store = self.enter(Operation::ListBrokers)?;
        Ok(store
            .brokers
            .iter()
            .filter(|(_, tags)| select_tags.iter().all(|t| tags.contains(t)))
            .map(|(b, _)| b.clone())
            .collect())
    }

    async fn get_broker(&self, cid: &BrokerCid) -> Result<Broker> {
        let store = self.enter(Operation::GetBroker)?;
        store
            .brokers
            .iter()
            .find(|(b, _)| &b.cid == cid)
            .map(|(b, _)| b.clone())
            .ok_or_else(|| Error::NotFound(cid.to_string()))
    }
}
