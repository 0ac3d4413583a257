use async_trait::async_trait;

use crate::error::Result;

pub mod http;
pub mod memory;
pub mod types;

pub use http::HttpApi;
pub use memory::InMemoryApi;
pub use types::{
    Broker, BrokerCid, BrokerDetail, BundleCid, Check, CheckBundle, CheckBundleConfig,
    CheckBundleMetric, CheckCid, CheckDetails, MetricStatus, MetricType,
};

/// Prefix of the bundle notes used to tag bundles with the owning instance.
pub const INSTANCE_NOTE_PREFIX: &str = "cgm_instanceid=";

/// Structured check bundle search filter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BundleQuery {
    pub target: String,
    pub check_type: String,
    pub display_name: String,
    pub search_tags: Vec<String>,
    pub instance_id: String,
}

impl BundleQuery {
    pub fn notes(&self) -> String {
        format!("{INSTANCE_NOTE_PREFIX}{}", self.instance_id)
    }

    /// Renders the backend's search expression.
    pub fn to_search_string(&self) -> String {
        format!(
            "(active:1)(host:\"{}\")(type:\"{}\")(display_name:\"{}\")(tags:{})(notes:\"{}\")",
            self.target,
            self.check_type,
            self.display_name,
            self.search_tags.join(","),
            self.notes()
        )
    }

    /// Whether a bundle satisfies every criterion of the query.
    pub fn matches(&self, bundle: &CheckBundle) -> bool {
        bundle.target == self.target
            && bundle.check_type == self.check_type
            && bundle.display_name == self.display_name
            && self.search_tags.iter().all(|t| bundle.tags.contains(t))
            && bundle.notes.as_deref() == Some(self.notes().as_str())
    }
}

/// Remote operations the check manager needs from the monitoring backend.
/// Every call is already authenticated; misses are reported as
/// [`crate::Error::NotFound`], everything else as [`crate::Error::Backend`].
#[async_trait]
pub trait CheckApi: Send + Sync {
    async fn get_check(&self, id: u64) -> Result<Check>;

    async fn get_check_bundle(&self, cid: &BundleCid) -> Result<CheckBundle>;

    async fn search_check_bundles(&self, query: &BundleQuery) -> Result<Vec<CheckBundle>>;

    async fn create_check_bundle(&self, bundle: &CheckBundle) -> Result<CheckBundle>;

    async fn update_check_bundle(&self, cid: &BundleCid, bundle: &CheckBundle)
        -> Result<CheckBundle>;

    /// Lists brokers, restricted to those carrying every tag in `select_tags`
    /// when it is non-empty.
    async fn list_brokers(&self, select_tags: &[String]) -> Result<Vec<Broker>>;

    async fn get_broker(&self, cid: &BrokerCid) -> Result<Broker>;
}
