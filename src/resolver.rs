//! Lookup-or-create for the check that receives this process's metrics.
//!
//! Resolution short-circuits at the first applicable step: a configured
//! submission URL, a configured check id, a search on target/type/display
//! name/tags, and finally creation of a new check bundle on a selected
//! broker.
use reqwest::Url;
use std::net::IpAddr;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::api::types::{
    Broker, BrokerCid, CheckBundle, CheckBundleConfig, CHECK_TYPE_HTTPTRAP, STATUS_ACTIVE,
};
use crate::api::{BundleQuery, CheckApi, INSTANCE_NOTE_PREFIX};
use crate::broker::{self, BrokerSelector, Prober};
use crate::config::{BrokerConfig, CheckConfig};
use crate::error::{Error, Result};
use crate::secret::make_secret;

const REVERSE_SCHEME: &str = "mtev_reverse";
const DEFAULT_PERIOD_SECS: u32 = 60;
const DEFAULT_TIMEOUT_SECS: u32 = 10;
const UNLIMITED_METRICS: i64 = -1;

/// Everything a transport needs to submit to the resolved check.
#[derive(Debug, Clone, PartialEq)]
pub struct Trap {
    pub url: String,
    pub check_id: Option<u64>,
    pub check_uuid: Option<String>,
    pub secret: Option<String>,
    /// Common name to present as TLS server name. For an IP host this is
    /// the CN of the broker detail with that IP; `None` when no detail has it.
    pub broker_cn: Option<String>,
    pub is_https: bool,
    pub resolved_at: Instant,
}

impl Trap {
    /// Builds a trap from a fixed submission URL. The check UUID and secret
    /// are picked out of `/module/<type>/<uuid>/<secret>` paths.
    pub fn from_submission_url(raw: &str) -> Result<Self> {
        let url = Url::parse(raw).map_err(|e| Error::InvalidTrapUrl(format!("{raw}: {e}")))?;
        let segments: Vec<&str> = url
            .path_segments()
            .map(|s| s.filter(|seg| !seg.is_empty()).collect())
            .unwrap_or_default();
        let (check_uuid, secret) = match segments.as_slice() {
            ["module", _, uuid, secret, ..] => (Some(uuid.to_string()), Some(secret.to_string())),
            _ => (None, None),
        };
        Ok(Self {
            url: raw.to_string(),
            check_id: None,
            check_uuid,
            secret,
            broker_cn: url
                .host_str()
                .filter(|h| h.parse::<IpAddr>().is_err())
                .map(str::to_string),
            is_https: url.scheme() == "https",
            resolved_at: Instant::now(),
        })
    }
}

/// Outcome of a resolution. The bundle is absent when a fixed submission URL
/// was used.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub trap: Trap,
    pub bundle: Option<CheckBundle>,
}

pub struct CheckResolver<'a> {
    api: &'a dyn CheckApi,
    prober: &'a dyn Prober,
    check: &'a CheckConfig,
    broker: &'a BrokerConfig,
}

impl<'a> CheckResolver<'a> {
    pub fn new(
        api: &'a dyn CheckApi,
        prober: &'a dyn Prober,
        check: &'a CheckConfig,
        broker: &'a BrokerConfig,
    ) -> Self {
        Self {
            api,
            prober,
            check,
            broker,
        }
    }

    pub async fn resolve(&self, enabled: bool) -> Result<Resolution> {
        if let Some(url) = self.check.submission_url.as_deref().filter(|u| !u.is_empty()) {
            debug!(url = %url, "Using configured submission url.");
            return Ok(Resolution {
                trap: Trap::from_submission_url(url)?,
                bundle: None,
            });
        }
        if !enabled {
            return Err(Error::ManagerDisabled);
        }

        let mut found = None;
        if let Some(id) = self.check.id {
            found = self.by_id(id).await?;
        }
        if found.is_none() {
            if let Some(bundle) = self.search().await? {
                found = Some((bundle, None));
            }
        }
        let (bundle, broker) = match found {
            Some(found) => found,
            None => {
                let (bundle, broker) = self.create().await?;
                (bundle, Some(broker))
            }
        };

        let broker = match broker {
            Some(broker) => broker,
            None => self.bound_broker(&bundle).await?,
        };
        let trap = trap_for_bundle(&bundle, &broker)?;
        info!(url = %trap.url, check_id = ?trap.check_id, broker = %broker.cid, "Resolved trap.");
        Ok(Resolution {
            trap,
            bundle: Some(bundle),
        })
    }

    /// Check -> bundle -> owning broker. A miss anywhere falls through to
    /// search.
    async fn by_id(&self, id: u64) -> Result<Option<(CheckBundle, Option<Broker>)>> {
        let check = match self.api.get_check(id).await {
            Ok(check) => check,
            Err(e) if e.is_not_found() => {
                warn!(check_id = id, "Configured check not found, searching instead.");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        if !check.active {
            return Err(Error::InactiveCheck(check.cid.to_string()));
        }

        let bundle = match self.api.get_check_bundle(&check.check_bundle).await {
            Ok(bundle) => bundle,
            Err(e) if e.is_not_found() => {
                warn!(bundle = %check.check_bundle, "Check bundle not found, searching instead.");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        let broker = match self.api.get_broker(&check.broker).await {
            Ok(broker) => broker,
            Err(e) if e.is_not_found() => {
                warn!(broker = %check.broker, "Check broker not found, searching instead.");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        Ok(Some((bundle, Some(broker))))
    }

    /// Active bundles matching the configured criteria; several matches
    /// resolve to the lowest bundle id.
    async fn search(&self) -> Result<Option<CheckBundle>> {
        let query = BundleQuery {
            target: self.check.target_host.clone(),
            check_type: self.check.check_type.clone(),
            display_name: self.check.display_name.clone(),
            search_tags: self.check.search_tags.clone(),
            instance_id: self.check.instance_id.clone(),
        };
        debug!(search = %query.to_search_string(), "Searching for check bundle.");

        let bundles = match self.api.search_check_bundles(&query).await {
            Ok(bundles) => bundles,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };
        let mut active: Vec<CheckBundle> = bundles.into_iter().filter(|b| b.is_active()).collect();
        if active.len() > 1 {
            warn!(matches = active.len(), "Multiple check bundles match, using the lowest id.");
        }
        active.sort_by_key(|b| b.cid.as_ref().and_then(|c| c.id()).unwrap_or(u64::MAX));
        Ok(active.into_iter().next())
    }

    async fn create(&self) -> Result<(CheckBundle, Broker)> {
        let selector = BrokerSelector::new(
            self.prober,
            &self.check.check_type,
            self.broker.max_response_time(),
        );
        let selection = match self.broker.id {
            Some(id) => {
                let broker = self.api.get_broker(&BrokerCid::from_id(id)).await?;
                selector.validate(&broker).await?
            }
            None => {
                let brokers = self.api.list_brokers(&self.broker.select_tags).await?;
                selector.select(&brokers).await?
            }
        };

        let secret = match self.check.secret.as_deref().filter(|s| !s.is_empty()) {
            Some(secret) => secret.to_string(),
            None => make_secret()?,
        };
        let payload = self.new_bundle(&selection.broker, secret);
        let bundle = self.api.create_check_bundle(&payload).await?;
        info!(
            bundle = ?bundle.cid,
            broker = %selection.broker.cid,
            display_name = %bundle.display_name,
            "Created check bundle."
        );
        Ok((bundle, selection.broker))
    }

    fn new_bundle(&self, broker: &Broker, secret: String) -> CheckBundle {
        let mut tags = self.check.search_tags.clone();
        for tag in &self.check.tags {
            if !tags.contains(tag) {
                tags.push(tag.clone());
            }
        }
        CheckBundle {
            brokers: vec![broker.cid.clone()],
            config: CheckBundleConfig {
                async_metrics: Some("true".to_string()),
                secret: Some(secret),
                ..Default::default()
            },
            display_name: self.check.display_name.clone(),
            metric_limit: UNLIMITED_METRICS,
            notes: Some(format!("{INSTANCE_NOTE_PREFIX}{}", self.check.instance_id)),
            period: DEFAULT_PERIOD_SECS,
            status: STATUS_ACTIVE.to_string(),
            tags,
            target: self.check.target_host.clone(),
            timeout: DEFAULT_TIMEOUT_SECS,
            check_type: self.check.check_type.clone(),
            ..Default::default()
        }
    }

    async fn bound_broker(&self, bundle: &CheckBundle) -> Result<Broker> {
        let cid = bundle.brokers.first().ok_or_else(|| {
            Error::Backend(format!("check bundle {:?} has no brokers", bundle.cid))
        })?;
        self.api.get_broker(cid).await.map_err(|e| {
            if e.is_not_found() {
                Error::Backend(format!(
                    "check bundle {:?} is bound to missing broker {cid}",
                    bundle.cid
                ))
            } else {
                e
            }
        })
    }
}

/// Derives the trap for a resolved bundle. httptrap bundles publish their
/// submission URL; other types are reached through the first reverse
/// connection URL plus the reverse secret.
pub fn trap_for_bundle(bundle: &CheckBundle, broker: &Broker) -> Result<Trap> {
    let raw = if bundle.check_type == CHECK_TYPE_HTTPTRAP {
        bundle
            .config
            .submission_url
            .clone()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| {
                Error::InvalidTrapUrl(format!("check bundle {:?} has no submission url", bundle.cid))
            })?
    } else {
        reverse_trap_url(bundle)?
    };

    let url = Url::parse(&raw).map_err(|e| Error::InvalidTrapUrl(format!("{raw}: {e}")))?;
    let host = url.host_str().unwrap_or_default();
    let broker_cn = if host.parse::<IpAddr>().is_err() {
        Some(host.to_string())
    } else {
        broker::detail_for_host(broker, host)
            .map(|d| d.cn.clone())
            .filter(|cn| !cn.is_empty())
    };
    if broker_cn.is_none() {
        warn!(host = %host, broker = %broker.cid, "Unable to match trap host to a broker detail.");
    }

    let from_url = Trap::from_submission_url(&raw)?;
    Ok(Trap {
        url: raw,
        check_id: bundle.checks.first().and_then(|c| c.id()),
        check_uuid: bundle.check_uuids.first().cloned().or(from_url.check_uuid),
        secret: bundle
            .config
            .secret
            .clone()
            .or_else(|| bundle.config.reverse_secret.clone())
            .or(from_url.secret),
        broker_cn,
        is_https: url.scheme() == "https",
        resolved_at: Instant::now(),
    })
}

fn reverse_trap_url(bundle: &CheckBundle) -> Result<String> {
    let reverse = bundle.reverse_connect_urls.first().ok_or_else(|| {
        Error::InvalidTrapUrl(format!(
            "{} is not an httptrap check and no reverse connection urls found",
            bundle.check_type
        ))
    })?;
    let secret = bundle
        .config
        .reverse_secret
        .as_deref()
        .ok_or_else(|| Error::InvalidTrapUrl("reverse connection secret missing".to_string()))?;
    let https = reverse
        .replacen(REVERSE_SCHEME, "https", 1)
        .replacen("/check/", "/module/httptrap/", 1);
    Ok(format!("{https}/{secret}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::memory::Operation;
    use crate::api::InMemoryApi;
    use crate::broker::tests::ScriptedProber;
    use crate::fixtures::{self, TRAP_URL};

    fn check_config() -> CheckConfig {
        CheckConfig {
            instance_id: "test_id".into(),
            target_host: "test".into(),
            display_name: "test_dn".into(),
            search_tags: vec!["test:test".into()],
            ..Default::default()
        }
    }

    fn prober() -> ScriptedProber {
        ScriptedProber::default().with("127.0.0.1", 5)
    }

    #[test]
    fn fixed_url_parts() {
        let trap = Trap::from_submission_url(TRAP_URL).unwrap();
        assert_eq!(trap.check_uuid.as_deref(), Some("abc123-a1b2-c3d4-e5f6-123abc"));
        assert_eq!(trap.secret.as_deref(), Some("blah"));
        assert_eq!(trap.broker_cn, None);
        assert!(!trap.is_https);

        let trap = Trap::from_submission_url("https://trap.example.com/metrics").unwrap();
        assert_eq!(trap.check_uuid, None);
        assert_eq!(trap.broker_cn.as_deref(), Some("trap.example.com"));
        assert!(trap.is_https);

        assert!(matches!(
            Trap::from_submission_url("not a url"),
            Err(Error::InvalidTrapUrl(_))
        ));
    }

    #[tokio::test]
    async fn by_id_and_search_agree() {
        let api = fixtures::api();
        let prober = prober();
        let broker_config = BrokerConfig::default();

        let mut by_id = check_config();
        by_id.id = Some(1234);
        let first = CheckResolver::new(&api, &prober, &by_id, &broker_config)
            .resolve(true)
            .await
            .unwrap();

        let searched = check_config();
        let second = CheckResolver::new(&api, &prober, &searched, &broker_config)
            .resolve(true)
            .await
            .unwrap();

        assert_eq!(first.trap.url, TRAP_URL);
        assert_eq!(first.trap.url, second.trap.url);
        assert_eq!(first.trap.check_id, Some(1234));
        assert_eq!(first.trap.broker_cn.as_deref(), Some("testbroker.example.com"));
        assert_eq!(api.calls().create_check_bundle, 0);
    }

    #[tokio::test]
    async fn unknown_id_falls_through_to_search() {
        let api = fixtures::api();
        let prober = prober();
        let mut config = check_config();
        config.id = Some(99);
        let resolution = CheckResolver::new(&api, &prober, &config, &BrokerConfig::default())
            .resolve(true)
            .await
            .unwrap();
        assert_eq!(resolution.trap.url, TRAP_URL);
        assert_eq!(api.calls().search_check_bundles, 1);
    }

    #[tokio::test]
    async fn inactive_check_is_rejected() {
        let mut check = fixtures::check();
        check.active = false;
        let api = InMemoryApi::new()
            .with_check(check)
            .with_bundle(fixtures::bundle())
            .with_broker(fixtures::broker(), &[]);
        let prober = prober();
        let mut config = check_config();
        config.id = Some(1234);
        let err = CheckResolver::new(&api, &prober, &config, &BrokerConfig::default())
            .resolve(true)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InactiveCheck(_)));
    }

    #[tokio::test]
    async fn search_miss_creates_bundle() {
        let api = fixtures::api();
        let prober = prober();
        let config = CheckConfig {
            instance_id: "foo_id".into(),
            target_host: "foo_t".into(),
            display_name: "foo_dn".into(),
            search_tags: vec!["foo:bar".into()],
            tags: vec!["env:test".into(), "foo:bar".into()],
            ..Default::default()
        };
        let broker_config = BrokerConfig {
            max_response_time_ms: 50,
            ..Default::default()
        };
        let resolution = CheckResolver::new(&api, &prober, &config, &broker_config)
            .resolve(true)
            .await
            .unwrap();

        let created = api.created();
        assert_eq!(created.len(), 1);
        let payload = &created[0];
        assert_eq!(payload.brokers[0].as_str(), "/broker/1234");
        assert_eq!(payload.display_name, "foo_dn");
        assert_eq!(payload.target, "foo_t");
        assert_eq!(payload.check_type, "httptrap");
        assert_eq!(payload.tags, vec!["foo:bar".to_string(), "env:test".to_string()]);
        assert_eq!(payload.notes.as_deref(), Some("cgm_instanceid=foo_id"));
        assert_eq!(payload.config.async_metrics.as_deref(), Some("true"));
        let secret = payload.config.secret.clone().unwrap();
        assert_eq!(secret.len(), 16);

        let bundle = resolution.bundle.unwrap();
        assert_eq!(resolution.trap.url, bundle.config.submission_url.unwrap());
        assert!(resolution.trap.url.ends_with(&format!("/{secret}")));
        assert_eq!(resolution.trap.secret.as_deref(), Some(secret.as_str()));
        assert_eq!(resolution.trap.check_id, bundle.cid.unwrap().id());
    }

    #[tokio::test]
    async fn configured_secret_is_used() {
        let api = fixtures::api();
        let prober = prober();
        let config = CheckConfig {
            target_host: "other".into(),
            secret: Some("s3cr3t".into()),
            ..check_config()
        };
        CheckResolver::new(&api, &prober, &config, &BrokerConfig::default())
            .resolve(true)
            .await
            .unwrap();
        assert_eq!(api.created()[0].config.secret.as_deref(), Some("s3cr3t"));
    }

    #[tokio::test]
    async fn designated_broker_must_be_valid() {
        let api = fixtures::api();
        let unreachable = ScriptedProber::default();
        let config = CheckConfig {
            target_host: "other".into(),
            ..check_config()
        };
        let broker_config = BrokerConfig {
            id: Some(1234),
            ..Default::default()
        };
        let err = CheckResolver::new(&api, &unreachable, &config, &broker_config)
            .resolve(true)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidBroker(_)));
        assert_eq!(api.calls().get_broker, 1);
        assert_eq!(api.calls().list_brokers, 0);
        assert_eq!(api.calls().create_check_bundle, 0);
    }

    #[tokio::test]
    async fn multiple_matches_pick_lowest_id() {
        let mut newer = fixtures::bundle();
        newer.cid = Some("/check_bundle/9999".into());
        newer.config.submission_url = Some("http://127.0.0.1:43191/module/httptrap/other/blah".into());
        let mut inactive = fixtures::bundle();
        inactive.cid = Some("/check_bundle/1".into());
        inactive.status = "disabled".into();
        let api = fixtures::api().with_bundle(newer).with_bundle(inactive);
        let prober = prober();

        let resolution = CheckResolver::new(&api, &prober, &check_config(), &BrokerConfig::default())
            .resolve(true)
            .await
            .unwrap();
        assert_eq!(resolution.trap.url, TRAP_URL);
    }

    #[tokio::test]
    async fn backend_failure_aborts() {
        let api = fixtures::api();
        api.fail(Operation::SearchCheckBundles);
        let prober = prober();
        let err = CheckResolver::new(&api, &prober, &check_config(), &BrokerConfig::default())
            .resolve(true)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Backend(_)));
        assert_eq!(api.calls().create_check_bundle, 0);
    }

    #[tokio::test]
    async fn missing_check_broker_falls_through_to_search() {
        let api = InMemoryApi::new()
            .with_check(fixtures::check())
            .with_bundle(fixtures::bundle());
        let prober = prober();
        let mut config = check_config();
        config.id = Some(1234);
        let err = CheckResolver::new(&api, &prober, &config, &BrokerConfig::default())
            .resolve(true)
            .await
            .unwrap_err();

        assert_eq!(api.calls().search_check_bundles, 1);
        assert!(matches!(err, Error::Backend(_)));
        assert!(!err.is_not_found());
    }

    #[tokio::test]
    async fn no_capable_broker_blocks_creation() {
        let mut json_only = fixtures::broker();
        json_only.details[0].modules = vec!["json".into()];
        let api = InMemoryApi::new().with_broker(json_only, &[]);
        let prober = prober();
        let err = CheckResolver::new(&api, &prober, &check_config(), &BrokerConfig::default())
            .resolve(true)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::NoEligibleBroker(_)));
        assert_eq!(api.calls().list_brokers, 1);
        assert_eq!(api.calls().create_check_bundle, 0);
    }

    #[test]
    fn unmatched_ip_has_no_broker_cn() {
        let mut broker = fixtures::broker();
        broker.details[0].ip = Some("10.0.0.9".into());
        let trap = trap_for_bundle(&fixtures::bundle(), &broker).unwrap();
        assert_eq!(trap.url, TRAP_URL);
        assert_eq!(trap.broker_cn, None);
    }

    #[test]
    fn non_httptrap_uses_reverse_url() {
        let mut bundle = fixtures::bundle();
        bundle.check_type = "json:nad".into();
        let trap = trap_for_bundle(&bundle, &fixtures::broker()).unwrap();
        assert_eq!(
            trap.url,
            "https://127.0.0.1:43191/module/httptrap/abc123-a1b2-c3d4-e5f6-123abc/blah"
        );
        assert!(trap.is_https);
        assert_eq!(trap.broker_cn.as_deref(), Some("testbroker.example.com"));

        bundle.reverse_connect_urls.clear();
        assert!(matches!(
            trap_for_bundle(&bundle, &fixtures::broker()),
            Err(Error::InvalidTrapUrl(_))
        ));
    }
}
