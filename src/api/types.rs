//! Wire records exchanged with the monitoring backend.
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub const STATUS_ACTIVE: &str = "active";
pub const CHECK_TYPE_HTTPTRAP: &str = "httptrap";

macro_rules! cid_type {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub const PREFIX: &'static str = $prefix;

            pub fn from_id(id: u64) -> Self {
                Self(format!("{}/{}", $prefix, id))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Numeric id at the end of the CID, if it carries one.
            pub fn id(&self) -> Option<u64> {
                self.0.strip_prefix($prefix)?.strip_prefix('/')?.parse().ok()
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

cid_type!(
    /// `/check/<id>`
    CheckCid,
    "/check"
);
cid_type!(
    /// `/check_bundle/<id>`
    BundleCid,
    "/check_bundle"
);
cid_type!(
    /// `/broker/<id>`
    BrokerCid,
    "/broker"
);

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct CheckDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submission_url: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Check {
    #[serde(rename = "_cid")]
    pub cid: CheckCid,
    #[serde(rename = "_active", default)]
    pub active: bool,
    #[serde(rename = "_broker")]
    pub broker: BrokerCid,
    #[serde(rename = "_check_bundle")]
    pub check_bundle: BundleCid,
    #[serde(rename = "_check_uuid", default)]
    pub check_uuid: String,
    #[serde(rename = "_details", default)]
    pub details: CheckDetails,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    #[default]
    Numeric,
    Text,
    Histogram,
    Composite,
    Caql,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MetricStatus {
    #[default]
    Active,
    Available,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CheckBundleMetric {
    pub name: String,
    #[serde(rename = "type", default)]
    pub metric_type: MetricType,
    #[serde(default)]
    pub status: MetricStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
}

/// Check bundle `config` object. Known keys are typed, anything else the
/// backend sends is carried through untouched.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct CheckBundleConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submission_url: Option<String>,
    #[serde(
        rename = "reverse:secret_key",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub reverse_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(
        rename = "asynch_metrics",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub async_metrics: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct CheckBundle {
    #[serde(rename = "_cid", default, skip_serializing_if = "Option::is_none")]
    pub cid: Option<BundleCid>,
    #[serde(rename = "_checks", default, skip_serializing_if = "Vec::is_empty")]
    pub checks: Vec<CheckCid>,
    #[serde(rename = "_check_uuids", default, skip_serializing_if = "Vec::is_empty")]
    pub check_uuids: Vec<String>,
    #[serde(
        rename = "_reverse_connection_urls",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub reverse_connect_urls: Vec<String>,
    #[serde(default)]
    pub brokers: Vec<BrokerCid>,
    #[serde(default)]
    pub config: CheckBundleConfig,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub metrics: Vec<CheckBundleMetric>,
    #[serde(default)]
    pub metric_limit: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default)]
    pub period: u32,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub timeout: u32,
    #[serde(rename = "type", default)]
    pub check_type: String,
}

impl CheckBundle {
    pub fn is_active(&self) -> bool {
        self.status == STATUS_ACTIVE
    }

    pub fn metric(&self, name: &str) -> Option<&CheckBundleMetric> {
        self.metrics.iter().find(|m| m.name == name)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct BrokerDetail {
    #[serde(default)]
    pub cn: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default)]
    pub modules: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default)]
    pub status: String,
}

impl BrokerDetail {
    pub fn is_active(&self) -> bool {
        self.status == STATUS_ACTIVE
    }

    /// A module matches either the full check type or its base type
    /// (`json:nad` is served by `json`).
    pub fn supports(&self, check_type: &str) -> bool {
        if self.modules.iter().any(|m| m == check_type) {
            return true;
        }
        match check_type.split_once(':') {
            Some((base, _)) if !base.is_empty() => self.modules.iter().any(|m| m == base),
            _ => false,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Broker {
    #[serde(rename = "_cid")]
    pub cid: BrokerCid,
    #[serde(rename = "_name", default)]
    pub name: String,
    #[serde(rename = "_type", default)]
    pub broker_type: String,
    #[serde(rename = "_details", default)]
    pub details: Vec<BrokerDetail>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cid_id_parsing() {
        assert_eq!(BundleCid::from("/check_bundle/1234").id(), Some(1234));
        assert_eq!(CheckCid::from_id(7).as_str(), "/check/7");
        assert_eq!(BrokerCid::from("/broker/abc").id(), None);
        // A check cid must not parse a bundle cid.
        assert_eq!(CheckCid::from("/check_bundle/1").id(), None);
    }

    #[test]
    fn detail_supports_base_type() {
        let detail = BrokerDetail {
            modules: vec!["httptrap".into(), "json".into()],
            status: STATUS_ACTIVE.into(),
            ..Default::default()
        };
        assert!(detail.supports("httptrap"));
        assert!(detail.supports("json:nad"));
        assert!(!detail.supports("ping_icmp"));
        assert!(!detail.supports(":nad"));
    }

    #[test]
    fn bundle_config_keeps_unknown_keys() {
        let raw = r#"{
            "_cid": "/check_bundle/1",
            "display_name": "x",
            "type": "httptrap",
            "config": {
                "submission_url": "http://127.0.0.1:43191/module/httptrap/u/s",
                "reverse:secret_key": "s",
                "custom_key": "v"
            },
            "metrics": [{"name": "elmo", "type": "numeric", "status": "active"}]
        }"#;
        let bundle: CheckBundle = serde_json::from_str(raw).unwrap();
        assert_eq!(bundle.config.reverse_secret.as_deref(), Some("s"));
        assert_eq!(bundle.config.extra.get("custom_key").map(String::as_str), Some("v"));

        let back = serde_json::to_value(&bundle).unwrap();
        assert_eq!(back["config"]["custom_key"], "v");
        assert_eq!(back["config"]["reverse:secret_key"], "s");
        assert!(back.get("_checks").is_none());
    }
}
