//! Canned backend records shared by unit tests.
use crate::api::types::{
    Broker, BrokerDetail, Check, CheckBundle, CheckBundleConfig, CheckBundleMetric, CheckDetails,
    MetricStatus, MetricType, STATUS_ACTIVE,
};
use crate::api::InMemoryApi;

pub const TRAP_URL: &str =
    "http://127.0.0.1:43191/module/httptrap/abc123-a1b2-c3d4-e5f6-123abc/blah";
pub const CHECK_UUID: &str = "abc123-a1b2-c3d4-e5f6-123abc";

pub fn check() -> Check {
    Check {
        cid: "/check/1234".into(),
        active: true,
        broker: "/broker/1234".into(),
        check_bundle: "/check_bundle/1234".into(),
        check_uuid: CHECK_UUID.into(),
        details: CheckDetails {
            submission_url: Some(TRAP_URL.into()),
        },
    }
}

pub fn bundle() -> CheckBundle {
    CheckBundle {
        cid: Some("/check_bundle/1234".into()),
        checks: vec!["/check/1234".into()],
        check_uuids: vec![CHECK_UUID.into()],
        reverse_connect_urls: vec![format!("mtev_reverse://127.0.0.1:43191/check/{CHECK_UUID}")],
        brokers: vec!["/broker/1234".into()],
        config: CheckBundleConfig {
            submission_url: Some(TRAP_URL.into()),
            reverse_secret: Some("blah".into()),
            ..Default::default()
        },
        display_name: "test_dn".into(),
        metrics: vec![CheckBundleMetric {
            name: "elmo".into(),
            metric_type: MetricType::Numeric,
            status: MetricStatus::Active,
            tags: Vec::new(),
            units: None,
        }],
        metric_limit: 0,
        notes: Some("cgm_instanceid=test_id".into()),
        period: 60,
        status: STATUS_ACTIVE.into(),
        tags: vec!["test:test".into()],
        target: "test".into(),
        timeout: 10,
        check_type: "httptrap".into(),
    }
}

pub fn broker() -> Broker {
    Broker {
        cid: "/broker/1234".into(),
        name: "test broker".into(),
        broker_type: "enterprise".into(),
        details: vec![BrokerDetail {
            cn: "testbroker.example.com".into(),
            external_host: None,
            external_port: Some(43191),
            ip: Some("127.0.0.1".into()),
            modules: vec!["httptrap".into()],
            port: Some(43191),
            status: STATUS_ACTIVE.into(),
        }],
    }
}

pub fn api() -> InMemoryApi {
    InMemoryApi::new()
        .with_check(check())
        .with_bundle(bundle())
        .with_broker(broker(), &[])
}
