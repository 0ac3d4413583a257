//! Broker selection: capability filtering plus a latency race between the
//! surviving broker details.
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::fmt;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::api::types::{Broker, BrokerDetail};
use crate::error::{Error, Result};

pub const DEFAULT_BROKER_PORT: u16 = 43191;
const PUBLIC_TRAP_HOST: &str = "trap.noit.circonus.net";
const PUBLIC_TRAP_PORT: u16 = 443;
const ENTERPRISE: &str = "enterprise";
const ELIGIBLE_BROKER_TYPES: [&str; 2] = ["circonus", ENTERPRISE];
const PROBE_CONCURRENCY: usize = 8;

/// Network location probed for a broker detail.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BrokerAddr {
    pub host: String,
    pub port: u16,
}

impl BrokerAddr {
    /// External host/port when published, internal otherwise. Details with
    /// neither an external host nor an IP are unreachable.
    pub fn for_detail(detail: &BrokerDetail) -> Option<Self> {
        let host = detail
            .external_host
            .as_deref()
            .filter(|h| !h.is_empty())
            .or_else(|| detail.ip.as_deref().filter(|ip| !ip.is_empty()))?
            .to_string();
        let port = if host == PUBLIC_TRAP_HOST {
            PUBLIC_TRAP_PORT
        } else {
            detail
                .external_port
                .filter(|p| *p != 0)
                .or(detail.port.filter(|p| *p != 0))
                .unwrap_or(DEFAULT_BROKER_PORT)
        };
        Some(Self { host, port })
    }
}

impl fmt::Display for BrokerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Reachability probe used to rank broker details.
#[async_trait]
pub trait Prober: Send + Sync {
    /// Time taken to reach `addr`, or `None` if it could not be reached
    /// within `timeout`.
    async fn probe(&self, addr: &BrokerAddr, timeout: Duration) -> Option<Duration>;
}

/// Probes by opening (and immediately dropping) a TCP connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpProber;

#[async_trait]
impl Prober for TcpProber {
    async fn probe(&self, addr: &BrokerAddr, timeout: Duration) -> Option<Duration> {
        let start_time = Instant::now();
        let result = tokio::time::timeout(
            timeout,
            TcpStream::connect((addr.host.as_str(), addr.port)),
        )
        .await;

        match result {
            Ok(Ok(_stream)) => Some(start_time.elapsed()),
            Ok(Err(e)) => {
                debug!(addr = %addr, error = %e, "Broker probe failed.");
                None
            }
            Err(_) => {
                debug!(addr = %addr, timeout_ms = timeout.as_millis() as u64, "Broker probe timed out.");
                None
            }
        }
    }
}

/// The broker chosen for a check, with the detail that won the race.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub broker: Broker,
    pub detail: BrokerDetail,
    pub addr: BrokerAddr,
    pub latency: Duration,
}

pub fn is_eligible_type(broker: &Broker) -> bool {
    ELIGIBLE_BROKER_TYPES.contains(&broker.broker_type.as_str())
}

/// Details of `broker` that are active, load `check_type`, and have an
/// address, in declaration order.
pub fn eligible_details<'a>(
    broker: &'a Broker,
    check_type: &'a str,
) -> impl Iterator<Item = (&'a BrokerDetail, BrokerAddr)> + 'a {
    broker
        .details
        .iter()
        .filter(move |d| d.is_active() && d.supports(check_type))
        .filter_map(|d| BrokerAddr::for_detail(d).map(|addr| (d, addr)))
}

/// The broker detail serving `host`, matched on IP or external host.
pub fn detail_for_host<'a>(broker: &'a Broker, host: &str) -> Option<&'a BrokerDetail> {
    broker.details.iter().find(|d| {
        d.ip.as_deref() == Some(host) || d.external_host.as_deref() == Some(host)
    })
}

pub struct BrokerSelector<'a> {
    prober: &'a dyn Prober,
    check_type: &'a str,
    max_response_time: Duration,
}

impl<'a> BrokerSelector<'a> {
    pub fn new(prober: &'a dyn Prober, check_type: &'a str, max_response_time: Duration) -> Self {
        Self {
            prober,
            check_type,
            max_response_time,
        }
    }

    /// Picks the lowest-latency eligible detail across `brokers`. Enterprise
    /// brokers win over public ones whenever one of them qualifies; equal
    /// latencies keep declaration order.
    pub async fn select(&self, brokers: &[Broker]) -> Result<Selection> {
        let candidates: Vec<(&Broker, &BrokerDetail, BrokerAddr)> = brokers
            .iter()
            .filter(|b| is_eligible_type(b))
            .flat_map(|b| {
                eligible_details(b, self.check_type).map(move |(d, addr)| (b, d, addr))
            })
            .collect();

        if candidates.is_empty() {
            return Err(Error::NoEligibleBroker(format!(
                "found {} broker(s), none with an active detail supporting {}",
                brokers.len(),
                self.check_type
            )));
        }
        debug!(candidates = candidates.len(), check_type = %self.check_type, "Probing broker candidates.");

        let probed: Vec<_> = stream::iter(candidates)
            .map(|(broker, detail, addr)| async move {
                let latency = self.prober.probe(&addr, self.max_response_time).await;
                (broker, detail, addr, latency)
            })
            .buffered(PROBE_CONCURRENCY)
            .collect()
            .await;
        let total = probed.len();

        let reachable: Vec<Selection> = probed
            .into_iter()
            .filter_map(|(broker, detail, addr, latency)| match latency {
                Some(latency) if latency <= self.max_response_time => Some(Selection {
                    broker: broker.clone(),
                    detail: detail.clone(),
                    addr,
                    latency,
                }),
                Some(latency) => {
                    warn!(broker = %broker.cid, addr = %addr, latency_ms = latency.as_millis() as u64, "Broker too slow, skipping.");
                    None
                }
                None => {
                    warn!(broker = %broker.cid, addr = %addr, "Broker unreachable, skipping.");
                    None
                }
            })
            .collect();

        let have_enterprise = reachable.iter().any(|s| s.broker.broker_type == ENTERPRISE);
        let selected = reachable
            .into_iter()
            .filter(|s| !have_enterprise || s.broker.broker_type == ENTERPRISE)
            .min_by_key(|s| s.latency)
            .ok_or_else(|| {
                Error::NoEligibleBroker(format!(
                    "{total} candidate(s), none reachable within {}ms",
                    self.max_response_time.as_millis()
                ))
            })?;

        info!(
            broker = %selected.broker.cid,
            addr = %selected.addr,
            latency_ms = selected.latency.as_millis() as u64,
            "Selected broker."
        );
        Ok(selected)
    }

    /// Checks a designated broker: the first eligible detail that answers in
    /// time makes it valid.
    pub async fn validate(&self, broker: &Broker) -> Result<Selection> {
        if is_eligible_type(broker) {
            for (detail, addr) in eligible_details(broker, self.check_type) {
                if let Some(latency) = self.prober.probe(&addr, self.max_response_time).await {
                    if latency <= self.max_response_time {
                        return Ok(Selection {
                            broker: broker.clone(),
                            detail: detail.clone(),
                            addr,
                            latency,
                        });
                    }
                }
            }
        }
        Err(Error::InvalidBroker(format!("{} [{}]", broker.cid, broker.name)))
    }
}
