//! VPN Region Catalog
//!
//! Fetches the provider's points of presence, ranks them by measured
//! latency and picks one for a session.
//!
//! # Ranking
//!
//! Every region with a WireGuard server is probed concurrently, one task per
//! region. Each task returns its own `(index, latency)` result; the list is
//! only touched again after all of them have been joined. Unreachable
//! regions always sort after reachable ones.

use crate::error::ProtocolError;
use crate::probe::LatencyProbe;
use pia_network::{Request, Transport};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Public server list endpoint
pub const DEFAULT_CATALOG_URL: &str = "https://serverlist.piaservers.net/vpninfo/servers/v4";

/// A provider server: dialed by IP, identified by certificate name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub ip: IpAddr,
    pub cn: String,
}

/// Service types a region may expose
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    /// Metadata / authentication service
    Meta,
    /// WireGuard key registration and port forwarding
    WireGuard,
}

impl ServiceKind {
    /// Key used in the catalog's `servers` map
    pub fn key(&self) -> &'static str {
        match self {
            ServiceKind::Meta => "meta",
            ServiceKind::WireGuard => "wg",
        }
    }
}

/// A point of presence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub port_forward: bool,
    /// Servers per service type, in the provider's order
    #[serde(default)]
    pub servers: BTreeMap<String, Vec<Server>>,
    /// Mean RTT from the last probe of this catalog fetch; `None` when
    /// unreachable or not measured
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency: Option<Duration>,
}

impl Region {
    /// First server of a service type
    pub fn server(&self, kind: ServiceKind) -> Option<&Server> {
        self.servers.get(kind.key())?.first()
    }

    /// WireGuard endpoint, if the region has one
    pub fn tunnel_server(&self) -> Option<&Server> {
        self.server(ServiceKind::WireGuard)
    }

    /// Metadata endpoint, if the region has one
    pub fn meta_server(&self) -> Option<&Server> {
        self.server(ServiceKind::Meta)
    }

    /// Does this region support WireGuard sessions?
    pub fn has_tunnel(&self) -> bool {
        self.tunnel_server().is_some()
    }

    /// Was the last probe answered?
    pub fn is_reachable(&self) -> bool {
        self.latency.is_some_and(|d| !d.is_zero())
    }
}

#[derive(Deserialize)]
struct ServerList {
    regions: Vec<Region>,
}

/// Region catalog client
pub struct RegionCatalog<T, P> {
    transport: T,
    probe: Arc<P>,
    url: String,
}

impl<T: Transport, P: LatencyProbe> RegionCatalog<T, P> {
    pub fn new(transport: T, probe: P) -> Self {
        Self::with_shared_probe(transport, Arc::new(probe))
    }

    /// Build around a probe that is also used elsewhere
    pub fn with_shared_probe(transport: T, probe: Arc<P>) -> Self {
        Self {
            transport,
            probe,
            url: DEFAULT_CATALOG_URL.to_string(),
        }
    }

    /// Use a different server list URL
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Fetch every region from the server list
    pub async fn fetch_all(&self) -> Result<Vec<Region>, RegionError> {
        debug!("Fetching server list from {}", self.url);
        let response = self
            .transport
            .send(Request::get(&self.url).map_err(ProtocolError::from)?)
            .await
            .map_err(ProtocolError::from)?;

        let list: ServerList = response
            .json()
            .map_err(|e| ProtocolError::decode("server list", e))?;

        info!("Server list has {} regions", list.regions.len());
        Ok(list.regions)
    }

    /// Probe every region concurrently and sort by latency
    ///
    /// Latencies from any earlier measurement are discarded first.
    pub async fn rank_by_latency(&self, mut regions: Vec<Region>) -> Vec<Region> {
        let mut probes = JoinSet::new();

        for (index, region) in regions.iter_mut().enumerate() {
            region.latency = None;
            let Some(server) = region.tunnel_server() else {
                continue;
            };
            let probe = Arc::clone(&self.probe);
            let addr = server.ip;
            probes.spawn(async move { (index, probe.probe(addr).await) });
        }

        debug!("Probing {} regions", probes.len());
        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok((index, latency)) => {
                    regions[index].latency = latency.filter(|d| !d.is_zero());
                }
                Err(e) => warn!("Latency probe task failed: {}", e),
            }
        }

        sort_by_latency(&mut regions);
        regions
    }

    /// Look a region up by id and check that it answers
    ///
    /// An unreachable region is still returned; only a warning is logged.
    pub async fn locate(&self, id: &str, regions: &[Region]) -> Result<Region, RegionError> {
        let mut region = find_by_id(id, regions)?;
        if let Some(server) = region.tunnel_server() {
            let addr = server.ip;
            region.latency = self.probe.probe(addr).await.filter(|d| !d.is_zero());
            if !region.is_reachable() {
                warn!(
                    "WireGuard server for region {} ({}) is not currently reachable at {}",
                    region.id, region.name, addr
                );
            }
        }
        Ok(region)
    }
}

/// Stable sort: ascending latency, unreachable regions last
pub fn sort_by_latency(regions: &mut [Region]) {
    regions.sort_by(|a, b| match (a.is_reachable(), b.is_reachable()) {
        (true, true) => a.latency.cmp(&b.latency),
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => Ordering::Equal,
    });
}

/// First region, in list order, with port forwarding and a WireGuard server
pub fn select_best(regions: &[Region]) -> Result<Region, RegionError> {
    regions
        .iter()
        .find(|r| r.port_forward && r.has_tunnel())
        .cloned()
        .ok_or(RegionError::NoSuitableRegion)
}

/// Exact match by id; the region must have a WireGuard server
pub fn find_by_id(id: &str, regions: &[Region]) -> Result<Region, RegionError> {
    let region = regions
        .iter()
        .find(|r| r.id == id)
        .ok_or_else(|| RegionError::NotFound(id.to_string()))?;

    if !region.has_tunnel() {
        return Err(RegionError::NoTunnelService {
            id: region.id.clone(),
            name: region.name.clone(),
        });
    }
    Ok(region.clone())
}

/// Region errors
#[derive(Debug, thiserror::Error)]
pub enum RegionError {
    #[error("No suitable region (port forwarding + WireGuard) found")]
    NoSuitableRegion,

    #[error("Could not find region {0}")]
    NotFound(String),

    #[error("Region {id} ({name}) was found but does not have a WireGuard server")]
    NoTunnelService { id: String, name: String },

    #[error("Region {id} ({name}) does not list a metadata server")]
    NoMetaService { id: String, name: String },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use pia_network::MockTransport;
    use proptest::prelude::*;
    use std::collections::HashMap;

    /// Probe answering from a fixed table; unknown addresses are unreachable
    pub(crate) struct TableProbe(pub HashMap<IpAddr, Duration>);

    impl LatencyProbe for TableProbe {
        async fn probe(&self, addr: IpAddr) -> Option<Duration> {
            self.0.get(&addr).copied()
        }
    }

    pub(crate) fn region(id: &str, ip: &str, port_forward: bool, wg: bool) -> Region {
        let server = Server {
            ip: ip.parse().unwrap(),
            cn: format!("{id}401"),
        };
        let mut servers = BTreeMap::new();
        servers.insert("meta".to_string(), vec![server.clone()]);
        if wg {
            servers.insert("wg".to_string(), vec![server]);
        }
        Region {
            id: id.to_string(),
            name: id.to_uppercase(),
            port_forward,
            servers,
            latency: None,
        }
    }

    const SERVER_LIST: &str = r#"{
        "groups": {"wg": [{"name": "wg", "ports": [1337]}]},
        "regions": [
            {
                "id": "ca_toronto",
                "name": "CA Toronto",
                "country": "CA",
                "port_forward": true,
                "servers": {
                    "meta": [{"ip": "66.115.142.2", "cn": "toronto401"}],
                    "wg": [{"ip": "66.115.142.46", "cn": "toronto401"}]
                }
            },
            {
                "id": "us_florida",
                "name": "US Florida",
                "port_forward": false,
                "servers": {
                    "meta": [{"ip": "102.129.152.2", "cn": "miami401"}]
                }
            }
        ]
    }

    c2lnbmF0dXJl"#;

    #[tokio::test]
    async fn test_fetch_all() {
        let mock = MockTransport::new();
        mock.respond("/vpninfo/servers/v4", SERVER_LIST);

        let catalog = RegionCatalog::new(&mock, TableProbe(HashMap::new()));
        let regions = catalog.fetch_all().await.unwrap();

        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].id, "ca_toronto");
        assert!(regions[0].port_forward);
        assert_eq!(regions[0].tunnel_server().unwrap().cn, "toronto401");
        assert!(!regions[1].has_tunnel());
        assert_eq!(regions[1].latency, None);

        let sent = mock.requests();
        assert_eq!(sent[0].request.host, "serverlist.piaservers.net");
    }

    #[tokio::test]
    async fn test_fetch_all_decode_error() {
        let mock = MockTransport::new();
        mock.respond("/vpninfo/servers/v4", "<html>maintenance</html>");

        let catalog = RegionCatalog::new(&mock, TableProbe(HashMap::new()));
        let result = catalog.fetch_all().await;
        assert!(matches!(
            result,
            Err(RegionError::Protocol(ProtocolError::Decode { .. }))
        ));
    }

    #[tokio::test]
    async fn test_rank_by_latency() {
        let regions = vec![
            region("slow", "10.0.0.1", true, true),
            region("dead", "10.0.0.2", true, true),
            region("nowg", "10.0.0.3", true, false),
            region("fast", "10.0.0.4", true, true),
        ];
        let mut table = HashMap::new();
        table.insert("10.0.0.1".parse().unwrap(), Duration::from_millis(80));
        table.insert("10.0.0.4".parse().unwrap(), Duration::from_millis(20));
        // Region without WireGuard must not be probed even if it would answer
        table.insert("10.0.0.3".parse().unwrap(), Duration::from_millis(1));

        let catalog = RegionCatalog::new(MockTransport::new(), TableProbe(table));
        let ranked = catalog.rank_by_latency(regions).await;

        let ids: Vec<&str> = ranked.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["fast", "slow", "dead", "nowg"]);
        assert_eq!(ranked[0].latency, Some(Duration::from_millis(20)));
        assert_eq!(ranked[3].latency, None);
    }

    #[tokio::test]
    async fn test_rank_discards_stale_latency() {
        let mut stale = region("a", "10.0.0.1", true, true);
        stale.latency = Some(Duration::from_millis(5));

        let catalog = RegionCatalog::new(MockTransport::new(), TableProbe(HashMap::new()));
        let ranked = catalog.rank_by_latency(vec![stale]).await;
        assert_eq!(ranked[0].latency, None);
    }

    #[test]
    fn test_select_best() {
        let mut a = region("a", "10.0.0.1", true, true);
        a.latency = Some(Duration::from_millis(20));
        let b = region("b", "10.0.0.2", true, true);
        assert_eq!(select_best(&[a.clone(), b]).unwrap().id, "a");

        let no_pf = region("c", "10.0.0.3", false, true);
        let no_wg = region("d", "10.0.0.4", true, false);
        assert_eq!(select_best(&[no_pf.clone(), no_wg.clone(), a]).unwrap().id, "a");
        assert!(matches!(
            select_best(&[no_pf, no_wg]),
            Err(RegionError::NoSuitableRegion)
        ));
    }

    #[test]
    fn test_find_by_id() {
        let regions = vec![
            region("ca_toronto", "10.0.0.1", true, true),
            region("us_florida", "10.0.0.2", false, false),
        ];
        assert_eq!(find_by_id("ca_toronto", &regions).unwrap().id, "ca_toronto");
        assert!(matches!(
            find_by_id("ca_tor", &regions),
            Err(RegionError::NotFound(_))
        ));
        assert!(matches!(
            find_by_id("us_florida", &regions),
            Err(RegionError::NoTunnelService { .. })
        ));
    }

    #[tokio::test]
    async fn test_locate_unreachable_is_not_an_error() {
        let regions = vec![region("ca_toronto", "10.0.0.1", true, true)];
        let catalog = RegionCatalog::new(MockTransport::new(), TableProbe(HashMap::new()));

        let found = catalog.locate("ca_toronto", &regions).await.unwrap();
        assert!(!found.is_reachable());
    }

    proptest! {
        #[test]
        fn prop_reachable_never_after_unreachable(latencies in proptest::collection::vec(
            proptest::option::of(0u64..500), 0..40
        )) {
            let mut regions: Vec<Region> = latencies
                .iter()
                .enumerate()
                .map(|(i, ms)| {
                    let mut r = region(&format!("r{i}"), "10.0.0.1", true, true);
                    r.latency = ms.map(Duration::from_millis);
                    r
                })
                .collect();

            sort_by_latency(&mut regions);

            let first_unreachable = regions.iter().position(|r| !r.is_reachable());
            if let Some(pos) = first_unreachable {
                prop_assert!(regions[pos..].iter().all(|r| !r.is_reachable()));
            }
            for pair in regions.windows(2) {
                if pair[0].is_reachable() && pair[1].is_reachable() {
                    prop_assert!(pair[0].latency <= pair[1].latency);
                }
            }
        }
    }
}
