use models::Endpoint;
use std::collections::HashMap;

/// Where a member sits physically. Queried for datacenter, rack, and
/// proximity ordering; implementations must answer for any endpoint, using
/// defaults for nodes they have not been told about.
pub trait Topology: Send + Sync + 'static {
    fn datacenter(&self, endpoint: Endpoint) -> String;
    fn rack(&self, endpoint: Endpoint) -> String;

    /// Order `endpoints` by increasing distance from `from`: same rack,
    /// then same datacenter, then the rest.
    fn sort_by_proximity(&self, from: Endpoint, endpoints: &mut Vec<Endpoint>) {
        let dc = self.datacenter(from);
        let rack = self.rack(from);
        endpoints.sort_by_key(|ep| {
            let same_dc = self.datacenter(*ep) == dc;
            let same_rack = same_dc && self.rack(*ep) == rack;
            (!same_rack, !same_dc, *ep)
        });
    }
}

/// Table-driven topology with a default location for unknown members.
#[derive(Debug, Clone)]
pub struct SimpleTopology {
    datacenters: HashMap<Endpoint, String>,
    racks: HashMap<Endpoint, String>,
    default_dc: String,
    default_rack: String,
}

impl SimpleTopology {
    pub fn new(default_dc: &str, default_rack: &str) -> Self {
        Self {
            datacenters: HashMap::new(),
            racks: HashMap::new(),
            default_dc: default_dc.to_string(),
            default_rack: default_rack.to_string(),
        }
    }

    pub fn with_location(mut self, endpoint: Endpoint, dc: &str, rack: &str) -> Self {
        self.set_location(endpoint, dc, rack);
        self
    }

    pub fn set_location(&mut self, endpoint: Endpoint, dc: &str, rack: &str) {
        self.datacenters.insert(endpoint, dc.to_string());
        self.racks.insert(endpoint, rack.to_string());
    }
}

impl Topology for SimpleTopology {
    fn datacenter(&self, endpoint: Endpoint) -> String {
        self.datacenters
            .get(&endpoint)
            .cloned()
            .unwrap_or_else(|| self.default_dc.clone())
    }

    fn rack(&self, endpoint: Endpoint) -> String {
        self.racks
            .get(&endpoint)
            .cloned()
            .unwrap_or_else(|| self.default_rack.clone())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn ep(s: &str) -> Endpoint {
        Endpoint::parse(s).unwrap()
    }

    #[test]
    fn unknown_members_use_defaults() {
        let topo = SimpleTopology::new("dc1", "rack1");
        assert_eq!(topo.datacenter(ep("10.0.0.1")), "dc1");
        assert_eq!(topo.rack(ep("10.0.0.1")), "rack1");
    }

    #[test]
    fn proximity_prefers_rack_then_datacenter() {
        let topo = SimpleTopology::new("dc1", "r1")
            .with_location(ep("10.0.0.1"), "dc1", "r1")
            .with_location(ep("10.0.0.2"), "dc1", "r2")
            .with_location(ep("10.0.0.3"), "dc2", "r1")
            .with_location(ep("10.0.0.4"), "dc1", "r1");

        let mut peers = vec![ep("10.0.0.3"), ep("10.0.0.2"), ep("10.0.0.4")];
        topo.sort_by_proximity(ep("10.0.0.1"), &mut peers);
        assert_eq!(peers, vec![ep("10.0.0.4"), ep("10.0.0.2"), ep("10.0.0.3")]);
    }
}
