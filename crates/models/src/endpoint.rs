use std::net::IpAddr;

/// A cluster member's broadcast address. Addresses identify members on the
/// wire; the durable identity is the [`HostId`].
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(transparent)]
pub struct Endpoint(pub IpAddr);

impl Endpoint {
    pub fn parse(s: &str) -> Result<Self, crate::Error> {
        s.parse::<IpAddr>()
            .map(Endpoint)
            .map_err(|_| crate::Error::InvalidEndpoint(s.to_string()))
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<IpAddr> for Endpoint {
    fn from(addr: IpAddr) -> Self {
        Endpoint(addr)
    }
}

impl std::str::FromStr for Endpoint {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Durable node identity, assigned once at first boot and carried across
/// address changes.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(transparent)]
pub struct HostId(pub uuid::Uuid);

impl HostId {
    pub fn random() -> Self {
        HostId(uuid::Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Option<Self> {
        uuid::Uuid::parse_str(s).ok().map(HostId)
    }
}

impl std::fmt::Display for HostId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn endpoint_parse_round_trip() {
        let ep = Endpoint::parse("10.0.0.1").unwrap();
        assert_eq!(ep.to_string(), "10.0.0.1");
        assert!(Endpoint::parse("not-an-address").is_err());
    }

    #[test]
    fn host_id_round_trip() {
        let id = HostId::random();
        assert_eq!(HostId::parse(&id.to_string()), Some(id));
    }
}
