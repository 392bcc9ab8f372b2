//! Endpoints: addressable VIF (or proxied) destinations (spec §3, §6).

use crate::routing_id::RoutingId;
use std::fmt;
use std::str::FromStr;

/// The endpoint string format's version tag. Bumped whenever the field
/// layout below changes in a way that breaks round-tripping.
pub const ENDPOINT_STRING_VERSION: u32 = 6;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointParseError(pub String);

impl fmt::Display for EndpointParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed endpoint string: {}", self.0)
    }
}

impl std::error::Error for EndpointParseError {}

/// An addressable location: a protocol tag, an address, a Routing ID, a
/// negotiable protocol-version range, whether it serves a mount table, and
/// an optional route of intermediate Routing IDs used to reach it through
/// one or more proxies.
///
/// Endpoints are immutable once created; every mutator here returns a new
/// value rather than mutating in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    protocol: String,
    address: String,
    routing_id: RoutingId,
    min_version: u32,
    max_version: u32,
    serves_mount_table: bool,
    route: Vec<RoutingId>,
}

impl Endpoint {
    pub fn new(protocol: impl Into<String>, address: impl Into<String>) -> Self {
        Endpoint {
            protocol: protocol.into(),
            address: address.into(),
            routing_id: RoutingId::UNKNOWN,
            min_version: ENDPOINT_STRING_VERSION,
            max_version: ENDPOINT_STRING_VERSION,
            serves_mount_table: false,
            route: Vec::new(),
        }
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn routing_id(&self) -> RoutingId {
        self.routing_id
    }

    pub fn version_range(&self) -> (u32, u32) {
        (self.min_version, self.max_version)
    }

    pub fn serves_mount_table(&self) -> bool {
        self.serves_mount_table
    }

    pub fn route(&self) -> &[RoutingId] {
        &self.route
    }

    pub fn with_routing_id(mut self, id: RoutingId) -> Self {
        self.routing_id = id;
        self
    }

    pub fn with_version_range(mut self, min: u32, max: u32) -> Self {
        self.min_version = min;
        self.max_version = max;
        self
    }

    pub fn with_mount_table_flag(mut self, flag: bool) -> Self {
        self.serves_mount_table = flag;
        self
    }

    pub fn with_route(mut self, route: Vec<RoutingId>) -> Self {
        self.route = route;
        self
    }

    /// Returns a copy with `id` pushed onto the *head* of the route (the
    /// proxy relaying for this endpoint is the new next hop to dial).
    pub fn with_route_prefixed(&self, id: RoutingId) -> Self {
        let mut route = Vec::with_capacity(self.route.len() + 1);
        route.push(id);
        route.extend_from_slice(&self.route);
        Endpoint {
            route,
            ..self.clone()
        }
    }

    /// Returns a copy with the head of the route popped off, along with the
    /// popped Routing ID (proxy transit routing, spec §4.9).
    pub fn without_route_head(&self) -> (Option<RoutingId>, Endpoint) {
        if self.route.is_empty() {
            return (None, self.clone());
        }
        let head = self.route[0];
        let rest = self.route[1..].to_vec();
        (
            Some(head),
            Endpoint {
                route: rest,
                ..self.clone()
            },
        )
    }

    /// Parse either the structured `/@...@` form or the legacy `/host:port`
    /// form (spec §6).
    pub fn parse(s: &str) -> Result<Endpoint, EndpointParseError> {
        let body = s
            .strip_prefix('/')
            .ok_or_else(|| EndpointParseError(format!("missing leading '/': {s:?}")))?;

        if !body.starts_with('@') {
            // Legacy form: /host:port
            if body.is_empty() || body.contains('@') {
                return Err(EndpointParseError(format!("not a legacy endpoint: {s:?}")));
            }
            return Ok(Endpoint::new("tcp", body));
        }

        let fields: Vec<&str> = body.split('@').collect();
        // "@v@proto@addr@routes@minv@maxv@rid@mt@" splits (on '@') into:
        // ["", v, proto, addr, routes, minv, maxv, rid, mt, ""]
        if fields.len() != 10 || !fields[0].is_empty() || !fields[9].is_empty() {
            return Err(EndpointParseError(format!("wrong field count: {s:?}")));
        }

        let _version: u32 = fields[1]
            .parse()
            .map_err(|_| EndpointParseError(format!("bad version field: {:?}", fields[1])))?;
        let protocol = fields[2].to_string();
        let address = fields[3].to_string();
        let route = if fields[4].is_empty() {
            Vec::new()
        } else {
            fields[4]
                .split(',')
                .map(|h| {
                    RoutingId::from_hex(h)
                        .ok_or_else(|| EndpointParseError(format!("bad route hop: {h:?}")))
                })
                .collect::<Result<Vec<_>, _>>()?
        };
        let min_version: u32 = fields[5]
            .parse()
            .map_err(|_| EndpointParseError(format!("bad min-version: {:?}", fields[5])))?;
        let max_version: u32 = fields[6]
            .parse()
            .map_err(|_| EndpointParseError(format!("bad max-version: {:?}", fields[6])))?;
        let routing_id = if fields[7].is_empty() {
            RoutingId::UNKNOWN
        } else {
            RoutingId::from_hex(fields[7])
                .ok_or_else(|| EndpointParseError(format!("bad routing id: {:?}", fields[7])))?
        };
        let serves_mount_table = match fields[8] {
            "" | "0" => false,
            "1" | "m" => true,
            other => {
                return Err(EndpointParseError(format!(
                    "bad mount-table flag: {other:?}"
                )));
            }
        };

        Ok(Endpoint {
            protocol,
            address,
            routing_id,
            min_version,
            max_version,
            serves_mount_table,
            route,
        })
    }

    /// True if `name` begins with this endpoint's string form followed by
    /// `/` or is exactly the endpoint string (mountable-name concatenation,
    /// spec §6).
    pub fn name_join(&self, suffix: &str) -> String {
        if suffix.is_empty() {
            self.to_string()
        } else {
            format!("{self}/{suffix}")
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let routes = self
            .route
            .iter()
            .map(|r| r.to_hex())
            .collect::<Vec<_>>()
            .join(",");
        let mt = if self.serves_mount_table { "1" } else { "0" };
        let rid = if self.routing_id.is_unknown() {
            String::new()
        } else {
            self.routing_id.to_hex()
        };
        write!(
            f,
            "/@{}@{}@{}@{}@{}@{}@{}@{}@",
            ENDPOINT_STRING_VERSION,
            self.protocol,
            self.address,
            routes,
            self.min_version,
            self.max_version,
            rid,
            mt
        )
    }
}

impl FromStr for Endpoint {
    type Err = EndpointParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Endpoint::parse(s)
    }
}
