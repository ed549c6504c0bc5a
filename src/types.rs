use std::fmt;

/// A `(host, port)` pair identifying a broker on the network.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Endpoint {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl From<(String, u16)> for Endpoint {
    fn from((host, port): (String, u16)) -> Self {
        Endpoint { host, port }
    }
}

/// An inclusive `[min, max]` range of API versions, as advertised or supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionRange {
    pub min: i16,
    pub max: i16,
}

impl VersionRange {
    pub fn new(min: i16, max: i16) -> Self {
        debug_assert!(min <= max);
        VersionRange { min, max }
    }

    /// A degenerate range containing exactly one version.
    pub fn exact(version: i16) -> Self {
        VersionRange {
            min: version,
            max: version,
        }
    }

    /// Intersect with another range; `None` if the ranges don't overlap.
    pub fn intersect(&self, other: &VersionRange) -> Option<VersionRange> {
        let min = self.min.max(other.min);
        let max = self.max.min(other.max);
        if min <= max {
            Some(VersionRange { min, max })
        } else {
            None
        }
    }
}

/// The caller-chosen identity used to match a [`Response`] to the [`Request`] that produced it.
/// Opaque to this crate; only equality matters.
pub type RequestRef = u64;

/// A request to be sent on a connection.
#[derive(Debug, Clone)]
pub struct Request {
    /// Opaque identity chosen by the caller, echoed back on the matching [`Response`].
    pub reference: RequestRef,
    pub api: kafka_protocol::messages::ApiKey,
    pub version: i16,
    /// `true` if no response is expected from the broker for this request.
    pub no_ack: bool,
    /// The already-encoded request body (header-less, schema-specific bytes).
    pub body: bytes::Bytes,
}

/// A response delivered to the caller that sent the matching [`Request`].
#[derive(Debug, Clone)]
pub struct Response {
    /// Copied from the originating [`Request::reference`].
    pub reference: RequestRef,
    pub api: kafka_protocol::messages::ApiKey,
    pub version: i16,
    /// The decoded response body, header-less.
    pub body: bytes::Bytes,
}

/// The coordinator type requested from `FindCoordinator`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorType {
    Group,
    Transaction,
}

impl CoordinatorType {
    pub(crate) fn wire_value(self) -> i8 {
        match self {
            CoordinatorType::Group => 0,
            CoordinatorType::Transaction => 1,
        }
    }
}
