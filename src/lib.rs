//! `kpro`: a Kafka wire-protocol broker connection, request multiplexer, and cluster discovery
//! core.
//!
//! A [`Connection`] dials one broker, runs the SASL/TLS handshake and version negotiation
//! configured for it (§4.4, §4.6), then multiplexes concurrent [`Request`]/[`Response`] pairs
//! over that single socket by correlation ID (§4.5). [`discover_partition_leader`] and
//! [`discover_coordinator`] resolve cluster metadata to the broker a caller actually needs to
//! talk to next; [`connect_any`] and [`with_connection`] turn a list of candidate endpoints into
//! a single working connection.

mod bootstrap;
mod config;
mod connection;
mod discovery;
mod error;
mod frame;
mod handshake;
mod pending;
mod transport;
mod types;
mod versions;
mod wire;

pub use bootstrap::{connect_any, with_connection};
pub use config::{Config, Debug, PlainSasl, Sasl, Tls, TlsParams};
pub use connection::{Connection, DebugMode};
pub use discovery::{discover_coordinator, discover_partition_leader};
pub use error::{Error, Result, TransportCloseReason};
pub use handshake::AuthBackend;
pub use types::{CoordinatorType, Endpoint, Request, RequestRef, Response, VersionRange};
pub use versions::VersionMap;
pub use wire::{KafkaProtocolCodec, WireCodec};

pub use kafka_protocol::messages::ApiKey;

use std::sync::Arc;
use std::time::Duration;

/// Every API this crate negotiated a usable version for, alongside its negotiated range.
/// `get_api_versions(connection)` (§6).
pub async fn get_api_versions(connection: &Connection) -> Result<Vec<(ApiKey, VersionRange)>> {
    Ok(connection.version_map().await?.iter().collect())
}

/// The negotiated version range for a single API, or [`Error::NotSupported`].
/// `get_api_vsn_range(connection, api)` (§6).
pub async fn get_api_vsn_range(connection: &Connection, api: ApiKey) -> Result<VersionRange> {
    connection.version_map().await?.get_or_not_supported(api)
}

/// Where to resolve cluster metadata from, for [`connect_partition_leader`] and
/// [`connect_coordinator`] (§4.8): an already-open connection to any broker that can answer
/// `Metadata`/`FindCoordinator`, or a bootstrap endpoint list to open a temporary `nolink`
/// connection against.
pub enum MetadataSource<'a> {
    Connection(&'a Connection),
    Bootstrap(&'a [Endpoint]),
}

/// Resolve the leader for `topic`-`partition` and open a connection to it. In the bootstrap
/// form, a temporary `nolink` connection is opened to discover the leader, then closed, before
/// the final connection is opened (§6).
pub async fn connect_partition_leader(
    source: MetadataSource<'_>,
    topic: &str,
    partition: i32,
    timeout: Duration,
    config: Config,
    codec: Arc<dyn WireCodec>,
    auth_backend: Option<Arc<dyn AuthBackend>>,
) -> Result<Connection> {
    let endpoint = match source {
        MetadataSource::Connection(conn) => {
            discover_partition_leader(conn, topic, partition, timeout).await?
        }
        MetadataSource::Bootstrap(endpoints) => {
            let topic = topic.to_string();
            with_connection(endpoints, config.clone(), codec.clone(), auth_backend.clone(), move |conn| async move {
                discover_partition_leader(&conn, &topic, partition, timeout).await
            })
            .await?
        }
    };
    Connection::start(endpoint, config, codec, auth_backend).await
}

/// Resolve a group/transaction coordinator and open a connection to it. Bootstrap semantics
/// mirror [`connect_partition_leader`] (§6).
pub async fn connect_coordinator(
    source: MetadataSource<'_>,
    coordinator_type: CoordinatorType,
    id: &str,
    timeout: Duration,
    config: Config,
    codec: Arc<dyn WireCodec>,
    auth_backend: Option<Arc<dyn AuthBackend>>,
) -> Result<Connection> {
    let endpoint = match source {
        MetadataSource::Connection(conn) => {
            discover_coordinator(conn, coordinator_type, id, timeout).await?
        }
        MetadataSource::Bootstrap(endpoints) => {
            let id = id.to_string();
            with_connection(endpoints, config.clone(), codec.clone(), auth_backend.clone(), move |conn| async move {
                discover_coordinator(&conn, coordinator_type, &id, timeout).await
            })
            .await?
        }
    };
    Connection::start(endpoint, config, codec, auth_backend).await
}
