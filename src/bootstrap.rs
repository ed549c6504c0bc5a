//! Bootstrap helpers (C8, §4.8): try a randomized endpoint list until one connects, and a
//! scoped `with_connection` helper that guarantees cleanup.

use crate::config::Config;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::handshake::AuthBackend;
use crate::types::Endpoint;
use crate::wire::WireCodec;
use rand::seq::SliceRandom;
use std::future::Future;
use std::sync::Arc;

/// `connect_any(endpoints, config)` (§4.8): shuffle `endpoints` into uniform random order so
/// clients don't all hammer the first node in the list, then attempt each once, returning the
/// first success or the ordered list of every failure.
pub async fn connect_any(
    endpoints: &[Endpoint],
    config: Config,
    codec: Arc<dyn WireCodec>,
    auth_backend: Option<Arc<dyn AuthBackend>>,
) -> Result<Connection> {
    let mut shuffled: Vec<Endpoint> = endpoints.to_vec();
    shuffled.shuffle(&mut rand::thread_rng());

    let mut failures = Vec::with_capacity(shuffled.len());
    for endpoint in shuffled {
        match Connection::start(
            endpoint.clone(),
            config.clone(),
            codec.clone(),
            auth_backend.clone(),
        )
        .await
        {
            Ok(conn) => return Ok(conn),
            Err(e) => failures.push((endpoint, e.to_string())),
        }
    }

    Err(Error::FailedToConnect(failures))
}

/// `with_connection(endpoints, config, body)` (§4.8): open a `nolink` connection to any
/// endpoint, run `body`, and guarantee the connection is stopped on every exit path.
pub async fn with_connection<F, Fut, T>(
    endpoints: &[Endpoint],
    mut config: Config,
    codec: Arc<dyn WireCodec>,
    auth_backend: Option<Arc<dyn AuthBackend>>,
    body: F,
) -> Result<T>
where
    F: FnOnce(Connection) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    config.nolink = true;
    let connection = connect_any(endpoints, config, codec, auth_backend).await?;
    let result = body(connection.clone()).await;
    let _ = connection.stop().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shuffle_preserves_multiset_membership() {
        let endpoints: Vec<Endpoint> = (0..10)
            .map(|i| Endpoint::new(format!("host-{i}"), 9092))
            .collect();

        let mut shuffled = endpoints.clone();
        shuffled.shuffle(&mut rand::thread_rng());

        let mut a: Vec<_> = endpoints.iter().map(|e| e.to_string()).collect();
        let mut b: Vec<_> = shuffled.iter().map(|e| e.to_string()).collect();
        a.sort();
        b.sort();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn connect_any_tries_every_endpoint_exactly_once_on_total_failure() {
        // Ports in the "reserved, nothing listens there" range so every dial fails fast.
        let endpoints: Vec<Endpoint> = vec![
            Endpoint::new("127.0.0.1", 1),
            Endpoint::new("127.0.0.1", 2),
            Endpoint::new("127.0.0.1", 3),
        ];
        let mut config = Config::default();
        config.connect_timeout = std::time::Duration::from_millis(200);

        let codec: Arc<dyn WireCodec> = Arc::new(crate::wire::KafkaProtocolCodec);
        let err = connect_any(&endpoints, config, codec, None).await.unwrap_err();
        match err {
            Error::FailedToConnect(failures) => assert_eq!(failures.len(), 3),
            other => panic!("expected FailedToConnect, got {other:?}"),
        }
    }
}
