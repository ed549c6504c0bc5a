//! Handshake engine (C4, §4.4): drives a freshly connected transport through
//! `tcp_connected -> [tls_upgraded] -> [sasl_handshaked -> sasl_authed] -> ready`, before the
//! socket is ever handed to [`crate::connection::Connection`].
//!
//! Grounded on `api_client.rs::sasl_auth`/`get_mechanisms`/`_send_request`: this module inlines
//! that same discovery-handshake-then-token-exchange flow, generalized to also run over a plain
//! (non-TLS) transport and to support callback-delegated mechanisms via [`AuthBackend`].

use crate::config::{Config, Sasl};
use crate::error::{Error, Result};
use crate::pending::RESERVED_HANDSHAKE_CORR_ID;
use crate::transport::Transport;
use crate::wire::{KafkaProtocolCodec, WireCodec};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use kafka_protocol::messages::{
    sasl_authenticate_request::{SaslAuthenticateRequest, SaslAuthenticateRequestBuilder},
    sasl_handshake_request::{SaslHandshakeRequest, SaslHandshakeRequestBuilder},
    ApiKey,
};
use kafka_protocol::protocol::StrBytes;
use rsasl::mechname::Mechname;
use rsasl::prelude::SASLClient;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Delegate for SASL mechanisms the embedding application implements itself
/// (`sasl = {callback, module, opts}`, §6.1). The built-in `plain` mechanism and the
/// `rsasl`-backed mechanisms never reach this trait.
#[async_trait]
pub trait AuthBackend: Send + Sync {
    async fn auth(
        &self,
        module: &str,
        host: &str,
        client_id: &[u8],
        deadline: Duration,
        opts: &serde_json::Value,
        transport: &mut Transport,
    ) -> Result<()>;
}

/// A diagnosable handshake failure, used to select the hint table in §4.4. `TlsUpgrade` fires
/// from [`crate::connection::Connection::start`], before the handshake engine even runs — the
/// TLS upgrade itself happens inside `Transport::connect` — the rest fire from [`run`] below.
#[derive(Debug, Clone, Copy)]
pub(crate) enum FailurePoint {
    TlsUpgrade,
    SaslIllegalState,
    SaslAuth,
}

/// Produce the diagnostic hint for a handshake failure, per the table in §4.4. Implemented as
/// a pure function over a small enum so it can be unit-tested without a socket.
fn diagnose(point: FailurePoint, tls_on: bool, sasl_on: bool) -> Option<&'static str> {
    match (point, tls_on, sasl_on) {
        (FailurePoint::TlsUpgrade, false, _) => {
            Some("Make sure connecting to a 'SSL://' listener")
        }
        (FailurePoint::TlsUpgrade, true, _) => {
            Some("Make sure connecting to 'SASL_SSL://' listener")
        }
        (FailurePoint::SaslIllegalState, _, true) if tls_on => {
            Some("Make sure connecting to 'SASL_SSL://' listener")
        }
        (FailurePoint::SaslIllegalState, false, true) => {
            Some("Make sure connecting to 'SASL_PLAINTEXT://' listener")
        }
        (FailurePoint::SaslAuth, false, true) => {
            Some("Add TLS to config, or connect to 'SASL_PLAINTEXT://' listener")
        }
        _ => None,
    }
}

pub(crate) fn log_hint(point: FailurePoint, config: &Config, err: &Error) {
    let tls_on = !matches!(config.tls, crate::config::Tls::Off);
    let sasl_on = !matches!(config.sasl, Sasl::Off);
    if let Some(hint) = diagnose(point, tls_on, sasl_on) {
        tracing::warn!(error = %err, hint, "connection handshake failed");
    } else {
        tracing::warn!(error = %err, "connection handshake failed");
    }
}

/// Run the handshake to completion, returning the ready-to-multiplex transport.
pub async fn run(
    mut transport: Transport,
    endpoint: &crate::types::Endpoint,
    config: &Config,
    auth_backend: Option<&Arc<dyn AuthBackend>>,
) -> Result<Transport> {
    tracing::debug!(endpoint = %endpoint, "tcp_connected");

    match &config.sasl {
        Sasl::Off => {
            tracing::debug!("ready (no SASL configured)");
            Ok(transport)
        }
        Sasl::Plain(plain) => {
            let (user, password) = plain.resolve().await?;
            sasl_handshake(&mut transport, "PLAIN").await.map_err(|e| {
                log_hint(FailurePoint::SaslIllegalState, config, &e);
                e
            })?;
            sasl_plain_auth(&mut transport, &user, &password)
                .await
                .map_err(|e| {
                    log_hint(FailurePoint::SaslAuth, config, &e);
                    e
                })?;
            tracing::debug!("sasl_authed");
            Ok(transport)
        }
        Sasl::Callback { module, opts } => {
            let backend = auth_backend.ok_or_else(|| {
                Error::InvalidConfig(format!(
                    "sasl.callback module {module:?} configured but no AuthBackend was supplied"
                ))
            })?;
            backend
                .auth(
                    module,
                    &endpoint.host,
                    &config.client_id,
                    config.connect_timeout,
                    opts,
                    &mut transport,
                )
                .await
                .map_err(|e| {
                    log_hint(FailurePoint::SaslAuth, config, &e);
                    e
                })?;
            tracing::debug!("sasl_authed (callback)");
            Ok(transport)
        }
    }
}

/// Inline `rsasl`-mediated handshake for mechanisms other than `plain`/`callback` (SCRAM,
/// OAUTHBEARER), following the same discover-mechanisms-then-step loop as
/// `api_client.rs::sasl_auth`.
pub async fn run_rsasl(
    mut transport: Transport,
    sasl_config: Arc<rsasl::config::SASLConfig>,
) -> Result<Transport> {
    let offered = discover_mechanisms(&mut transport).await?;
    let offered_names: Result<Vec<_>> = offered
        .iter()
        .map(|m| {
            Mechname::parse(m.as_bytes())
                .map_err(|e| Error::SaslAuthError(format!("unparseable mechanism {m}: {e}")))
        })
        .collect();
    let offered_names = offered_names?;

    let sasl = SASLClient::new(sasl_config);
    let mut session = sasl
        .start_suggested(offered_names.iter())
        .map_err(|e| Error::SaslAuthError(format!("no mutually supported mechanism: {e}")))?;

    let mechanism = session.get_mechname().as_str().to_owned();
    sasl_handshake(&mut transport, &mechanism).await?;

    let mut out = Vec::new();
    let mut state = session
        .step(None, &mut out)
        .map_err(|e| Error::SaslAuthError(e.to_string()))?;

    while state.is_running() {
        let auth_resp = send_sasl_authenticate(&mut transport, Bytes::from(out)).await?;
        if auth_resp.error_code > 0 {
            return Err(Error::SaslAuthError(
                auth_resp
                    .error_message
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| format!("error code {}", auth_resp.error_code)),
            ));
        }
        out = Vec::new();
        let data = auth_resp.auth_bytes.to_vec();
        state = session
            .step(Some(&data), &mut out)
            .map_err(|e| Error::SaslAuthError(e.to_string()))?;
    }

    Ok(transport)
}

async fn discover_mechanisms(transport: &mut Transport) -> Result<Vec<String>> {
    // An intentionally-invalid mechanism name: Kafka rejects it but still reports the
    // mechanisms it does support, which is all this probe is after (`api_client.rs::get_mechanisms`).
    let req = SaslHandshakeRequestBuilder::default()
        .build()
        .map_err(|e| Error::Other(anyhow::anyhow!("building handshake probe: {e}")))?;
    let resp = send_typed_handshake(transport, &req).await?;
    Ok(resp.mechanisms.iter().map(|m| m.to_string()).collect())
}

async fn sasl_handshake(transport: &mut Transport, mechanism: &str) -> Result<()> {
    let req = SaslHandshakeRequestBuilder::default()
        .mechanism(
            StrBytes::from_utf8(Bytes::copy_from_slice(mechanism.as_bytes()))
                .map_err(|e| Error::Other(anyhow::anyhow!("invalid mechanism name: {e}")))?,
        )
        .build()
        .map_err(|e| Error::Other(anyhow::anyhow!("building handshake request: {e}")))?;

    let resp = send_typed_handshake(transport, &req).await?;
    if resp.error_code > 0 {
        return Err(Error::SaslAuthError(format!(
            "handshake rejected (error code {}); supported mechanisms: {:?}",
            resp.error_code, resp.mechanisms
        )));
    }
    Ok(())
}

async fn send_typed_handshake(
    transport: &mut Transport,
    req: &SaslHandshakeRequest,
) -> Result<kafka_protocol::messages::SaslHandshakeResponse> {
    let codec = KafkaProtocolCodec;
    let body = crate::wire::encode_typed(req, 0)?;
    let frame = codec.encode_request(
        b"",
        RESERVED_HANDSHAKE_CORR_ID,
        ApiKey::SaslHandshake,
        0,
        &body,
    )?;
    let raw = blocking_round_trip(transport, frame).await?;
    let (_corr_id, rest) = codec.decode_corr_id(&raw)?;
    let body = codec.decode_body(ApiKey::SaslHandshake, 0, rest)?;
    crate::wire::decode_typed::<SaslHandshakeRequest>(body, 0)
}

async fn send_sasl_authenticate(
    transport: &mut Transport,
    auth_bytes: Bytes,
) -> Result<kafka_protocol::messages::SaslAuthenticateResponse> {
    let req = SaslAuthenticateRequestBuilder::default()
        .auth_bytes(auth_bytes)
        .build()
        .map_err(|e| Error::Other(anyhow::anyhow!("building authenticate request: {e}")))?;

    let codec = KafkaProtocolCodec;
    let body = crate::wire::encode_typed(&req, 0)?;
    let frame = codec.encode_request(
        b"",
        RESERVED_HANDSHAKE_CORR_ID,
        ApiKey::SaslAuthenticate,
        0,
        &body,
    )?;
    let raw = blocking_round_trip(transport, frame).await?;
    let (_corr_id, rest) = codec.decode_corr_id(&raw)?;
    let body = codec.decode_body(ApiKey::SaslAuthenticate, 0, rest)?;
    crate::wire::decode_typed::<SaslAuthenticateRequest>(body, 0)
}

/// `SASL/PLAIN`, sent as a raw length-prefixed `\0user\0password` frame rather than through
/// `SaslAuthenticateRequest` — the wire-level mechanism token exchange predates that API and is
/// what Kafka expects for `plain` specifically (§4.4).
async fn sasl_plain_auth(transport: &mut Transport, user: &str, password: &str) -> Result<()> {
    let mut token = BytesMut::new();
    token.put_u8(0);
    token.extend_from_slice(user.as_bytes());
    token.put_u8(0);
    token.extend_from_slice(password.as_bytes());

    sasl_handshake(transport, "PLAIN").await?;

    let mut frame = BytesMut::new();
    frame.put_i32(token.len() as i32);
    frame.extend_from_slice(&token);

    transport
        .write_all(&frame)
        .await
        .map_err(Error::SendError)?;

    let mut ack = [0u8; 4];
    match transport.read_exact(&mut ack).await {
        Ok(_) => {
            let len = i32::from_be_bytes(ack);
            if len == 0 {
                Ok(())
            } else {
                Err(Error::SaslAuthError(
                    "unexpected non-zero ack length from SASL/PLAIN exchange".into(),
                ))
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(Error::SaslAuthError("bad_credentials".into()))
        }
        Err(e) => Err(Error::TransportError(e)),
    }
}

/// Query the peer's supported API version ranges and intersect with `codec`'s, completing the
/// `-> ready` transition (§4.4, §4.6). Uses the reserved handshake correlation ID since this
/// runs before the connection actor (and its pending-request table) exist.
pub async fn negotiate_versions(
    mut transport: Transport,
    codec: &dyn WireCodec,
) -> Result<(Transport, crate::versions::VersionMap)> {
    let req = crate::versions::build_api_versions_request()?;
    let body = crate::wire::encode_typed(&req, 0)?;
    let frame = codec.encode_request(
        b"",
        RESERVED_HANDSHAKE_CORR_ID,
        ApiKey::ApiVersions,
        0,
        &body,
    )?;

    let raw = match blocking_round_trip(&mut transport, frame).await {
        Ok(raw) => raw,
        Err(_) => {
            tracing::debug!("peer did not answer ApiVersions; falling back to kafka_09 ranges");
            let map = crate::versions::kafka_09_fallback(codec);
            return Ok((transport, map));
        }
    };

    let (_corr_id, rest) = codec.decode_corr_id(&raw)?;
    let body = codec.decode_body(ApiKey::ApiVersions, 0, rest)?;
    let resp = crate::wire::decode_typed::<kafka_protocol::messages::ApiVersionsRequest>(body, 0)?;

    let map = crate::versions::negotiate(codec, &resp);
    tracing::debug!("ready");
    Ok((transport, map))
}

/// Write a complete frame and read back exactly one complete frame, used only during the
/// handshake where the socket is effectively single-reader/single-writer (§4.3).
async fn blocking_round_trip(transport: &mut Transport, frame: Bytes) -> Result<Bytes> {
    transport
        .write_all(&frame)
        .await
        .map_err(Error::SendError)?;

    let mut header = [0u8; 4];
    transport
        .read_exact(&mut header)
        .await
        .map_err(Error::TransportError)?;
    let len = i32::from_be_bytes(header);
    if len < 0 {
        return Err(Error::InvalidFrameLength(len));
    }

    let mut body = BytesMut::new();
    body.resize(len as usize, 0);
    transport
        .read_exact(&mut body)
        .await
        .map_err(Error::TransportError)?;

    let mut out = BytesMut::with_capacity(4 + body.len());
    out.extend_from_slice(&header);
    out.extend_from_slice(&body);
    Ok(out.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tls_upgrade_failure_hints_ssl_listener() {
        assert_eq!(
            diagnose(FailurePoint::TlsUpgrade, false, false),
            Some("Make sure connecting to a 'SSL://' listener")
        );
        assert_eq!(
            diagnose(FailurePoint::TlsUpgrade, true, true),
            Some("Make sure connecting to 'SASL_SSL://' listener")
        );
    }

    #[test]
    fn sasl_illegal_state_hints_by_tls() {
        assert_eq!(
            diagnose(FailurePoint::SaslIllegalState, true, true),
            Some("Make sure connecting to 'SASL_SSL://' listener")
        );
        assert_eq!(
            diagnose(FailurePoint::SaslIllegalState, false, true),
            Some("Make sure connecting to 'SASL_PLAINTEXT://' listener")
        );
    }

    #[test]
    fn sasl_auth_failure_without_tls_suggests_adding_it() {
        assert_eq!(
            diagnose(FailurePoint::SaslAuth, false, true),
            Some("Add TLS to config, or connect to 'SASL_PLAINTEXT://' listener")
        );
    }

    #[test]
    fn no_sasl_no_tls_has_no_hint() {
        assert_eq!(diagnose(FailurePoint::SaslAuth, false, false), None);
    }
}
