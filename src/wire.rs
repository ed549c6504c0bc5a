//! The narrow interface (§6) this crate depends on for turning requests/responses into bytes.
//!
//! The multiplexer, framing, and discovery logic never touch a wire format directly — they go
//! through [`WireCodec`]. [`KafkaProtocolCodec`] is the default implementation, built the same
//! way this codebase's existing Kafka-protocol client builds frames directly against the
//! `kafka-protocol` crate (see `api_client.rs::_send_request` in the reference proxy this crate
//! is descended from).

use crate::error::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};
use kafka_protocol::messages::{ApiKey, RequestHeader, ResponseHeader};
use kafka_protocol::protocol::{Decodable, Encodable, StrBytes};

/// Produces and consumes the on-wire bytes for requests/responses, and answers version-range
/// questions about the APIs this crate knows about. See §6 and §6.1.
pub trait WireCodec: Send + Sync {
    /// Build the full on-wire frame (length prefix included) for a request whose body has
    /// already been schema-encoded by the caller.
    fn encode_request(
        &self,
        client_id: &[u8],
        corr_id: i32,
        api: ApiKey,
        version: i16,
        body: &[u8],
    ) -> Result<Bytes>;

    /// Extract the correlation ID from a complete frame (length prefix included), returning it
    /// alongside the remaining bytes (the response header onward).
    fn decode_corr_id(&self, frame: &[u8]) -> Result<(i32, Bytes)>;

    /// Strip the response header from `body` (the bytes following the correlation ID),
    /// returning the per-API response payload, still schema-encoded, for the caller to decode
    /// with the schema they already know they asked for.
    fn decode_body(&self, api: ApiKey, version: i16, body: Bytes) -> Result<Bytes>;

    /// The client-supported version range for `api`, if this crate's version of the protocol
    /// knows about it.
    fn supported_version_range(&self, api: ApiKey) -> Option<crate::types::VersionRange>;

    /// The historical `kafka_09` minimum version for `api`, used as a fallback when a peer
    /// doesn't advertise version ranges (§4.6).
    fn kafka_09_range(&self, api: ApiKey) -> Option<crate::types::VersionRange>;

    /// Every API this crate's version of the protocol knows about.
    fn all_apis(&self) -> Vec<ApiKey>;
}

/// Default [`WireCodec`], implemented directly against the `kafka-protocol` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct KafkaProtocolCodec;

/// `(min, max)` pairs for the APIs this core actively uses: `ApiVersions`, the SASL handshake
/// pair, `Metadata`, and `FindCoordinator`. A full client would extend this table as it grows
/// support for more APIs; the core only needs the ones it (and its discovery layer) speaks.
const SUPPORTED: &[(ApiKey, i16, i16)] = &[
    (ApiKey::ApiVersions, 0, 3),
    (ApiKey::SaslHandshake, 0, 1),
    (ApiKey::SaslAuthenticate, 0, 2),
    (ApiKey::Metadata, 0, 9),
    (ApiKey::FindCoordinator, 0, 4),
];

/// Kafka 0.9's original minimum supported version for each API, as a fallback intersection
/// target when a peer predates `ApiVersions` (§4.6).
const KAFKA_09: &[(ApiKey, i16)] = &[
    (ApiKey::ApiVersions, 0),
    (ApiKey::SaslHandshake, 0),
    (ApiKey::SaslAuthenticate, 0),
    (ApiKey::Metadata, 0),
    (ApiKey::FindCoordinator, 0),
];

impl WireCodec for KafkaProtocolCodec {
    fn encode_request(
        &self,
        client_id: &[u8],
        corr_id: i32,
        api: ApiKey,
        version: i16,
        body: &[u8],
    ) -> Result<Bytes> {
        let header_version = api.request_header_version(version);

        let header = RequestHeader::builder()
            .request_api_key(api as i16)
            .request_api_version(version)
            .correlation_id(corr_id)
            .client_id(Some(
                StrBytes::from_utf8(Bytes::copy_from_slice(client_id))
                    .map_err(|e| Error::Other(anyhow::anyhow!("invalid client_id: {e}")))?,
            ))
            .build()
            .map_err(|e| Error::Other(anyhow::anyhow!("building request header: {e}")))?;

        let mut buf = BytesMut::new();
        // Reserve the 4-byte length prefix; we backpatch it once we know the total size.
        buf.put_i32(0);

        header
            .encode(&mut buf, header_version)
            .map_err(|e| Error::Other(anyhow::anyhow!("encoding request header: {e}")))?;
        buf.extend_from_slice(body);

        let payload_len = (buf.len() - 4) as i32;
        buf[0..4].copy_from_slice(&payload_len.to_be_bytes());

        Ok(buf.freeze())
    }

    fn decode_corr_id(&self, frame: &[u8]) -> Result<(i32, Bytes)> {
        if frame.len() < 8 {
            return Err(Error::Other(anyhow::anyhow!(
                "frame too short to contain a correlation id: {} bytes",
                frame.len()
            )));
        }
        let corr_id = i32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]);
        Ok((corr_id, Bytes::copy_from_slice(&frame[4..])))
    }

    fn decode_body(&self, api: ApiKey, version: i16, body: Bytes) -> Result<Bytes> {
        let header_version = api.response_header_version(version);
        let mut buf = body;
        ResponseHeader::decode(&mut buf, header_version)
            .map_err(|e| Error::Other(anyhow::anyhow!("decoding response header: {e}")))?;
        Ok(buf)
    }

    fn supported_version_range(&self, api: ApiKey) -> Option<crate::types::VersionRange> {
        SUPPORTED
            .iter()
            .find(|(k, _, _)| *k == api)
            .map(|(_, min, max)| crate::types::VersionRange::new(*min, *max))
    }

    fn kafka_09_range(&self, api: ApiKey) -> Option<crate::types::VersionRange> {
        KAFKA_09
            .iter()
            .find(|(k, _)| *k == api)
            .map(|(_, v)| crate::types::VersionRange::exact(*v))
    }

    fn all_apis(&self) -> Vec<ApiKey> {
        SUPPORTED.iter().map(|(k, _, _)| *k).collect()
    }
}

/// Encode a strongly-typed `kafka-protocol` request into the header-less body bytes this
/// crate's [`crate::connection::Connection`] expects, then decode the matching response type
/// from the header-stripped bytes it returns. Layered on top of [`WireCodec`] rather than part
/// of it: the connection actor never needs to know about concrete request/response types, only
/// the typed helpers in `versions.rs`/`discovery.rs` do.
pub(crate) fn encode_typed<R: kafka_protocol::protocol::Request>(
    req: &R,
    version: i16,
) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    req.encode(&mut buf, version)
        .map_err(|e| Error::Other(anyhow::anyhow!("encoding {:?} request body: {e}", R::KEY)))?;
    Ok(buf.freeze())
}

pub(crate) fn decode_typed<R: kafka_protocol::protocol::Request>(
    body: Bytes,
    version: i16,
) -> Result<R::Response> {
    let mut buf = body;
    R::Response::decode(&mut buf, version)
        .map_err(|e| Error::Other(anyhow::anyhow!("decoding {:?} response body: {e}", R::KEY)))
}

static NEXT_TYPED_REQUEST_REF: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);

/// Send a strongly-typed request on `connection` and decode its strongly-typed response,
/// entirely in terms of the generic [`crate::connection::Connection::request_sync`] byte-level
/// API. Used by `versions.rs`/`discovery.rs`, which need actual Kafka schema fields (broker
/// lists, coordinator hosts) rather than opaque bytes.
pub(crate) async fn typed_request_sync<R: kafka_protocol::protocol::Request>(
    connection: &crate::connection::Connection,
    req: R,
    version: i16,
    timeout: std::time::Duration,
) -> Result<R::Response> {
    let api = ApiKey::try_from(R::KEY)
        .map_err(|_| Error::Other(anyhow::anyhow!("unknown API key {}", R::KEY)))?;
    let body = encode_typed(&req, version)?;
    let reference = NEXT_TYPED_REQUEST_REF.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

    let request = crate::types::Request {
        reference,
        api,
        version,
        no_ack: false,
        body,
    };

    let response = connection
        .request_sync(request, timeout)
        .await?
        .ok_or_else(|| Error::Other(anyhow::anyhow!("no_ack set unexpectedly on typed request")))?;

    decode_typed::<R>(response.body, version)
}
