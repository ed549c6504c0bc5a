//! Version negotiator (C6, §4.6): intersect a peer's advertised API version ranges with the
//! ranges this crate's `WireCodec` knows how to speak.

use crate::error::{Error, Result};
use crate::types::VersionRange;
use crate::wire::WireCodec;
use kafka_protocol::messages::{
    api_versions_request::ApiVersionsRequestBuilder, ApiKey, ApiVersionsResponse,
};
use std::collections::HashMap;

/// The negotiated version range for every API this crate knows about, after intersecting with
/// whatever a specific peer advertised (or the `kafka_09` fallback if it didn't).
#[derive(Debug, Clone, Default)]
pub struct VersionMap {
    ranges: HashMap<ApiKey, VersionRange>,
}

impl VersionMap {
    /// `version_range(api)`: the negotiated pair, or `None` if the API isn't supported at any
    /// mutually agreeable version (§4.6).
    pub fn version_range(&self, api: ApiKey) -> Option<VersionRange> {
        self.ranges.get(&api).copied()
    }

    pub fn get_or_not_supported(&self, api: ApiKey) -> Result<VersionRange> {
        self.version_range(api).ok_or(Error::NotSupported)
    }

    /// All `(api, range)` pairs, for `get_api_versions` (§6).
    pub fn iter(&self) -> impl Iterator<Item = (ApiKey, VersionRange)> + '_ {
        self.ranges.iter().map(|(k, v)| (*k, *v))
    }
}

/// Build a negotiated [`VersionMap`] from a peer's [`ApiVersionsResponse`], intersected against
/// `codec`'s locally supported ranges.
pub fn negotiate(codec: &dyn WireCodec, peer: &ApiVersionsResponse) -> VersionMap {
    let mut ranges = HashMap::new();

    let peer_ranges: HashMap<ApiKey, VersionRange> = peer
        .api_keys
        .iter()
        .filter_map(|k| {
            let api = ApiKey::try_from(k.api_key).ok()?;
            Some((api, VersionRange::new(k.min_version, k.max_version)))
        })
        .collect();

    for api in codec.all_apis() {
        let Some(local) = codec.supported_version_range(api) else {
            continue;
        };
        if let Some(peer_range) = peer_ranges.get(&api) {
            if let Some(intersected) = local.intersect(peer_range) {
                ranges.insert(api, intersected);
            }
        }
    }

    VersionMap { ranges }
}

/// Fallback used when the peer predates `ApiVersions` entirely (older brokers, §4.6): every
/// locally known API maps to its historical `kafka_09` minimum, as an exact `(min, min)` range.
pub fn kafka_09_fallback(codec: &dyn WireCodec) -> VersionMap {
    let mut ranges = HashMap::new();
    for api in codec.all_apis() {
        if let Some(range) = codec.kafka_09_range(api) {
            ranges.insert(api, range);
        }
    }
    VersionMap { ranges }
}

/// Build the `ApiVersions` request body (version 0 is universally understood and sufficient to
/// discover the peer's full range table).
pub fn build_api_versions_request() -> Result<kafka_protocol::messages::ApiVersionsRequest> {
    ApiVersionsRequestBuilder::default()
        .build()
        .map_err(|e| Error::Other(anyhow::anyhow!("building ApiVersions request: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::KafkaProtocolCodec;
    use kafka_protocol::messages::api_versions_response::ApiVersion;

    fn api_version(api: ApiKey, min: i16, max: i16) -> ApiVersion {
        ApiVersion::default()
            .with_api_key(api as i16)
            .with_min_version(min)
            .with_max_version(max)
    }

    #[test]
    fn intersects_and_drops_unsupported_apis() {
        let codec = KafkaProtocolCodec;
        let mut peer = ApiVersionsResponse::default();
        peer.api_keys = vec![
            api_version(ApiKey::Metadata, 0, 20), // peer goes higher than we do
            api_version(ApiKey::Produce, 0, 9),   // we don't speak Produce at all
        ];

        let map = negotiate(&codec, &peer);
        assert_eq!(
            map.version_range(ApiKey::Metadata),
            Some(VersionRange::new(0, 9))
        );
        assert_eq!(map.version_range(ApiKey::Produce), None);
        assert_eq!(map.version_range(ApiKey::FindCoordinator), None);
    }

    #[test]
    fn kafka_09_fallback_is_exact_minimums() {
        let codec = KafkaProtocolCodec;
        let map = kafka_09_fallback(&codec);
        assert_eq!(
            map.version_range(ApiKey::Metadata),
            Some(VersionRange::exact(0))
        );
    }

    #[test]
    fn not_supported_when_absent() {
        let map = VersionMap::default();
        assert!(matches!(
            map.get_or_not_supported(ApiKey::Metadata),
            Err(Error::NotSupported)
        ));
    }
}
