//! Discovery (C7, §4.7): resolve a topic-partition leader or a group/transaction coordinator
//! from an already-established connection.

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::types::{CoordinatorType, Endpoint};
use kafka_protocol::messages::find_coordinator_request::FindCoordinatorRequestBuilder;
use kafka_protocol::messages::metadata_request::MetadataRequestBuilder;
use kafka_protocol::messages::{
    metadata_request::MetadataRequestTopic, ApiKey, FindCoordinatorResponse, MetadataResponse,
};
use kafka_protocol::protocol::StrBytes;
use std::time::Duration;

/// `discover_partition_leader(connection, topic, partition, timeout) -> endpoint | error` (§4.7).
pub async fn discover_partition_leader(
    connection: &Connection,
    topic: &str,
    partition: i32,
    timeout: Duration,
) -> Result<Endpoint> {
    let range = connection
        .version_map()
        .await?
        .get_or_not_supported(ApiKey::Metadata)?;
    let version = range.max;

    let topic_name = StrBytes::from_utf8(bytes::Bytes::copy_from_slice(topic.as_bytes()))
        .map_err(|e| Error::Other(anyhow::anyhow!("invalid topic name {topic:?}: {e}")))?;

    let req = MetadataRequestBuilder::default()
        .topics(Some(vec![MetadataRequestTopic::default()
            .with_name(Some(kafka_protocol::messages::TopicName(topic_name)))]))
        .build()
        .map_err(|e| Error::Other(anyhow::anyhow!("building metadata request: {e}")))?;

    let resp: MetadataResponse = crate::wire::typed_request_sync(connection, req, version, timeout).await?;

    let topic_entry = resp
        .topics
        .iter()
        .find(|t| t.name.as_ref().map(|n| n.as_str()) == Some(topic))
        .ok_or(Error::UnknownTopicOrPartition)?;

    if topic_entry.error_code != 0 {
        return Err(kafka_error(topic_entry.error_code));
    }

    let matches: Vec<_> = topic_entry
        .partitions
        .iter()
        .filter(|p| p.partition_index == partition)
        .collect();

    let partition_entry = match matches.len() {
        0 => return Err(Error::UnknownTopicOrPartition),
        1 => matches[0],
        // REDESIGN FLAG resolution (§9): a well-formed broker never reports the same partition
        // twice; treat the duplicate as a protocol violation rather than silently picking one.
        _ => {
            return Err(Error::ProtocolError(format!(
                "broker reported {} entries for {topic}-{partition}",
                matches.len()
            )))
        }
    };

    if partition_entry.error_code != 0 {
        return Err(kafka_error(partition_entry.error_code));
    }

    let leader_id = partition_entry.leader_id;
    let broker = resp
        .brokers
        .iter()
        .find(|b| b.node_id == leader_id)
        .ok_or_else(|| {
            Error::ProtocolError(format!("no broker entry for leader node_id {}", leader_id.0))
        })?;

    Ok(Endpoint::new(broker.host.to_string(), broker.port as u16))
}

/// `discover_coordinator(connection, type, id, timeout) -> endpoint | error` (§4.7).
pub async fn discover_coordinator(
    connection: &Connection,
    coordinator_type: CoordinatorType,
    id: &str,
    timeout: Duration,
) -> Result<Endpoint> {
    let range = connection
        .version_map()
        .await?
        .get_or_not_supported(ApiKey::FindCoordinator)?;
    let version = range.max;

    if version == 0 && coordinator_type == CoordinatorType::Transaction {
        return Err(Error::BadVersion(
            "find_coordinator v0 supports only group coordinators".into(),
        ));
    }

    let key = StrBytes::from_utf8(bytes::Bytes::copy_from_slice(id.as_bytes()))
        .map_err(|e| Error::Other(anyhow::anyhow!("invalid coordinator key {id:?}: {e}")))?;

    let mut builder = FindCoordinatorRequestBuilder::default();
    if version == 0 {
        builder = builder.key(key);
    } else {
        builder = builder
            .key(key)
            .key_type(coordinator_type.wire_value());
    }
    let req = builder
        .build()
        .map_err(|e| Error::Other(anyhow::anyhow!("building find_coordinator request: {e}")))?;

    let resp: FindCoordinatorResponse =
        crate::wire::typed_request_sync(connection, req, version, timeout).await?;

    if resp.error_code != 0 {
        return Err(if version == 0 {
            kafka_error(resp.error_code)
        } else {
            Error::KafkaErrorCode(
                resp.error_code,
                resp.error_message
                    .map(|m| m.to_string())
                    .unwrap_or_default(),
            )
        });
    }

    Ok(Endpoint::new(resp.host.to_string(), resp.port as u16))
}

fn kafka_error(code: i16) -> Error {
    let name = kafka_protocol::ResponseError::try_from_code(code)
        .map(|e| format!("{e:?}"))
        .unwrap_or_else(|| format!("unknown error code {code}"));
    match code {
        3 => Error::UnknownTopicOrPartition, // UNKNOWN_TOPIC_OR_PARTITION
        _ => Error::KafkaErrorCode(code, name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{test_spawn, Connection};
    use crate::transport::Transport;
    use crate::versions::kafka_09_fallback;
    use crate::wire::{KafkaProtocolCodec, WireCodec};
    use bytes::{BufMut, Bytes, BytesMut};
    use kafka_protocol::messages::metadata_response::{
        MetadataResponseBroker, MetadataResponsePartition, MetadataResponseTopic,
    };
    use kafka_protocol::messages::{BrokerId, ResponseHeader, TopicName};
    use kafka_protocol::protocol::Encodable;
    use std::sync::Arc;

    fn str_bytes(s: &str) -> StrBytes {
        StrBytes::from_utf8(Bytes::copy_from_slice(s.as_bytes())).unwrap()
    }

    fn test_connection() -> (Connection, tokio::io::DuplexStream) {
        let (client_io, server_io) = tokio::io::duplex(8192);
        let transport = Transport::from_parts(client_io, "127.0.0.1:9092".parse().unwrap());
        let codec: Arc<dyn WireCodec> = Arc::new(KafkaProtocolCodec);
        let version_map = kafka_09_fallback(&KafkaProtocolCodec);
        let connection = test_spawn(
            transport,
            crate::config::Config::default(),
            codec,
            version_map,
        );
        (connection, server_io)
    }

    /// Reads one framed request off `io`, returning its correlation id.
    async fn read_request_corr_id(io: &mut (impl tokio::io::AsyncReadExt + Unpin)) -> i32 {
        let mut len_buf = [0u8; 4];
        io.read_exact(&mut len_buf).await.unwrap();
        let len = i32::from_be_bytes(len_buf) as usize;
        let mut body = vec![0u8; len];
        io.read_exact(&mut body).await.unwrap();
        i32::from_be_bytes([body[4], body[5], body[6], body[7]])
    }

    async fn write_typed_response<R: Encodable>(
        io: &mut (impl tokio::io::AsyncWriteExt + Unpin),
        corr_id: i32,
        resp: &R,
        version: i16,
    ) {
        let header = ResponseHeader::default().with_correlation_id(corr_id);
        let mut buf = BytesMut::new();
        buf.put_i32(0);
        header.encode(&mut buf, 0).unwrap();
        resp.encode(&mut buf, version).unwrap();
        let payload_len = (buf.len() - 4) as i32;
        buf[0..4].copy_from_slice(&payload_len.to_be_bytes());
        io.write_all(&buf).await.unwrap();
    }

    #[tokio::test]
    async fn discover_partition_leader_happy_path() {
        let (connection, mut server_io) = test_connection();

        let server = tokio::spawn(async move {
            let corr_id = read_request_corr_id(&mut server_io).await;

            let partition = MetadataResponsePartition::default()
                .with_partition_index(0)
                .with_error_code(0)
                .with_leader_id(BrokerId(7));
            let topic = MetadataResponseTopic::default()
                .with_name(Some(TopicName(str_bytes("t"))))
                .with_error_code(0)
                .with_partitions(vec![partition]);
            let broker = MetadataResponseBroker::default()
                .with_node_id(BrokerId(7))
                .with_host(str_bytes("k7"))
                .with_port(9092);
            let resp = MetadataResponse::default()
                .with_topics(vec![topic])
                .with_brokers(vec![broker]);

            write_typed_response(&mut server_io, corr_id, &resp, 0).await;
        });

        let endpoint = discover_partition_leader(&connection, "t", 0, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(endpoint, Endpoint::new("k7", 9092));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn discover_coordinator_happy_path() {
        let (connection, mut server_io) = test_connection();

        let server = tokio::spawn(async move {
            let corr_id = read_request_corr_id(&mut server_io).await;
            let resp = FindCoordinatorResponse::default()
                .with_error_code(0)
                .with_host(str_bytes("coord"))
                .with_port(9093);
            write_typed_response(&mut server_io, corr_id, &resp, 0).await;
        });

        let endpoint = discover_coordinator(
            &connection,
            CoordinatorType::Group,
            "my-group",
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(endpoint, Endpoint::new("coord", 9093));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn coordinator_v0_rejects_transaction_type_without_touching_the_socket() {
        let (connection, _server_io) = test_connection();

        let err = discover_coordinator(
            &connection,
            CoordinatorType::Transaction,
            "txn-id",
            Duration::from_millis(200),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::BadVersion(_)));
    }
}
