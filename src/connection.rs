//! Connection actor (C5, §4.5): a single-consumer task that owns one socket exclusively,
//! multiplexing concurrent callers' requests over it by correlation ID.
//!
//! Grounded on the `tokio::select!`-driven event loop shape used elsewhere in this codebase for
//! a task that owns one resource exclusively and answers both external commands and resource
//! events in the same loop (`gazette/src/journal/append_stream.rs`), adapted to a classic
//! mailbox-plus-socket actor instead of a coroutine-stream adapter.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::frame::Accumulator;
use crate::pending::{PendingTable, Waiter, RESERVED_HANDSHAKE_CORR_ID};
use crate::transport::Transport;
use crate::types::{Endpoint, Request, Response};
use crate::versions::VersionMap;
use crate::wire::WireCodec;
use bytes::BytesMut;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};

/// Where debug tracing of messages should go (§4.5 item 6).
#[derive(Debug, Clone, Default)]
pub enum DebugMode {
    #[default]
    Off,
    Stdout,
    File(std::path::PathBuf),
}

impl From<&crate::config::Debug> for DebugMode {
    fn from(value: &crate::config::Debug) -> Self {
        match value {
            crate::config::Debug::Off => DebugMode::Off,
            crate::config::Debug::Stdout => DebugMode::Stdout,
            crate::config::Debug::File(path) => DebugMode::File(path.clone()),
        }
    }
}

enum Command {
    Send {
        request: Request,
        write_ack: oneshot::Sender<Result<()>>,
        deliver: Option<oneshot::Sender<Result<Response>>>,
    },
    Stop(oneshot::Sender<()>),
    SetDebug(DebugMode, oneshot::Sender<()>),
    GetVersionMap(oneshot::Sender<VersionMap>),
    PeerAddr(oneshot::Sender<Result<String>>),
}

/// A handle to a running connection actor. Cheap to clone; all clones share the same
/// underlying socket and mailbox.
#[derive(Clone)]
pub struct Connection {
    mailbox: mpsc::Sender<Command>,
    /// Present unless `config.nolink`. Each clone shares the same `Arc`; the actor's lifetime
    /// is coupled to the last clone being dropped, which drops the wrapped `oneshot::Sender`
    /// and closes the channel the actor is watching.
    _owner: Option<Arc<oneshot::Sender<()>>>,
    client_id: bytes::Bytes,
}

impl Connection {
    /// Dial, handshake, negotiate versions, and spawn the actor. This is the `start(host, port,
    /// config)` entry point from §6.
    pub async fn start(
        endpoint: Endpoint,
        config: Config,
        codec: Arc<dyn WireCodec>,
        auth_backend: Option<Arc<dyn crate::handshake::AuthBackend>>,
    ) -> Result<Connection> {
        config.validate()?;

        let transport = Transport::connect(&endpoint, &config).await.map_err(|e| {
            if matches!(e, Error::FailedToUpgradeToTls(_)) {
                crate::handshake::log_hint(crate::handshake::FailurePoint::TlsUpgrade, &config, &e);
            }
            e
        })?;
        let transport = crate::handshake::run(transport, &endpoint, &config, auth_backend.as_ref())
            .await
            .map_err(|e| {
                tracing::error!(endpoint = %endpoint, error = %e, "handshake failed");
                e
            })?;

        let (transport, version_map) =
            crate::handshake::negotiate_versions(transport, &*codec).await?;

        Ok(spawn(transport, config, codec, version_map))
    }

    pub async fn request_async(&self, request: Request) -> Result<()> {
        let (write_ack, write_ack_rx) = oneshot::channel();
        self.mailbox
            .send(Command::Send {
                request,
                write_ack,
                deliver: None,
            })
            .await
            .map_err(|_| Error::TransportDown("connection actor is gone".into()))?;
        write_ack_rx
            .await
            .map_err(|_| Error::TransportDown("connection actor is gone".into()))?
    }

    /// `request_sync(connection, request, timeout) -> response | ok (if no_ack) | error` (§6):
    /// `Ok(None)` is the `no_ack` "ok" case, `Ok(Some(_))` the awaited response.
    pub async fn request_sync(
        &self,
        request: Request,
        timeout: Duration,
    ) -> Result<Option<Response>> {
        if request.no_ack {
            self.request_async(request).await?;
            return Ok(None);
        }

        let (write_ack, write_ack_rx) = oneshot::channel();
        let (deliver, deliver_rx) = oneshot::channel();
        self.mailbox
            .send(Command::Send {
                request,
                write_ack,
                deliver: Some(deliver),
            })
            .await
            .map_err(|_| Error::TransportDown("connection actor is gone".into()))?;

        write_ack_rx
            .await
            .map_err(|_| Error::TransportDown("connection actor is gone".into()))??;

        match tokio::time::timeout(timeout, deliver_rx).await {
            Ok(Ok(response)) => response.map(Some),
            Ok(Err(_)) => Err(Error::TransportDown("connection actor is gone".into())),
            Err(_) => Err(Error::Timeout),
        }
    }

    pub async fn stop(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        if self.mailbox.send(Command::Stop(tx)).await.is_err() {
            return Ok(()); // already gone
        }
        let _ = rx.await;
        Ok(())
    }

    pub async fn set_debug(&self, mode: DebugMode) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.mailbox
            .send(Command::SetDebug(mode, tx))
            .await
            .map_err(|_| Error::TransportDown("connection actor is gone".into()))?;
        rx.await
            .map_err(|_| Error::TransportDown("connection actor is gone".into()))
    }

    pub async fn version_map(&self) -> Result<VersionMap> {
        let (tx, rx) = oneshot::channel();
        self.mailbox
            .send(Command::GetVersionMap(tx))
            .await
            .map_err(|_| Error::TransportDown("connection actor is gone".into()))?;
        rx.await
            .map_err(|_| Error::TransportDown("connection actor is gone".into()))
    }

    /// `Get underlying socket` (§4.5 item 7), rendered for a userspace client as the peer
    /// address string rather than a raw fd/handle, since the socket is privately owned by the
    /// actor task for the connection's entire life.
    pub async fn peer_addr(&self) -> Result<String> {
        let (tx, rx) = oneshot::channel();
        self.mailbox
            .send(Command::PeerAddr(tx))
            .await
            .map_err(|_| Error::TransportDown("connection actor is gone".into()))?;
        rx.await
            .map_err(|_| Error::TransportDown("connection actor is gone".into()))?
    }

    pub fn client_id(&self) -> &bytes::Bytes {
        &self.client_id
    }
}

fn spawn(
    transport: Transport,
    config: Config,
    codec: Arc<dyn WireCodec>,
    version_map: VersionMap,
) -> Connection {
    let (mailbox, rx) = mpsc::channel(64);
    let (owner, actor_owner_rx) = if config.nolink {
        (None, None)
    } else {
        let (tx, rx) = oneshot::channel::<()>();
        (Some(Arc::new(tx)), Some(rx))
    };

    let client_id = config.client_id.clone();

    let actor = Actor {
        transport,
        codec,
        accumulator: Accumulator::new(),
        pending: PendingTable::new(),
        client_id: client_id.clone(),
        request_timeout: config.request_timeout,
        liveness_interval: config.liveness_tick_interval(),
        debug: DebugMode::from(&config.debug),
        version_map,
        mailbox: rx,
        owner_gone: actor_owner_rx,
    };

    tokio::spawn(actor.run());

    Connection {
        mailbox,
        _owner: owner,
        client_id,
    }
}

/// Test-only entry point into [`spawn`], for driving a [`Connection`] against a
/// [`Transport`] built from an in-memory duplex stream instead of a dialed socket.
#[cfg(test)]
pub(crate) fn test_spawn(
    transport: Transport,
    config: Config,
    codec: Arc<dyn WireCodec>,
    version_map: VersionMap,
) -> Connection {
    spawn(transport, config, codec, version_map)
}

struct Actor {
    transport: Transport,
    codec: Arc<dyn WireCodec>,
    accumulator: Accumulator,
    pending: PendingTable,
    client_id: bytes::Bytes,
    request_timeout: Duration,
    liveness_interval: Duration,
    debug: DebugMode,
    version_map: VersionMap,
    mailbox: mpsc::Receiver<Command>,
    owner_gone: Option<oneshot::Receiver<()>>,
}

impl Actor {
    async fn run(mut self) {
        let mut liveness = tokio::time::interval(self.liveness_interval);
        liveness.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut read_buf = BytesMut::with_capacity(8 * 1024);

        let exit = loop {
            tokio::select! {
                biased;

                _ = async { self.owner_gone.as_mut().unwrap().await }, if self.owner_gone.is_some() => {
                    tracing::debug!("owning handle dropped, stopping connection");
                    break Ok(());
                }

                _ = liveness.tick() => {
                    if !self.pending.is_empty() && self.pending.oldest_age() > self.request_timeout {
                        break Err(Error::RequestTimeout);
                    }
                }

                cmd = self.mailbox.recv() => {
                    match cmd {
                        None => break Ok(()),
                        Some(Command::Stop(ack)) => {
                            let _ = ack.send(());
                            break Ok(());
                        }
                        Some(cmd) => {
                            if let Err(e) = self.handle_command(cmd).await {
                                break Err(e);
                            }
                        }
                    }
                }

                read = self.transport.read_buf(&mut read_buf) => {
                    match read {
                        Ok(0) => break Err(Error::TransportClosed(crate::error::TransportCloseReason::TcpClosed)),
                        Ok(_) => {
                            let chunk = read_buf.split().freeze();
                            match self.accumulator.push(chunk) {
                                Ok(frames) => {
                                    for frame in frames {
                                        self.dispatch(frame);
                                    }
                                }
                                Err(e) => break Err(e),
                            }
                        }
                        Err(e) => break Err(Error::TransportError(e)),
                    }
                }
            }
        };

        if let Err(err) = &exit {
            tracing::error!(error = %err, "connection actor exiting");
            for waiter in self.pending.drain() {
                if let Some(deliver) = waiter.deliver {
                    let _ = deliver.send(Err(Error::TransportDown(err.to_string())));
                }
            }
        }
        let _ = self.transport.shutdown().await;
    }

    async fn handle_command(&mut self, cmd: Command) -> Result<()> {
        match cmd {
            Command::Stop(_) => unreachable!("handled in run()"),
            Command::Send {
                request,
                write_ack,
                deliver,
            } => {
                // A write failure (or any other fatal error) must still kill the connection even
                // though it's reported to this one caller via `write_ack` (§4.5 item 1, §7): the
                // pending table may already hold other callers' waiters that need `transport_down`.
                match self.send_request(request, deliver).await {
                    Ok(()) => {
                        let _ = write_ack.send(Ok(()));
                        Ok(())
                    }
                    Err(e) if e.is_fatal() => {
                        let _ = write_ack.send(Err(clone_fatal(&e)));
                        Err(e)
                    }
                    Err(e) => {
                        let _ = write_ack.send(Err(e));
                        Ok(())
                    }
                }
            }
            Command::SetDebug(mode, ack) => {
                self.debug = mode;
                let _ = ack.send(());
                Ok(())
            }
            Command::GetVersionMap(ack) => {
                let _ = ack.send(self.version_map.clone());
                Ok(())
            }
            Command::PeerAddr(ack) => {
                let _ = ack.send(self.transport.peer_addr_string());
                Ok(())
            }
        }
    }

    async fn send_request(
        &mut self,
        request: Request,
        deliver: Option<oneshot::Sender<Result<Response>>>,
    ) -> Result<()> {
        let corr_id = if request.no_ack {
            self.pending.increment()?
        } else {
            self.pending.add(Waiter {
                reference: request.reference,
                api: request.api,
                version: request.version,
                sent_at: std::time::Instant::now(),
                deliver,
            })?
        };

        let frame = self.codec.encode_request(
            &self.client_id,
            corr_id,
            request.api,
            request.version,
            &request.body,
        )?;

        self.trace_outbound(corr_id, &request);

        if let Err(e) = self.transport.write_all(&frame).await {
            return Err(Error::SendError(e));
        }
        Ok(())
    }

    fn dispatch(&mut self, frame: bytes::Bytes) {
        let (corr_id, rest) = match self.codec.decode_corr_id(&frame) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "dropping unparseable frame");
                return;
            }
        };

        if corr_id == RESERVED_HANDSHAKE_CORR_ID {
            return; // stray handshake-era frame, nothing to deliver it to
        }

        let Some(waiter) = self.pending.delete(corr_id) else {
            tracing::debug!(corr_id, "dropping response for unknown/expired correlation id");
            return;
        };

        self.trace_inbound(corr_id, waiter.api);

        let Some(deliver) = waiter.deliver else {
            return; // caller already detached; response silently discarded per §3 invariant 2
        };

        let body = match self.codec.decode_body(waiter.api, waiter.version, rest) {
            Ok(b) => b,
            Err(e) => {
                let _ = deliver.send(Err(e));
                return;
            }
        };

        let _ = deliver.send(Ok(Response {
            reference: waiter.reference,
            api: waiter.api,
            version: waiter.version,
            body,
        }));
    }

    fn trace_outbound(&self, corr_id: i32, request: &Request) {
        match &self.debug {
            DebugMode::Off => {}
            DebugMode::Stdout => {
                println!(
                    "{:?} corr_id={corr_id} -> {:?} v{} ({} bytes)",
                    debug_timestamp(),
                    request.api,
                    request.version,
                    request.body.len()
                );
            }
            DebugMode::File(path) => {
                append_debug_line(
                    path,
                    &format!(
                        "{:?} corr_id={corr_id} -> {:?} v{} ({} bytes)\n",
                        debug_timestamp(),
                        request.api,
                        request.version,
                        request.body.len()
                    ),
                );
            }
        }
    }

    fn trace_inbound(&self, corr_id: i32, api: kafka_protocol::messages::ApiKey) {
        match &self.debug {
            DebugMode::Off => {}
            DebugMode::Stdout => {
                println!("{:?} corr_id={corr_id} <- {:?}", debug_timestamp(), api);
            }
            DebugMode::File(path) => {
                append_debug_line(
                    path,
                    &format!("{:?} corr_id={corr_id} <- {:?}\n", debug_timestamp(), api),
                );
            }
        }
    }
}

fn debug_timestamp() -> std::time::SystemTime {
    std::time::SystemTime::now()
}

/// `Error` isn't `Clone` (it wraps `io::Error`/`anyhow::Error`, neither of which are), but a
/// fatal send failure needs to reach both the one caller waiting on `write_ack` and the actor
/// loop's own `break Err(e)`. Rebuild a structurally equivalent error for the caller from the
/// original, which the actor loop keeps and reports.
fn clone_fatal(e: &Error) -> Error {
    match e {
        Error::SendError(io_err) => Error::SendError(std::io::Error::new(io_err.kind(), io_err.to_string())),
        Error::TransportError(io_err) => {
            Error::TransportError(std::io::Error::new(io_err.kind(), io_err.to_string()))
        }
        Error::TransportClosed(reason) => Error::TransportClosed(*reason),
        Error::RequestTimeout => Error::RequestTimeout,
        other => Error::TransportDown(other.to_string()),
    }
}

fn append_debug_line(path: &std::path::Path, line: &str) {
    use std::io::Write;
    if let Ok(mut f) = std::fs::OpenOptions::new().create(true).append(true).open(path) {
        let _ = f.write_all(line.as_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::KafkaProtocolCodec;
    use bytes::{BufMut, Bytes};
    use kafka_protocol::messages::ApiKey;
    use kafka_protocol::protocol::Encodable;

    #[test]
    fn debug_mode_from_config_maps_variants() {
        assert!(matches!(
            DebugMode::from(&crate::config::Debug::Off),
            DebugMode::Off
        ));
        assert!(matches!(
            DebugMode::from(&crate::config::Debug::Stdout),
            DebugMode::Stdout
        ));
    }

    fn test_connection(
        config: Config,
    ) -> (Connection, tokio::io::DuplexStream) {
        let (client_io, server_io) = tokio::io::duplex(8192);
        let transport = Transport::from_parts(client_io, "127.0.0.1:9092".parse().unwrap());
        let codec: Arc<dyn WireCodec> = Arc::new(KafkaProtocolCodec);
        let version_map = crate::versions::kafka_09_fallback(&KafkaProtocolCodec);
        let connection = test_spawn(transport, config, codec, version_map);
        (connection, server_io)
    }

    /// Reads one framed request off `io`, returning its correlation id and raw body.
    async fn read_request(io: &mut (impl AsyncReadExt + Unpin)) -> (i32, Vec<u8>) {
        let mut len_buf = [0u8; 4];
        io.read_exact(&mut len_buf).await.unwrap();
        let len = i32::from_be_bytes(len_buf) as usize;
        let mut body = vec![0u8; len];
        io.read_exact(&mut body).await.unwrap();
        let corr_id = i32::from_be_bytes([body[4], body[5], body[6], body[7]]);
        (corr_id, body)
    }

    /// Writes a minimal, framed, header-only response (empty body past the response header) for
    /// `corr_id`, tagged with `extra` as the only payload bytes.
    async fn write_response(io: &mut (impl AsyncWriteExt + Unpin), corr_id: i32, extra: &[u8]) {
        let header =
            kafka_protocol::messages::ResponseHeader::default().with_correlation_id(corr_id);
        let mut buf = BytesMut::new();
        buf.put_i32(0);
        header.encode(&mut buf, 0).unwrap();
        buf.extend_from_slice(extra);
        let payload_len = (buf.len() - 4) as i32;
        buf[0..4].copy_from_slice(&payload_len.to_be_bytes());
        io.write_all(&buf).await.unwrap();
    }

    #[tokio::test]
    async fn request_sync_round_trips_a_response() {
        let (connection, mut server_io) = test_connection(Config::default());

        let server = tokio::spawn(async move {
            let (corr_id, _body) = read_request(&mut server_io).await;
            write_response(&mut server_io, corr_id, b"payload").await;
        });

        let request = Request {
            reference: 1,
            api: ApiKey::Metadata,
            version: 0,
            no_ack: false,
            body: Bytes::from_static(b"req-body"),
        };
        let response = connection
            .request_sync(request, Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(response.reference, 1);
        assert_eq!(&response.body[..], b"payload");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn no_ack_request_returns_ok_none_and_still_writes_to_the_wire() {
        let (connection, mut server_io) = test_connection(Config::default());

        let request = Request {
            reference: 7,
            api: ApiKey::Metadata,
            version: 0,
            no_ack: true,
            body: Bytes::from_static(b"fire-and-forget"),
        };
        let result = connection
            .request_sync(request, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(result.is_none());

        let (_corr_id, body) = read_request(&mut server_io).await;
        assert!(body.ends_with(b"fire-and-forget"));
    }

    #[tokio::test(start_paused = true)]
    async fn liveness_tick_evicts_a_request_that_never_gets_a_response() {
        let mut config = Config::default();
        config.request_timeout = Duration::from_secs(2);
        let (connection, _server_io) = test_connection(config);

        let request = Request {
            reference: 1,
            api: ApiKey::Metadata,
            version: 0,
            no_ack: false,
            body: Bytes::from_static(b"never-answered"),
        };

        let waiter = tokio::spawn({
            let connection = connection.clone();
            async move { connection.request_sync(request, Duration::from_secs(30)).await }
        });

        tokio::time::advance(Duration::from_secs(3)).await;

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(Error::TransportDown(_))));
    }
}
