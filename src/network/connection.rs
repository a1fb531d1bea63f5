//! Connection task
//!
//! One task per peer drives a `PeerSession` over a byte stream: it decodes
//! frames, runs the verack/ping/getaddr/getheaders timers and carries out
//! the session's actions. Writes go through a dedicated writer task so
//! they never interleave. The task owns its timers, so none can fire after
//! the peer is gone.

use crate::chain::{BlockHash, BlockHeader, ChainError, ChainTip, HeaderRecord};
use crate::network::params::PeerTimings;
use crate::network::peer::{
    DisconnectReason, PeerAction, PeerCommand, PeerError, PeerInfo, PeerSession, SessionConfig,
};
use crate::network::transport::PeerStream;
use crate::wire::{Message, MessageCodec, TimestampedAddress, MAX_ADDR_PER_MESSAGE, MAX_HEADERS_PER_MESSAGE};
use async_trait::async_trait;
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use rand::Rng;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep};
use tokio_util::codec::{FramedRead, FramedWrite};

/// Outgoing messages buffered per connection
const OUTBOUND_QUEUE: usize = 100;

/// How long teardown waits for queued writes to flush
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Everything a peer reports to, or asks of, its owner
#[async_trait]
pub trait PeerDelegate: Send + Sync {
    async fn peer_connected(&self, info: &PeerInfo);
    async fn peer_disconnected(&self, info: &PeerInfo, reason: &DisconnectReason);
    async fn peer_failed_to_connect(&self, info: &PeerInfo, error: &PeerError);
    async fn peer_failed_handshake(&self, info: &PeerInfo);
    async fn peer_failed_ping(&self, info: &PeerInfo, consecutive: u32);
    async fn peer_failed_getaddr(&self, info: &PeerInfo);
    async fn peer_failed_getheaders(&self, info: &PeerInfo);
    async fn received_addresses(&self, info: &PeerInfo, entries: Vec<TimestampedAddress>);
    async fn received_headers(
        &self,
        info: &PeerInfo,
        headers: Vec<BlockHeader>,
    ) -> Result<Vec<HeaderRecord>, ChainError>;
    /// Tip used for `getheaders` locators and our advertised start height
    async fn request_current_tip(&self) -> ChainTip;
    async fn known_addresses(&self, max: usize) -> Vec<TimestampedAddress>;
    async fn headers_after(
        &self,
        locators: &[BlockHash],
        stop: &BlockHash,
        max: usize,
    ) -> Vec<BlockHeader>;
}

/// Settings shared by every connection of a node
#[derive(Debug, Clone)]
pub struct PeerContext {
    pub magic: u32,
    pub session: Arc<SessionConfig>,
    pub timings: PeerTimings,
}

async fn wait_deadline(deadline: &mut Option<Pin<Box<Sleep>>>) {
    match deadline {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending::<()>().await,
    }
}

async fn wait_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Periodic timer whose first tick is one period away
fn periodic(period: Duration) -> Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

struct Connection {
    session: PeerSession,
    ctx: Arc<PeerContext>,
    delegate: Arc<dyn PeerDelegate>,
    outbound: mpsc::Sender<Message>,
    verack_deadline: Option<Pin<Box<Sleep>>>,
    ping_timer: Option<Interval>,
    getaddr_timer: Option<Interval>,
    getheaders_timer: Option<Interval>,
}

impl Connection {
    async fn send(&self, message: Message) -> Option<DisconnectReason> {
        log::trace!("-> {} {}", self.session.info().addr, message.command());
        match self.outbound.send(message).await {
            Ok(()) => None,
            Err(_) => Some(DisconnectReason::WriteFailed),
        }
    }

    fn start_timers(&mut self) {
        let timings = self.ctx.timings;
        let mut rng = rand::thread_rng();
        self.verack_deadline = None;
        self.ping_timer = Some(periodic(timings.ping_interval.pick(&mut rng)));
        self.getaddr_timer = Some(periodic(timings.getaddr_interval.pick(&mut rng)));
        self.getheaders_timer = Some(periodic(timings.getheaders_interval.pick(&mut rng)));
    }

    fn stop_timers(&mut self) {
        self.verack_deadline = None;
        self.ping_timer = None;
        self.getaddr_timer = None;
        self.getheaders_timer = None;
    }

    /// Carry out session actions until done or the peer must go
    async fn apply(&mut self, actions: Vec<PeerAction>) -> Option<DisconnectReason> {
        let mut queue: VecDeque<PeerAction> = actions.into();

        while let Some(action) = queue.pop_front() {
            match action {
                PeerAction::Send(message) => {
                    if let Some(reason) = self.send(message).await {
                        return Some(reason);
                    }
                }
                PeerAction::ArmVerackTimer => {
                    let timeout = self.ctx.timings.verack_timeout();
                    self.verack_deadline = Some(Box::pin(tokio::time::sleep(timeout)));
                }
                PeerAction::Handshaked => {
                    self.start_timers();
                    self.delegate.peer_connected(self.session.info()).await;
                }
                PeerAction::HandshakeFailed => {
                    self.delegate.peer_failed_handshake(self.session.info()).await;
                }
                PeerAction::PingFailed { consecutive } => {
                    self.delegate
                        .peer_failed_ping(self.session.info(), consecutive)
                        .await;
                }
                PeerAction::GetAddrFailed => {
                    self.delegate.peer_failed_getaddr(self.session.info()).await;
                }
                PeerAction::GetHeadersFailed => {
                    self.delegate.peer_failed_getheaders(self.session.info()).await;
                }
                PeerAction::RequestHeaders => {
                    let tip = self.delegate.request_current_tip().await;
                    let request = self.session.getheaders_request(vec![tip.hash]);
                    if let Some(reason) = self.send(request).await {
                        return Some(reason);
                    }
                }
                PeerAction::MergeHeaders(headers) => {
                    let count = headers.len();
                    match self
                        .delegate
                        .received_headers(self.session.info(), headers)
                        .await
                    {
                        Ok(accepted) => {
                            queue.extend(self.session.on_headers_merged(accepted.len()));
                        }
                        Err(e) => {
                            log::debug!(
                                "Dropped {} headers from {}: {}",
                                count,
                                self.session.info().addr,
                                e
                            );
                            self.session.on_headers_rejected();
                        }
                    }
                }
                PeerAction::ForwardAddresses(entries) => {
                    self.delegate
                        .received_addresses(self.session.info(), entries)
                        .await;
                }
                PeerAction::RespondAddresses => {
                    let entries = self.delegate.known_addresses(MAX_ADDR_PER_MESSAGE).await;
                    if let Some(reason) = self.send(Message::Addr(entries)).await {
                        return Some(reason);
                    }
                }
                PeerAction::ServeHeaders(request) => {
                    let headers = self
                        .delegate
                        .headers_after(&request.locators, &request.stop_hash, MAX_HEADERS_PER_MESSAGE)
                        .await;
                    if let Some(reason) = self.send(Message::Headers(headers)).await {
                        return Some(reason);
                    }
                }
                PeerAction::Disconnect(reason) => return Some(reason),
            }
        }

        None
    }
}

/// Drive one peer until it disconnects
///
/// Sends our `version` straight away regardless of direction. The delegate
/// is told about the disconnect exactly once, with the final `PeerInfo`,
/// which is also returned.
pub async fn run_peer<S: PeerStream>(
    stream: S,
    info: PeerInfo,
    ctx: Arc<PeerContext>,
    delegate: Arc<dyn PeerDelegate>,
    mut commands: mpsc::Receiver<PeerCommand>,
) -> PeerInfo {
    let addr: SocketAddr = info.addr;
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = FramedRead::new(read_half, MessageCodec::new(ctx.magic));
    let mut writer = FramedWrite::new(write_half, MessageCodec::new(ctx.magic));

    let (out_tx, mut out_rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);
    let mut write_handle = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            if let Err(e) = writer.send(message).await {
                log::debug!("Write to {} failed: {}", addr, e);
                break;
            }
        }
        let _ = writer.close().await;
    });

    let mut conn = Connection {
        session: PeerSession::new(info, Arc::clone(&ctx.session)),
        ctx: Arc::clone(&ctx),
        delegate,
        outbound: out_tx,
        verack_deadline: None,
        ping_timer: None,
        getaddr_timer: None,
        getheaders_timer: None,
    };

    let tip = conn.delegate.request_current_tip().await;
    let nonce = rand::thread_rng().gen::<u64>();
    let version = conn
        .session
        .local_version(tip.height as i32, nonce, unix_now());
    let actions = conn.session.start(version);
    let mut outcome = conn.apply(actions).await;

    while outcome.is_none() {
        outcome = tokio::select! {
            frame = reader.next() => match frame {
                Some(Ok(message)) => {
                    log::trace!("<- {} {}", addr, message.command());
                    let actions = conn.session.on_message(message, unix_now());
                    conn.apply(actions).await
                }
                Some(Err(e)) => Some(DisconnectReason::ReadError(e.to_string())),
                None => Some(DisconnectReason::RemoteClosed),
            },
            command = commands.recv() => match command {
                Some(PeerCommand::Send(message)) => conn.send(message).await,
                Some(PeerCommand::Disconnect) | None => Some(DisconnectReason::Requested),
            },
            _ = wait_deadline(&mut conn.verack_deadline) => {
                conn.verack_deadline = None;
                let actions = conn.session.on_verack_timeout();
                conn.apply(actions).await
            }
            _ = wait_tick(&mut conn.ping_timer) => {
                let nonce = rand::thread_rng().gen::<u64>();
                let actions = conn.session.on_ping_tick(nonce);
                conn.apply(actions).await
            }
            _ = wait_tick(&mut conn.getaddr_timer) => {
                let actions = conn.session.on_getaddr_tick();
                conn.apply(actions).await
            }
            _ = wait_tick(&mut conn.getheaders_timer) => {
                let actions = conn.session.on_getheaders_tick();
                conn.apply(actions).await
            }
        };
    }
    let reason = outcome.unwrap_or(DisconnectReason::Requested);

    // Timers go first, then the writer, then the read half
    conn.stop_timers();
    conn.session.begin_disconnect();
    let Connection {
        mut session,
        delegate,
        outbound,
        ..
    } = conn;
    drop(outbound);
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut write_handle)
        .await
        .is_err()
    {
        write_handle.abort();
    }
    drop(reader);

    session.finish_disconnect();
    let info = session.into_info();
    delegate.peer_disconnected(&info, &reason).await;
    info
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::chain::header::tests::genesis_header;
    use crate::chain::HeaderChain;
    use crate::network::params::{JitterRange, NetworkParams};
    use crate::network::peer::{ConnectionDirection, PeerPhase};
    use crate::wire::{Envelope, VersionMessage};
    use bytes::BytesMut;
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio_util::codec::Decoder;

    pub const MAGIC: u32 = 0xe3e1f3e8;

    /// Delegate that records every callback
    pub struct RecordingDelegate {
        pub chain: Mutex<HeaderChain>,
        pub events: Mutex<Vec<String>>,
        pub disconnects: Mutex<Vec<(PeerInfo, DisconnectReason)>>,
    }

    impl RecordingDelegate {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                chain: Mutex::new(HeaderChain::new(genesis_header().hash(), [])),
                events: Mutex::new(Vec::new()),
                disconnects: Mutex::new(Vec::new()),
            })
        }

        fn record(&self, event: impl Into<String>) {
            self.events.lock().unwrap().push(event.into());
        }

        pub fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PeerDelegate for RecordingDelegate {
        async fn peer_connected(&self, _info: &PeerInfo) {
            self.record("connected");
        }

        async fn peer_disconnected(&self, info: &PeerInfo, reason: &DisconnectReason) {
            self.record(format!("disconnected: {}", reason));
            self.disconnects
                .lock()
                .unwrap()
                .push((info.clone(), reason.clone()));
        }

        async fn peer_failed_to_connect(&self, _info: &PeerInfo, _error: &PeerError) {
            self.record("failed-to-connect");
        }

        async fn peer_failed_handshake(&self, _info: &PeerInfo) {
            self.record("failed-handshake");
        }

        async fn peer_failed_ping(&self, _info: &PeerInfo, consecutive: u32) {
            self.record(format!("failed-ping {}", consecutive));
        }

        async fn peer_failed_getaddr(&self, _info: &PeerInfo) {
            self.record("failed-getaddr");
        }

        async fn peer_failed_getheaders(&self, _info: &PeerInfo) {
            self.record("failed-getheaders");
        }

        async fn received_addresses(&self, _info: &PeerInfo, entries: Vec<TimestampedAddress>) {
            self.record(format!("addresses {}", entries.len()));
        }

        async fn received_headers(
            &self,
            _info: &PeerInfo,
            headers: Vec<BlockHeader>,
        ) -> Result<Vec<HeaderRecord>, ChainError> {
            let result = self.chain.lock().unwrap().append(&headers);
            self.record(format!("headers {}", headers.len()));
            result
        }

        async fn request_current_tip(&self) -> ChainTip {
            self.chain.lock().unwrap().chain_tip()
        }

        async fn known_addresses(&self, _max: usize) -> Vec<TimestampedAddress> {
            Vec::new()
        }

        async fn headers_after(
            &self,
            locators: &[BlockHash],
            stop: &BlockHash,
            max: usize,
        ) -> Vec<BlockHeader> {
            self.chain.lock().unwrap().headers_after(locators, stop, max)
        }
    }

    pub fn test_context(timings: PeerTimings) -> Arc<PeerContext> {
        let params = NetworkParams::bitcoin_cash();
        Arc::new(PeerContext {
            magic: MAGIC,
            session: Arc::new(SessionConfig::new(&params, &timings, None)),
            timings,
        })
    }

    /// Fixed timer periods so paused-time tests are deterministic
    fn fixed_timings() -> PeerTimings {
        PeerTimings {
            verack_timeout_secs: 10,
            ping_interval: JitterRange::new(20, 20),
            getaddr_interval: JitterRange::new(1000, 1000),
            getheaders_interval: JitterRange::new(1000, 1000),
            ..PeerTimings::default()
        }
    }

    /// The remote end of a duplex pipe, speaking raw frames
    struct RemotePeer {
        stream: DuplexStream,
        codec: MessageCodec,
        buf: BytesMut,
    }

    impl RemotePeer {
        fn new(stream: DuplexStream) -> Self {
            Self {
                stream,
                codec: MessageCodec::new(MAGIC),
                buf: BytesMut::new(),
            }
        }

        async fn send(&mut self, message: Message) {
            let bytes = Envelope::from_message(&message).to_bytes(MAGIC);
            self.stream.write_all(&bytes).await.unwrap();
        }

        async fn recv(&mut self) -> Option<Message> {
            loop {
                if let Some(message) = self.codec.decode(&mut self.buf).unwrap() {
                    return Some(message);
                }
                let mut chunk = [0u8; 4096];
                let n = self.stream.read(&mut chunk).await.unwrap();
                if n == 0 {
                    return None;
                }
                self.buf.extend_from_slice(&chunk[..n]);
            }
        }
    }

    fn remote_version() -> VersionMessage {
        VersionMessage {
            version: 70015,
            services: crate::wire::ServiceFlags::NETWORK,
            timestamp: 0,
            receiver: crate::wire::NetworkAddress::unspecified(),
            emitter: None,
            nonce: 1,
            user_agent: "/remote/".to_string(),
            start_height: 0,
            relay: None,
        }
    }

    fn spawn_peer(
        delegate: Arc<RecordingDelegate>,
        timings: PeerTimings,
    ) -> (
        RemotePeer,
        mpsc::Sender<PeerCommand>,
        tokio::task::JoinHandle<PeerInfo>,
    ) {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let (tx, rx) = mpsc::channel(8);
        let info = PeerInfo::new("192.0.2.50:8333".parse().unwrap(), ConnectionDirection::Outbound);
        let handle = tokio::spawn(run_peer(local, info, test_context(timings), delegate, rx));
        (RemotePeer::new(remote), tx, handle)
    }

    #[tokio::test(start_paused = true)]
    async fn test_verack_timeout_disconnects_once() {
        let delegate = RecordingDelegate::new();
        let (mut remote, _tx, handle) = spawn_peer(Arc::clone(&delegate), fixed_timings());

        match remote.recv().await {
            Some(Message::Version(v)) => assert_eq!(v.version, 70015),
            other => panic!("expected version, got {:?}", other),
        }

        // Paused clock auto-advances to the verack deadline
        let info = handle.await.unwrap();
        assert_eq!(info.failures.verack, 1);
        assert_eq!(info.phase, PeerPhase::Disconnected);

        let disconnects = delegate.disconnects.lock().unwrap().clone();
        assert_eq!(disconnects.len(), 1);
        assert_eq!(disconnects[0].1, DisconnectReason::VerackTimeout);
        assert_eq!(
            delegate.events(),
            vec!["failed-handshake", "disconnected: verack timeout"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_then_ping_timeout() {
        let delegate = RecordingDelegate::new();
        let (mut remote, _tx, handle) = spawn_peer(Arc::clone(&delegate), fixed_timings());

        assert!(matches!(remote.recv().await, Some(Message::Version(_))));
        remote.send(Message::Version(remote_version())).await;
        assert_eq!(remote.recv().await, Some(Message::Verack));
        remote.send(Message::Verack).await;

        // Answer nothing; count pings until the connection drops
        let mut pings = 0;
        while let Some(message) = remote.recv().await {
            if let Message::Ping(_) = message {
                pings += 1;
            }
        }

        let info = handle.await.unwrap();
        assert_eq!(pings, 4);
        assert_eq!(info.failures.ping, 4);
        assert_eq!(info.failures.verack, 0);
        assert_eq!(
            delegate.events(),
            vec![
                "connected",
                "failed-ping 1",
                "failed-ping 2",
                "failed-ping 3",
                "failed-ping 4",
                "disconnected: ping timeout"
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_pong_keeps_connection_alive() {
        let delegate = RecordingDelegate::new();
        let (mut remote, tx, handle) = spawn_peer(Arc::clone(&delegate), fixed_timings());

        assert!(matches!(remote.recv().await, Some(Message::Version(_))));
        remote.send(Message::Verack).await;

        for _ in 0..6 {
            match remote.recv().await {
                Some(Message::Ping(nonce)) => remote.send(Message::Pong(nonce)).await,
                other => panic!("expected ping, got {:?}", other),
            }
        }

        tx.send(PeerCommand::Disconnect).await.unwrap();
        let info = handle.await.unwrap();
        assert_eq!(info.failures.ping, 0);
        assert_eq!(
            delegate.disconnects.lock().unwrap()[0].1,
            DisconnectReason::Requested
        );
    }

    #[tokio::test]
    async fn test_answers_ping_and_remote_close() {
        let delegate = RecordingDelegate::new();
        let (mut remote, _tx, handle) = spawn_peer(Arc::clone(&delegate), fixed_timings());

        assert!(matches!(remote.recv().await, Some(Message::Version(_))));
        remote.send(Message::Ping(0x5151)).await;
        assert_eq!(remote.recv().await, Some(Message::Pong(0x5151)));

        drop(remote);
        let info = handle.await.unwrap();
        assert_eq!(info.phase, PeerPhase::Disconnected);
        assert_eq!(
            delegate.disconnects.lock().unwrap()[0].1,
            DisconnectReason::RemoteClosed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_header_sync_loop() {
        use crate::chain::header::tests::BLOCK_1_HEADER;
        use crate::wire::Decodable;

        let delegate = RecordingDelegate::new();
        let timings = PeerTimings {
            getheaders_interval: JitterRange::new(5, 5),
            ping_interval: JitterRange::new(1000, 1000),
            ..fixed_timings()
        };
        let (mut remote, tx, handle) = spawn_peer(Arc::clone(&delegate), timings);

        assert!(matches!(remote.recv().await, Some(Message::Version(_))));
        remote.send(Message::Verack).await;

        let genesis = genesis_header().hash();
        match remote.recv().await {
            Some(Message::GetHeaders(request)) => assert_eq!(request.locators, vec![genesis]),
            other => panic!("expected getheaders, got {:?}", other),
        }

        let block1 = BlockHeader::from_bytes(&BLOCK_1_HEADER).unwrap();
        remote.send(Message::Headers(vec![block1])).await;

        // Accepted headers trigger the next request right away
        match remote.recv().await {
            Some(Message::GetHeaders(request)) => {
                assert_eq!(request.locators, vec![block1.hash()])
            }
            other => panic!("expected getheaders, got {:?}", other),
        }
        assert_eq!(delegate.chain.lock().unwrap().height(), 1);

        tx.send(PeerCommand::Disconnect).await.unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_serves_getheaders() {
        let delegate = RecordingDelegate::new();
        let (mut remote, tx, handle) = spawn_peer(Arc::clone(&delegate), fixed_timings());
        assert!(matches!(remote.recv().await, Some(Message::Version(_))));

        remote
            .send(Message::GetHeaders(crate::wire::GetHeadersMessage::new(
                70015,
                vec![genesis_header().hash()],
            )))
            .await;
        assert_eq!(remote.recv().await, Some(Message::Headers(Vec::new())));

        remote.send(Message::GetAddr).await;
        assert_eq!(remote.recv().await, Some(Message::Addr(Vec::new())));

        tx.send(PeerCommand::Disconnect).await.unwrap();
        handle.await.unwrap();
    }
}
