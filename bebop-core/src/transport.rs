//! Transport layer for the device link.
//!
//! This module handles:
//! - The outbound socket connected to the device command port
//! - The inbound socket receiving telemetry and video
//! - Three tasks: a single writer, the reader/dispatcher, and the heartbeat
//!
//! Every producer (acks, pongs, video acks, heartbeat, user commands) goes
//! through one bounded outbound queue of unsequenced frames. Only the writer
//! touches the outbound socket, and it assigns each frame its per-channel
//! sequence number as it dequeues it, so numbers on the wire follow the wire
//! order and a frame dropped before the writer consumes no number.
//!
//! Full-queue policy: frames produced on the inbound path and by the
//! heartbeat are dropped when the queue is full (the device retransmits and
//! the next tick replaces a heartbeat); user commands wait for capacity.

use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::ack::AckResponder;
use crate::command::{Command, CommandState};
use crate::control::{ConfigError, DroneConfig, HealthCounters, LinkHealth};
use crate::proto::stream::StreamFragment;
use crate::proto::{channel, split_datagram, FrameType, NetworkFrame, ProtocolError};
use crate::reassembly::{ReassemblyStats, VideoFrame, VideoReassembler};
use crate::sequence::SequenceAllocator;

/// Large enough for any UDP datagram
const UDP_RECV_BUF_SIZE: usize = 65536;

/// Send attempts per datagram before it is dropped
const WRITE_ATTEMPTS: u32 = 3;

/// Backoff before the second attempt, doubled for each further attempt
const WRITE_BACKOFF: Duration = Duration::from_millis(5);

/// Pause after a socket receive error before reading again
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Transport errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error("Device address did not resolve: {0}")]
    Unresolved(String),

    #[error("Transport is shut down")]
    Closed,

    #[error("Transport task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Consumer side of the inbound streams
pub struct Streams {
    /// Reassembled video frames
    pub video: mpsc::Receiver<VideoFrame>,
    /// Every inbound frame that is not video or a ping
    pub telemetry: mpsc::Receiver<NetworkFrame>,
}

/// Producer side of the outbound queue
#[derive(Clone)]
struct Outbox {
    queue: mpsc::Sender<NetworkFrame>,
    counters: Arc<HealthCounters>,
}

impl Outbox {
    /// Enqueue without waiting; on a full queue the frame is dropped and counted
    fn offer(&self, frame: NetworkFrame) {
        if let Err(e) = self.queue.try_send(frame) {
            HealthCounters::incr(&self.counters.outbound_dropped);
            match e {
                TrySendError::Full(frame) => tracing::debug!(
                    channel = frame.channel_id,
                    "outbound queue full, dropping frame"
                ),
                TrySendError::Closed(_) => tracing::debug!("outbound queue closed"),
            }
        }
    }

    /// Enqueue, waiting for room
    async fn push(&self, frame: NetworkFrame) -> Result<(), TransportError> {
        self.queue
            .send(frame)
            .await
            .map_err(|_| TransportError::Closed)
    }
}

/// Routes inbound frames to the ack responder, the video reassembler, or
/// the telemetry consumer.
///
/// Owned by the reader task; dispatch is strictly sequential, so the
/// reassembly state needs no locking.
pub struct Dispatcher {
    responder: AckResponder,
    video: VideoReassembler,
    outbox: Outbox,
    telemetry: mpsc::Sender<NetworkFrame>,
    counters: Arc<HealthCounters>,
    video_stats: watch::Sender<ReassemblyStats>,
}

impl Dispatcher {
    /// Create a dispatcher enqueueing replies on `outbound`
    pub fn new(
        outbound: mpsc::Sender<NetworkFrame>,
        video: mpsc::Sender<VideoFrame>,
        telemetry: mpsc::Sender<NetworkFrame>,
    ) -> Self {
        let counters = Arc::new(HealthCounters::default());
        let (video_stats, _) = watch::channel(ReassemblyStats::default());
        Self {
            responder: AckResponder::new(),
            video: VideoReassembler::new(video),
            outbox: Outbox {
                queue: outbound,
                counters: Arc::clone(&counters),
            },
            telemetry,
            counters,
            video_stats,
        }
    }

    /// Dispatch every frame of one datagram.
    ///
    /// Malformed frames are logged, counted and dropped.
    pub fn dispatch_datagram(&mut self, datagram: &[u8]) {
        for result in split_datagram(datagram) {
            match result {
                Ok(frame) => self.dispatch(frame),
                Err(e) => {
                    HealthCounters::incr(&self.counters.malformed_frames);
                    tracing::warn!(error = %e, len = datagram.len(), "dropping malformed frame");
                }
            }
        }
    }

    /// Dispatch one decoded frame
    pub fn dispatch(&mut self, frame: NetworkFrame) {
        match frame.frame_type {
            FrameType::DataWithAck => {
                self.outbox.offer(self.responder.on_ack_required(&frame));
                // Device events ride on acknowledged frames
                self.forward_telemetry(frame);
            }
            FrameType::DataLowLatency if frame.channel_id == channel::VIDEO_DATA => {
                self.on_video(&frame);
            }
            _ if frame.channel_id == channel::PING => {
                self.outbox.offer(self.responder.on_ping(&frame));
            }
            _ => self.forward_telemetry(frame),
        }
    }

    fn on_video(&mut self, frame: &NetworkFrame) {
        let fragment = match StreamFragment::decode(&frame.payload) {
            Ok(f) => f,
            Err(e) => {
                HealthCounters::incr(&self.counters.malformed_frames);
                tracing::warn!(error = %e, "dropping malformed video fragment");
                return;
            }
        };

        let ack = self.video.push(fragment);
        self.video_stats.send_replace(self.video.stats());

        self.outbox.offer(NetworkFrame::unsequenced(
            FrameType::Data,
            channel::VIDEO_ACK,
            ack.encode().to_vec(),
        ));
    }

    fn forward_telemetry(&self, frame: NetworkFrame) {
        if self.telemetry.try_send(frame).is_err() {
            HealthCounters::incr(&self.counters.telemetry_dropped);
        }
    }

    /// Health counters seen by this dispatcher
    pub fn health(&self) -> LinkHealth {
        self.counters.snapshot(self.video.stats())
    }

    /// Whether video delivery is suspended until the next key frame
    pub fn waiting_for_iframe(&self) -> bool {
        self.video.waiting_for_iframe()
    }
}

/// Running link to the device.
///
/// Dropping the handle signals the tasks to stop; [`Transport::shutdown`]
/// additionally waits for them.
pub struct Transport {
    outbox: Outbox,
    commands: Arc<CommandState>,
    counters: Arc<HealthCounters>,
    video_stats: watch::Receiver<ReassemblyStats>,
    stop: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
}

impl Transport {
    /// Validate `config`, bind both sockets and start the writer, reader and
    /// heartbeat tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn start(config: &DroneConfig) -> Result<(Self, Streams), TransportError> {
        config.validate()?;

        let target = format!("{}:{}", config.device_addr, config.c2d_port);
        let remote_addr = tokio::net::lookup_host(&target)
            .await?
            .next()
            .ok_or_else(|| TransportError::Unresolved(target.clone()))?;

        let unspecified: SocketAddr = if remote_addr.is_ipv6() {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        };

        let inbound = UdpSocket::bind(SocketAddr::new(unspecified.ip(), config.d2c_port)).await?;
        let outbound_sock = UdpSocket::bind(unspecified).await?;
        outbound_sock.connect(remote_addr).await?;
        let local_addr = inbound.local_addr()?;

        let commands = Arc::new(CommandState::new());
        let (outbound, outbound_rx) = mpsc::channel(config.outbound_queue);
        let (video_tx, video) = mpsc::channel(config.video_queue);
        let (telemetry_tx, telemetry) = mpsc::channel(config.telemetry_queue);
        let (stop, stop_rx) = watch::channel(false);

        let dispatcher = Dispatcher::new(outbound, video_tx, telemetry_tx);
        let outbox = dispatcher.outbox.clone();
        let counters = Arc::clone(&dispatcher.counters);
        let video_stats = dispatcher.video_stats.subscribe();
        let writer = Writer::new(outbound_sock, config.write_timeout, Arc::clone(&counters));

        let tasks = vec![
            tokio::spawn(run_writer(writer, outbound_rx, stop_rx.clone())),
            tokio::spawn(run_reader(
                inbound,
                dispatcher,
                stop_rx.clone(),
                config.read_timeout,
            )),
            tokio::spawn(run_heartbeat(
                Arc::clone(&commands),
                outbox.clone(),
                stop_rx,
                config.heartbeat_delay,
                config.heartbeat_interval,
            )),
        ];

        tracing::info!(%local_addr, %remote_addr, "transport started");

        let transport = Self {
            outbox,
            commands,
            counters,
            video_stats,
            stop,
            tasks,
            local_addr,
            remote_addr,
        };

        if config.send_initial_commands {
            transport.send_command(Command::AllStates).await?;
            transport.send_command(Command::FlatTrim).await?;
        }

        Ok((transport, Streams { video, telemetry }))
    }

    /// Address of the inbound socket
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Device command endpoint
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Piloting state serialized by the heartbeat
    pub fn commands(&self) -> &CommandState {
        &self.commands
    }

    /// Submit a raw command payload on `channel_id`.
    ///
    /// Waits for room in the outbound queue. The sequence number is assigned
    /// by the writer.
    pub async fn submit(
        &self,
        frame_type: FrameType,
        channel_id: u8,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        self.outbox
            .push(NetworkFrame::unsequenced(frame_type, channel_id, payload.to_vec()))
            .await
    }

    /// Submit a one-shot device command
    pub async fn send_command(&self, command: Command) -> Result<(), TransportError> {
        tracing::debug!(?command, "sending command");
        self.submit(FrameType::Data, command.channel(), &command.encode())
            .await
    }

    /// Current link health
    pub fn health(&self) -> LinkHealth {
        self.counters.snapshot(*self.video_stats.borrow())
    }

    /// Stop all tasks and wait for them; both sockets are closed on return
    pub async fn shutdown(mut self) -> Result<(), TransportError> {
        let _ = self.stop.send(true);
        for task in std::mem::take(&mut self.tasks) {
            task.await?;
        }
        tracing::info!(remote_addr = %self.remote_addr, "transport stopped");
        Ok(())
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        let _ = self.stop.send(true);
    }
}

/// Resolves once stop is requested or the transport handle is gone
async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}

/// Destination of the writer's datagrams
trait DatagramSink: Send + Sync + 'static {
    fn send_datagram<'a>(
        &'a self,
        datagram: &'a [u8],
    ) -> impl Future<Output = io::Result<usize>> + Send + 'a;
}

impl DatagramSink for UdpSocket {
    fn send_datagram<'a>(
        &'a self,
        datagram: &'a [u8],
    ) -> impl Future<Output = io::Result<usize>> + Send + 'a {
        self.send(datagram)
    }
}

/// Numbers, encodes and sends outbound frames
struct Writer<S> {
    sink: S,
    sequences: SequenceAllocator,
    write_timeout: Duration,
    counters: Arc<HealthCounters>,
}

impl<S: DatagramSink> Writer<S> {
    fn new(sink: S, write_timeout: Duration, counters: Arc<HealthCounters>) -> Self {
        Self {
            sink,
            sequences: SequenceAllocator::new(),
            write_timeout,
            counters,
        }
    }

    async fn write(&self, frame: &NetworkFrame) {
        match self.sequences.encode(frame) {
            Ok(datagram) => self.send_with_retry(&datagram).await,
            Err(e) => tracing::warn!(
                error = %e,
                channel = frame.channel_id,
                "failed to encode outbound frame"
            ),
        }
    }

    async fn send_with_retry(&self, datagram: &[u8]) {
        let mut backoff = WRITE_BACKOFF;
        for attempt in 1..=WRITE_ATTEMPTS {
            match tokio::time::timeout(self.write_timeout, self.sink.send_datagram(datagram)).await
            {
                Ok(Ok(n)) => {
                    HealthCounters::incr(&self.counters.datagrams_sent);
                    HealthCounters::add(&self.counters.bytes_sent, n);
                    return;
                }
                Ok(Err(e)) => tracing::debug!(attempt, error = %e, "datagram send failed"),
                Err(_) => tracing::debug!(attempt, "datagram send timed out"),
            }
            if attempt < WRITE_ATTEMPTS {
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
        }

        HealthCounters::incr(&self.counters.write_failures);
        tracing::warn!(
            len = datagram.len(),
            "dropping datagram after {WRITE_ATTEMPTS} failed attempts"
        );
    }
}

async fn run_writer<S: DatagramSink>(
    writer: Writer<S>,
    mut queue: mpsc::Receiver<NetworkFrame>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = stop_requested(&mut stop) => break,
            maybe = queue.recv() => {
                let Some(frame) = maybe else {
                    break;
                };
                writer.write(&frame).await;
            }
        }
    }

    // Flush what was queued before stop, e.g. a final landing command, within
    // a single write deadline
    let flush = async {
        while let Ok(frame) = queue.try_recv() {
            writer.write(&frame).await;
        }
    };
    if tokio::time::timeout(writer.write_timeout, flush).await.is_err() {
        tracing::warn!("flush deadline passed, dropping queued frames");
    }
    tracing::debug!("writer stopped");
}

async fn run_reader(
    socket: UdpSocket,
    mut dispatcher: Dispatcher,
    mut stop: watch::Receiver<bool>,
    read_timeout: Duration,
) {
    let counters = Arc::clone(&dispatcher.counters);
    let mut buf = vec![0u8; UDP_RECV_BUF_SIZE];

    loop {
        tokio::select! {
            recv = tokio::time::timeout(read_timeout, socket.recv_from(&mut buf)) => {
                match recv {
                    Ok(Ok((n, _peer))) => {
                        HealthCounters::incr(&counters.datagrams_received);
                        HealthCounters::add(&counters.bytes_received, n);
                        dispatcher.dispatch_datagram(&buf[..n]);
                    }
                    Ok(Err(e)) => {
                        tracing::warn!(error = %e, "receive failed");
                        tokio::time::sleep(RECV_ERROR_BACKOFF).await;
                    }
                    Err(_) => {
                        HealthCounters::incr(&counters.read_timeouts);
                        tracing::debug!("no datagram from device within {read_timeout:?}");
                    }
                }
            }
            _ = stop_requested(&mut stop) => break,
        }
    }
    tracing::debug!("reader stopped");
}

async fn run_heartbeat(
    commands: Arc<CommandState>,
    outbox: Outbox,
    mut stop: watch::Receiver<bool>,
    delay: Duration,
    interval: Duration,
) {
    tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        _ = stop_requested(&mut stop) => return,
    }

    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = tick.tick() => {
                let payload = commands.snapshot().encode();
                outbox.offer(NetworkFrame::unsequenced(
                    FrameType::Data,
                    channel::COMMAND_NONACK,
                    payload,
                ));
            }
            _ = stop_requested(&mut stop) => break,
        }
    }
    tracing::debug!("heartbeat stopped");
}
