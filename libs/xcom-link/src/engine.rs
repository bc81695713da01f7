//! Engine task
//!
//! One task owns the write half of the socket and the pending table. Callers
//! talk to it through a command channel; a separate reader task feeds it
//! reassembled frames. Deadlines are driven by a timer branch of the same
//! select loop, so a silent peer never stalls timeout handling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, error, info, trace, warn};
use xcom_protocol::{
    DeviceMessage, Frame, FrameBuffer, FrameType, Inbound, Result, XcomError, XcomMessageSet,
};

use crate::config::DuplicatePolicy;
use crate::diagnostics::LinkDiagnostics;
use crate::transaction::{
    Admission, Expiry, MatchKey, PendingTable, PendingTransaction, TransactionId,
    TransactionState,
};

const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const INBOUND_QUEUE: usize = 64;

/// Requests from link handles to the engine
#[derive(Debug)]
pub(crate) enum Command {
    Submit {
        id: TransactionId,
        request: Frame,
        timeout: Duration,
        retries: u32,
        reply: oneshot::Sender<Result<Frame>>,
    },
    Cancel(TransactionId),
    Diagnostics(oneshot::Sender<LinkDiagnostics>),
    Shutdown(oneshot::Sender<()>),
}

/// Output of the reader task
#[derive(Debug)]
enum ReaderEvent {
    Items(Vec<Inbound>),
    Closed(Option<String>),
}

/// Handles returned by [`spawn`]
pub(crate) struct EngineHandle {
    pub commands: mpsc::UnboundedSender<Command>,
    pub connected: Arc<AtomicBool>,
    pub task: JoinHandle<()>,
}

/// Start reader and engine tasks on an open stream
pub(crate) fn spawn(
    stream: TcpStream,
    policy: DuplicatePolicy,
    read_buffer_size: usize,
    unsolicited: broadcast::Sender<Frame>,
    messages: Option<Arc<XcomMessageSet>>,
) -> EngineHandle {
    let (read_half, write_half) = stream.into_split();
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
    let connected = Arc::new(AtomicBool::new(true));

    let reader = tokio::spawn(read_loop(read_half, inbound_tx, read_buffer_size));

    let engine = Engine {
        writer: write_half,
        commands: commands_rx,
        inbound: inbound_rx,
        table: PendingTable::new(policy),
        diagnostics: LinkDiagnostics::default(),
        unsolicited,
        messages,
        connected: connected.clone(),
        broken: false,
    };
    let task = tokio::spawn(engine.run(reader));

    EngineHandle {
        commands: commands_tx,
        connected,
        task,
    }
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    events: mpsc::Sender<ReaderEvent>,
    buffer_size: usize,
) {
    let mut buf = vec![0u8; buffer_size];
    let mut frames = FrameBuffer::with_capacity(buffer_size * 2);

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                info!("Gateway closed the connection");
                let _ = events.send(ReaderEvent::Closed(None)).await;
                return;
            },
            Ok(n) => {
                debug!("RX {}B: {}", n, hex::encode(&buf[..n]));
                let items = frames.push(&buf[..n]);
                if !items.is_empty() && events.send(ReaderEvent::Items(items)).await.is_err() {
                    return;
                }
            },
            Err(e) => {
                error!("RX err: {}", e);
                let _ = events.send(ReaderEvent::Closed(Some(e.to_string()))).await;
                return;
            },
        }
    }
}

struct Engine {
    writer: OwnedWriteHalf,
    commands: mpsc::UnboundedReceiver<Command>,
    inbound: mpsc::Receiver<ReaderEvent>,
    table: PendingTable,
    diagnostics: LinkDiagnostics,
    unsolicited: broadcast::Sender<Frame>,
    messages: Option<Arc<XcomMessageSet>>,
    connected: Arc<AtomicBool>,
    /// Set when a write failed; the loop exits after the current step
    broken: bool,
}

impl Engine {
    async fn run(mut self, reader: JoinHandle<()>) {
        let mut shutdown_ack = None;

        loop {
            let deadline = self.table.next_deadline();

            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Shutdown(ack)) => {
                        shutdown_ack = Some(ack);
                        break;
                    },
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        debug!("All link handles dropped");
                        break;
                    },
                },
                event = self.inbound.recv() => match event {
                    Some(ReaderEvent::Items(items)) => {
                        for item in items {
                            self.handle_inbound(item).await;
                        }
                    },
                    Some(ReaderEvent::Closed(reason)) => {
                        warn!("Connection lost: {}", reason.as_deref().unwrap_or("closed by peer"));
                        self.broken = true;
                    },
                    None => self.broken = true,
                },
                _ = sleep_until(deadline.unwrap_or_else(far_future)), if deadline.is_some() => {
                    self.handle_deadlines().await;
                },
            }

            if self.broken {
                break;
            }
        }

        self.connected.store(false, Ordering::SeqCst);
        let state = if shutdown_ack.is_some() {
            TransactionState::Cancelled
        } else {
            TransactionState::Failed
        };
        self.fail_all(state);

        reader.abort();
        if let Err(e) = self.writer.shutdown().await {
            trace!("Shutdown: {}", e);
        }
        // anyone still sending commands gets ConnectionClosed from here on
        self.commands.close();
        while let Ok(cmd) = self.commands.try_recv() {
            self.reject_late(cmd);
        }

        info!("Link engine stopped");
        if let Some(ack) = shutdown_ack {
            let _ = ack.send(());
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Submit {
                id,
                request,
                timeout,
                retries,
                reply,
            } => {
                let encoded = match request.encode() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = reply.send(Err(e));
                        return;
                    },
                };
                let tx = PendingTransaction::new(id, request, encoded, timeout, retries, reply);
                match self.table.submit(tx) {
                    Admission::Active(key) => self.transmit(&key).await,
                    Admission::Queued => debug!("Queued #{} behind active request", id),
                    Admission::Rejected(tx) => {
                        debug!("Rejected duplicate #{} for {}", id, tx.key);
                        let msg = tx.key.to_string();
                        tx.complete(Err(XcomError::DuplicateRequest(msg)));
                    },
                }
            },
            Command::Cancel(id) => {
                if let Some((tx, promoted)) = self.table.cancel(id) {
                    debug!("Cancelled #{} ({})", id, tx.key);
                    self.diagnostics
                        .record(TransactionState::Cancelled, tx.attempts, tx.elapsed());
                    if let Some(key) = promoted {
                        self.transmit(&key).await;
                    }
                }
            },
            Command::Diagnostics(reply) => {
                let _ = reply.send(self.diagnostics.clone());
            },
            // handled by the select loop
            Command::Shutdown(_) => {},
        }
    }

    async fn transmit(&mut self, key: &MatchKey) {
        let Some((id, attempt, bytes)) = self.table.arm(key, Instant::now()) else {
            return;
        };
        debug!("TX #{} {} try {}: {}", id, key, attempt, hex::encode(&bytes));

        match timeout(WRITE_TIMEOUT, self.writer.write_all(&bytes)).await {
            Ok(Ok(())) => {},
            Ok(Err(e)) => {
                error!("TX err: {}", e);
                self.broken = true;
            },
            Err(_) => {
                error!("TX timeout");
                self.broken = true;
            },
        }
    }

    async fn handle_inbound(&mut self, item: Inbound) {
        match item {
            Inbound::Frame(frame) => self.handle_frame(frame).await,
            Inbound::Corrupt { header, error } => {
                if matches!(error, XcomError::Checksum { .. }) {
                    self.diagnostics.checksum_errors += 1;
                }
                warn!("Corrupt frame dropped: {}", error);

                let Some(header) = header.filter(|h| h.frame_type == FrameType::Response) else {
                    return;
                };
                // a damaged answer is as good as none; retry early if allowed
                let Some(key) = self.table.awaiting(&header) else {
                    return;
                };
                match self.table.expire(&key) {
                    Some(Expiry::Retransmit(key)) => {
                        warn!("Retry {} after corrupt response", key);
                        self.transmit(&key).await;
                    },
                    Some(Expiry::Exhausted { tx, promoted }) => {
                        self.finish(tx, TransactionState::Failed, Err(error));
                        if let Some(key) = promoted {
                            self.transmit(&key).await;
                        }
                    },
                    None => {},
                }
            },
        }
    }

    async fn handle_frame(&mut self, frame: Frame) {
        trace!("RX frame {}", frame);

        if frame.frame_type != FrameType::Response {
            self.publish_unsolicited(frame);
            return;
        }

        let Some(resolved) = self.table.resolve(&frame) else {
            self.publish_unsolicited(frame);
            return;
        };

        if resolved.ambiguous {
            self.diagnostics.ambiguous += 1;
            info!(
                "Ambiguous response {}, matched oldest #{}",
                frame, resolved.tx.id
            );
        }

        let (state, outcome) = match frame.error_code() {
            Some(code) => {
                debug!("#{} device error {}", resolved.tx.id, code);
                (TransactionState::Failed, Err(XcomError::Device(code)))
            },
            None => (TransactionState::Completed, Ok(frame)),
        };
        self.finish(resolved.tx, state, outcome);

        if let Some(key) = resolved.promoted {
            self.transmit(&key).await;
        }
    }

    fn publish_unsolicited(&mut self, frame: Frame) {
        self.diagnostics.unsolicited += 1;
        match DeviceMessage::from_frame(&frame) {
            Some(Ok(msg)) => match &self.messages {
                Some(set) => info!(
                    "Device message {} from {} ({} pending)",
                    msg.text(set),
                    msg.src,
                    msg.pending
                ),
                None => info!(
                    "Device message {} from {} ({} pending)",
                    msg.message_id, msg.src, msg.pending
                ),
            },
            Some(Err(e)) => warn!("Bad device message: {}", e),
            None => debug!("Unsolicited frame {}", frame),
        }
        // no subscribers is fine
        let _ = self.unsolicited.send(frame);
    }

    async fn handle_deadlines(&mut self) {
        let now = Instant::now();
        for key in self.table.expired(now) {
            match self.table.expire(&key) {
                Some(Expiry::Retransmit(key)) => {
                    warn!("Timeout {}, retrying", key);
                    self.transmit(&key).await;
                },
                Some(Expiry::Exhausted { tx, promoted }) => {
                    warn!("Timeout {} after {} attempts", tx.key, tx.attempts);
                    let msg = format!("{} after {} attempts", tx.key, tx.attempts);
                    self.finish(tx, TransactionState::TimedOut, Err(XcomError::RequestTimeout(msg)));
                    if let Some(key) = promoted {
                        self.transmit(&key).await;
                    }
                },
                None => {},
            }
            if self.broken {
                return;
            }
        }
    }

    fn finish(&mut self, tx: PendingTransaction, state: TransactionState, outcome: Result<Frame>) {
        self.diagnostics.record(state, tx.attempts, tx.elapsed());
        tx.complete(outcome);
    }

    fn fail_all(&mut self, state: TransactionState) {
        let pending = self.table.drain();
        if !pending.is_empty() {
            info!("Failing {} pending requests: connection closed", pending.len());
        }
        for tx in pending {
            self.finish(tx, state, Err(XcomError::ConnectionClosed));
        }
    }

    fn reject_late(&mut self, cmd: Command) {
        match cmd {
            Command::Submit { reply, .. } => {
                let _ = reply.send(Err(XcomError::ConnectionClosed));
            },
            Command::Diagnostics(reply) => {
                let _ = reply.send(self.diagnostics.clone());
            },
            Command::Shutdown(ack) => {
                let _ = ack.send(());
            },
            Command::Cancel(_) => {},
        }
    }
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86_400)
}
