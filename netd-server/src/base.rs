//! Ready-made line-oriented provider.
//!
//! [`BaseProvider`] owns an accepted stream and runs two tasks over it: a
//! writer fed by a bounded queue and a reader that feeds a
//! [`MessageParser`] and hands each [`Message`] to a [`MessageHandler`].

use crate::config::Credential;
use crate::error::ProviderError;
use crate::info::BaseInfo;
use crate::parser::{LineParser, Message, MessageParser};
use crate::provider::{ClientAuth, CloseNotify, CloseSignal, ConnectionContext, Connections, Provider};
use crate::stats::Stat;
use crate::stream::NetStream;
use bytes::Bytes;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;

/// Maximum number of queued outbound messages per provider.
const OUTBOUND_QUEUE: usize = 1024;

/// Read buffer size for the reader task.
const READ_BUFFER: usize = 8192;

/// Callback for inbound messages.
pub trait MessageHandler: Send + Sync + 'static {
    fn on_message(&self, responder: &Responder, message: Message);
}

impl<F> MessageHandler for F
where
    F: Fn(&Responder, Message) + Send + Sync + 'static,
{
    fn on_message(&self, responder: &Responder, message: Message) {
        self(responder, message)
    }
}

/// Stream-owning provider with a queued writer and a parsing reader.
pub struct BaseProvider {
    info: BaseInfo,
    tx: mpsc::Sender<Bytes>,
    /// Requests both tasks to stop.
    stop: CloseSignal,
    /// Fired by the writer once the stream is shut down.
    done: CloseSignal,
    pending: AtomicUsize,
    max_payload: usize,
    max_pending: usize,
    credentials: Option<Credential>,
    stats: Arc<Stat>,
}

impl BaseProvider {
    /// Starts a provider with the default line parser and no credentials.
    pub fn new(ctx: ConnectionContext, handler: impl MessageHandler) -> Arc<Self> {
        let parser = LineParser::new(ctx.config.limits.max_payload);
        Self::with_parser(ctx, None, parser, handler)
    }

    /// Starts a provider that presents `credentials` to the auth gate.
    pub fn with_credentials(
        ctx: ConnectionContext,
        credentials: Credential,
        handler: impl MessageHandler,
    ) -> Arc<Self> {
        let parser = LineParser::new(ctx.config.limits.max_payload);
        Self::with_parser(ctx, Some(credentials), parser, handler)
    }

    pub fn with_parser(
        ctx: ConnectionContext,
        credentials: Option<Credential>,
        parser: impl MessageParser + 'static,
        handler: impl MessageHandler,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let provider = Arc::new(Self {
            info: ctx.peer_info,
            tx,
            stop: CloseSignal::new(),
            done: CloseSignal::new(),
            pending: AtomicUsize::new(0),
            max_payload: ctx.config.limits.max_payload,
            max_pending: ctx.config.limits.max_pending,
            credentials,
            stats: ctx.stats,
        });

        let (reader, writer) = tokio::io::split(ctx.stream);
        let responder = Responder {
            provider: provider.clone(),
            connections: ctx.connections,
        };

        tokio::spawn(write_loop(provider.clone(), writer, rx));
        tokio::spawn(read_loop(
            responder,
            reader,
            Box::new(parser),
            Arc::new(handler),
        ));

        provider
    }

    /// Whether close was requested or the connection ended.
    pub fn is_closed(&self) -> bool {
        self.stop.is_fired()
    }

    /// Bytes queued but not yet written.
    pub fn pending_bytes(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

impl Provider for BaseProvider {
    fn send_message(&self, payload: &[u8]) -> Result<(), ProviderError> {
        if self.stop.is_fired() {
            return Err(ProviderError::Closed);
        }
        let size = payload.len();
        if size > self.max_payload {
            return Err(ProviderError::PayloadTooLarge {
                size,
                max: self.max_payload,
            });
        }
        if self.pending.fetch_add(size, Ordering::AcqRel) + size > self.max_pending {
            self.pending.fetch_sub(size, Ordering::AcqRel);
            return Err(ProviderError::Backpressure);
        }

        match self.tx.try_send(Bytes::copy_from_slice(payload)) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.pending.fetch_sub(size, Ordering::AcqRel);
                match e {
                    mpsc::error::TrySendError::Full(_) => Err(ProviderError::Backpressure),
                    mpsc::error::TrySendError::Closed(_) => Err(ProviderError::Closed),
                }
            }
        }
    }

    fn close(&self) -> Result<(), ProviderError> {
        self.stop.fire();
        Ok(())
    }

    fn close_notify(&self) -> CloseNotify {
        self.done.subscribe()
    }

    fn base_info(&self) -> BaseInfo {
        self.info.clone()
    }

    fn client_auth(&self) -> Option<&dyn ClientAuth> {
        self.credentials.as_ref().map(|c| c as &dyn ClientAuth)
    }
}

impl std::fmt::Debug for BaseProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BaseProvider")
            .field("peer", &self.info.socket_addr())
            .field("closed", &self.stop.is_fired())
            .field("pending", &self.pending_bytes())
            .finish()
    }
}

async fn write_loop(
    provider: Arc<BaseProvider>,
    mut writer: WriteHalf<NetStream>,
    mut rx: mpsc::Receiver<Bytes>,
) {
    let addr = provider.info.socket_addr();
    let stop = provider.stop.subscribe();

    loop {
        let payload = tokio::select! {
            biased;
            payload = rx.recv() => match payload {
                Some(payload) => payload,
                None => break,
            },
            _ = stop.clone().closed() => break,
        };

        if let Err(e) = write_one(&provider, &mut writer, payload).await {
            tracing::debug!("[{}] Write failed: {}", addr, e);
            provider.stop.fire();
            break;
        }
    }

    // Deliver whatever was queued before the stop
    rx.close();
    while let Ok(payload) = rx.try_recv() {
        if write_one(&provider, &mut writer, payload).await.is_err() {
            break;
        }
    }

    let _ = tokio::time::timeout(crate::DEFAULT_FLUSH_DEADLINE, writer.shutdown()).await;
    provider.done.fire();
    tracing::debug!("[{}] Provider closed", addr);
}

async fn write_one(
    provider: &BaseProvider,
    writer: &mut WriteHalf<NetStream>,
    payload: Bytes,
) -> io::Result<()> {
    let size = payload.len();
    let result = tokio::time::timeout(crate::DEFAULT_FLUSH_DEADLINE, async {
        writer.write_all(&payload).await?;
        writer.flush().await
    })
    .await;
    provider.pending.fetch_sub(size, Ordering::AcqRel);

    match result {
        Ok(Ok(())) => {
            provider.stats.increment_out_msg();
            provider.stats.increment_writes(size);
            Ok(())
        }
        Ok(Err(e)) => Err(e),
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "write deadline exceeded")),
    }
}

async fn read_loop(
    responder: Responder,
    mut reader: ReadHalf<NetStream>,
    mut parser: Box<dyn MessageParser>,
    handler: Arc<dyn MessageHandler>,
) {
    let provider = responder.provider.clone();
    let addr = provider.info.socket_addr();
    let stop = provider.stop.subscribe();
    let mut buf = vec![0u8; READ_BUFFER];

    // Lines prefilled into the parser are handled before the first read
    if deliver(&responder, parser.as_mut(), handler.as_ref(), &[]) {
        loop {
            let n = tokio::select! {
                result = reader.read(&mut buf) => match result {
                    Ok(0) => {
                        tracing::debug!("[{}] Connection closed by peer", addr);
                        break;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        tracing::debug!("[{}] Read failed: {}", addr, e);
                        break;
                    }
                },
                _ = stop.clone().closed() => break,
            };

            provider.stats.increment_reads(n);
            if !deliver(&responder, parser.as_mut(), handler.as_ref(), &buf[..n]) {
                break;
            }
        }
    }

    provider.stop.fire();
}

/// Parses `chunk` and hands every complete message to `handler`. Returns
/// false after a parse error, which has already been reported to the peer.
fn deliver(
    responder: &Responder,
    parser: &mut dyn MessageParser,
    handler: &dyn MessageHandler,
    chunk: &[u8],
) -> bool {
    let provider = &responder.provider;
    match parser.parse(chunk) {
        Ok(messages) => {
            for message in messages {
                provider.stats.increment_in_msg();
                provider.stats.increment_request();
                handler.on_message(responder, message);
            }
            true
        }
        Err(e) => {
            tracing::warn!("[{}] {}", provider.info.socket_addr(), e);
            let _ = provider.send_message(format!("Error: {}\n", e).as_bytes());
            false
        }
    }
}

/// Handle given to a [`MessageHandler`] for the connection it serves.
#[derive(Clone)]
pub struct Responder {
    provider: Arc<BaseProvider>,
    connections: Connections,
}

impl Responder {
    /// Queues `payload` for this peer.
    pub fn reply(&self, payload: impl AsRef<[u8]>) -> Result<(), ProviderError> {
        self.provider.send_message(payload.as_ref())
    }

    /// Registries and broadcast of the owning server.
    pub fn connections(&self) -> &Connections {
        &self.connections
    }

    pub fn provider(&self) -> &Arc<BaseProvider> {
        &self.provider
    }

    pub fn peer(&self) -> &BaseInfo {
        &self.provider.info
    }

    pub fn close(&self) {
        self.provider.stop.fire();
    }
}

/// Reads one `\n`-terminated line directly from `stream`.
///
/// Reads a byte at a time so nothing past the delimiter is consumed; meant
/// for a short handshake line before a provider takes over the stream.
/// Returns `None` on EOF before any byte arrived.
pub async fn read_control_line(stream: &mut NetStream, limit: usize) -> io::Result<Option<String>> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];

    loop {
        if stream.read(&mut byte).await? == 0 {
            if line.is_empty() {
                return Ok(None);
            }
            break;
        }
        if byte[0] == b'\n' {
            break;
        }
        if line.len() >= limit {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("control line exceeds {} bytes", limit),
            ));
        }
        line.push(byte[0]);
    }

    if line.last() == Some(&b'\r') {
        line.pop();
    }
    String::from_utf8(line)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
