use std::sync::Arc;

use bytes::Bytes;
use indi_common::xml::XmlElement;
use tokio::{
    io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _},
    net::TcpStream,
    sync::{
        mpsc::{UnboundedReceiver, UnboundedSender},
        watch,
    },
    time,
};

use crate::{ConnectionConfig, Error, Result};

/// Receives what arrives on a connection. Called from the connection's own
/// task, one call at a time.
pub trait Inbound: Send {
    /// A stream was established. Messages sent through `handle` from here go
    /// out before anything else.
    fn connected(&mut self, _handle: &ConnectionHandle) {}

    fn received(&mut self, bytes: &[u8]);

    fn disconnected(&mut self) {}
}

pub(crate) struct Shared {
    addr: String,
    connected: watch::Sender<bool>,
    shutdown: watch::Sender<bool>,
}

/// Cheap handle for queueing outbound messages and observing a connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    tx: UnboundedSender<Bytes>,
    pub(crate) shared: Arc<Shared>,
}

impl ConnectionHandle {
    /// A handle whose queue is drained by whoever holds the receiver
    pub(crate) fn detached(addr: impl Into<String>) -> (Self, UnboundedReceiver<Bytes>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let shared = Shared {
            addr: addr.into(),
            connected: watch::Sender::new(false),
            shutdown: watch::Sender::new(false),
        };
        (Self { tx, shared: Arc::new(shared) }, rx)
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.shared.connected.send_replace(connected);
    }

    pub fn addr(&self) -> &str {
        &self.shared.addr
    }

    pub fn is_connected(&self) -> bool {
        *self.shared.connected.borrow()
    }

    /// Resolves once a stream is established (immediately if it already is)
    pub async fn wait_connected(&self) {
        let mut rx = self.shared.connected.subscribe();
        let _ = rx.wait_for(|connected| *connected).await;
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shared.shutdown.borrow()
    }

    /// Queues raw bytes. Fails without queueing when no stream is up.
    pub fn send(&self, bytes: impl Into<Bytes>) -> Result<()> {
        if !self.is_connected() {
            tracing::warn!(addr = %self.shared.addr, "dropping outbound message: not connected");
            return Err(Error::NotConnected);
        }

        self.tx.send(bytes.into()).map_err(|_| Error::Closed)
    }

    pub fn send_element(&self, element: &XmlElement) -> Result<()> {
        tracing::debug!(addr = %self.shared.addr, tag = %element.tag, "sending");
        self.send(element.to_wire())
    }

    /// Stops the connection for good, closing the current stream
    pub fn shutdown(&self) {
        self.shared.shutdown.send_replace(true);
    }
}

/// A supervised TCP connection: connects, pumps bytes both ways until the
/// stream fails, waits out the backoff and connects again, until shut down.
pub struct Connection {
    host: String,
    port: u16,
    config: ConnectionConfig,
    handle: ConnectionHandle,
    rx: UnboundedReceiver<Bytes>,
}

impl Connection {
    pub fn new(host: impl Into<String>, port: u16, config: ConnectionConfig) -> Self {
        let host = host.into();
        let (handle, rx) = ConnectionHandle::detached(format!("{host}:{port}"));
        Self { host, port, config, handle, rx }
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// One connection attempt, bounded by the connect timeout
    pub async fn connect(&self) -> Result<TcpStream> {
        let addr = self.handle.addr();

        let stream = match time::timeout(
            self.config.connect_timeout,
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        {
            Err(_) => return Err(Error::Timeout(addr.to_owned())),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                return Err(Error::Refused(addr.to_owned()));
            }
            Ok(result) => result?,
        };

        stream.set_nodelay(true)?;
        Ok(stream)
    }

    /// Runs the supervising loop until [`ConnectionHandle::shutdown`].
    pub async fn run(mut self, mut inbound: impl Inbound) {
        let shared = self.handle.shared.clone();
        let mut stop = shared.shutdown.subscribe();

        while !*stop.borrow() {
            match self.connect().await {
                Ok(stream) => {
                    tracing::info!(addr = %shared.addr, "connected");

                    // anything queued for the previous stream is stale
                    while self.rx.try_recv().is_ok() {}

                    self.handle.set_connected(true);
                    inbound.connected(&self.handle);

                    let (reader, writer) = stream.into_split();
                    let result =
                        pump(reader, writer, &mut self.rx, &mut inbound, &self.config, &shared)
                            .await;

                    self.handle.set_connected(false);
                    inbound.disconnected();

                    match result {
                        Ok(()) => tracing::info!(addr = %shared.addr, "disconnected"),
                        Err(err) => tracing::warn!(addr = %shared.addr, %err, "connection lost"),
                    }
                }
                Err(err) => tracing::warn!(addr = %shared.addr, %err, "connect failed"),
            }

            tokio::select! {
                _ = time::sleep(self.config.reconnect_backoff) => {}
                _ = stop.wait_for(|stop| *stop) => break,
            }
        }

        tracing::info!(addr = %shared.addr, "connection shut down");
    }
}

/// Moves bytes between one stream and the outbound queue until either side
/// fails, the peer closes, or shutdown is requested (`Ok`).
pub(crate) async fn pump<R, W>(
    mut reader: R,
    mut writer: W,
    rx: &mut UnboundedReceiver<Bytes>,
    inbound: &mut impl Inbound,
    config: &ConnectionConfig,
    shared: &Shared,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut stop = shared.shutdown.subscribe();

    let result = tokio::select! {
        result = read_loop(&mut reader, inbound, config) => result,
        result = write_loop(&mut writer, rx, config, shared.shutdown.subscribe()) => result,
        _ = stop.wait_for(|stop| *stop) => Ok(()),
    };

    if let Err(err) = writer.shutdown().await {
        tracing::debug!(%err, "closing writer");
    }

    result
}

async fn read_loop<R: AsyncRead + Unpin>(
    reader: &mut R,
    inbound: &mut impl Inbound,
    config: &ConnectionConfig,
) -> Result<()> {
    let mut buf = vec![0; config.read_width];

    loop {
        let n = match config.idle_timeout {
            Some(idle) => time::timeout(idle, reader.read(&mut buf))
                .await
                .map_err(|_| Error::Idle(idle))??,
            None => reader.read(&mut buf).await?,
        };

        if n == 0 {
            return Err(Error::Eof);
        }

        tracing::trace!(len = n, "read");
        inbound.received(&buf[..n]);
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(
    writer: &mut W,
    rx: &mut UnboundedReceiver<Bytes>,
    config: &ConnectionConfig,
    stop: watch::Receiver<bool>,
) -> Result<()> {
    loop {
        match time::timeout(config.write_poll, rx.recv()).await {
            // an empty queue is only a chance to look at the stop flag
            Err(_) => {
                if *stop.borrow() {
                    return Ok(());
                }
            }
            Ok(None) => return Err(Error::Closed),
            Ok(Some(bytes)) => {
                writer.write_all(&bytes).await?;
                writer.flush().await?;
            }
        }
    }
}
