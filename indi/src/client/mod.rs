//! The client side: one supervised connection to a hub, with framed input
//! routed to watches, BLOB callbacks and a raw byte relay.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use indi_common::{
    Kind, SwitchState,
    blob::{BlobExtractor, BlobPayload, BlobSink},
    framer::Framer,
    message,
    xml::XmlElement,
};
use tokio::sync::broadcast;

use crate::{Connection, ConnectionConfig, ConnectionHandle, Inbound, Result};

mod router;

pub use self::router::{Router, WatchFn, WatchId};

const RAW_CAPACITY: usize = 1024;

type BlobFn = Box<dyn FnMut(&BlobPayload) + Send>;

#[derive(Default)]
struct BlobStore {
    last: Option<BlobPayload>,
    callback: Option<BlobFn>,
}

impl BlobSink for BlobStore {
    fn blob(&mut self, payload: BlobPayload) {
        tracing::debug!(
            vector = ?payload.vector,
            name = %payload.name,
            format = %payload.format,
            len = payload.data.len(),
            "received BLOB"
        );

        if let Some(cb) = &mut self.callback {
            cb(&payload);
        }
        self.last = Some(payload);
    }
}

struct State {
    framer: Framer,
    router: Router,
    blobs: BlobExtractor<BlobStore>,
}

/// Shared between the [`Client`] and the connection task
#[derive(Clone)]
struct Shared {
    state: Arc<Mutex<State>>,
    /// `getProperties` requests to replay on every new stream
    requests: Arc<Mutex<Vec<XmlElement>>>,
    raw: broadcast::Sender<Bytes>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn requests(&self) -> MutexGuard<'_, Vec<XmlElement>> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Inbound for Shared {
    fn connected(&mut self, handle: &ConnectionHandle) {
        {
            let mut state = self.state();
            state.framer.reset();
            state.router.reset();
            state.blobs.reset();
        }

        for request in self.requests().iter() {
            if let Err(err) = handle.send_element(request) {
                tracing::warn!(%err, "replaying getProperties");
            }
        }
    }

    fn received(&mut self, bytes: &[u8]) {
        if self.raw.receiver_count() > 0 {
            let _ = self.raw.send(Bytes::copy_from_slice(bytes));
        }

        let mut state = self.state();
        let State { framer, router, blobs } = &mut *state;
        framer.feed(bytes, &mut (router, blobs));
    }
}

/// A connection to a hub.
///
/// Callbacks run on the connection task while the client's state is locked:
/// they must not call back into the [`Client`] that invoked them.
pub struct Client {
    handle: ConnectionHandle,
    shared: Shared,
}

impl Client {
    /// Spawns the connection onto the current runtime. The client keeps
    /// reconnecting until [`shutdown`](Self::shutdown).
    pub fn connect(host: impl Into<String>, port: u16, config: ConnectionConfig) -> Self {
        let shared = Shared {
            state: Arc::new(Mutex::new(State {
                framer: Framer::new(config.max_message_bytes),
                router: Router::new(),
                blobs: BlobExtractor::new(BlobStore::default()),
            })),
            requests: Arc::new(Mutex::new(Vec::new())),
            raw: broadcast::Sender::new(RAW_CAPACITY),
        };

        let connection = Connection::new(host, port, config);
        let handle = connection.handle();
        tokio::spawn(connection.run(shared.clone()));

        Self { handle, shared }
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    pub fn is_connected(&self) -> bool {
        self.handle.is_connected()
    }

    pub async fn wait_connected(&self) {
        self.handle.wait_connected().await
    }

    pub fn shutdown(&self) {
        self.handle.shutdown();
    }

    /// Calls `callback` with every definition or update of `device.name`
    pub fn watch(
        &self,
        device: impl AsRef<str>,
        name: impl AsRef<str>,
        callback: impl FnMut(&XmlElement) + Send + 'static,
    ) -> WatchId {
        self.shared.state().router.watch(device, name, callback)
    }

    pub fn watch_all(
        &self,
        device: impl AsRef<str>,
        callback: impl FnMut(&XmlElement) + Send + 'static,
    ) -> WatchId {
        self.shared.state().router.watch_all(device, callback)
    }

    pub fn unwatch(&self, id: WatchId) -> bool {
        self.shared.state().router.unwatch(id)
    }

    pub fn on_new_device(&self, callback: impl FnMut(&str) + Send + 'static) {
        self.shared.state().router.on_new_device(callback);
    }

    pub fn on_new_group(&self, callback: impl FnMut(&str, &str) + Send + 'static) {
        self.shared.state().router.on_new_group(callback);
    }

    pub fn on_message(&self, callback: impl FnMut(&XmlElement) + Send + 'static) {
        self.shared.state().router.on_message(callback);
    }

    pub fn on_blob(&self, callback: impl FnMut(&BlobPayload) + Send + 'static) {
        self.shared.state().blobs.sink().callback = Some(Box::new(callback));
    }

    pub fn last_blob(&self) -> Option<BlobPayload> {
        self.shared.state().blobs.sink().last.clone()
    }

    pub fn devices(&self) -> Vec<String> {
        self.shared.state().router.devices().map(str::to_owned).collect()
    }

    pub fn groups(&self, device: &str) -> Vec<String> {
        self.shared.state().router.groups(device).map(str::to_owned).collect()
    }

    /// Every chunk read from the hub, verbatim
    pub fn subscribe_raw(&self) -> broadcast::Receiver<Bytes> {
        self.shared.raw.subscribe()
    }

    /// Forwards bytes to the hub as they are
    pub fn send_raw(&self, bytes: impl Into<Bytes>) -> Result<()> {
        self.handle.send(bytes)
    }

    /// Asks for definitions, optionally of one device or one vector. The
    /// request is sent again after every reconnect.
    pub fn get_properties(&self, device: Option<&str>, name: Option<&str>) -> Result<()> {
        let request = message::get_properties(device, name);

        {
            let mut requests = self.shared.requests();
            if !requests.contains(&request) {
                requests.push(request.clone());
            }
        }

        if !self.is_connected() {
            tracing::debug!(addr = self.handle.addr(), "getProperties queued for connect");
            return Ok(());
        }

        self.handle.send_element(&request)
    }

    pub fn new_number(&self, device: &str, name: &str, values: &[(&str, f64)]) -> Result<()> {
        let values = values.iter().map(|(n, v)| (*n, v.to_string()));
        self.handle.send_element(&message::new_vector(Kind::Number, device, name, values)?)
    }

    pub fn new_text(&self, device: &str, name: &str, values: &[(&str, &str)]) -> Result<()> {
        let values = values.iter().map(|(n, v)| (*n, (*v).to_owned()));
        self.handle.send_element(&message::new_vector(Kind::Text, device, name, values)?)
    }

    pub fn new_switch(&self, device: &str, name: &str, values: &[(&str, SwitchState)]) -> Result<()> {
        let values = values.iter().map(|(n, v)| (*n, v.to_string()));
        self.handle.send_element(&message::new_vector(Kind::Switch, device, name, values)?)
    }
}
