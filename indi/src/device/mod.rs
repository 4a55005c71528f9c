//! The device side: a driver answers `getProperties` and `new*Vector`
//! requests arriving on stdin (or any stream) and pushes updates back out.

use compact_str::CompactString;
use indi_common::{
    PropertyKey, SwitchState,
    blob::{self, BlobPayload},
    framer::Framer,
    message::{MessageKind, NewValues},
    xml::{ElementCollector, XmlElement},
    Kind, ModelError,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc::{UnboundedReceiver, UnboundedSender},
    time::{self, Instant},
};

use crate::{ConnectionConfig, ConnectionHandle, Inbound, Result, connection::pump};

mod context;
mod timer;

pub use self::{
    context::{DeviceContext, HandlerFn, HandlerId, TimerFn},
    timer::TimerId,
};

/// Device behaviour. Every method runs on the dispatch loop, one at a time,
/// interleaved with timer callbacks.
#[allow(unused_variables)]
pub trait Driver: Send + Sized + 'static {
    /// Builds and registers the device's vectors. Runs before every
    /// `getProperties` is answered, so it should be idempotent.
    fn init_properties(&mut self, ctx: &mut DeviceContext<Self>) -> Result<()> {
        Ok(())
    }

    /// Answers `getProperties`; `name` is set when one vector was asked for
    fn get_properties(&mut self, ctx: &mut DeviceContext<Self>, name: Option<&str>) -> Result<()> {
        ctx.define_all(name)
    }

    fn new_number(
        &mut self,
        ctx: &mut DeviceContext<Self>,
        name: &str,
        values: &[(CompactString, f64)],
    ) -> Result<()> {
        ctx.set_numbers(name, values)
    }

    fn new_text(
        &mut self,
        ctx: &mut DeviceContext<Self>,
        name: &str,
        values: &[(CompactString, String)],
    ) -> Result<()> {
        ctx.set_texts(name, values)
    }

    fn new_switch(
        &mut self,
        ctx: &mut DeviceContext<Self>,
        name: &str,
        values: &[(CompactString, SwitchState)],
    ) -> Result<()> {
        ctx.set_switches(name, values)
    }

    fn new_blob(
        &mut self,
        ctx: &mut DeviceContext<Self>,
        name: &str,
        blobs: Vec<BlobPayload>,
    ) -> Result<()> {
        tracing::warn!(device = ctx.name(), name, count = blobs.len(), "ignoring BLOB upload");
        Ok(())
    }
}

pub struct Device<D> {
    name: CompactString,
    driver: D,
    config: ConnectionConfig,
    setup: Vec<Box<dyn FnOnce(&mut D, &mut DeviceContext<D>) -> Result<()> + Send>>,
}

impl<D: Driver> Device<D> {
    pub fn new(name: impl Into<CompactString>, driver: D) -> Self {
        Self { name: name.into(), driver, config: ConnectionConfig::default(), setup: Vec::new() }
    }

    pub fn with_config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Runs `f` against the context before the first message is read, to
    /// register timers and handlers.
    pub fn setup(
        mut self,
        f: impl FnOnce(&mut D, &mut DeviceContext<D>) -> Result<()> + Send + 'static,
    ) -> Self {
        self.setup.push(Box::new(f));
        self
    }

    /// Serves the protocol on stdin/stdout, as launched by a hub
    pub async fn run_stdio(self) -> Result<()> {
        self.run(tokio::io::stdin(), tokio::io::stdout()).await
    }

    /// Serves the protocol on any stream until the peer closes it
    pub async fn run<R, W>(self, reader: R, writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let Self { name, mut driver, config, setup } = self;

        let (conn, mut outbound) = ConnectionHandle::detached(format!("device {name}"));
        conn.set_connected(true);

        let (tx, mut inbox) = tokio::sync::mpsc::unbounded_channel();
        let mut forwarder = Forwarder {
            framer: Framer::new(config.max_message_bytes),
            collector: ElementCollector::default(),
            tx,
        };

        let io = tokio::spawn({
            let conn = conn.clone();
            async move {
                let result =
                    pump(reader, writer, &mut outbound, &mut forwarder, &config, &conn.shared).await;
                conn.set_connected(false);
                result
            }
        });

        let mut ctx = DeviceContext::new(&name, conn.clone());
        for f in setup {
            f(&mut driver, &mut ctx)?;
        }

        tracing::info!(device = %name, "dispatch loop started");
        dispatch_loop(&mut driver, &mut ctx, &mut inbox).await;
        tracing::info!(device = %name, "dispatch loop finished");

        conn.shutdown();
        match io.await {
            Ok(Ok(())) | Ok(Err(crate::Error::Eof)) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(join) => Err(crate::Error::Io(std::io::Error::other(join))),
        }
    }
}

struct Forwarder {
    framer: Framer,
    collector: ElementCollector,
    tx: UnboundedSender<XmlElement>,
}

impl Inbound for Forwarder {
    fn received(&mut self, bytes: &[u8]) {
        self.framer.feed(bytes, &mut self.collector);
        for element in self.collector.take() {
            let _ = self.tx.send(element);
        }
    }
}

/// Single queue of work: inbound messages and timer fires, handled one at a
/// time so nothing else touches the context concurrently.
async fn dispatch_loop<D: Driver>(
    driver: &mut D,
    ctx: &mut DeviceContext<D>,
    inbox: &mut UnboundedReceiver<XmlElement>,
) {
    loop {
        let deadline = ctx.timers.next_deadline();

        tokio::select! {
            biased;

            element = inbox.recv() => match element {
                Some(element) => {
                    // overdue timers go first so a busy inbox can't starve them
                    fire_timers(driver, ctx);
                    dispatch(driver, ctx, &element);
                }
                None => break,
            },
            _ = time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                fire_timers(driver, ctx);
            }
        }
    }
}

fn fire_timers<D: Driver>(driver: &mut D, ctx: &mut DeviceContext<D>) {
    let now = Instant::now();

    while let Some((id, mut callback)) = ctx.timers.pop_due(now) {
        if let Err(err) = callback(driver, ctx) {
            tracing::error!(device = ctx.name(), ?id, %err, "timer failed");
        }
        ctx.timers.restore(id, callback, Instant::now());
    }
}

pub(crate) fn dispatch<D: Driver>(driver: &mut D, ctx: &mut DeviceContext<D>, el: &XmlElement) {
    let kind = MessageKind::classify(&el.tag);

    let result = match kind {
        MessageKind::GetProperties => get_properties(driver, ctx, el),
        MessageKind::New(_) => new_values(driver, ctx, el),
        _ => {
            tracing::trace!(tag = %el.tag, "ignoring");
            return;
        }
    };

    if let Err(err) = result {
        let name = el.attribute("name").unwrap_or_default();
        tracing::error!(device = ctx.name(), name, tag = %el.tag, %err, "request failed");

        // the peer sees the failure as a device message
        let _ = ctx.message(&format!("{name}: {err}"));
    }
}

fn get_properties<D: Driver>(
    driver: &mut D,
    ctx: &mut DeviceContext<D>,
    el: &XmlElement,
) -> Result<()> {
    if let Some(device) = el.attribute("device").filter(|d| !d.is_empty())
        && device != ctx.name()
    {
        return Ok(());
    }

    driver.init_properties(ctx)?;
    driver.get_properties(ctx, el.attribute("name"))?;

    if !ctx.timers.is_armed() {
        tracing::debug!(device = ctx.name(), "starting timers");
        ctx.timers.arm(Instant::now());
    }

    Ok(())
}

fn new_values<D: Driver>(driver: &mut D, ctx: &mut DeviceContext<D>, el: &XmlElement) -> Result<()> {
    let request = NewValues::from_element(el)?;
    if request.device != ctx.name() {
        return Ok(());
    }

    let name = request.name.as_str();
    let vector = ctx.find(name)?;
    if !vector.perm().is_writable() {
        return Err(ModelError::ReadOnly(vector.key().to_string()).into());
    }
    if vector.kind() != request.kind {
        return Err(ModelError::UnexpectedTag {
            expected: vector.kind().new_vector_tag(),
            found: el.tag.to_string(),
        }
        .into());
    }

    tracing::debug!(device = ctx.name(), name, values = request.values.len(), "new values");

    if let Some((id, mut handler)) = ctx.take_handler(name) {
        let result = handler(driver, ctx, &request);
        ctx.restore_handler(name, id, handler);
        return result;
    }

    match request.kind {
        Kind::Number => driver.new_number(ctx, name, &request.numbers()?),
        Kind::Text => driver.new_text(ctx, name, &request.texts()),
        Kind::Switch => driver.new_switch(ctx, name, &request.switches()?),
        Kind::Blob => {
            let key = PropertyKey::new(ctx.name(), name);
            let blobs = uploaded_blobs(el, key)?;
            driver.new_blob(ctx, name, blobs)
        }
        Kind::Light => Err(ModelError::Schema(el.tag.to_string()).into()),
    }
}

fn uploaded_blobs(el: &XmlElement, key: PropertyKey) -> Result<Vec<BlobPayload>> {
    let one = Kind::Blob.one_element_tag();

    el.children
        .iter()
        .filter(|c| c.tag == one)
        .map(|c| -> Result<BlobPayload> {
            let name = c.require("name")?;
            let format = c.attribute("format").unwrap_or_default();
            let size = c
                .attribute("size")
                .map(|s| s.trim().parse::<usize>().map_err(|_| ModelError::value("size", s)))
                .transpose()?;

            let data = blob::decode(&c.text)?;
            blob::check_size(name, format, size, data.len())?;

            Ok(BlobPayload {
                vector: Some(key.clone()),
                name: name.into(),
                format: format.into(),
                size,
                attributes: c.attributes.clone(),
                data,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use indi_common::{Number, NumberVector, Switch, SwitchVector};

    use super::*;

    #[derive(Default)]
    struct Dome {
        inits: usize,
        uploads: Vec<BlobPayload>,
    }

    impl Driver for Dome {
        fn init_properties(&mut self, ctx: &mut DeviceContext<Self>) -> Result<()> {
            self.inits += 1;
            ctx.register(
                NumberVector::new("dome", "AZIMUTH", vec![Number::new("AZ", 0.0)])?
                    .with_group("Main"),
            );
            ctx.register(SwitchVector::new("dome", "SHUTTER", vec![
                Switch::new("OPEN", SwitchState::Off),
                Switch::new("CLOSE", SwitchState::On),
            ])?);
            ctx.register(
                NumberVector::new("dome", "TEMPERATURE", vec![Number::new("T", 11.0)])?
                    .with_perm(indi_common::Permission::ReadOnly),
            );
            ctx.register(indi_common::BlobVector::new("dome", "UPLOAD", vec![
                indi_common::Blob::new("FILE", ""),
            ])?);
            Ok(())
        }

        fn new_blob(
            &mut self,
            _ctx: &mut DeviceContext<Self>,
            _name: &str,
            blobs: Vec<BlobPayload>,
        ) -> Result<()> {
            self.uploads.extend(blobs);
            Ok(())
        }
    }

    fn context() -> (DeviceContext<Dome>, UnboundedReceiver<bytes::Bytes>) {
        let (conn, rx) = ConnectionHandle::detached("test");
        conn.set_connected(true);
        (DeviceContext::new("dome", conn), rx)
    }

    fn sent(rx: &mut UnboundedReceiver<bytes::Bytes>) -> Vec<XmlElement> {
        let mut out = Vec::new();
        while let Ok(bytes) = rx.try_recv() {
            out.extend(XmlElement::parse_all(&bytes).unwrap());
        }
        out
    }

    fn run(driver: &mut Dome, ctx: &mut DeviceContext<Dome>, xml: &str) {
        dispatch(driver, ctx, &XmlElement::parse(xml.as_bytes()).unwrap());
    }

    #[tokio::test]
    async fn get_properties_scoping() {
        let (mut ctx, mut rx) = context();
        let mut dome = Dome::default();

        run(&mut dome, &mut ctx, "<getProperties version='1.7' device='mount'/>");
        assert_eq!(dome.inits, 0);
        assert!(sent(&mut rx).is_empty());

        run(&mut dome, &mut ctx, "<getProperties version='1.7'/>");
        assert_eq!(dome.inits, 1);
        assert_eq!(sent(&mut rx).len(), 4);
        assert!(ctx.timers.is_armed());

        run(&mut dome, &mut ctx, "<getProperties version='1.7' device='dome' name='SHUTTER'/>");
        assert_eq!(dome.inits, 2);
        let out = sent(&mut rx);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].tag, "defSwitchVector");
    }

    #[tokio::test]
    async fn new_values_reach_the_model() {
        let (mut ctx, mut rx) = context();
        let mut dome = Dome::default();
        run(&mut dome, &mut ctx, "<getProperties/>");
        sent(&mut rx);

        run(
            &mut dome,
            &mut ctx,
            "<newSwitchVector device='dome' name='SHUTTER'><oneSwitch name='OPEN'>On</oneSwitch></newSwitchVector>",
        );

        let out = sent(&mut rx);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].tag, "setSwitchVector");
        let shutter = ctx.switch_vector_mut("SHUTTER").unwrap();
        assert_eq!(shutter.on_switch(), Some("OPEN"));
        assert!(!shutter.element("CLOSE").unwrap().is_on());
    }

    #[tokio::test]
    async fn bad_requests_become_messages() {
        let (mut ctx, mut rx) = context();
        let mut dome = Dome::default();
        run(&mut dome, &mut ctx, "<getProperties/>");
        sent(&mut rx);

        for bad in [
            "<newNumberVector device='dome' name='AZIMUTH'><oneNumber name='AZ'>east</oneNumber></newNumberVector>",
            "<newNumberVector device='dome' name='TEMPERATURE'><oneNumber name='T'>1</oneNumber></newNumberVector>",
            "<newNumberVector device='dome' name='MISSING'><oneNumber name='X'>1</oneNumber></newNumberVector>",
            "<newTextVector device='dome' name='AZIMUTH'><oneText name='AZ'>1</oneText></newTextVector>",
            "<newSwitchVector device='dome' name='SHUTTER'><oneSwitch name='OPEN'>On</oneSwitch><oneSwitch name='AJAR'>On</oneSwitch></newSwitchVector>",
        ] {
            run(&mut dome, &mut ctx, bad);
            let out = sent(&mut rx);
            assert_eq!(out.len(), 1, "{bad}");
            assert_eq!(out[0].tag, "message", "{bad}");
            assert_eq!(out[0].attribute("device"), Some("dome"));
        }

        assert_eq!(ctx.number_vector_mut("AZIMUTH").unwrap().value("AZ").unwrap(), 0.0);
        assert_eq!(ctx.switch_vector_mut("SHUTTER").unwrap().on_switch(), Some("CLOSE"));

        // other devices' requests are not ours to answer
        run(
            &mut dome,
            &mut ctx,
            "<newNumberVector device='mount' name='AZIMUTH'><oneNumber name='AZ'>x</oneNumber></newNumberVector>",
        );
        assert!(sent(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn overdue_timers_run_before_the_next_message() {
        let (mut ctx, mut rx) = context();
        let mut dome = Dome::default();
        ctx.add_timer(core::time::Duration::from_secs(1), |_, ctx| ctx.message("tick"));
        run(&mut dome, &mut ctx, "<getProperties/>");
        sent(&mut rx);

        time::advance(core::time::Duration::from_secs(2)).await;

        let (tx, mut inbox) = tokio::sync::mpsc::unbounded_channel();
        tx.send(XmlElement::parse(b"<getProperties name='SHUTTER'/>").unwrap()).unwrap();
        drop(tx);
        dispatch_loop(&mut dome, &mut ctx, &mut inbox).await;

        let tags = sent(&mut rx).into_iter().map(|el| el.tag).collect::<Vec<_>>();
        assert_eq!(tags, ["message", "defSwitchVector"]);
    }

    #[tokio::test]
    async fn registered_handler_takes_precedence() {
        let (mut ctx, mut rx) = context();
        let mut dome = Dome::default();
        run(&mut dome, &mut ctx, "<getProperties/>");
        sent(&mut rx);

        let id = ctx.on_new("AZIMUTH", |_, ctx, request| {
            let vector = ctx.number_vector_mut(&request.name)?;
            vector.state = indi_common::PropertyState::Busy;
            ctx.update(&request.name, Some("slewing"))
        });

        let request =
            "<newNumberVector device='dome' name='AZIMUTH'><oneNumber name='AZ'>180</oneNumber></newNumberVector>";
        run(&mut dome, &mut ctx, request);

        let out = sent(&mut rx);
        assert_eq!(out[0].attribute("state"), Some("Busy"));
        assert_eq!(out[0].attribute("message"), Some("slewing"));
        assert_eq!(out[0].children[0].text, "0");

        assert!(ctx.revoke(id));
        run(&mut dome, &mut ctx, request);
        let out = sent(&mut rx);
        assert_eq!(out[0].attribute("state"), Some("Ok"));
        assert_eq!(out[0].children[0].text, "180");
    }

    #[tokio::test]
    async fn blob_uploads() {
        let (mut ctx, mut rx) = context();
        let mut dome = Dome::default();
        run(&mut dome, &mut ctx, "<getProperties/>");
        sent(&mut rx);

        run(
            &mut dome,
            &mut ctx,
            "<newBLOBVector device='dome' name='UPLOAD'>\
                <oneBLOB name='FILE' size='5' format='.txt'>aGVs bG8=</oneBLOB>\
             </newBLOBVector>",
        );

        assert_eq!(dome.uploads.len(), 1);
        assert_eq!(dome.uploads[0].data, b"hello");
        assert_eq!(dome.uploads[0].vector, Some(PropertyKey::new("dome", "UPLOAD")));
    }
}
