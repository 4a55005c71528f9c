use std::collections::{BTreeMap, BTreeSet, HashMap};

use compact_str::{CompactString, ToCompactString as _};
use indi_common::{
    PropertyKey,
    message::MessageKind,
    xml::{Attribute, EventSink, XmlElement, XmlEvent},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(u64);

pub type WatchFn = Box<dyn FnMut(&XmlElement) + Send>;

struct Watch {
    id: WatchId,
    callback: WatchFn,
}

enum Target {
    Watch(PropertyKey),
    Message,
}

enum State {
    Idle,
    /// Inside an element nobody asked for; only depth is tracked
    Skipping { depth: usize },
    Building { target: Target, stack: Vec<XmlElement> },
}

/// Routes framed events to per-vector callbacks.
///
/// Only watched vectors (and `<message>` elements) are rebuilt into element
/// trees. Every other top-level element is inspected at its start tag for
/// device and group names, then skipped without buffering.
pub struct Router {
    watches: HashMap<PropertyKey, Watch>,
    next_id: u64,
    state: State,
    devices: BTreeMap<CompactString, BTreeSet<CompactString>>,
    on_device: Option<Box<dyn FnMut(&str) + Send>>,
    on_group: Option<Box<dyn FnMut(&str, &str) + Send>>,
    on_message: Option<WatchFn>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Self {
            watches: HashMap::new(),
            next_id: 1,
            state: State::Idle,
            devices: BTreeMap::new(),
            on_device: None,
            on_group: None,
            on_message: None,
        }
    }

    fn insert(&mut self, key: PropertyKey, callback: WatchFn) -> WatchId {
        let id = WatchId(self.next_id);
        self.next_id += 1;

        if self.watches.insert(key.clone(), Watch { id, callback }).is_some() {
            tracing::debug!(%key, "replacing watch");
        }

        id
    }

    /// Calls `callback` with every definition or update of `device.name`.
    /// Replaces any previous watch on the same vector.
    pub fn watch(
        &mut self,
        device: impl AsRef<str>,
        name: impl AsRef<str>,
        callback: impl FnMut(&XmlElement) + Send + 'static,
    ) -> WatchId {
        self.insert(PropertyKey::new(device, name), Box::new(callback))
    }

    /// Like [`watch`](Self::watch) for every vector of `device` that has no
    /// watch of its own
    pub fn watch_all(
        &mut self,
        device: impl AsRef<str>,
        callback: impl FnMut(&XmlElement) + Send + 'static,
    ) -> WatchId {
        self.insert(PropertyKey::wildcard(device), Box::new(callback))
    }

    pub fn unwatch(&mut self, id: WatchId) -> bool {
        let before = self.watches.len();
        self.watches.retain(|_, w| w.id != id);
        self.watches.len() != before
    }

    pub fn on_new_device(&mut self, callback: impl FnMut(&str) + Send + 'static) {
        self.on_device = Some(Box::new(callback));
    }

    pub fn on_new_group(&mut self, callback: impl FnMut(&str, &str) + Send + 'static) {
        self.on_group = Some(Box::new(callback));
    }

    pub fn on_message(&mut self, callback: impl FnMut(&XmlElement) + Send + 'static) {
        self.on_message = Some(Box::new(callback));
    }

    /// Devices seen so far, with the groups their vectors were defined in
    pub fn devices(&self) -> impl Iterator<Item = &str> {
        self.devices.keys().map(CompactString::as_str)
    }

    pub fn groups(&self, device: &str) -> impl Iterator<Item = &str> {
        self.devices.get(device).into_iter().flatten().map(CompactString::as_str)
    }

    /// Drops a partially received element, as after a reconnect
    pub fn reset(&mut self) {
        self.state = State::Idle;
    }

    fn resolve(&self, device: &str, name: &str) -> Option<PropertyKey> {
        [PropertyKey::new(device, name), PropertyKey::wildcard(device)]
            .into_iter()
            .find(|key| self.watches.contains_key(key))
    }

    fn note_device(&mut self, device: &str, group: Option<&str>) {
        if !self.devices.contains_key(device) {
            tracing::info!(device, "new device");
            self.devices.insert(device.to_compact_string(), BTreeSet::new());
            if let Some(cb) = &mut self.on_device {
                cb(device);
            }
        }

        let Some(group) = group.filter(|g| !g.is_empty()) else {
            return;
        };
        let Some(groups) = self.devices.get_mut(device) else {
            return;
        };

        if groups.insert(group.to_compact_string()) {
            tracing::debug!(device, group, "new group");
            if let Some(cb) = &mut self.on_group {
                cb(device, group);
            }
        }
    }

    fn start_top_level(&mut self, tag: &CompactString, attributes: &[Attribute]) -> State {
        let attr = |key: &str| attributes.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str());
        let element = || XmlElement { tag: tag.clone(), attributes: attributes.to_vec(), ..Default::default() };

        if tag == "message" {
            return State::Building { target: Target::Message, stack: vec![element()] };
        }

        let Some(device) = attr("device").filter(|d| !d.is_empty()) else {
            return State::Skipping { depth: 1 };
        };

        if tag.starts_with("def") {
            self.note_device(device, attr("group"));
        } else {
            self.note_device(device, None);
        }

        // watches see definitions and updates only
        if !MessageKind::classify(tag).is_vector() {
            return State::Skipping { depth: 1 };
        }

        match self.resolve(device, attr("name").unwrap_or(PropertyKey::WILDCARD)) {
            Some(key) => State::Building { target: Target::Watch(key), stack: vec![element()] },
            None => {
                tracing::trace!(%tag, device, "not watched");
                State::Skipping { depth: 1 }
            }
        }
    }

    fn deliver(&mut self, target: Target, element: XmlElement) {
        match target {
            Target::Watch(key) => {
                // the watch may have been removed while the element streamed in
                if let Some(watch) = self.watches.get_mut(&key) {
                    tracing::debug!(%key, tag = %element.tag, "delivering");
                    (watch.callback)(&element);
                }
            }
            Target::Message => {
                let device = element.attribute("device").unwrap_or_default();
                let text = element.attribute("message").unwrap_or_default();
                tracing::info!(device, "{text}");

                if let Some(cb) = &mut self.on_message {
                    cb(&element);
                }
            }
        }
    }
}

impl EventSink for Router {
    fn event(&mut self, event: &XmlEvent) {
        let state = core::mem::replace(&mut self.state, State::Idle);

        self.state = match (state, event) {
            (State::Idle, XmlEvent::Start { tag, attributes }) => {
                self.start_top_level(tag, attributes)
            }
            (State::Idle, _) => State::Idle,

            (State::Skipping { depth }, XmlEvent::Start { .. }) => {
                State::Skipping { depth: depth + 1 }
            }
            (State::Skipping { depth: 1 }, XmlEvent::End { .. }) => State::Idle,
            (State::Skipping { depth }, XmlEvent::End { .. }) => {
                State::Skipping { depth: depth - 1 }
            }
            (skipping @ State::Skipping { .. }, XmlEvent::Text(_)) => skipping,

            (State::Building { target, mut stack }, XmlEvent::Start { tag, attributes }) => {
                stack.push(XmlElement {
                    tag: tag.clone(),
                    attributes: attributes.clone(),
                    ..Default::default()
                });
                State::Building { target, stack }
            }
            (State::Building { target, mut stack }, XmlEvent::Text(text)) => {
                if let Some(current) = stack.last_mut() {
                    current.text.push_str(text);
                }
                State::Building { target, stack }
            }
            (State::Building { target, mut stack }, XmlEvent::End { .. }) => {
                match stack.pop() {
                    Some(done) => match stack.last_mut() {
                        Some(parent) => {
                            parent.children.push(done);
                            State::Building { target, stack }
                        }
                        None => {
                            self.deliver(target, done);
                            State::Idle
                        }
                    },
                    None => State::Idle,
                }
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use indi_common::{framer::Framer, parse_number};

    use super::*;

    const COORD: &[u8] = br#"<setNumberVector device="mount" name="EQUATORIAL_EOD_COORD" state="Ok">
    <oneNumber name="RA">12:30:00</oneNumber>
    <oneNumber name="DEC">-5.25</oneNumber>
</setNumberVector>
"#;

    fn feed(router: &mut Router, bytes: &[u8]) {
        Framer::new(1 << 20).feed(bytes, router);
    }

    fn recorder() -> (Arc<Mutex<Vec<XmlElement>>>, impl FnMut(&XmlElement) + Send + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |el: &XmlElement| sink.lock().unwrap().push(el.clone()))
    }

    #[test]
    fn watched_vector_is_delivered_once() {
        let mut router = Router::new();
        let (seen, cb) = recorder();
        router.watch("mount", "EQUATORIAL_EOD_COORD", cb);

        feed(&mut router, br#"<setNumberVector device="mount" name="HORIZONTAL_COORD"><oneNumber name="ALT">10</oneNumber></setNumberVector>"#);
        feed(&mut router, br#"<setNumberVector device="dome" name="EQUATORIAL_EOD_COORD"><oneNumber name="RA">1</oneNumber></setNumberVector>"#);
        assert!(seen.lock().unwrap().is_empty());

        feed(&mut router, COORD);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);

        let values = seen[0]
            .children
            .iter()
            .map(|c| (c.attribute("name").unwrap(), parse_number(&c.text).unwrap()))
            .collect::<Vec<_>>();
        assert_eq!(values, [("RA", 12.5), ("DEC", -5.25)]);
    }

    #[test]
    fn split_delivery() {
        let mut router = Router::new();
        let (seen, cb) = recorder();
        router.watch("mount", "EQUATORIAL_EOD_COORD", cb);

        let mut framer = Framer::new(1 << 20);
        for chunk in COORD.chunks(3) {
            framer.feed(chunk, &mut router);
        }

        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(seen.lock().unwrap()[0].children.len(), 2);
    }

    #[test]
    fn exact_watch_beats_wildcard() {
        let mut router = Router::new();
        let (exact, cb) = recorder();
        router.watch("mount", "EQUATORIAL_EOD_COORD", cb);
        let (any, cb) = recorder();
        router.watch_all("mount", cb);

        feed(&mut router, COORD);
        feed(&mut router, br#"<defTextVector device="mount" name="DRIVER_INFO"><defText name="NAME">sim</defText></defTextVector>"#);

        assert_eq!(exact.lock().unwrap().len(), 1);
        let any = any.lock().unwrap();
        assert_eq!(any.len(), 1);
        assert_eq!(any[0].attribute("name"), Some("DRIVER_INFO"));
    }

    #[test]
    fn only_definitions_and_updates_are_delivered() {
        let mut router = Router::new();
        let (seen, cb) = recorder();
        router.watch_all("mount", cb);
        let devices = Arc::new(Mutex::new(Vec::new()));
        let sink = devices.clone();
        router.on_new_device(move |device| sink.lock().unwrap().push(device.to_owned()));

        feed(&mut router, br#"<delProperty device="mount" name="X"/>"#);
        feed(&mut router, br#"<newNumberVector device="mount" name="X"><oneNumber name="A">1</oneNumber></newNumberVector>"#);
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(*devices.lock().unwrap(), ["mount"]);

        feed(&mut router, COORD);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].tag, "setNumberVector");
    }

    #[test]
    fn unwatch_and_replace() {
        let mut router = Router::new();
        let (first, cb) = recorder();
        let old = router.watch("mount", "EQUATORIAL_EOD_COORD", cb);
        let (second, cb) = recorder();
        let id = router.watch("mount", "EQUATORIAL_EOD_COORD", cb);

        assert!(!router.unwatch(old));
        feed(&mut router, COORD);
        assert!(first.lock().unwrap().is_empty());
        assert_eq!(second.lock().unwrap().len(), 1);

        assert!(router.unwatch(id));
        feed(&mut router, COORD);
        assert_eq!(second.lock().unwrap().len(), 1);
    }

    #[test]
    fn devices_and_groups() {
        let mut router = Router::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        router.on_new_device(move |d| sink.lock().unwrap().push(format!("device {d}")));
        let sink = seen.clone();
        router.on_new_group(move |d, g| sink.lock().unwrap().push(format!("group {d}/{g}")));

        feed(&mut router, br#"
            <defSwitchVector device="mount" name="CONNECTION" group="Main Control">
                <defSwitch name="CONNECT">Off</defSwitch>
            </defSwitchVector>
            <defNumberVector device="mount" name="TIME_LST" group="Site">
                <defNumber name="LST">0</defNumber>
            </defNumberVector>
            <defNumberVector device="mount" name="GEO" group="Site">
                <defNumber name="LAT">0</defNumber>
            </defNumberVector>
            <setNumberVector device="focuser" name="POS"><oneNumber name="P">1</oneNumber></setNumberVector>
        "#);

        assert_eq!(*seen.lock().unwrap(), [
            "device mount",
            "group mount/Main Control",
            "group mount/Site",
            "device focuser",
        ]);
        assert_eq!(router.devices().collect::<Vec<_>>(), ["focuser", "mount"]);
        assert_eq!(router.groups("mount").collect::<Vec<_>>(), ["Main Control", "Site"]);
        assert_eq!(router.groups("dome").count(), 0);
    }

    #[test]
    fn messages_are_surfaced() {
        let mut router = Router::new();
        let (seen, cb) = recorder();
        router.on_message(cb);

        feed(&mut router, br#"<message device="dome" timestamp="2024-01-01T00:00:00" message="shutter stuck"/>"#);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].attribute("message"), Some("shutter stuck"));
    }
}
