use core::time::Duration;
use std::collections::HashMap;

use chrono::Utc;
use compact_str::{CompactString, ToCompactString as _};
use indi_common::{
    AnyVector, BlobVector, LightVector, ModelError, NumberVector, PropertyState, SwitchState,
    SwitchVector, TextVector,
    message::{self, MessageKind, NewValues},
    xml::XmlElement,
};

use super::timer::{TimerId, TimerWheel};
use crate::{ConnectionHandle, Result};

pub type TimerFn<D> = Box<dyn FnMut(&mut D, &mut DeviceContext<D>) -> Result<()> + Send>;
pub type HandlerFn<D> =
    Box<dyn FnMut(&mut D, &mut DeviceContext<D>, &NewValues) -> Result<()> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

struct HandlerSlot<D> {
    id: HandlerId,
    handler: Option<HandlerFn<D>>,
}

/// Everything a driver touches while handling a message or a timer: its
/// property table, the outbound connection, timers and new-value handlers.
pub struct DeviceContext<D> {
    name: CompactString,
    conn: ConnectionHandle,
    properties: Vec<AnyVector>,
    pub(crate) timers: TimerWheel<TimerFn<D>>,
    handlers: HashMap<CompactString, HandlerSlot<D>>,
    next_handler: u64,
}

macro_rules! typed_lookup {
    ($( $fn:ident, $as_mut:ident, $ty:ty, $what:literal; )+) => {
        $(
            pub fn $fn(&mut self, name: &str) -> Result<&mut $ty> {
                let key = self.key(name);
                Ok(self
                    .find_mut(name)?
                    .$as_mut()
                    .ok_or_else(|| ModelError::NotFound(format!("{} vector {key}", $what)))?)
            }
        )+
    };
}

impl<D: 'static> DeviceContext<D> {
    pub(crate) fn new(name: impl AsRef<str>, conn: ConnectionHandle) -> Self {
        Self {
            name: name.as_ref().to_compact_string(),
            conn,
            properties: Vec::new(),
            timers: TimerWheel::new(),
            handlers: HashMap::new(),
            next_handler: 1,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connection(&self) -> &ConnectionHandle {
        &self.conn
    }

    fn key(&self, name: &str) -> String {
        format!("{}.{name}", self.name)
    }

    pub fn send(&self, element: &XmlElement) -> Result<()> {
        self.conn.send_element(element)
    }

    /// Adds a vector to the table without announcing it. A vector with the
    /// same name is replaced in place.
    pub fn register(&mut self, vector: impl Into<AnyVector>) -> &mut AnyVector {
        let vector = vector.into();
        if vector.device() != self.name.as_str() {
            tracing::warn!(device = %self.name, key = %vector.key(), "registering vector of another device");
        }

        match self.properties.iter().position(|v| v.name() == vector.name()) {
            Some(i) => {
                self.properties[i] = vector;
                &mut self.properties[i]
            }
            None => {
                self.properties.push(vector);
                let last = self.properties.len() - 1;
                &mut self.properties[last]
            }
        }
    }

    /// Registers a vector and sends its definition
    pub fn define(&mut self, vector: impl Into<AnyVector>) -> Result<()> {
        let def = self.register(vector).define(None)?;
        self.send(&def)
    }

    /// Sends definitions for every registered vector, or only for `name`
    pub fn define_all(&self, name: Option<&str>) -> Result<()> {
        for vector in self.properties.iter().filter(|v| name.is_none_or(|n| v.name() == n)) {
            self.send(&vector.define(None)?)?;
        }
        Ok(())
    }

    pub fn properties(&self) -> impl Iterator<Item = &AnyVector> {
        self.properties.iter()
    }

    pub fn find(&self, name: &str) -> Result<&AnyVector> {
        self.properties
            .iter()
            .find(|v| v.name() == name)
            .ok_or_else(|| ModelError::NotFound(self.key(name)).into())
    }

    pub fn find_mut(&mut self, name: &str) -> Result<&mut AnyVector> {
        let key = self.key(name);
        self.properties
            .iter_mut()
            .find(|v| v.name() == name)
            .ok_or_else(|| ModelError::NotFound(key).into())
    }

    typed_lookup! {
        number_vector_mut, as_number_mut, NumberVector, "number";
        text_vector_mut, as_text_mut, TextVector, "text";
        light_vector_mut, as_light_mut, LightVector, "light";
        switch_vector_mut, as_switch_mut, SwitchVector, "switch";
        blob_vector_mut, as_blob_mut, BlobVector, "BLOB";
    }

    /// Stamps a vector and sends its current state
    pub fn update(&mut self, name: &str, message: Option<&str>) -> Result<()> {
        let vector = self.find_mut(name)?;
        vector.touch();
        let update = vector.update(message)?;
        self.send(&update)
    }

    /// Sends a `<message>` attributed to this device
    pub fn message(&self, text: &str) -> Result<()> {
        self.send(&message::message(Some(&self.name), text, Utc::now()))
    }

    /// Assigns every value of a request to its vector at once, marks the
    /// vector `Ok` and sends the update.
    pub fn apply(&mut self, request: &NewValues) -> Result<()> {
        let vector = self.find_mut(&request.name)?;
        vector.apply(request.pairs())?;
        vector.set_state(PropertyState::Ok);
        self.update(&request.name, None)
    }

    /// Sets the named numbers and sends the update. Nothing changes unless
    /// every element exists.
    pub fn set_numbers(&mut self, name: &str, values: &[(CompactString, f64)]) -> Result<()> {
        let vector = self.number_vector_mut(name)?;
        let mut staged = vector.clone();
        for (element, value) in values {
            staged.set_value(element, *value)?;
        }
        staged.state = PropertyState::Ok;
        *vector = staged;
        self.update(name, None)
    }

    pub fn set_texts(&mut self, name: &str, values: &[(CompactString, String)]) -> Result<()> {
        let vector = self.text_vector_mut(name)?;
        let mut staged = vector.clone();
        for (element, value) in values {
            staged.set_text(element, value.as_str())?;
        }
        staged.state = PropertyState::Ok;
        *vector = staged;
        self.update(name, None)
    }

    pub fn set_switches(&mut self, name: &str, values: &[(CompactString, SwitchState)]) -> Result<()> {
        let vector = self.switch_vector_mut(name)?;
        let mut staged = vector.clone();
        for (element, state) in values {
            staged.set_switch(element, *state)?;
        }
        staged.state = PropertyState::Ok;
        *vector = staged;
        self.update(name, None)
    }

    /// Parses a file of `def*Vector` elements and defines each one. Returns
    /// how many were loaded.
    pub fn load_skeleton(&mut self, xml: &[u8]) -> Result<usize> {
        let mut loaded = 0;

        for el in XmlElement::parse_all(xml)? {
            if !matches!(MessageKind::classify(&el.tag), MessageKind::Define(_)) {
                tracing::debug!(tag = %el.tag, "skipping non-definition in skeleton");
                continue;
            }

            self.define(AnyVector::from_definition(&el)?)?;
            loaded += 1;
        }

        tracing::info!(device = %self.name, loaded, "loaded skeleton");
        Ok(loaded)
    }

    /// Runs `callback` every `period`, starting once the first
    /// `getProperties` has been answered
    pub fn add_timer(
        &mut self,
        period: Duration,
        callback: impl FnMut(&mut D, &mut DeviceContext<D>) -> Result<()> + Send + 'static,
    ) -> TimerId {
        self.timers.add_periodic(period, Box::new(callback))
    }

    /// Runs `callback` once after `delay`
    pub fn add_oneshot(
        &mut self,
        delay: Duration,
        callback: impl FnOnce(&mut D, &mut DeviceContext<D>) -> Result<()> + Send + 'static,
    ) -> TimerId {
        let mut callback = Some(callback);
        self.timers.add_oneshot(
            delay,
            Box::new(move |driver, ctx| match callback.take() {
                Some(callback) => callback(driver, ctx),
                None => Ok(()),
            }),
        )
    }

    pub fn cancel_timer(&mut self, id: TimerId) -> bool {
        self.timers.cancel(id)
    }

    /// Routes `new*Vector` requests for `name` to `handler` instead of the
    /// driver's `new_*` method. Replaces any previous handler for `name`.
    pub fn on_new(
        &mut self,
        name: impl AsRef<str>,
        handler: impl FnMut(&mut D, &mut DeviceContext<D>, &NewValues) -> Result<()> + Send + 'static,
    ) -> HandlerId {
        let id = HandlerId(self.next_handler);
        self.next_handler += 1;

        self.handlers.insert(name.as_ref().to_compact_string(), HandlerSlot {
            id,
            handler: Some(Box::new(handler)),
        });

        id
    }

    pub fn revoke(&mut self, id: HandlerId) -> bool {
        let before = self.handlers.len();
        self.handlers.retain(|_, slot| slot.id != id);
        self.handlers.len() != before
    }

    pub(crate) fn take_handler(&mut self, name: &str) -> Option<(HandlerId, HandlerFn<D>)> {
        let slot = self.handlers.get_mut(name)?;
        Some((slot.id, slot.handler.take()?))
    }

    /// Puts a handler back unless it was revoked or replaced while it ran
    pub(crate) fn restore_handler(&mut self, name: &str, id: HandlerId, handler: HandlerFn<D>) {
        if let Some(slot) = self.handlers.get_mut(name)
            && slot.id == id
        {
            slot.handler = Some(handler);
        }
    }
}
