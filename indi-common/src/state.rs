use crate::macros::wire_enum;

wire_enum! {
    /// State of a vector property; also the value domain of a light element
    pub enum PropertyState ("state") {
        Idle = "Idle",
        Ok = "Ok",
        Busy = "Busy",
        Alert = "Alert",
    }
}

impl Default for PropertyState {
    fn default() -> Self {
        Self::Idle
    }
}

wire_enum! {
    pub enum Permission ("perm") {
        ReadOnly = "ro",
        WriteOnly = "wo",
        ReadWrite = "rw",
    }
}

impl Permission {
    pub const fn is_writable(&self) -> bool {
        matches!(self, Self::WriteOnly | Self::ReadWrite)
    }
}

wire_enum! {
    pub enum SwitchRule ("rule") {
        /// Exactly one switch is on; turning one on turns its siblings off
        OneOfMany = "OneOfMany",
        AtMostOne = "AtMostOne",
        AnyOfMany = "AnyOfMany",
    }
}

wire_enum! {
    pub enum SwitchState ("switch state") {
        Off = "Off",
        On = "On",
    }
}

impl From<bool> for SwitchState {
    fn from(on: bool) -> Self {
        if on { Self::On } else { Self::Off }
    }
}

wire_enum! {
    /// The five element kinds, spelled the way they appear inside tag names
    pub enum Kind ("kind") {
        Number = "Number",
        Text = "Text",
        Light = "Light",
        Switch = "Switch",
        Blob = "BLOB",
    }
}

impl Kind {
    pub fn def_vector_tag(&self) -> String {
        format!("def{self}Vector")
    }

    pub fn def_element_tag(&self) -> String {
        format!("def{self}")
    }

    pub fn set_vector_tag(&self) -> String {
        format!("set{self}Vector")
    }

    pub fn new_vector_tag(&self) -> String {
        format!("new{self}Vector")
    }

    pub fn one_element_tag(&self) -> String {
        format!("one{self}")
    }
}
