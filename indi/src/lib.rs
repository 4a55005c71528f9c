use core::time::Duration;

pub mod client;
pub mod config;
pub mod connection;
pub mod device;
pub mod log;

pub use indi_common as common;

pub use self::{
    client::{Client, Router, WatchId},
    config::ConnectionConfig,
    connection::{Connection, ConnectionHandle, Inbound},
    device::{Device, DeviceContext, Driver, HandlerId, TimerId},
};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("timed out connecting to {0}")]
    Timeout(String),
    #[error("connection refused by {0}")]
    Refused(String),
    #[error("peer closed the stream")]
    Eof,
    #[error("no data from peer for {0:?}")]
    Idle(Duration),
    #[error("not connected")]
    NotConnected,
    #[error("connection shut down")]
    Closed,
    #[error("model error: {0}")]
    Model(#[from] indi_common::ModelError),
    #[error("framing error: {0}")]
    Framing(#[from] indi_common::FramingError),
}
