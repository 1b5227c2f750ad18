//! Boundary between the coordination layer and protocol drivers.
//!
//! A driver supplies a [`ConnectionFactory`] that opens and closes physical
//! connections and knows where its protocol keeps the correlation key, and a
//! [`Transport`] that pushes already-encoded frames onto the wire.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;

use crate::errors::Error;

pub mod tcp;

/// Authentication material handed to the driver when a connection is opened.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Authentication {
    /// User name
    pub username: String,
    /// Password, never printed
    pub password: String,
}

impl Authentication {
    /// Bundle a user name and password
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Authentication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authentication")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// A live, driver-owned session to one device.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Push one encoded frame onto the wire
    async fn send(&mut self, frame: Bytes) -> Result<(), Error>;
}

/// Opens, checks and closes physical connections for one protocol.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    /// Transport handed out for every opened connection
    type Transport: Transport;

    /// Open a connection to `endpoint`. Errors end up as `Error::Connection`
    /// for every caller waiting on that endpoint.
    async fn open(
        &self,
        endpoint: &str,
        authentication: Option<&Authentication>,
    ) -> Result<Self::Transport, Error>;

    /// Close a connection that is being torn down
    async fn close(&self, transport: &mut Self::Transport) -> Result<(), Error>;

    /// Whether `transport` is still usable; checked before a connection is reused
    fn is_connected(&self, transport: &Self::Transport) -> bool;

    /// Correlation key carried by an encoded request or response frame
    fn correlation_key(&self, frame: &[u8]) -> Option<u64>;
}
