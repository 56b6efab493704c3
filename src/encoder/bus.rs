//! Bus abstraction used by the controller
//!
//! The controller talks to the encoder through these traits so that the
//! D-Bus transport in [`super::dbus`] can be swapped for an in-memory bus
//! in tests.

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use std::sync::Arc;

use super::wire::ConfigEntry;
use crate::error::Result;

/// Object path the encoder registers itself at
pub const ENCODER_OBJECT_PATH: &str = "/org/freedesktop/miracle/encoder";

/// Interface the encoder implements
pub const ENCODER_INTERFACE: &str = "org.freedesktop.miracle.encoder";

/// Name of the property carrying the encoder state code
pub const STATE_PROPERTY: &str = "State";

/// Remote methods exposed by the encoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderMethod {
    Configure,
    Start,
    Pause,
    Stop,
}

impl EncoderMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            EncoderMethod::Configure => "Configure",
            EncoderMethod::Start => "Start",
            EncoderMethod::Pause => "Pause",
            EncoderMethod::Stop => "Stop",
        }
    }
}

/// A property value as far as the controller cares
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    Int(i64),
    Other,
}

/// Decoded `PropertiesChanged` signal from the encoder object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertiesChanged {
    pub interface: String,
    pub changed: Vec<(String, PropertyValue)>,
}

/// Decoded `NameOwnerChanged` broadcast from the bus daemon
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameOwnerChanged {
    pub name: String,
    pub old_owner: String,
    pub new_owner: String,
}

/// An open bus connection
pub trait EncoderBus: Send + Sync {
    /// Call `method` on the encoder owning `destination`, waiting for the reply.
    ///
    /// `entries` is only sent for [`EncoderMethod::Configure`].
    fn call(
        &self,
        destination: String,
        method: EncoderMethod,
        entries: Vec<ConfigEntry>,
    ) -> BoxFuture<'static, Result<()>>;

    /// Property changes emitted by `sender` on the encoder object
    fn watch_properties(
        &self,
        sender: String,
    ) -> BoxFuture<'static, Result<BoxStream<'static, PropertiesChanged>>>;

    /// Ownership changes of any name in the `namespace` prefix
    fn watch_name_owner(
        &self,
        namespace: String,
    ) -> BoxFuture<'static, Result<BoxStream<'static, NameOwnerChanged>>>;
}

/// Opens bus connections once the encoder has announced itself
pub trait BusConnector: Send + Sync {
    fn connect(&self) -> BoxFuture<'static, Result<Arc<dyn EncoderBus>>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_names() {
        assert_eq!(EncoderMethod::Configure.as_str(), "Configure");
        assert_eq!(EncoderMethod::Stop.as_str(), "Stop");
    }
}
