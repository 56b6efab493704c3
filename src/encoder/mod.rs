//! Encoder process control
//!
//! Launches the external encoder, picks up its bus name over the handshake
//! pipe and drives it over D-Bus.

mod bus;
mod controller;
mod dbus;
mod launcher;
mod state;
mod wire;

#[cfg(test)]
mod testing;

pub use bus::{
    BusConnector, EncoderBus, EncoderMethod, NameOwnerChanged, PropertiesChanged, PropertyValue,
    ENCODER_INTERFACE, ENCODER_OBJECT_PATH, STATE_PROPERTY,
};
pub use controller::{EncoderController, EncoderObserver, KillMode};
pub use dbus::{DBusEncoderBus, SystemBusConnector};
pub use launcher::HANDSHAKE_FD;
pub use state::{Decoded, EncoderState, StateCode, StateMachine};
pub use wire::{configure_entries, ConfigEntry, ConfigKey, ConfigValue};
