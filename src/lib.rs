//! wfd-encoderd
//!
//! Encoder controller for a Wifi-Display (Miracast) sender. Spawns an
//! external encoder, learns its bus name over a bootstrap pipe and drives
//! it through Configure/Start/Pause/Stop over D-Bus.

#[cfg(not(unix))]
compile_error!("wfd-encoderd only supports unix targets");

pub mod config;
pub mod encoder;
pub mod error;
pub mod logging;
pub mod session;

pub use config::{Config, EncoderSettings};
pub use encoder::{EncoderController, EncoderObserver, EncoderState, KillMode};
pub use error::{EncoderError, Result};
pub use session::{DisplayRect, SessionContext};
