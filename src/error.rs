//! Error types for the encoder controller

use std::io;

/// Errors surfaced by the encoder controller
#[derive(Debug, thiserror::Error)]
pub enum EncoderError {
    /// The bootstrap pipe could not be created
    #[error("failed to create handshake pipe: {0}")]
    Pipe(#[source] io::Error),

    /// Fork or exec of the encoder binary failed
    #[error("failed to launch encoder {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },

    /// A watcher could not be attached to the event loop
    #[error("failed to register {what} with the event loop: {source}")]
    Register {
        what: &'static str,
        #[source]
        source: io::Error,
    },

    /// The encoder did not report a usable bus name
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Opening the bus connection failed
    #[error("failed to connect to the bus: {0}")]
    Connect(String),

    /// Installing a signal match failed
    #[error("failed to subscribe to {what}: {reason}")]
    Subscribe { what: &'static str, reason: String },

    /// The method call never got a reply
    #[error("bus transport error: {0}")]
    Transport(String),

    /// The encoder answered with an error reply
    #[error("encoder replied with {name}: {message}")]
    Remote { name: String, message: String },

    /// No bus name has been received from the encoder yet
    #[error("encoder is not connected to the bus")]
    NotConnected,

    /// Sending a signal to the encoder process failed
    #[error("failed to signal encoder process {pid}: {source}")]
    Signal {
        pid: i32,
        #[source]
        source: io::Error,
    },
}

pub type Result<T> = std::result::Result<T, EncoderError>;
