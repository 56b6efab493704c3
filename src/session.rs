//! Session parameters handed to the encoder
//!
//! The negotiation layer fills this in once the sink has agreed on ports
//! and display geometry. The controller only ever reads it.

use serde::{Deserialize, Serialize};

/// Region of the local display to capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Read-only view of a negotiated Wifi-Display session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionContext {
    /// Address of the sink
    pub peer_address: String,

    /// Address of the local interface facing the sink
    pub local_address: String,

    /// RTP port the sink listens on
    pub rtp_port: u32,

    /// RTCP port, when the sink asked for one
    #[serde(default)]
    pub rtcp_port: Option<u32>,

    /// Capture region; absent means the whole display
    #[serde(default)]
    pub display_rect: Option<DisplayRect>,

    /// X display the encoder captures from
    #[serde(default = "default_display_name")]
    pub display_name: String,

    /// Xauthority file granting access to `display_name`
    #[serde(default)]
    pub display_auth: String,
}

fn default_display_name() -> String {
    ":0".to_string()
}

impl Default for SessionContext {
    fn default() -> Self {
        Self {
            peer_address: String::new(),
            local_address: String::new(),
            rtp_port: 1991,
            rtcp_port: None,
            display_rect: None,
            display_name: default_display_name(),
            display_auth: String::new(),
        }
    }
}
