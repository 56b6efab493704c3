//! Configure payload
//!
//! The encoder takes its configuration as a list of `(key, variant)` pairs
//! where the key is an integer shared with the encoder binary.

use crate::session::SessionContext;

/// Configuration keys understood by the encoder.
///
/// Discriminants are the wire codes and must not be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ConfigKey {
    DisplayType = 0,
    DisplayName = 1,
    MonitorNum = 2,
    X = 3,
    Y = 4,
    Width = 5,
    Height = 6,
    WindowId = 7,
    Framerate = 8,
    ScaleWidth = 9,
    ScaleHeight = 10,
    AudioType = 11,
    AudioDev = 12,
    PeerAddress = 13,
    RtpPort0 = 14,
    RtpPort1 = 15,
    PeerRtcpPort = 16,
    LocalAddress = 17,
    LocalRtpPort0 = 18,
    LocalRtpPort1 = 19,
    LocalRtcpPort = 20,
    H264Profile = 21,
    H264Level = 22,
    DebugLevel = 23,
}

impl ConfigKey {
    pub fn code(self) -> i32 {
        self as i32
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigValue {
    Str(String),
    U32(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigEntry {
    pub key: ConfigKey,
    pub value: ConfigValue,
}

impl ConfigEntry {
    fn string(key: ConfigKey, value: &str) -> Self {
        Self {
            key,
            value: ConfigValue::Str(value.to_string()),
        }
    }

    fn uint(key: ConfigKey, value: u32) -> Self {
        Self {
            key,
            value: ConfigValue::U32(value),
        }
    }
}

/// Build the ordered argument list of a `Configure` call.
///
/// The two RTCP ports travel together, and the capture rectangle is sent
/// as all four fields or not at all.
pub fn configure_entries(session: &SessionContext) -> Vec<ConfigEntry> {
    let mut entries = vec![
        ConfigEntry::string(ConfigKey::PeerAddress, &session.peer_address),
        ConfigEntry::uint(ConfigKey::RtpPort0, session.rtp_port),
    ];

    if let Some(rtcp) = session.rtcp_port {
        entries.push(ConfigEntry::uint(ConfigKey::PeerRtcpPort, rtcp));
    }

    entries.push(ConfigEntry::string(ConfigKey::LocalAddress, &session.local_address));

    if let Some(rtcp) = session.rtcp_port {
        entries.push(ConfigEntry::uint(ConfigKey::LocalRtcpPort, rtcp));
    }

    if let Some(rect) = session.display_rect {
        entries.extend([
            ConfigEntry::uint(ConfigKey::X, rect.x),
            ConfigEntry::uint(ConfigKey::Y, rect.y),
            ConfigEntry::uint(ConfigKey::Width, rect.width),
            ConfigEntry::uint(ConfigKey::Height, rect.height),
        ]);
    }

    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::DisplayRect;

    fn keys(entries: &[ConfigEntry]) -> Vec<ConfigKey> {
        entries.iter().map(|e| e.key).collect()
    }

    fn base_session() -> SessionContext {
        SessionContext {
            peer_address: "10.0.0.2".to_string(),
            local_address: "10.0.0.5".to_string(),
            rtp_port: 5000,
            ..Default::default()
        }
    }

    #[test]
    fn test_minimal_session_has_three_entries() {
        let entries = configure_entries(&base_session());

        assert_eq!(
            entries,
            vec![
                ConfigEntry::string(ConfigKey::PeerAddress, "10.0.0.2"),
                ConfigEntry::uint(ConfigKey::RtpPort0, 5000),
                ConfigEntry::string(ConfigKey::LocalAddress, "10.0.0.5"),
            ]
        );
    }

    #[test]
    fn test_rtcp_ports_are_paired() {
        let session = SessionContext {
            rtcp_port: Some(5001),
            ..base_session()
        };
        let entries = configure_entries(&session);

        assert_eq!(
            keys(&entries),
            vec![
                ConfigKey::PeerAddress,
                ConfigKey::RtpPort0,
                ConfigKey::PeerRtcpPort,
                ConfigKey::LocalAddress,
                ConfigKey::LocalRtcpPort,
            ]
        );
        assert_eq!(entries[2].value, ConfigValue::U32(5001));
        assert_eq!(entries[4].value, ConfigValue::U32(5001));
    }

    #[test]
    fn test_geometry_is_emitted_as_a_block() {
        let session = SessionContext {
            display_rect: Some(DisplayRect {
                x: 10,
                y: 20,
                width: 1280,
                height: 720,
            }),
            ..base_session()
        };
        let entries = configure_entries(&session);

        assert_eq!(entries.len(), 7);
        assert_eq!(
            &entries[3..],
            &[
                ConfigEntry::uint(ConfigKey::X, 10),
                ConfigEntry::uint(ConfigKey::Y, 20),
                ConfigEntry::uint(ConfigKey::Width, 1280),
                ConfigEntry::uint(ConfigKey::Height, 720),
            ]
        );
    }

    #[test]
    fn test_wire_codes() {
        assert_eq!(ConfigKey::PeerAddress.code(), 13);
        assert_eq!(ConfigKey::RtpPort0.code(), 14);
        assert_eq!(ConfigKey::LocalRtcpPort.code(), 20);
        assert_eq!(ConfigKey::Height.code(), 6);
    }
}
