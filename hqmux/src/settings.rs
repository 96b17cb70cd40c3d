//! SETTINGS identifiers and the session's settings snapshots.
//!
//! The session keeps two snapshots: the settings it advertises (egress) and
//! the settings the peer advertised (ingress). Frame encoding and decoding
//! belong to the control codec; this module only models the values.

use crate::config::SessionConfig;

/// Setting identifiers carried on the control stream (RFC 9114 Section
/// 7.2.4.1, RFC 9204 Section 5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingId {
    QpackMaxTableCapacity,
    MaxFieldSectionSize,
    QpackBlockedStreams,
    /// Unknown or reserved identifier; ignored per RFC 9114 Section 7.2.4.
    Unknown(u64),
}

impl SettingId {
    pub fn from_wire(id: u64) -> Self {
        match id {
            0x01 => Self::QpackMaxTableCapacity,
            0x06 => Self::MaxFieldSectionSize,
            0x07 => Self::QpackBlockedStreams,
            other => Self::Unknown(other),
        }
    }

    pub fn to_wire(self) -> u64 {
        match self {
            Self::QpackMaxTableCapacity => 0x01,
            Self::MaxFieldSectionSize => 0x06,
            Self::QpackBlockedStreams => 0x07,
            Self::Unknown(other) => other,
        }
    }
}

/// One setting as carried in a SETTINGS frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Setting {
    pub id: SettingId,
    pub value: u64,
}

/// A resolved view of one side's settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettingsSnapshot {
    pub qpack_max_table_capacity: u64,
    pub qpack_blocked_streams: u64,
    pub max_field_section_size: u64,
}

impl Default for SettingsSnapshot {
    fn default() -> Self {
        Self {
            qpack_max_table_capacity: 0,
            qpack_blocked_streams: 0,
            max_field_section_size: u64::MAX,
        }
    }
}

impl SettingsSnapshot {
    /// The settings this session advertises, from its configuration.
    pub fn egress_from_config(config: &SessionConfig) -> Self {
        Self {
            qpack_max_table_capacity: config.qpack_max_table_capacity,
            qpack_blocked_streams: config.qpack_blocked_streams,
            max_field_section_size: config.max_field_section_size,
        }
    }

    /// Fold a received settings list into a snapshot, ignoring unknown ids.
    pub fn apply(&mut self, settings: &[Setting]) {
        for setting in settings {
            match setting.id {
                SettingId::QpackMaxTableCapacity => {
                    self.qpack_max_table_capacity = setting.value;
                }
                SettingId::QpackBlockedStreams => {
                    self.qpack_blocked_streams = setting.value;
                }
                SettingId::MaxFieldSectionSize => {
                    self.max_field_section_size = setting.value;
                }
                SettingId::Unknown(_) => {}
            }
        }
    }

    /// The settings list to put in an outgoing SETTINGS frame.
    pub fn to_list(&self) -> Vec<Setting> {
        vec![
            Setting {
                id: SettingId::QpackMaxTableCapacity,
                value: self.qpack_max_table_capacity,
            },
            Setting {
                id: SettingId::MaxFieldSectionSize,
                value: self.max_field_section_size,
            },
            Setting {
                id: SettingId::QpackBlockedStreams,
                value: self.qpack_blocked_streams,
            },
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_ignores_unknown_settings() {
        let mut snapshot = SettingsSnapshot::default();
        snapshot.apply(&[
            Setting {
                id: SettingId::QpackMaxTableCapacity,
                value: 4096,
            },
            Setting {
                id: SettingId::Unknown(0x21),
                value: 7,
            },
        ]);
        assert_eq!(snapshot.qpack_max_table_capacity, 4096);
        assert_eq!(snapshot.qpack_blocked_streams, 0);
    }

    #[test]
    fn wire_id_roundtrip() {
        for id in [
            SettingId::QpackMaxTableCapacity,
            SettingId::MaxFieldSectionSize,
            SettingId::QpackBlockedStreams,
        ] {
            assert_eq!(SettingId::from_wire(id.to_wire()), id);
        }
        assert_eq!(SettingId::from_wire(0x33), SettingId::Unknown(0x33));
    }
}
