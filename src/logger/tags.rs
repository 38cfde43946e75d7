/// Log tags identify the subsystem a message comes from
///
/// Every tag maps to a `--debug-<key>` command-line flag that enables its
/// debug-level output.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogTag {
    System,
    Connection,
    Commands,
    Topics,
    Telemetry,
    Discovery,
    Manager,
    Persistence,
    Simulator,
}

impl LogTag {
    /// All tags, in display order
    pub const ALL: [LogTag; 9] = [
        LogTag::System,
        LogTag::Connection,
        LogTag::Commands,
        LogTag::Topics,
        LogTag::Telemetry,
        LogTag::Discovery,
        LogTag::Manager,
        LogTag::Persistence,
        LogTag::Simulator,
    ];

    /// Key used in `--debug-<key>` / `--verbose-<key>` flags
    pub fn to_debug_key(&self) -> String {
        match self {
            LogTag::System => "system",
            LogTag::Connection => "connection",
            LogTag::Commands => "commands",
            LogTag::Topics => "topics",
            LogTag::Telemetry => "telemetry",
            LogTag::Discovery => "discovery",
            LogTag::Manager => "manager",
            LogTag::Persistence => "persistence",
            LogTag::Simulator => "simulator",
        }
        .to_string()
    }

    /// Uppercase label used in console and file output
    pub fn to_plain_string(&self) -> String {
        match self {
            LogTag::System => "SYSTEM",
            LogTag::Connection => "CONN",
            LogTag::Commands => "COMMAND",
            LogTag::Topics => "TOPIC",
            LogTag::Telemetry => "TELEMETRY",
            LogTag::Discovery => "DISCOVERY",
            LogTag::Manager => "MANAGER",
            LogTag::Persistence => "PERSIST",
            LogTag::Simulator => "SIMULATOR",
        }
        .to_string()
    }

    /// Parse a debug key back into a tag
    pub fn from_debug_key(key: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|tag| tag.to_debug_key() == key)
    }
}

impl std::fmt::Display for LogTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_plain_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_key_roundtrip() {
        for tag in LogTag::ALL {
            assert_eq!(LogTag::from_debug_key(&tag.to_debug_key()), Some(tag));
        }
        assert_eq!(LogTag::from_debug_key("trader"), None);
    }
}
