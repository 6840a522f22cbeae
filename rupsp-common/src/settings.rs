// SPDX-FileCopyrightText: 2025 rupsp contributors
// SPDX-License-Identifier: GPL-3.0-or-later

/// Global emulator settings, populated from config INI.
#[derive(Debug, Clone)]
pub struct Settings {
    // Kernel
    /// SDK version the running module was built against (0 = unknown).
    /// Several thread calls change behavior across firmware revisions.
    pub compiled_sdk_version: u32,
    pub log_context_switches: bool,

    // Root thread
    pub root_thread_priority: u32,
    pub root_stack_size: u32,
    pub root_thread_attr: u32,

    // Debug
    pub use_debug_logging: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            compiled_sdk_version: 0,
            log_context_switches: false,
            root_thread_priority: 0x20,
            root_stack_size: 0x4_0000,
            root_thread_attr: 0,
            use_debug_logging: false,
        }
    }
}

/// Parse a config integer, accepting `0x` hex or decimal.
pub fn parse_u32(text: &str) -> Option<u32> {
    let text = text.trim();
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

/// Parse a config boolean (`true`/`1`).
pub fn parse_bool(text: &str) -> bool {
    matches!(text.trim(), "true" | "1")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_u32() {
        assert_eq!(parse_u32("0x02060010"), Some(0x0206_0010));
        assert_eq!(parse_u32(" 32 "), Some(32));
        assert_eq!(parse_u32("zz"), None);
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("true"));
        assert!(parse_bool("1"));
        assert!(!parse_bool("no"));
    }

    #[test]
    fn test_defaults() {
        let s = Settings::default();
        assert_eq!(s.root_thread_priority, 0x20);
        assert_eq!(s.compiled_sdk_version, 0);
    }
}
