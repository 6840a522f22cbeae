// SPDX-FileCopyrightText: 2025 rupsp contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use ini::Ini;
use log::{debug, info, warn};
use rupsp_common::settings::{parse_bool, parse_u32, Settings};
use std::path::PathBuf;

/// Locate rupsp.ini in the user's config directory.
pub fn find_config_path() -> Option<PathBuf> {
    // XDG_CONFIG_HOME
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        let path = PathBuf::from(&xdg).join("rupsp").join("rupsp.ini");
        if path.exists() {
            return Some(path);
        }
    }

    // Linux: ~/.config/rupsp/rupsp.ini
    if let Ok(home) = std::env::var("HOME") {
        let path = PathBuf::from(&home)
            .join(".config")
            .join("rupsp")
            .join("rupsp.ini");
        if path.exists() {
            return Some(path);
        }
    }

    // Windows: %APPDATA%\rupsp\rupsp.ini
    if let Ok(appdata) = std::env::var("APPDATA") {
        let path = PathBuf::from(&appdata).join("rupsp").join("rupsp.ini");
        if path.exists() {
            return Some(path);
        }
    }

    None
}

/// Load settings from an INI file, falling back to defaults.
pub fn load_config(path: Option<&PathBuf>) -> Settings {
    let mut settings = Settings::default();

    let config_path = match path {
        Some(p) => {
            if !p.exists() {
                warn!("Config file not found: {}", p.display());
                return settings;
            }
            p.clone()
        }
        None => match find_config_path() {
            Some(p) => p,
            None => {
                info!("No rupsp config found, using defaults");
                return settings;
            }
        },
    };

    info!("Loading config from: {}", config_path.display());

    match Ini::load_from_file(&config_path) {
        Ok(conf) => apply_config(&conf, &mut settings),
        Err(e) => warn!("Failed to parse config: {}", e),
    }
    settings
}

fn read_u32(value: &str, key: &str, out: &mut u32) {
    match parse_u32(value) {
        Some(v) => *out = v,
        None => warn!("Ignoring bad value for {}: {:?}", key, value),
    }
}

/// Copy recognised keys from `conf` into `settings`.
pub fn apply_config(conf: &Ini, settings: &mut Settings) {
    // [Kernel]
    if let Some(section) = conf.section(Some("Kernel")) {
        if let Some(sdk) = section.get("compiled_sdk_version") {
            read_u32(sdk, "compiled_sdk_version", &mut settings.compiled_sdk_version);
            debug!("Compiled SDK version: {:08x}", settings.compiled_sdk_version);
        }
        if let Some(switches) = section.get("log_context_switches") {
            settings.log_context_switches = parse_bool(switches);
        }
    }

    // [RootThread]
    if let Some(section) = conf.section(Some("RootThread")) {
        if let Some(prio) = section.get("priority") {
            read_u32(prio, "priority", &mut settings.root_thread_priority);
        }
        if let Some(size) = section.get("stack_size") {
            read_u32(size, "stack_size", &mut settings.root_stack_size);
        }
        if let Some(attr) = section.get("attr") {
            read_u32(attr, "attr", &mut settings.root_thread_attr);
        }
    }

    // [Debugging]
    if let Some(section) = conf.section(Some("Debugging")) {
        if let Some(debug_log) = section.get("use_debug_logging") {
            settings.use_debug_logging = parse_bool(debug_log);
        }
    }
}
