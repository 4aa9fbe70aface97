// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Interpretation of the `default` and `settings` metadata objects.

use crate::audio::types::{ClockSettings, DefaultDevices};
use serde::Deserialize;
use tracing::{debug, trace};

/// Metadata object carrying default device selections.
pub const DEFAULT_METADATA: &str = "default";
/// Metadata object carrying graph clock settings.
pub const SETTINGS_METADATA: &str = "settings";

pub const KEY_DEFAULT_SINK: &str = "default.audio.sink";
pub const KEY_DEFAULT_SOURCE: &str = "default.audio.source";
pub const KEY_CONFIGURED_SINK: &str = "default.configured.audio.sink";
pub const KEY_CONFIGURED_SOURCE: &str = "default.configured.audio.source";

pub const KEY_CLOCK_RATE: &str = "clock.rate";
pub const KEY_CLOCK_ALLOWED_RATES: &str = "clock.allowed-rates";
pub const KEY_CLOCK_QUANTUM: &str = "clock.quantum";
pub const KEY_CLOCK_MIN_QUANTUM: &str = "clock.min-quantum";
pub const KEY_CLOCK_MAX_QUANTUM: &str = "clock.max-quantum";
pub const KEY_CLOCK_FORCE_RATE: &str = "clock.force-rate";
pub const KEY_CLOCK_FORCE_QUANTUM: &str = "clock.force-quantum";

/// SPA type tag for JSON metadata values.
pub const JSON_TYPE: &str = "Spa:String:JSON";

#[derive(Deserialize)]
struct NameValue {
    name: String,
}

/// Extract `name` from a `{"name": "..."}` value.
pub fn parse_name_value(value: &str) -> Option<String> {
    serde_json::from_str::<NameValue>(value)
        .ok()
        .map(|v| v.name)
        .filter(|n| !n.is_empty())
}

/// Encode a node name as a default-device metadata value.
pub fn name_value(name: &str) -> String {
    serde_json::json!({ "name": name }).to_string()
}

/// Parse an integer list like `[ 44100 48000 ]` or `[44100, 48000]`.
pub fn parse_rate_list(value: &str) -> Option<Vec<u32>> {
    let inner = value.trim().strip_prefix('[')?.strip_suffix(']')?;
    inner
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(|s| s.parse().ok())
        .collect()
}

/// Apply a `default` metadata property. Returns true when the table changed.
///
/// A `None` value clears the key; an unparseable value is ignored and the
/// previous selection kept.
pub fn apply_default_property(
    defaults: &mut DefaultDevices,
    key: &str,
    value: Option<&str>,
) -> bool {
    let slot = match key {
        KEY_DEFAULT_SINK => &mut defaults.audio_sink,
        KEY_DEFAULT_SOURCE => &mut defaults.audio_source,
        KEY_CONFIGURED_SINK => &mut defaults.configured_audio_sink,
        KEY_CONFIGURED_SOURCE => &mut defaults.configured_audio_source,
        _ => {
            trace!("Ignoring default metadata key {}", key);
            return false;
        }
    };

    let parsed = match value {
        None => None,
        Some(v) => match parse_name_value(v) {
            Some(name) => Some(name),
            None => {
                debug!("Malformed value for {}: {:?}", key, v);
                return false;
            }
        },
    };

    if *slot == parsed {
        return false;
    }
    *slot = parsed;
    true
}

/// Apply a `settings` metadata property. Returns true when the table changed.
pub fn apply_settings_property(clock: &mut ClockSettings, key: &str, value: Option<&str>) -> bool {
    if key == KEY_CLOCK_ALLOWED_RATES {
        let parsed = match value {
            None => Vec::new(),
            Some(v) => match parse_rate_list(v) {
                Some(rates) => rates,
                None => {
                    debug!("Malformed value for {}: {:?}", key, v);
                    return false;
                }
            },
        };
        if clock.allowed_rates == parsed {
            return false;
        }
        clock.allowed_rates = parsed;
        return true;
    }

    let slot = match key {
        KEY_CLOCK_RATE => &mut clock.rate,
        KEY_CLOCK_QUANTUM => &mut clock.quantum,
        KEY_CLOCK_MIN_QUANTUM => &mut clock.min_quantum,
        KEY_CLOCK_MAX_QUANTUM => &mut clock.max_quantum,
        KEY_CLOCK_FORCE_RATE => &mut clock.force_rate,
        KEY_CLOCK_FORCE_QUANTUM => &mut clock.force_quantum,
        _ => {
            trace!("Ignoring settings metadata key {}", key);
            return false;
        }
    };

    let parsed = match value {
        None => None,
        Some(v) => match v.trim().parse::<u32>() {
            // A forced value of 0 means "not forced".
            Ok(0) if key == KEY_CLOCK_FORCE_RATE || key == KEY_CLOCK_FORCE_QUANTUM => None,
            Ok(n) => Some(n),
            Err(_) => {
                debug!("Malformed value for {}: {:?}", key, v);
                return false;
            }
        },
    };

    if *slot == parsed {
        return false;
    }
    *slot = parsed;
    true
}
