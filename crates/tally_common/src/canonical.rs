//! Canonical metric-key vocabulary.
//!
//! Clients have shipped several generations of tool identifiers: Spanish-era
//! names, keys accidentally namespaced with a `tools.` / `tool.` prefix, and
//! retired experiments. Every key funnels through the table here, on both the
//! write and the read path, so a counter bucket keeps one stable name no
//! matter which app version reported it.

use once_cell::sync::Lazy;
use std::collections::HashMap;

use crate::batch::MetricFamily;

/// Legacy tool key -> canonical key. An empty-string value retires the key:
/// it is dropped everywhere, never counted and never stored.
static LEGACY_TOOL_KEYS: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        // Spanish-era identifiers (pre-2.x clients)
        ("linterna", "flashlight"),
        ("dados", "dice"),
        ("moneda", "coin_flip"),
        ("brujula", "compass"),
        ("nivel", "bubble_level"),
        ("regla", "ruler"),
        ("lupa", "magnifier"),
        ("espejo", "mirror"),
        ("cronometro", "stopwatch"),
        ("calculadora", "calculator"),
        ("conversor", "unit_converter"),
        // 2.x renames
        ("qr", "qr_scanner"),
        ("torch", "flashlight"),
        ("level", "bubble_level"),
        // Retired buckets internal builds used to report
        ("dev", ""),
        ("test", ""),
    ])
});

/// Prefixes older clients (and legacy flattened fields) attach to tool keys.
const TOOL_PREFIXES: [&str; 2] = ["tools.", "tool."];

/// Resolve a raw tool key to its canonical name, or `None` if the key is
/// blank or retired. Unknown keys pass through prefix-free, so tools added in
/// newer app versions aggregate correctly before this table learns of them.
pub fn canonical_tool_key(raw: &str) -> Option<String> {
    let mut key = raw.trim();
    for prefix in TOOL_PREFIXES {
        if let Some(stripped) = key.strip_prefix(prefix) {
            key = stripped;
            break;
        }
    }
    if key.is_empty() {
        return None;
    }
    match LEGACY_TOOL_KEYS.get(key) {
        Some(&"") => None,
        Some(&canonical) => Some(canonical.to_string()),
        None => Some(key.to_string()),
    }
}

/// Canonicalize a key for any metric family. Only tools carry a rename
/// table, but legacy flattened rows can prefix any family's keys with the
/// family name itself (`ads.banner_home`), so that prefix is stripped for
/// every family before use.
pub fn canonical_key(family: MetricFamily, raw: &str) -> Option<String> {
    if family == MetricFamily::Tools {
        return canonical_tool_key(raw);
    }
    let mut key = raw.trim();
    if let Some(rest) = key
        .strip_prefix(family.as_str())
        .and_then(|rest| rest.strip_prefix('.'))
    {
        key = rest;
    }
    if key.is_empty() {
        None
    } else {
        Some(key.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_tool_prefixes() {
        assert_eq!(canonical_tool_key("tools.flashlight").as_deref(), Some("flashlight"));
        assert_eq!(canonical_tool_key("tool.flashlight").as_deref(), Some("flashlight"));
        assert_eq!(canonical_tool_key("flashlight").as_deref(), Some("flashlight"));
    }

    #[test]
    fn maps_legacy_names() {
        assert_eq!(canonical_tool_key("linterna").as_deref(), Some("flashlight"));
        assert_eq!(canonical_tool_key("tools.linterna").as_deref(), Some("flashlight"));
        assert_eq!(canonical_tool_key("dados").as_deref(), Some("dice"));
        assert_eq!(canonical_tool_key("torch").as_deref(), Some("flashlight"));
    }

    #[test]
    fn drops_retired_keys() {
        assert_eq!(canonical_tool_key("dev"), None);
        assert_eq!(canonical_tool_key("tools.dev"), None);
        assert_eq!(canonical_tool_key("test"), None);
    }

    #[test]
    fn passes_unknown_keys_through() {
        assert_eq!(canonical_tool_key("barometer").as_deref(), Some("barometer"));
        assert_eq!(canonical_tool_key("tools.barometer").as_deref(), Some("barometer"));
    }

    #[test]
    fn drops_blank_keys() {
        assert_eq!(canonical_tool_key(""), None);
        assert_eq!(canonical_tool_key("   "), None);
        assert_eq!(canonical_tool_key("tools."), None);
    }

    #[test]
    fn other_families_strip_own_prefix_only() {
        assert_eq!(
            canonical_key(MetricFamily::Ads, "ads.banner_home").as_deref(),
            Some("banner_home")
        );
        assert_eq!(
            canonical_key(MetricFamily::Ads, "banner_home").as_deref(),
            Some("banner_home")
        );
        // A version string with dots is not a path; it stays intact.
        assert_eq!(
            canonical_key(MetricFamily::Versions, "3.2.1").as_deref(),
            Some("3.2.1")
        );
        assert_eq!(canonical_key(MetricFamily::Widgets, ""), None);
    }

    #[test]
    fn no_alias_table_outside_tools() {
        // "linterna" is only a tool alias; as an ad surface it passes through.
        assert_eq!(
            canonical_key(MetricFamily::Ads, "linterna").as_deref(),
            Some("linterna")
        );
    }
}
