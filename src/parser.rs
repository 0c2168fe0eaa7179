//! Cascading multi-format telemetry line parser
//!
//! Firmware on both links speaks newline-delimited ASCII, but the exact frame
//! shape varies by firmware revision. Each trimmed line runs through an
//! ordered cascade; the first matching rule wins and no later rule is
//! evaluated:
//!
//! 1. Strict nutrient triple: `N:<int>,P:<int>,K:<int>` (case-insensitive)
//! 2. JSON object, e.g. `{"t":25.0,"h":60.0,"g":300,"n":40,"p":30,"k":50}`:
//!    nutrient commit if `n`,`p`,`k` are all present, environment update if
//!    any of `t`,`h`,`g` is present (both may fire from one object)
//! 3. CSV nutrient triple: `<int>,<int>,<int>` as the whole line
//! 4. Loose labelled environment tokens (`Temp`, `Hum`, `Gas`/`Methane`, `pH`)
//! 5. Loose per-nutrient tokens accumulated across lines; the reading commits
//!    once all of N, P and K have been seen
//!
//! A line matching nothing is discarded silently; that is normal chatter, not
//! an error.

use regex::Regex;
use serde_json::Value;
use tracing::debug;

use crate::telemetry::EnvironmentPatch;

/// Result of feeding one line through the cascade.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameUpdate {
    /// Commit a nutrient reading with a fresh timestamp.
    Nutrient { n: u32, p: u32, k: u32 },
    /// Partial environment update; also refreshes the staleness marker.
    Environment(EnvironmentPatch),
    /// One JSON object carried both telemetry classes.
    Both {
        n: u32,
        p: u32,
        k: u32,
        environment: EnvironmentPatch,
    },
}

/// Multi-line accumulator for firmware that prints one nutrient per line.
///
/// Once all three fields are present the triple is committed and the
/// accumulator resets, atomically with respect to the cascade.
#[derive(Debug, Default, Clone, PartialEq)]
struct PartialNpk {
    n: Option<u32>,
    p: Option<u32>,
    k: Option<u32>,
}

/// Stateful line decoder. One instance per open link, since the rule-5
/// accumulator is scoped to the transport the lines arrive on.
pub struct FrameParser {
    strict_npk: Regex,
    csv_npk: Regex,
    temp: Regex,
    humidity: Regex,
    gas: Regex,
    ph: Regex,
    nitrogen: Regex,
    phosphorus: Regex,
    potassium: Regex,
    partial: PartialNpk,
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameParser {
    pub fn new() -> Self {
        // The label alternations carry a leading \b so that a trailing letter
        // of an unrelated word ("...text 123") cannot pass as a label.
        Self {
            strict_npk: Regex::new(r"(?i)N:(\d+),P:(\d+),K:(\d+)").unwrap(),
            csv_npk: Regex::new(r"^(\d+)\s*,\s*(\d+)\s*,\s*(\d+)$").unwrap(),
            temp: Regex::new(r"(?i)\b(?:T|Temp)[:=\s]*([\d.]+)").unwrap(),
            humidity: Regex::new(r"(?i)\b(?:H|Hum)[:=\s]*([\d.]+)").unwrap(),
            gas: Regex::new(r"(?i)\b(?:G|Gas|Methane)[:=\s]*([\d.]+)").unwrap(),
            ph: Regex::new(r"(?i)\b(?:pH)[:=\s]*([\d.]+)").unwrap(),
            nitrogen: Regex::new(r"(?i)\b(?:N|Nitrogen)[:=\s]*(\d+)").unwrap(),
            phosphorus: Regex::new(r"(?i)\b(?:P|Phosphorus)[:=\s]*(\d+)").unwrap(),
            potassium: Regex::new(r"(?i)\b(?:K|Potassium)[:=\s]*(\d+)").unwrap(),
            partial: PartialNpk::default(),
        }
    }

    /// Run one line through the cascade. `None` means no state change is
    /// required (no rule matched, or a matched rule produced nothing).
    pub fn parse_line(&mut self, line: &str) -> Option<FrameUpdate> {
        let text = line.trim();
        if text.is_empty() {
            return None;
        }

        // Rule 1: strict combined triple, as sent by the ESP32 NPK firmware.
        if let Some(caps) = self.strict_npk.captures(text) {
            if let (Some(n), Some(p), Some(k)) = (
                parse_int(&caps[1]),
                parse_int(&caps[2]),
                parse_int(&caps[3]),
            ) {
                return Some(FrameUpdate::Nutrient { n, p, k });
            }
        }

        // Rule 2: JSON object. A successfully parsed object consumes the
        // line even when it carries none of the known keys; only a parse
        // failure falls through.
        if text.starts_with('{') && text.ends_with('}') {
            match serde_json::from_str::<Value>(text) {
                Ok(value) => return self.parse_json(&value),
                Err(err) => debug!(error = %err, "JSON parse failed, trying regex fallback"),
            }
        }

        // Rule 3: bare CSV triple.
        if let Some(caps) = self.csv_npk.captures(text) {
            if let (Some(n), Some(p), Some(k)) = (
                parse_int(&caps[1]),
                parse_int(&caps[2]),
                parse_int(&caps[3]),
            ) {
                return Some(FrameUpdate::Nutrient { n, p, k });
            }
        }

        // Rule 4: loose labelled environment tokens. Any label match fires
        // the update, even if its number fails to parse.
        let temp = self.temp.captures(text);
        let hum = self.humidity.captures(text);
        let gas = self.gas.captures(text);
        let ph = self.ph.captures(text);
        if temp.is_some() || hum.is_some() || gas.is_some() || ph.is_some() {
            let patch = EnvironmentPatch {
                temperature: temp.and_then(|c| parse_float(&c[1])),
                humidity: hum.and_then(|c| parse_float(&c[1])),
                methane: gas.and_then(|c| parse_float(&c[1])),
                ph: ph.and_then(|c| parse_float(&c[1])),
            };
            return Some(FrameUpdate::Environment(patch));
        }

        // Rule 5: per-nutrient accumulation across lines. Later values
        // overwrite earlier partials for the same field.
        let mut touched = false;
        if let Some(n) = self.nitrogen.captures(text).and_then(|c| parse_int(&c[1])) {
            self.partial.n = Some(n);
            touched = true;
        }
        if let Some(p) = self.phosphorus.captures(text).and_then(|c| parse_int(&c[1])) {
            self.partial.p = Some(p);
            touched = true;
        }
        if let Some(k) = self.potassium.captures(text).and_then(|c| parse_int(&c[1])) {
            self.partial.k = Some(k);
            touched = true;
        }

        if touched {
            if let (Some(n), Some(p), Some(k)) = (self.partial.n, self.partial.p, self.partial.k) {
                self.partial = PartialNpk::default();
                return Some(FrameUpdate::Nutrient { n, p, k });
            }
        }

        None
    }

    fn parse_json(&self, value: &Value) -> Option<FrameUpdate> {
        let nutrients = match (value.get("n"), value.get("p"), value.get("k")) {
            (Some(n), Some(p), Some(k)) => match (n.as_f64(), p.as_f64(), k.as_f64()) {
                (Some(n), Some(p), Some(k)) => Some((n as u32, p as u32, k as u32)),
                _ => None,
            },
            _ => None,
        };

        // The gate checks only t/h/g presence; a lone "ph" key fires nothing.
        // Known firmware quirk, kept for compatibility.
        let environment = if value.get("t").is_some()
            || value.get("h").is_some()
            || value.get("g").is_some()
        {
            Some(EnvironmentPatch {
                temperature: value.get("t").and_then(Value::as_f64).map(|v| v as f32),
                humidity: value.get("h").and_then(Value::as_f64).map(|v| v as f32),
                methane: value.get("g").and_then(Value::as_f64).map(|v| v as f32),
                ph: value.get("ph").and_then(Value::as_f64).map(|v| v as f32),
            })
        } else {
            None
        };

        match (nutrients, environment) {
            (Some((n, p, k)), Some(environment)) => Some(FrameUpdate::Both {
                n,
                p,
                k,
                environment,
            }),
            (Some((n, p, k)), None) => Some(FrameUpdate::Nutrient { n, p, k }),
            (None, Some(environment)) => Some(FrameUpdate::Environment(environment)),
            (None, None) => None,
        }
    }
}

fn parse_int(digits: &str) -> Option<u32> {
    digits.parse().ok()
}

fn parse_float(token: &str) -> Option<f32> {
    token.parse().ok()
}
