// Range classification for telemetry channels
//
// Each rule maps a channel's raw value to discard / error / ok. Discard hides a
// corrupted reading from every display; error only highlights it. Error state is
// edge-triggered: raising and resolving are each reported once per transition.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use serde::Deserialize;
use thiserror::Error;

use crate::net::messages::{ChannelValue, Channels, Flags};

/// Failure loading a rule table from disk
#[derive(Debug, Error)]
pub enum RulesError {
    #[error("cannot read rule table: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse rule table: {0}")]
    Json(#[from] serde_json::Error),
}

/// Closed interval with optional ends. A bound of zero is a real bound.
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
pub struct Bounds {
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

impl Bounds {
    pub const fn new(min: Option<f64>, max: Option<f64>) -> Self {
        Bounds { min, max }
    }

    pub fn contains(&self, value: f64) -> bool {
        if let Some(min) = self.min {
            if value < min {
                return false;
            }
        }
        if let Some(max) = self.max {
            if value > max {
                return false;
            }
        }
        true
    }
}

/// A classification rule shared by one or more channels
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RangeRule {
    pub channel_names: Vec<String>,
    #[serde(default)]
    pub discard_range: Option<Bounds>,
    #[serde(default)]
    pub error_range: Option<Bounds>,
    #[serde(default)]
    pub accepted_values: Option<BTreeSet<String>>,
    #[serde(default = "default_message")]
    pub message: String,
}

fn default_message() -> String {
    "out of range".to_string()
}

impl RangeRule {
    fn discards(&self, value: &ChannelValue) -> bool {
        match value {
            ChannelValue::Number(v) => self
                .discard_range
                .map_or(false, |range| !range.contains(*v)),
            ChannelValue::Text(s) => self
                .accepted_values
                .as_ref()
                .map_or(false, |accepted| !accepted.contains(s)),
        }
    }

    fn errors(&self, value: &ChannelValue) -> bool {
        match value {
            ChannelValue::Number(v) => self.error_range.map_or(false, |range| !range.contains(*v)),
            ChannelValue::Text(_) => false,
        }
    }
}

/// Ordered set of rules, indexed by channel
#[derive(Debug, Clone)]
pub struct RangeTable {
    rules: Vec<RangeRule>,
    /// channel -> indices into `rules`, in rule order
    by_channel: HashMap<String, Vec<usize>>,
    /// channels in first-mention order, for deterministic evaluation
    order: Vec<String>,
}

impl RangeTable {
    pub fn new(rules: Vec<RangeRule>) -> Self {
        let mut by_channel: HashMap<String, Vec<usize>> = HashMap::new();
        let mut order = Vec::new();
        for (idx, rule) in rules.iter().enumerate() {
            for name in &rule.channel_names {
                let entry = by_channel.entry(name.clone()).or_default();
                if entry.is_empty() {
                    order.push(name.clone());
                }
                entry.push(idx);
            }
        }
        RangeTable { rules, by_channel, order }
    }

    /// Load a JSON array of rules.
    pub fn from_json(text: &str) -> Result<Self, RulesError> {
        let rules: Vec<RangeRule> = serde_json::from_str(text)?;
        Ok(Self::new(rules))
    }

    pub fn from_file(path: &Path) -> Result<Self, RulesError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn rules(&self) -> &[RangeRule] {
        &self.rules
    }

    pub fn rules_for(&self, channel: &str) -> impl Iterator<Item = &RangeRule> {
        self.by_channel
            .get(channel)
            .into_iter()
            .flatten()
            .map(move |&idx| &self.rules[idx])
    }

    /// The ground station's fixed rule table.
    pub fn builtin() -> Self {
        fn names(list: &[&str]) -> Vec<String> {
            list.iter().map(|s| s.to_string()).collect()
        }
        fn discard(list: &[&str], min: f64, max: f64) -> RangeRule {
            RangeRule {
                channel_names: names(list),
                discard_range: Some(Bounds::new(Some(min), Some(max))),
                error_range: None,
                accepted_values: None,
                message: default_message(),
            }
        }
        fn accept(list: &[&str], values: &[&str]) -> RangeRule {
            RangeRule {
                channel_names: names(list),
                discard_range: None,
                error_range: None,
                accepted_values: Some(values.iter().map(|s| s.to_string()).collect()),
                message: default_message(),
            }
        }
        fn flagged(list: &[&str], error: Bounds, message: &str, min: f64, max: f64) -> RangeRule {
            RangeRule {
                error_range: Some(error),
                message: message.to_string(),
                ..discard(list, min, max)
            }
        }

        Self::new(vec![
            discard(&["analogVoltageInput1"], -1.0, 128.0),
            discard(
                &["accelLowX", "accelLowY", "accelLowZ", "accelHighX", "accelHighY", "accelHighZ"],
                -32.0,
                32.0,
            ),
            discard(&["altitude"], -128.0, 8192.0),
            discard(&["velocity"], -128.0, 1024.0),
            discard(&["GPSLatitude", "GPSLongitude"], -18000.0, 18000.0),
            discard(&["gyroX", "gyroY", "gyroZ"], -295.0, 295.0),
            discard(&["internalTemp"], -1.0, 128.0),
            discard(&["mach_speed"], -1.0, 16.0),
            discard(&["qw", "qx", "qy", "qz"], -1.0, 1.0),
            accept(&["navigationStatus"], &["NF", "DR", "G2", "G3", "D2", "D3", "RK", "TT"]),
            accept(
                &["flightState"],
                &["PRE_FLIGHT_NO_FLIGHT_READY", "LAUNCH", "COAST", "APOGEE", "DESCENT", "LANDED", "OH_NO"],
            ),
            flagged(
                &["gasBottleWeight1", "gasBottleWeight2"],
                Bounds::new(Some(15.1), Some(19.0)),
                "out of range",
                -1.0,
                128.0,
            ),
            flagged(
                &["thermocouple1", "thermocouple2", "thermocouple3", "thermocouple4"],
                Bounds::new(None, Some(34.5)),
                "flag raised",
                -128.0,
                128.0,
            ),
            flagged(
                &["transducer1", "transducer2", "transducer3"],
                Bounds::new(None, Some(64.5)),
                "flag raised",
                -1.0,
                128.0,
            ),
        ])
    }
}

impl Default for RangeTable {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Set of currently active error keys (`<channel>Error`)
#[derive(Debug, Clone, Default)]
pub struct ErrorState {
    active: BTreeSet<String>,
}

impl ErrorState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self, key: &str) -> bool {
        self.active.contains(key)
    }

    pub fn active(&self) -> impl Iterator<Item = &str> {
        self.active.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Returns true on a false -> true transition.
    fn raise(&mut self, key: &str) -> bool {
        self.active.insert(key.to_string())
    }

    /// Returns true on a true -> false transition.
    fn resolve(&mut self, key: &str) -> bool {
        self.active.remove(key)
    }
}

/// Outcome of classifying one packet
#[derive(Debug, Clone, PartialEq)]
pub enum RangeEvent {
    /// A reading was replaced by the invalid marker. Reported every time.
    Discarded { channel: String, value: ChannelValue },
    /// Error state entered (edge).
    Raised { key: String, message: String },
    /// Error state left (edge).
    Resolved { key: String },
}

impl std::fmt::Display for RangeEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RangeEvent::Discarded { channel, value } => match value {
                ChannelValue::Number(v) => write!(f, "Discarded {} ({})", channel, v),
                ChannelValue::Text(s) => write!(f, "Discarded {} ({})", channel, s),
            },
            RangeEvent::Raised { key, message } => write!(f, "{} {}", key, message),
            RangeEvent::Resolved { key } => write!(f, "{} resolved", key),
        }
    }
}

pub fn error_key(channel: &str) -> String {
    format!("{}Error", channel)
}

/// Applies a rule table to packets, tracking error state across packets
#[derive(Debug, Clone, Default)]
pub struct RangeClassifier {
    table: RangeTable,
    state: ErrorState,
}

impl RangeClassifier {
    pub fn new(table: RangeTable) -> Self {
        RangeClassifier { table, state: ErrorState::new() }
    }

    pub fn table(&self) -> &RangeTable {
        &self.table
    }

    pub fn state(&self) -> &ErrorState {
        &self.state
    }

    /// Classify every ruled channel present in `channels`, in place.
    ///
    /// All rules for a channel are evaluated against the raw value before any
    /// marker is written, so a later rule can never un-discard an earlier one.
    /// Discard always wins for display. Error bookkeeping runs on the raw value
    /// whether or not it was discarded, and a sender flag set to true forces the
    /// error state regardless of local ranges.
    pub fn classify(&mut self, channels: &mut Channels, error_flags: &Flags) -> Vec<RangeEvent> {
        let mut events = Vec::new();
        let mut discards: Vec<String> = Vec::new();

        for channel in &self.table.order {
            let value = match channels.get(channel) {
                Some(v) => v,
                None => continue,
            };
            // Already invalid at decode
            if !value.is_valid() {
                continue;
            }

            let key = error_key(channel);
            let overridden = error_flags.get(&key).copied().unwrap_or(false);

            let mut is_discard = false;
            let mut is_error = overridden;
            let mut message: Option<&str> = None;
            for rule in self.table.rules_for(channel) {
                is_discard |= rule.discards(value);
                if rule.errors(value) {
                    is_error = true;
                    message.get_or_insert(rule.message.as_str());
                }
            }

            if is_discard {
                events.push(RangeEvent::Discarded { channel: channel.clone(), value: value.clone() });
                discards.push(channel.clone());
            }

            if is_error {
                if self.state.raise(&key) {
                    let message = message.unwrap_or("flagged by sender").to_string();
                    events.push(RangeEvent::Raised { key, message });
                }
            } else if self.state.resolve(&key) {
                events.push(RangeEvent::Resolved { key });
            }
        }

        for channel in discards {
            if let Some(value) = channels.get_mut(&channel) {
                *value = value.invalidated();
            }
        }

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one(name: &str, value: f64) -> Channels {
        let mut c = Channels::new();
        c.insert(name.to_string(), ChannelValue::Number(value));
        c
    }

    fn count(events: &[RangeEvent]) -> (usize, usize, usize) {
        let mut raised = 0;
        let mut resolved = 0;
        let mut discarded = 0;
        for e in events {
            match e {
                RangeEvent::Raised { .. } => raised += 1,
                RangeEvent::Resolved { .. } => resolved += 1,
                RangeEvent::Discarded { .. } => discarded += 1,
            }
        }
        (raised, resolved, discarded)
    }

    #[test]
    fn test_error_hysteresis_is_edge_triggered() {
        let mut classifier = RangeClassifier::new(RangeTable::builtin());
        let flags = Flags::new();

        let mut per_sample = Vec::new();
        for v in [30.0, 40.0, 40.0, 30.0] {
            let mut channels = one("thermocouple1", v);
            per_sample.push(classifier.classify(&mut channels, &flags));
        }

        assert_eq!(count(&per_sample[0]), (0, 0, 0));
        assert_eq!(count(&per_sample[1]), (1, 0, 0));
        assert_eq!(count(&per_sample[2]), (0, 0, 0));
        assert_eq!(count(&per_sample[3]), (0, 1, 0));
        assert_eq!(
            per_sample[1][0],
            RangeEvent::Raised { key: "thermocouple1Error".into(), message: "flag raised".into() }
        );
        assert!(classifier.state().is_empty());
    }

    #[test]
    fn test_error_value_is_kept() {
        let mut classifier = RangeClassifier::default();
        let mut channels = one("thermocouple2", 40.0);
        classifier.classify(&mut channels, &Flags::new());
        assert_eq!(channels["thermocouple2"], ChannelValue::Number(40.0));
        assert!(classifier.state().is_active("thermocouple2Error"));
    }

    #[test]
    fn test_discard_replaces_with_marker_every_time() {
        let mut classifier = RangeClassifier::default();
        for _ in 0..2 {
            let mut channels = one("altitude", 9000.0);
            let events = classifier.classify(&mut channels, &Flags::new());
            assert_eq!(count(&events), (0, 0, 1));
            assert!(!channels["altitude"].is_valid());
        }
    }

    #[test]
    fn test_text_whitelist() {
        let mut classifier = RangeClassifier::default();
        let mut channels = Channels::new();
        channels.insert("flightState".into(), ChannelValue::Text("WARP".into()));
        channels.insert("navigationStatus".into(), ChannelValue::Text("G3".into()));
        classifier.classify(&mut channels, &Flags::new());
        assert_eq!(channels["flightState"], ChannelValue::Text(String::new()));
        assert_eq!(channels["navigationStatus"], ChannelValue::Text("G3".into()));
    }

    #[test]
    fn test_sender_override_forces_error_but_not_display() {
        let mut classifier = RangeClassifier::default();
        let mut flags = Flags::new();
        flags.insert("transducer1Error".into(), true);

        // In range locally, but the sender says error
        let mut channels = one("transducer1", 10.0);
        let events = classifier.classify(&mut channels, &flags);
        assert_eq!(count(&events), (1, 0, 0));
        assert_eq!(channels["transducer1"], ChannelValue::Number(10.0));

        // Discard still wins for display under an override
        let mut channels = one("transducer1", 500.0);
        let events = classifier.classify(&mut channels, &flags);
        assert_eq!(count(&events), (0, 0, 1));
        assert!(!channels["transducer1"].is_valid());
        assert!(classifier.state().is_active("transducer1Error"));

        // Override cleared and value back in range
        let mut channels = one("transducer1", 10.0);
        let events = classifier.classify(&mut channels, &Flags::new());
        assert_eq!(count(&events), (0, 1, 0));
    }

    #[test]
    fn test_discard_and_error_on_same_value() {
        let mut classifier = RangeClassifier::default();
        // Above both the error max (34.5) and the discard max (128)
        let mut channels = one("thermocouple3", 200.0);
        let events = classifier.classify(&mut channels, &Flags::new());
        assert_eq!(count(&events), (1, 0, 1));
        assert!(!channels["thermocouple3"].is_valid());
    }

    #[test]
    fn test_later_rule_cannot_undiscard() {
        let table = RangeTable::new(vec![
            RangeRule {
                channel_names: vec!["x".into()],
                discard_range: Some(Bounds::new(Some(0.0), Some(10.0))),
                error_range: None,
                accepted_values: None,
                message: "a".into(),
            },
            RangeRule {
                channel_names: vec!["x".into()],
                discard_range: Some(Bounds::new(Some(-100.0), Some(100.0))),
                error_range: None,
                accepted_values: None,
                message: "b".into(),
            },
        ]);
        let mut classifier = RangeClassifier::new(table);
        let mut channels = one("x", 50.0);
        let events = classifier.classify(&mut channels, &Flags::new());
        assert_eq!(count(&events), (0, 0, 1));
        assert!(!channels["x"].is_valid());
    }

    #[test]
    fn test_zero_bound_is_respected() {
        let bounds = Bounds::new(Some(0.0), None);
        assert!(bounds.contains(0.0));
        assert!(!bounds.contains(-0.5));
    }

    #[test]
    fn test_rules_from_json() {
        let json = r#"[
            {"channelNames": ["windSpeed"], "errorRange": {"max": 20}, "message": "too windy"},
            {"channelNames": ["flightState"], "acceptedValues": ["LAUNCH"]}
        ]"#;
        let table = RangeTable::from_json(json).unwrap();
        assert_eq!(table.rules().len(), 2);
        assert_eq!(table.rules()[1].message, "out of range");

        let mut classifier = RangeClassifier::new(table);
        let mut channels = one("windSpeed", 25.0);
        let events = classifier.classify(&mut channels, &Flags::new());
        assert_eq!(events[0].to_string(), "windSpeedError too windy");
    }

    #[test]
    fn test_rules_from_bad_json() {
        assert!(matches!(RangeTable::from_json("{"), Err(RulesError::Json(_))));
    }
}
