// JSON message type definitions
// Defines the telemetry source -> ground station packet protocol

use std::collections::BTreeMap;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::constants::{
    ID_AV_PRIMARY, ID_AV_SECONDARY, ID_GSE_PRIMARY, ID_GSE_SECONDARY, ID_PAYLOAD,
    ID_SINGLE_OPERATOR,
};

/// Named scalar channels of one packet.
pub type Channels = BTreeMap<String, ChannelValue>;

/// Named boolean indicators of one packet (state flags, test flags).
pub type Flags = BTreeMap<String, bool>;

/// Reasons a frame is dropped at the parse boundary
#[derive(Debug, Error)]
pub enum PacketError {
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("packet is not a JSON object")]
    NotAnObject,
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("invalid packet id {0}")]
    InvalidId(Value),
    #[error("unknown packet id {0}")]
    UnknownId(u64),
    #[error("`{0}` must be a JSON object")]
    NotAnObjectField(&'static str),
    #[error("frame is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),
    #[error("frame of {0} bytes exceeds the size limit")]
    FrameTooLong(usize),
}

/// A single telemetry value
///
/// Discarded readings are replaced in place by an invalid marker: NaN for
/// numbers, the empty string for text.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ChannelValue {
    Number(f64),
    Text(String),
}

impl ChannelValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ChannelValue::Number(v) => Some(*v),
            ChannelValue::Text(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ChannelValue::Text(s) => Some(s),
            ChannelValue::Number(_) => None,
        }
    }

    /// A usable reading: finite number or non-empty text.
    pub fn is_valid(&self) -> bool {
        match self {
            ChannelValue::Number(v) => v.is_finite(),
            ChannelValue::Text(s) => !s.is_empty(),
        }
    }

    /// The invalid marker of the same kind.
    pub fn invalidated(&self) -> ChannelValue {
        match self {
            ChannelValue::Number(_) => ChannelValue::Number(f64::NAN),
            ChannelValue::Text(_) => ChannelValue::Text(String::new()),
        }
    }
}

impl From<f64> for ChannelValue {
    fn from(v: f64) -> Self {
        ChannelValue::Number(v)
    }
}

impl From<String> for ChannelValue {
    fn from(v: String) -> Self {
        ChannelValue::Text(v)
    }
}

/// Radio link a packet travelled over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RadioLink {
    #[serde(rename = "av1")]
    Avionics,
    #[serde(rename = "gse")]
    Gse,
}

impl RadioLink {
    pub fn as_str(self) -> &'static str {
        match self {
            RadioLink::Avionics => "av1",
            RadioLink::Gse => "gse",
        }
    }
}

/// Packet-type discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    SingleOperator,
    AvionicsPrimary,
    AvionicsSecondary,
    Payload,
    GsePrimary,
    GseSecondary,
}

impl PacketKind {
    pub fn from_id(id: u64) -> Option<Self> {
        let id = u8::try_from(id).ok()?;
        match id {
            ID_SINGLE_OPERATOR => Some(PacketKind::SingleOperator),
            ID_AV_PRIMARY => Some(PacketKind::AvionicsPrimary),
            ID_AV_SECONDARY => Some(PacketKind::AvionicsSecondary),
            ID_PAYLOAD => Some(PacketKind::Payload),
            ID_GSE_PRIMARY => Some(PacketKind::GsePrimary),
            ID_GSE_SECONDARY => Some(PacketKind::GseSecondary),
            _ => None,
        }
    }

    pub fn id(self) -> u8 {
        match self {
            PacketKind::SingleOperator => ID_SINGLE_OPERATOR,
            PacketKind::AvionicsPrimary => ID_AV_PRIMARY,
            PacketKind::AvionicsSecondary => ID_AV_SECONDARY,
            PacketKind::Payload => ID_PAYLOAD,
            PacketKind::GsePrimary => ID_GSE_PRIMARY,
            PacketKind::GseSecondary => ID_GSE_SECONDARY,
        }
    }

    /// Radio link for packet accounting; single-operator packets have none.
    pub fn link(self) -> Option<RadioLink> {
        match self {
            PacketKind::AvionicsPrimary | PacketKind::AvionicsSecondary | PacketKind::Payload => {
                Some(RadioLink::Avionics)
            }
            PacketKind::GsePrimary | PacketKind::GseSecondary => Some(RadioLink::Gse),
            PacketKind::SingleOperator => None,
        }
    }

    /// Only the secondary avionics packet carries attitude.
    pub fn carries_orientation(self) -> bool {
        matches!(self, PacketKind::AvionicsSecondary)
    }
}

/// Link metadata attached by the sender
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PacketMeta {
    #[serde(default, deserialize_with = "lenient_f64")]
    pub timestamp_s: Option<f64>,
    #[serde(default, deserialize_with = "lenient_count")]
    pub total_packet_count_av: Option<u64>,
    #[serde(default, deserialize_with = "lenient_count")]
    pub total_packet_count_gse: Option<u64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub rssi: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub snr: Option<f64>,
}

/// Accepts a number, a numeric string or null. Anything else reads as absent.
fn lenient_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(n)) => n.as_f64().filter(|v| v.is_finite()),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
        _ => None,
    })
}

/// Packet counters are 64-bit on the wire and usually arrive as strings.
fn lenient_count<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0 && f.fract() == 0.0).map(|f| f as u64)),
        Some(Value::String(s)) => s.trim().parse::<u64>().ok(),
        _ => None,
    })
}

/// A packet as received, validated only at the envelope level
#[derive(Debug, Clone)]
pub struct RawPacket {
    pub kind: PacketKind,
    pub data: Map<String, Value>,
    pub meta: Option<PacketMeta>,
    /// Sender-declared error overrides keyed `<channel>Error`.
    pub error_flags: Flags,
}

impl RawPacket {
    /// Parse one text frame.
    ///
    /// `meta` and `errorFlags` are accepted both on the envelope and nested in
    /// `data` (where the ground-support backend puts them); the envelope wins.
    pub fn parse(frame: &str) -> Result<Self, PacketError> {
        let value: Value = serde_json::from_str(frame)?;
        let mut envelope = match value {
            Value::Object(map) => map,
            _ => return Err(PacketError::NotAnObject),
        };

        let kind = match envelope.remove("id") {
            None | Some(Value::Null) => return Err(PacketError::MissingField("id")),
            Some(Value::Number(n)) => {
                let id = n.as_u64().ok_or(PacketError::InvalidId(Value::Number(n.clone())))?;
                PacketKind::from_id(id).ok_or(PacketError::UnknownId(id))?
            }
            Some(other) => return Err(PacketError::InvalidId(other)),
        };

        let mut data = match envelope.remove("data") {
            None | Some(Value::Null) => return Err(PacketError::MissingField("data")),
            Some(Value::Object(map)) => map,
            Some(_) => return Err(PacketError::NotAnObjectField("data")),
        };

        let nested_meta = data.remove("meta");
        let nested_flags = data.remove("errorFlags");

        let meta = match envelope.remove("meta").or(nested_meta) {
            None | Some(Value::Null) => None,
            Some(v @ Value::Object(_)) => Some(serde_json::from_value::<PacketMeta>(v)?),
            Some(_) => return Err(PacketError::NotAnObjectField("meta")),
        };

        let error_flags = match envelope.remove("errorFlags").or(nested_flags) {
            Some(Value::Object(map)) => map
                .into_iter()
                .filter_map(|(k, v)| v.as_bool().map(|b| (k, b)))
                .collect(),
            _ => Flags::new(),
        };

        Ok(RawPacket { kind, data, meta, error_flags })
    }

    pub fn timestamp_s(&self) -> Option<f64> {
        self.meta.as_ref().and_then(|m| m.timestamp_s)
    }

    /// Decode the channel payload into its typed variant.
    pub fn decode(&self) -> Result<Packet, PacketError> {
        Packet::decode(self.kind, self.data.clone())
    }
}

/// A typed field as received
///
/// A value of the wrong JSON type is kept as `Invalid` so the rest of the
/// packet still decodes.
#[derive(Debug, Clone, PartialEq)]
pub enum Field<T> {
    Valid(T),
    Invalid(Value),
}

/// Scalar types a typed packet field can hold
pub trait WireValue: Sized + Into<ChannelValue> {
    fn from_wire(value: &Value) -> Option<Self>;
    /// Invalid marker written in place of a rejected value.
    fn marker() -> ChannelValue;
}

impl WireValue for f64 {
    fn from_wire(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_f64().filter(|v| v.is_finite()),
            Value::String(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
            _ => None,
        }
    }

    fn marker() -> ChannelValue {
        ChannelValue::Number(f64::NAN)
    }
}

impl WireValue for String {
    fn from_wire(value: &Value) -> Option<Self> {
        value.as_str().map(str::to_string)
    }

    fn marker() -> ChannelValue {
        ChannelValue::Text(String::new())
    }
}

impl<'de, T: WireValue> Deserialize<'de> for Field<T> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        Ok(match T::from_wire(&value) {
            Some(v) => Field::Valid(v),
            None => Field::Invalid(value),
        })
    }
}

/// A field whose value could not be read as its declared type
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedField {
    pub channel: String,
    pub value: Value,
}

/// Channels, flags and rejected fields of one packet
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PacketChannels {
    pub channels: Channels,
    pub flags: Flags,
    pub rejected: Vec<RejectedField>,
}

/// `stateFlags` keeps its boolean members; anything else reads as empty.
fn lenient_flags<'de, D>(deserializer: D) -> Result<Flags, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Object(map)) => map
            .into_iter()
            .filter_map(|(k, v)| v.as_bool().map(|b| (k, b)))
            .collect(),
        _ => Flags::new(),
    })
}

/// Declares one packet body with explicit optional fields. Anything else the
/// sender includes is kept in `extra` so nothing is silently lost.
macro_rules! packet_body {
    ($(#[$attr:meta])* $name:ident { $($field:ident : $ty:ty => $wire:literal),* $(,)? }) => {
        $(#[$attr])*
        #[derive(Debug, Clone, Default, PartialEq, Deserialize)]
        pub struct $name {
            $(
                #[serde(rename = $wire, default)]
                pub $field: Option<Field<$ty>>,
            )*
            #[serde(rename = "stateFlags", default, deserialize_with = "lenient_flags")]
            pub state_flags: Flags,
            #[serde(flatten)]
            pub extra: BTreeMap<String, Value>,
        }

        impl $name {
            fn split(self, out: &mut PacketChannels) {
                $(
                    match self.$field {
                        Some(Field::Valid(v)) => {
                            out.channels.insert($wire.to_string(), ChannelValue::from(v));
                        }
                        Some(Field::Invalid(value)) => {
                            out.channels.insert($wire.to_string(), <$ty as WireValue>::marker());
                            out.rejected.push(RejectedField { channel: $wire.to_string(), value });
                        }
                        None => {}
                    }
                )*
                out.flags.extend(self.state_flags);
                split_extra(self.extra, &mut out.channels, &mut out.flags);
            }
        }
    };
}

fn split_extra(extra: BTreeMap<String, Value>, channels: &mut Channels, flags: &mut Flags) {
    for (key, value) in extra {
        match value {
            Value::Number(n) => {
                if let Some(v) = n.as_f64() {
                    channels.insert(key, ChannelValue::Number(v));
                }
            }
            Value::String(s) => {
                channels.insert(key, ChannelValue::Text(s));
            }
            Value::Bool(b) => {
                flags.insert(key, b);
            }
            _ => {}
        }
    }
}

packet_body! {
    /// id 2: single-operator console packet
    SingleOperator {}
}

packet_body! {
    /// id 3: flight computer primary (inertial + barometric)
    AvionicsPrimary {
        flight_state: String => "flightState",
        accel_low_x: f64 => "accelLowX",
        accel_low_y: f64 => "accelLowY",
        accel_low_z: f64 => "accelLowZ",
        accel_high_x: f64 => "accelHighX",
        accel_high_y: f64 => "accelHighY",
        accel_high_z: f64 => "accelHighZ",
        gyro_x: f64 => "gyroX",
        gyro_y: f64 => "gyroY",
        gyro_z: f64 => "gyroZ",
        altitude: f64 => "altitude",
        velocity: f64 => "velocity",
        mach_number: f64 => "mach_number",
        mach_speed: f64 => "mach_speed",
    }
}

packet_body! {
    /// id 4: flight computer secondary (position + attitude)
    AvionicsSecondary {
        flight_state: String => "flightState",
        gps_latitude: f64 => "GPSLatitude",
        gps_longitude: f64 => "GPSLongitude",
        navigation_status: String => "navigationStatus",
        qw: f64 => "qw",
        qx: f64 => "qx",
        qy: f64 => "qy",
        qz: f64 => "qz",
    }
}

packet_body! {
    /// id 5: payload status
    PayloadStatus {
        flight_state: String => "flightState",
    }
}

packet_body! {
    /// id 6: pad-side fill system pressures and temperatures
    GsePrimary {
        transducer1: f64 => "transducer1",
        transducer2: f64 => "transducer2",
        transducer3: f64 => "transducer3",
        thermocouple1: f64 => "thermocouple1",
        thermocouple2: f64 => "thermocouple2",
        thermocouple3: f64 => "thermocouple3",
        thermocouple4: f64 => "thermocouple4",
    }
}

packet_body! {
    /// id 7: pad-side auxiliary sensors
    GseSecondary {
        internal_temp: f64 => "internalTemp",
        wind_speed: f64 => "windSpeed",
        gas_bottle_weight1: f64 => "gasBottleWeight1",
        gas_bottle_weight2: f64 => "gasBottleWeight2",
        analog_voltage_input1: f64 => "analogVoltageInput1",
        analog_voltage_input2: f64 => "analogVoltageInput2",
        additional_current_input1: f64 => "additionalCurrentInput1",
        additional_current_input2: f64 => "additionalCurrentInput2",
    }
}

/// Typed packet body, one variant per packet id
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    SingleOperator(SingleOperator),
    AvionicsPrimary(AvionicsPrimary),
    AvionicsSecondary(AvionicsSecondary),
    Payload(PayloadStatus),
    GsePrimary(GsePrimary),
    GseSecondary(GseSecondary),
}

impl Packet {
    pub fn decode(kind: PacketKind, data: Map<String, Value>) -> Result<Self, PacketError> {
        let value = Value::Object(data);
        Ok(match kind {
            PacketKind::SingleOperator => Packet::SingleOperator(serde_json::from_value(value)?),
            PacketKind::AvionicsPrimary => Packet::AvionicsPrimary(serde_json::from_value(value)?),
            PacketKind::AvionicsSecondary => {
                Packet::AvionicsSecondary(serde_json::from_value(value)?)
            }
            PacketKind::Payload => Packet::Payload(serde_json::from_value(value)?),
            PacketKind::GsePrimary => Packet::GsePrimary(serde_json::from_value(value)?),
            PacketKind::GseSecondary => Packet::GseSecondary(serde_json::from_value(value)?),
        })
    }

    pub fn kind(&self) -> PacketKind {
        match self {
            Packet::SingleOperator(_) => PacketKind::SingleOperator,
            Packet::AvionicsPrimary(_) => PacketKind::AvionicsPrimary,
            Packet::AvionicsSecondary(_) => PacketKind::AvionicsSecondary,
            Packet::Payload(_) => PacketKind::Payload,
            Packet::GsePrimary(_) => PacketKind::GsePrimary,
            Packet::GseSecondary(_) => PacketKind::GseSecondary,
        }
    }

    /// Flatten into named channels and boolean flags.
    pub fn into_channels(self) -> PacketChannels {
        let mut out = PacketChannels::default();
        match self {
            Packet::SingleOperator(p) => p.split(&mut out),
            Packet::AvionicsPrimary(p) => p.split(&mut out),
            Packet::AvionicsSecondary(p) => p.split(&mut out),
            Packet::Payload(p) => p.split(&mut out),
            Packet::GsePrimary(p) => p.split(&mut out),
            Packet::GseSecondary(p) => p.split(&mut out),
        }
        out
    }
}
