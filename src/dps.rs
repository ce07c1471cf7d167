//! Data-point table and thermostat domain model for the Pioneer WYT
//! (Diamante) family. The DP ids, wire enums and unit conventions are fixed
//! per device family; everything here is immutable configuration data.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub const DP_POWER: u32 = 1;
pub const DP_TARGET_TEMP: u32 = 2;
pub const DP_CURRENT_TEMP: u32 = 3;
pub const DP_MODE: u32 = 4;
pub const DP_FAN: u32 = 5;
pub const DP_HUMIDITY: u32 = 18;
pub const DP_FAULT_CODE: u32 = 20;
pub const DP_SLEEP_MODE: u32 = 105;
pub const DP_VERT_SWING: u32 = 113;
pub const DP_HORIZ_SWING: u32 = 114;
pub const DP_ECO_MODE: u32 = 119;
pub const DP_DISPLAY_BEEP: u32 = 123;
pub const DP_VERT_POSITION: u32 = 126;
pub const DP_HORIZ_POSITION: u32 = 127;
pub const DP_FILTER_DIRTY: u32 = 131;

/// Setpoint wire range: °F × 10.
pub const SETPOINT_MIN: i64 = 610;
pub const SETPOINT_MAX: i64 = 860;

/// One untyped DP scalar as it appears in a `dps` JSON object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DpValue {
    Bool(bool),
    Int(i64),
    Enum(String),
}

impl DpValue {
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(DpValue::Bool(*b)),
            Value::Number(n) => n.as_i64().map(DpValue::Int),
            Value::String(s) => Some(DpValue::Enum(s.clone())),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            DpValue::Bool(b) => Value::Bool(*b),
            DpValue::Int(i) => Value::from(*i),
            DpValue::Enum(s) => Value::String(s.clone()),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            DpValue::Bool(b) => Some(*b),
            // Some firmware reports the sleep/eco switches as enum strings
            DpValue::Enum(s) => match s.as_str() {
                "on" | "true" => Some(true),
                "off" | "false" => Some(false),
                _ => None,
            },
            DpValue::Int(_) => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            DpValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_enum(&self) -> Option<&str> {
        match self {
            DpValue::Enum(s) => Some(s),
            _ => None,
        }
    }
}

/// Operating mode, domain side. Wire names follow the Tuya firmware
/// (`cold`, `hot`, `wet`, `wind`, `auto`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Cool,
    Heat,
    Dry,
    FanOnly,
    Auto,
}

impl Mode {
    pub fn to_wire(self) -> &'static str {
        match self {
            Mode::Cool => "cold",
            Mode::Heat => "hot",
            Mode::Dry => "wet",
            Mode::FanOnly => "wind",
            Mode::Auto => "auto",
        }
    }

    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "cold" => Some(Mode::Cool),
            "hot" => Some(Mode::Heat),
            "wet" => Some(Mode::Dry),
            "wind" => Some(Mode::FanOnly),
            "auto" => Some(Mode::Auto),
            _ => None,
        }
    }

    pub const ALL: [Mode; 5] = [Mode::Cool, Mode::Heat, Mode::Dry, Mode::FanOnly, Mode::Auto];
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Mode::Cool => "cool",
            Mode::Heat => "heat",
            Mode::Dry => "dry",
            Mode::FanOnly => "fan_only",
            Mode::Auto => "auto",
        };
        f.write_str(s)
    }
}

impl FromStr for Mode {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "cool" => Ok(Mode::Cool),
            "heat" => Ok(Mode::Heat),
            "dry" => Ok(Mode::Dry),
            "fan_only" | "fan" => Ok(Mode::FanOnly),
            "auto" => Ok(Mode::Auto),
            _ => Err(()),
        }
    }
}

/// Fan speed, domain side. The firmware distinguishes seven wire speeds;
/// the thermostat surface collapses them to three plus auto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanSpeed {
    Low,
    Medium,
    High,
    Auto,
}

impl FanSpeed {
    pub fn to_wire(self) -> &'static str {
        match self {
            FanSpeed::Low => "low",
            FanSpeed::Medium => "medium",
            FanSpeed::High => "high",
            FanSpeed::Auto => "auto",
        }
    }

    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "quiet" | "low" => Some(FanSpeed::Low),
            "medium-low" | "medium" | "medium-high" => Some(FanSpeed::Medium),
            "high" | "strong" => Some(FanSpeed::High),
            "auto" => Some(FanSpeed::Auto),
            _ => None,
        }
    }
}

impl fmt::Display for FanSpeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_wire())
    }
}

impl FromStr for FanSpeed {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        FanSpeed::from_wire(s).ok_or(())
    }
}

/// Vertical louver setting (DP 113). Wire and domain names coincide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerticalSwing {
    Off,
    Full,
    Upper,
    Lower,
}

impl VerticalSwing {
    pub fn to_wire(self) -> &'static str {
        match self {
            VerticalSwing::Off => "off",
            VerticalSwing::Full => "full",
            VerticalSwing::Upper => "upper",
            VerticalSwing::Lower => "lower",
        }
    }

    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "off" => Some(VerticalSwing::Off),
            "full" => Some(VerticalSwing::Full),
            "upper" => Some(VerticalSwing::Upper),
            "lower" => Some(VerticalSwing::Lower),
            _ => None,
        }
    }
}

impl FromStr for VerticalSwing {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        VerticalSwing::from_wire(s).ok_or(())
    }
}

/// Horizontal louver setting (DP 114).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HorizontalSwing {
    Off,
    Full,
    Left,
    Center,
    Right,
}

impl HorizontalSwing {
    pub fn to_wire(self) -> &'static str {
        match self {
            HorizontalSwing::Off => "off",
            HorizontalSwing::Full => "full",
            HorizontalSwing::Left => "left",
            HorizontalSwing::Center => "center",
            HorizontalSwing::Right => "right",
        }
    }

    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "off" => Some(HorizontalSwing::Off),
            "full" => Some(HorizontalSwing::Full),
            "left" => Some(HorizontalSwing::Left),
            "center" => Some(HorizontalSwing::Center),
            "right" => Some(HorizontalSwing::Right),
            _ => None,
        }
    }
}

impl FromStr for HorizontalSwing {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        HorizontalSwing::from_wire(s).ok_or(())
    }
}

/// Derived equipment state; not a DP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatingState {
    Cooling,
    Heating,
    FanOnly,
    Idle,
}

pub fn operating_state(power: bool, mode: Option<Mode>) -> OperatingState {
    if !power {
        return OperatingState::Idle;
    }
    match mode {
        Some(Mode::Cool) => OperatingState::Cooling,
        Some(Mode::Heat) => OperatingState::Heating,
        Some(Mode::FanOnly) => OperatingState::FanOnly,
        // Dry and auto report as cooling-adjacent on the panel; without a
        // compressor telemetry DP the conservative derivation is idle.
        _ => OperatingState::Idle,
    }
}

/// Setpoint °F → wire (°F × 10), rounded and clamped to the unit's range.
pub fn encode_setpoint(fahrenheit: f64) -> i64 {
    ((fahrenheit * 10.0).round() as i64).clamp(SETPOINT_MIN, SETPOINT_MAX)
}

/// Wire setpoint → °F.
pub fn decode_setpoint(raw: i64) -> f64 {
    raw as f64 / 10.0
}

/// Room temperature is reported in whole °C; the °F reading keeps one
/// decimal, like the panel display.
pub fn celsius_to_fahrenheit(celsius: f64) -> f64 {
    ((celsius * 9.0 / 5.0 + 32.0) * 10.0).round() / 10.0
}

/// Typed view of one DP delta, as published to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeUpdate {
    Power(bool),
    /// Active setpoint, °F
    TargetTemperature(f64),
    /// Room temperature, °F
    CurrentTemperature(f64),
    Mode(Mode),
    Fan(FanSpeed),
    /// Relative humidity, percent
    Humidity(i64),
    FaultCode(i64),
    SleepMode(bool),
    VerticalSwing(VerticalSwing),
    HorizontalSwing(HorizontalSwing),
    EcoMode(bool),
    /// Opaque display/beep bitfield
    DisplayBeep(i64),
    FilterDirty(bool),
}

/// Map one DP delta to its typed attribute, if the DP has one. Unknown and
/// opaque DPs yield `None` and surface as raw deltas only.
pub fn attribute_update(dp: u32, value: &DpValue) -> Option<AttributeUpdate> {
    match dp {
        DP_POWER => value.as_bool().map(AttributeUpdate::Power),
        DP_TARGET_TEMP => value
            .as_int()
            .map(|raw| AttributeUpdate::TargetTemperature(decode_setpoint(raw))),
        DP_CURRENT_TEMP => value
            .as_int()
            .map(|c| AttributeUpdate::CurrentTemperature(celsius_to_fahrenheit(c as f64))),
        DP_MODE => value
            .as_enum()
            .and_then(Mode::from_wire)
            .map(AttributeUpdate::Mode),
        DP_FAN => value
            .as_enum()
            .and_then(FanSpeed::from_wire)
            .map(AttributeUpdate::Fan),
        DP_HUMIDITY => value.as_int().map(AttributeUpdate::Humidity),
        DP_FAULT_CODE => value.as_int().map(AttributeUpdate::FaultCode),
        DP_SLEEP_MODE => value.as_bool().map(AttributeUpdate::SleepMode),
        DP_VERT_SWING => value
            .as_enum()
            .and_then(VerticalSwing::from_wire)
            .map(AttributeUpdate::VerticalSwing),
        DP_HORIZ_SWING => value
            .as_enum()
            .and_then(HorizontalSwing::from_wire)
            .map(AttributeUpdate::HorizontalSwing),
        DP_ECO_MODE => value.as_bool().map(AttributeUpdate::EcoMode),
        DP_DISPLAY_BEEP => value.as_int().map(AttributeUpdate::DisplayBeep),
        DP_FILTER_DIRTY => value.as_bool().map(AttributeUpdate::FilterDirty),
        _ => None,
    }
}

/// The device's last known DP state, owned by the device task and exposed
/// to readers through a guarded snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DpSnapshot {
    values: BTreeMap<u32, DpValue>,
}

impl DpSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, dp: u32) -> Option<&DpValue> {
        self.values.get(&dp)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&u32, &DpValue)> {
        self.values.iter()
    }

    /// Merge a received `dps` JSON object; returns the deltas (DPs whose
    /// value is new or changed) in ascending DP order.
    pub fn apply(&mut self, dps: &Value) -> Vec<(u32, DpValue)> {
        let mut deltas = Vec::new();
        let Some(map) = dps.as_object() else {
            return deltas;
        };
        for (key, raw) in map {
            let Ok(dp) = key.parse::<u32>() else {
                continue;
            };
            let Some(value) = DpValue::from_json(raw) else {
                continue;
            };
            if self.values.get(&dp) != Some(&value) {
                self.values.insert(dp, value.clone());
                deltas.push((dp, value));
            }
        }
        deltas.sort_by_key(|(dp, _)| *dp);
        deltas
    }

    /// Raw `dps` object for serialization back out (bridge `raw_dps`).
    pub fn to_json(&self) -> Value {
        Value::Object(
            self.values
                .iter()
                .map(|(dp, v)| (dp.to_string(), v.to_json()))
                .collect(),
        )
    }

    pub fn power(&self) -> Option<bool> {
        self.get(DP_POWER).and_then(DpValue::as_bool)
    }

    pub fn target_temp_f(&self) -> Option<f64> {
        self.get(DP_TARGET_TEMP)
            .and_then(DpValue::as_int)
            .map(decode_setpoint)
    }

    pub fn current_temp_f(&self) -> Option<f64> {
        self.get(DP_CURRENT_TEMP)
            .and_then(DpValue::as_int)
            .map(|c| celsius_to_fahrenheit(c as f64))
    }

    pub fn mode(&self) -> Option<Mode> {
        self.get(DP_MODE).and_then(DpValue::as_enum).and_then(Mode::from_wire)
    }

    pub fn fan(&self) -> Option<FanSpeed> {
        self.get(DP_FAN)
            .and_then(DpValue::as_enum)
            .and_then(FanSpeed::from_wire)
    }

    pub fn humidity(&self) -> Option<i64> {
        self.get(DP_HUMIDITY).and_then(DpValue::as_int)
    }

    pub fn vertical_swing(&self) -> Option<VerticalSwing> {
        self.get(DP_VERT_SWING)
            .and_then(DpValue::as_enum)
            .and_then(VerticalSwing::from_wire)
    }

    pub fn horizontal_swing(&self) -> Option<HorizontalSwing> {
        self.get(DP_HORIZ_SWING)
            .and_then(DpValue::as_enum)
            .and_then(HorizontalSwing::from_wire)
    }

    pub fn filter_dirty(&self) -> Option<bool> {
        self.get(DP_FILTER_DIRTY).and_then(DpValue::as_bool)
    }

    pub fn operating_state(&self) -> OperatingState {
        operating_state(self.power().unwrap_or(false), self.mode())
    }
}
