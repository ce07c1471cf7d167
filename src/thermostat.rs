//! Thermostat-shaped command surface over the raw DP engine.
//!
//! Translates DP deltas into typed attribute events, derives the operating
//! state, and keeps the two setpoint channels coherent across mode changes.

use crate::device::{Device, DeviceEvent};
use crate::dps::{
    AttributeUpdate, DP_ECO_MODE, DP_FAN, DP_HORIZ_SWING, DP_MODE, DP_POWER, DP_SLEEP_MODE,
    DP_TARGET_TEMP, DP_VERT_SWING, DpSnapshot, DpValue, FanSpeed, HorizontalSwing, Mode,
    OperatingState, VerticalSwing, attribute_update, encode_setpoint,
};
use crate::error::{Result, TuyaError};
use futures_core::stream::Stream;
use log::debug;
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

/// Events published to thermostat subscribers: presence, raw DP deltas and
/// the typed attributes derived from them.
#[derive(Debug, Clone)]
pub enum ThermostatEvent {
    Connected,
    Disconnected,
    Dp { dp: u32, value: DpValue },
    Attribute(AttributeUpdate),
    OperatingState(OperatingState),
}

/// Setpoint channels and the last derived state, fed by the event stream.
#[derive(Debug, Default, Clone)]
struct DerivedState {
    cooling_setpoint: Option<f64>,
    heating_setpoint: Option<f64>,
    operating_state: Option<OperatingState>,
}

/// Thermostat-shaped status for hosts and the HTTP bridge.
#[derive(Debug, Clone, Serialize)]
pub struct StatusView {
    pub online: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub power: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<Mode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_temp: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_temp: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fan: Option<FanSpeed>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub humidity: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vert_swing: Option<VerticalSwing>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub horiz_swing: Option<HorizontalSwing>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter_dirty: Option<bool>,
    pub operating_state: OperatingState,
    pub raw_dps: Value,
}

impl StatusView {
    fn from_snapshot(snapshot: &DpSnapshot, online: bool) -> Self {
        Self {
            online,
            power: snapshot.power(),
            mode: snapshot.mode(),
            target_temp: snapshot.target_temp_f(),
            current_temp: snapshot.current_temp_f(),
            fan: snapshot.fan(),
            humidity: snapshot.humidity(),
            vert_swing: snapshot.vertical_swing(),
            horiz_swing: snapshot.horizontal_swing(),
            filter_dirty: snapshot.filter_dirty(),
            operating_state: snapshot.operating_state(),
            raw_dps: snapshot.to_json(),
        }
    }
}

/// High-level controller for one Pioneer WYT unit.
#[derive(Clone)]
pub struct Thermostat {
    device: Device,
    state: Arc<RwLock<DerivedState>>,
    events_tx: broadcast::Sender<ThermostatEvent>,
}

impl Thermostat {
    pub fn new(device: Device) -> Self {
        let (events_tx, _) = broadcast::channel(32);
        let state = Arc::new(RwLock::new(DerivedState::default()));

        let thermostat = Self {
            device,
            state,
            events_tx,
        };
        thermostat.spawn_translator();
        thermostat
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn is_connected(&self) -> bool {
        self.device.is_connected()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ThermostatEvent> {
        self.events_tx.subscribe()
    }

    /// Returns a Stream of thermostat events.
    pub fn events(&self) -> impl Stream<Item = ThermostatEvent> + Send + 'static {
        let mut rx = self.events_tx.subscribe();
        async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => yield event,
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                }
            }
        }
    }

    /// Current status from the last known DP state; no network round-trip.
    pub fn status(&self) -> StatusView {
        StatusView::from_snapshot(&self.device.snapshot(), self.device.is_connected())
    }

    /// Setpoint last seen while cooling, °F.
    pub fn cooling_setpoint(&self) -> Option<f64> {
        self.state.read().expect("state lock poisoned").cooling_setpoint
    }

    /// Setpoint last seen while heating, °F.
    pub fn heating_setpoint(&self) -> Option<f64> {
        self.state.read().expect("state lock poisoned").heating_setpoint
    }

    pub async fn on(&self) -> Result<()> {
        self.device.set_value(DP_POWER, json!(true)).await
    }

    pub async fn off(&self) -> Result<()> {
        self.device.set_value(DP_POWER, json!(false)).await
    }

    /// Switch operating mode; powers the unit on in the same write so the
    /// mode change is never a no-op on a sleeping unit.
    pub async fn set_mode(&self, mode: Mode) -> Result<()> {
        self.device
            .set_dps(json!({
                DP_POWER.to_string(): true,
                DP_MODE.to_string(): mode.to_wire(),
            }))
            .await
    }

    /// Set the target temperature in °F; values outside 61..=86 clamp.
    pub async fn set_target_temp(&self, fahrenheit: f64) -> Result<()> {
        if !fahrenheit.is_finite() {
            return Err(TuyaError::BadValue(format!(
                "target temperature must be finite, got {fahrenheit}"
            )));
        }
        self.device
            .set_value(DP_TARGET_TEMP, json!(encode_setpoint(fahrenheit)))
            .await
    }

    pub async fn set_fan(&self, fan: FanSpeed) -> Result<()> {
        self.device.set_value(DP_FAN, json!(fan.to_wire())).await
    }

    pub async fn set_vertical_swing(&self, position: VerticalSwing) -> Result<()> {
        self.device
            .set_value(DP_VERT_SWING, json!(position.to_wire()))
            .await
    }

    pub async fn set_horizontal_swing(&self, position: HorizontalSwing) -> Result<()> {
        self.device
            .set_value(DP_HORIZ_SWING, json!(position.to_wire()))
            .await
    }

    pub async fn set_sleep_mode(&self, enabled: bool) -> Result<()> {
        self.device.set_value(DP_SLEEP_MODE, json!(enabled)).await
    }

    pub async fn set_eco_mode(&self, enabled: bool) -> Result<()> {
        self.device.set_value(DP_ECO_MODE, json!(enabled)).await
    }

    /// Round-trip refresh: query the device and return the new status.
    pub async fn refresh(&self) -> Result<StatusView> {
        let snapshot = self.device.query().await?;
        Ok(StatusView::from_snapshot(&snapshot, true))
    }

    pub async fn disconnect(&self) {
        self.device.disconnect().await;
    }

    pub async fn stop(&self) {
        self.device.stop().await;
    }

    fn spawn_translator(&self) {
        let mut rx = self.device.subscribe();
        let device = self.device.clone();
        let state = self.state.clone();
        let events_tx = self.events_tx.clone();

        tokio::spawn(async move {
            loop {
                let event = match rx.recv().await {
                    Ok(e) => e,
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!("Thermostat event translator lagged by {} events", n);
                        continue;
                    }
                };
                let out = {
                    let mut derived = state.write().expect("state lock poisoned");
                    translate(&mut derived, &device.snapshot(), event)
                };
                for event in out {
                    let _ = events_tx.send(event);
                }
            }
        });
    }
}

/// Map one device event to thermostat events, updating the derived state.
/// The snapshot has already absorbed the delta when this runs.
fn translate(
    state: &mut DerivedState,
    snapshot: &DpSnapshot,
    event: DeviceEvent,
) -> Vec<ThermostatEvent> {
    let mut out = Vec::new();
    match event {
        DeviceEvent::Connected => out.push(ThermostatEvent::Connected),
        DeviceEvent::Disconnected => out.push(ThermostatEvent::Disconnected),
        DeviceEvent::Dp { dp, value } => {
            out.push(ThermostatEvent::Dp {
                dp,
                value: value.clone(),
            });
            if let Some(update) = attribute_update(dp, &value) {
                if let AttributeUpdate::TargetTemperature(setpoint) = update {
                    // Only the active channel mirrors DP 2; the inactive
                    // one keeps its last value across mode changes.
                    match snapshot.mode() {
                        Some(Mode::Heat) => state.heating_setpoint = Some(setpoint),
                        Some(Mode::Cool) => state.cooling_setpoint = Some(setpoint),
                        _ => {}
                    }
                }
                out.push(ThermostatEvent::Attribute(update));
            }
            if matches!(dp, DP_POWER | DP_MODE) {
                let current = snapshot.operating_state();
                if state.operating_state != Some(current) {
                    state.operating_state = Some(current);
                    out.push(ThermostatEvent::OperatingState(current));
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot_with(dps: Value) -> DpSnapshot {
        let mut snapshot = DpSnapshot::new();
        snapshot.apply(&dps);
        snapshot
    }

    fn dp_event(dp: u32, value: Value) -> DeviceEvent {
        DeviceEvent::Dp {
            dp,
            value: DpValue::from_json(&value).unwrap(),
        }
    }

    #[test]
    fn status_push_produces_typed_events_and_operating_state() {
        let mut state = DerivedState::default();
        let snapshot = snapshot_with(json!({"1": true, "2": 720, "4": "cold"}));

        let mut events = Vec::new();
        events.extend(translate(&mut state, &snapshot, dp_event(1, json!(true))));
        events.extend(translate(&mut state, &snapshot, dp_event(2, json!(720))));
        events.extend(translate(&mut state, &snapshot, dp_event(4, json!("cold"))));

        assert!(events
            .iter()
            .any(|e| matches!(e, ThermostatEvent::Attribute(AttributeUpdate::Power(true)))));
        assert!(events.iter().any(|e| matches!(
            e,
            ThermostatEvent::Attribute(AttributeUpdate::TargetTemperature(t)) if *t == 72.0
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            ThermostatEvent::Attribute(AttributeUpdate::Mode(Mode::Cool))
        )));
        assert!(events
            .iter()
            .any(|e| matches!(e, ThermostatEvent::OperatingState(OperatingState::Cooling))));
    }

    #[test]
    fn operating_state_only_fires_on_change() {
        let mut state = DerivedState::default();
        let snapshot = snapshot_with(json!({"1": true, "4": "cold"}));

        let first = translate(&mut state, &snapshot, dp_event(1, json!(true)));
        assert!(first
            .iter()
            .any(|e| matches!(e, ThermostatEvent::OperatingState(_))));

        // Same derived state again: raw delta only
        let second = translate(&mut state, &snapshot, dp_event(4, json!("cold")));
        assert!(!second
            .iter()
            .any(|e| matches!(e, ThermostatEvent::OperatingState(_))));
    }

    #[test]
    fn inactive_setpoint_channel_survives_mode_change() {
        let mut state = DerivedState::default();

        // Cooling at 72
        let cooling = snapshot_with(json!({"1": true, "2": 720, "4": "cold"}));
        translate(&mut state, &cooling, dp_event(2, json!(720)));
        assert_eq!(state.cooling_setpoint, Some(72.0));
        assert_eq!(state.heating_setpoint, None);

        // Switch to heat at 68: cooling channel untouched
        let heating = snapshot_with(json!({"1": true, "2": 680, "4": "hot"}));
        translate(&mut state, &heating, dp_event(4, json!("hot")));
        translate(&mut state, &heating, dp_event(2, json!(680)));
        assert_eq!(state.heating_setpoint, Some(68.0));
        assert_eq!(state.cooling_setpoint, Some(72.0));
    }

    #[test]
    fn presence_events_pass_through() {
        let mut state = DerivedState::default();
        let snapshot = DpSnapshot::new();
        let up = translate(&mut state, &snapshot, DeviceEvent::Connected);
        assert!(matches!(up.as_slice(), [ThermostatEvent::Connected]));
        let down = translate(&mut state, &snapshot, DeviceEvent::Disconnected);
        assert!(matches!(down.as_slice(), [ThermostatEvent::Disconnected]));
    }

    #[test]
    fn status_view_serializes_thermostat_shape() {
        let snapshot = snapshot_with(json!({
            "1": true, "2": 720, "3": 22, "4": "cold", "5": "quiet",
            "18": 45, "113": "off", "131": false
        }));
        let view = StatusView::from_snapshot(&snapshot, true);
        let body = serde_json::to_value(&view).unwrap();
        assert_eq!(body["online"], true);
        assert_eq!(body["mode"], "cool");
        assert_eq!(body["fan"], "low");
        assert_eq!(body["target_temp"], 72.0);
        assert_eq!(body["current_temp"], 71.6);
        assert_eq!(body["operating_state"], "cooling");
        assert_eq!(body["raw_dps"]["2"], 720);
        assert!(body.get("horiz_swing").is_none());
    }
}
