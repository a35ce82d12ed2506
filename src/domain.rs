//! ==============================================================================
//! domain.rs - the rig's sensor record and partial updates to it
//! ==============================================================================
//!
//! purpose:
//!     `SensorState` is the full, always-populated view of the rig.
//!     `SensorUpdate` is a partial write: every field optional, decoded from the
//!     wire with the fixed schema. keys outside the schema never make it past
//!     serde, so the store cannot be polluted by new upstream fields.
//!
//! wire names:
//!     the environment publisher speaks spanish json keys (temp1_C, humedad1_RH,
//!     ventiladores, ...). rust names are english; serde renames bridge them.
//!
//! relationships:
//!     - used by: store.rs (apply), bus.rs (decode), serial.rs (mass updates)
//!
//! ==============================================================================

use serde::de::{DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};

/// number of thermocouple channels on the rig
pub const THERMOCOUPLE_COUNT: usize = 6;
/// number of fan relays on the rig
pub const FAN_COUNT: usize = 3;

/// textual mass before the scale has said anything
pub const DEFAULT_MASS_TEXT: &str = "0.00";

/// current sensor readings
///
/// `mass_text` is authoritative for persistence (exact scale output, comma
/// separators kept). `mass_g` is the best-effort number for display.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SensorState {
    /// publisher-supplied timestamp (ms)
    pub timestamp_ms: u64,
    #[serde(rename = "temp1_C")]
    pub temperature1_c: f64,
    #[serde(rename = "humedad1_RH")]
    pub humidity1_rh: f64,
    #[serde(rename = "temperatura2_C")]
    pub temperature2_c: f64,
    #[serde(rename = "humedad2_RH")]
    pub humidity2_rh: f64,
    #[serde(rename = "radiacion_W_m2")]
    pub radiation_w_m2: f64,
    #[serde(rename = "termopares_C")]
    pub thermocouples_c: [f64; THERMOCOUPLE_COUNT],
    /// fan relay states, on = true
    #[serde(rename = "ventiladores")]
    pub fans: [bool; FAN_COUNT],
    #[serde(rename = "masa_g")]
    pub mass_g: f64,
    #[serde(rename = "masa_str")]
    pub mass_text: String,
}

impl Default for SensorState {
    fn default() -> Self {
        Self {
            timestamp_ms: 0,
            temperature1_c: 0.0,
            humidity1_rh: 0.0,
            temperature2_c: 0.0,
            humidity2_rh: 0.0,
            radiation_w_m2: 0.0,
            thermocouples_c: [0.0; THERMOCOUPLE_COUNT],
            fans: [false; FAN_COUNT],
            mass_g: 0.0,
            mass_text: DEFAULT_MASS_TEXT.to_string(),
        }
    }
}

impl SensorState {
    /// merge a partial update, returning how many fields were written
    pub fn apply(&mut self, update: SensorUpdate) -> usize {
        let mut written = 0;

        fn set<T>(slot: &mut T, value: Option<T>, written: &mut usize) {
            if let Some(v) = value {
                *slot = v;
                *written += 1;
            }
        }

        set(&mut self.timestamp_ms, update.timestamp_ms, &mut written);
        // current key wins over the legacy one when a payload carries both
        set(
            &mut self.temperature1_c,
            update.temperature1_c.or(update.legacy_temperature1_c),
            &mut written,
        );
        set(&mut self.humidity1_rh, update.humidity1_rh, &mut written);
        set(&mut self.temperature2_c, update.temperature2_c, &mut written);
        set(&mut self.humidity2_rh, update.humidity2_rh, &mut written);
        set(&mut self.radiation_w_m2, update.radiation_w_m2, &mut written);

        match update.thermocouples_c {
            Some(all) => set(&mut self.thermocouples_c, Some(all), &mut written),
            None => {
                set(&mut self.thermocouples_c[0], update.legacy_thermocouple1_c, &mut written);
                set(&mut self.thermocouples_c[1], update.legacy_thermocouple2_c, &mut written);
            }
        }

        set(&mut self.fans, update.fans, &mut written);
        set(&mut self.mass_g, update.mass_g, &mut written);
        set(&mut self.mass_text, update.mass_text, &mut written);

        written
    }
}

/// a partial write to `SensorState`
///
/// unknown keys are ignored by serde. a known key whose value has the wrong
/// shape (string where a number belongs, short fan array, null) is dropped on
/// its own; the rest of the payload still applies.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct SensorUpdate {
    /// publishers that send fractional milliseconds are truncated; negative or
    /// non-numeric timestamps are dropped like any other wrong-shaped field
    #[serde(default, deserialize_with = "timestamp")]
    pub timestamp_ms: Option<u64>,
    #[serde(rename = "temp1_C", default, deserialize_with = "lenient")]
    pub temperature1_c: Option<f64>,
    #[serde(rename = "temperatura1_C", default, deserialize_with = "lenient")]
    pub legacy_temperature1_c: Option<f64>,
    #[serde(rename = "humedad1_RH", default, deserialize_with = "lenient")]
    pub humidity1_rh: Option<f64>,
    #[serde(rename = "temperatura2_C", default, deserialize_with = "lenient")]
    pub temperature2_c: Option<f64>,
    #[serde(rename = "humedad2_RH", default, deserialize_with = "lenient")]
    pub humidity2_rh: Option<f64>,
    #[serde(rename = "radiacion_W_m2", default, deserialize_with = "lenient")]
    pub radiation_w_m2: Option<f64>,
    #[serde(rename = "termopares_C", default, deserialize_with = "lenient")]
    pub thermocouples_c: Option<[f64; THERMOCOUPLE_COUNT]>,
    #[serde(rename = "termopar1_C", default, deserialize_with = "lenient")]
    pub legacy_thermocouple1_c: Option<f64>,
    #[serde(rename = "termopar2_C", default, deserialize_with = "lenient")]
    pub legacy_thermocouple2_c: Option<f64>,
    #[serde(rename = "ventiladores", default, deserialize_with = "lenient")]
    pub fans: Option<[bool; FAN_COUNT]>,
    #[serde(rename = "masa_g", default, deserialize_with = "lenient")]
    pub mass_g: Option<f64>,
    #[serde(rename = "masa_str", default, deserialize_with = "lenient")]
    pub mass_text: Option<String>,
}

impl SensorUpdate {
    /// update carrying only the scale's reading
    pub fn mass(text: String, grams: Option<f64>) -> Self {
        Self {
            mass_text: Some(text),
            mass_g: grams,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// accept the field if it has the right shape, otherwise treat it as absent
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}

/// whole milliseconds from an integer or a non-negative float
fn timestamp<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    let serde_json::Value::Number(n) = value else {
        return Ok(None);
    };
    if let Some(ms) = n.as_u64() {
        return Ok(Some(ms));
    }
    Ok(n.as_f64()
        .filter(|ms| ms.is_finite() && *ms >= 0.0 && *ms < u64::MAX as f64)
        .map(|ms| ms as u64))
}
