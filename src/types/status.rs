//! Last-known pump state

use serde::{Deserialize, Serialize};
use std::time::SystemTime;

use super::TempBasalDescriptor;

/// Scalar fields of [`StatusSnapshot`] that family status rules can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusField {
    ReservoirUnits,
    BatteryPercent,
    BatteryVoltage,
    BolusStep,
    BasalStep,
    MaxBolus,
    ExtendedBolusEnabled,
    HardwareModel,
    ProtocolVersion,
    ProductCode,
    LastBolusUnits,
}

/// Coalesced view of the most recent fully decoded pump state.
///
/// Snapshots are immutable once published; the status store replaces the
/// whole value on every update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub reservoir_units: Option<f64>,
    pub battery_percent: Option<u8>,
    pub battery_voltage: Option<f64>,
    pub temp_basal: Option<TempBasalDescriptor>,
    pub temp_basal_estimated_end: Option<SystemTime>,
    pub bolus_step: Option<f64>,
    pub basal_step: Option<f64>,
    pub max_bolus: Option<f64>,
    pub extended_bolus_enabled: Option<bool>,
    pub hardware_model: Option<u8>,
    pub protocol_version: Option<u8>,
    pub product_code: Option<u8>,
    pub last_bolus_units: Option<f64>,
    pub last_communication: Option<SystemTime>,
}

impl StatusSnapshot {
    /// Read a scalar field as `f64`. Booleans read as `0.0`/`1.0`.
    pub fn field(&self, field: StatusField) -> Option<f64> {
        match field {
            StatusField::ReservoirUnits => self.reservoir_units,
            StatusField::BatteryPercent => self.battery_percent.map(f64::from),
            StatusField::BatteryVoltage => self.battery_voltage,
            StatusField::BolusStep => self.bolus_step,
            StatusField::BasalStep => self.basal_step,
            StatusField::MaxBolus => self.max_bolus,
            StatusField::ExtendedBolusEnabled => {
                self.extended_bolus_enabled.map(|enabled| if enabled { 1.0 } else { 0.0 })
            }
            StatusField::HardwareModel => self.hardware_model.map(f64::from),
            StatusField::ProtocolVersion => self.protocol_version.map(f64::from),
            StatusField::ProductCode => self.product_code.map(f64::from),
            StatusField::LastBolusUnits => self.last_bolus_units,
        }
    }

    /// Write a scalar field. Integer fields saturate into `u8`.
    pub fn set_field(&mut self, field: StatusField, value: f64) {
        let as_u8 = || value.round().clamp(0.0, f64::from(u8::MAX)) as u8;
        match field {
            StatusField::ReservoirUnits => self.reservoir_units = Some(value),
            StatusField::BatteryPercent => self.battery_percent = Some(as_u8().min(100)),
            StatusField::BatteryVoltage => self.battery_voltage = Some(value),
            StatusField::BolusStep => self.bolus_step = Some(value),
            StatusField::BasalStep => self.basal_step = Some(value),
            StatusField::MaxBolus => self.max_bolus = Some(value),
            StatusField::ExtendedBolusEnabled => self.extended_bolus_enabled = Some(value != 0.0),
            StatusField::HardwareModel => self.hardware_model = Some(as_u8()),
            StatusField::ProtocolVersion => self.protocol_version = Some(as_u8()),
            StatusField::ProductCode => self.product_code = Some(as_u8()),
            StatusField::LastBolusUnits => self.last_bolus_units = Some(value),
        }
    }

    /// Battery is known and at or below `threshold_percent`.
    pub fn low_battery(&self, threshold_percent: u8) -> bool {
        self.battery_percent.is_some_and(|percent| percent <= threshold_percent)
    }

    /// Set or clear the temp basal, keeping the estimated end consistent.
    pub fn set_temp_basal(&mut self, temp_basal: Option<TempBasalDescriptor>, received_at: SystemTime) {
        self.temp_basal_estimated_end = temp_basal.map(|tbr| tbr.estimated_end(received_at));
        self.temp_basal = temp_basal;
    }

    pub fn clear_temp_basal(&mut self) {
        self.temp_basal = None;
        self.temp_basal_estimated_end = None;
    }

    /// Temp basal end: confirmed when the start is known, estimated otherwise.
    pub fn temp_basal_end(&self) -> Option<SystemTime> {
        self.temp_basal.and_then(|tbr| tbr.end()).or(self.temp_basal_estimated_end)
    }
}
