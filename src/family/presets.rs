//! Built-in family descriptors

use std::collections::HashMap;

use super::{
    FamilyDescriptor, FieldEncoding, FieldQuirk, IntegrityKind, OpcodeWidth, StatusRule,
    TempBasalRule,
};
use crate::refresh::RefreshKind;
use crate::types::{Opcode, StatusField};

/// Tubed pump over a serial link, plaintext records with a two-byte opcode.
pub fn dana_r() -> FamilyDescriptor {
    FamilyDescriptor {
        name: "dana-r".to_string(),
        sync: vec![0x7E, 0x7E],
        opcode_width: OpcodeWidth::Two,
        integrity: IntegrityKind::Crc16CcittFalse,
        encrypted: false,
        handshake_opcode: Opcode(0x3001),
        max_payload: 256,
        max_sequence: u16::MAX,
        status_rules: vec![
            // init connection status: bolus config
            StatusRule::new(0x0302, StatusField::ExtendedBolusEnabled, 0, FieldEncoding::Bit(0)),
            StatusRule::new(0x0302, StatusField::BolusStep, 1, FieldEncoding::U8).scaled(0.01),
            StatusRule::new(0x0302, StatusField::MaxBolus, 2, FieldEncoding::U16Be).scaled(0.01),
            // meal settings
            StatusRule::new(0x3203, StatusField::BasalStep, 0, FieldEncoding::U8).scaled(0.01),
            StatusRule::new(0x3203, StatusField::BolusStep, 1, FieldEncoding::U8).scaled(0.01),
            // basic status
            StatusRule::new(0x020B, StatusField::ReservoirUnits, 0, FieldEncoding::U16Be)
                .scaled(0.01),
            StatusRule::new(0x020B, StatusField::BatteryPercent, 2, FieldEncoding::U8),
            StatusRule::new(0x0207, StatusField::LastBolusUnits, 0, FieldEncoding::U16Be)
                .scaled(0.01),
        ],
        temp_basal: Some(TempBasalRule { opcode: Opcode(0x0205), offset: 0, rate_scale: 0.01 }),
        quirks: Vec::new(),
        refresh_opcodes: HashMap::from([
            (RefreshKind::PumpStatus, Opcode(0x020B)),
            (RefreshKind::RemainingInsulin, Opcode(0x020B)),
            (RefreshKind::BatteryStatus, Opcode(0x020B)),
            (RefreshKind::Configuration, Opcode(0x3203)),
            (RefreshKind::TemporaryBasal, Opcode(0x0205)),
            (RefreshKind::PumpTime, Opcode(0x7001)),
            (RefreshKind::PumpHistory, Opcode(0x3101)),
        ]),
    }
}

/// Korean Dana R variant: reports a 0.1 U basal step but accepts 0.01 U from the host.
pub fn dana_r_korean() -> FamilyDescriptor {
    FamilyDescriptor {
        name: "dana-r-korean".to_string(),
        quirks: vec![FieldQuirk::Force { field: StatusField::BasalStep, value: 0.01 }],
        ..dana_r()
    }
}

/// BLE pump with an encrypted session and one-byte opcodes.
pub fn dana_rs() -> FamilyDescriptor {
    FamilyDescriptor {
        name: "dana-rs".to_string(),
        sync: vec![0xA5, 0xA5],
        opcode_width: OpcodeWidth::One,
        integrity: IntegrityKind::Crc16CcittFalse,
        encrypted: true,
        handshake_opcode: Opcode(0x01),
        max_payload: 128,
        max_sequence: u16::MAX,
        status_rules: vec![
            // pump check
            StatusRule::new(0x03, StatusField::HardwareModel, 0, FieldEncoding::U8),
            StatusRule::new(0x03, StatusField::ProtocolVersion, 1, FieldEncoding::U8),
            StatusRule::new(0x03, StatusField::ProductCode, 2, FieldEncoding::U8),
            StatusRule::new(0x02, StatusField::ReservoirUnits, 0, FieldEncoding::U16Le).scaled(0.01),
            StatusRule::new(0x02, StatusField::BatteryPercent, 2, FieldEncoding::U8),
            StatusRule::new(0x04, StatusField::BolusStep, 0, FieldEncoding::U8).scaled(0.01),
            StatusRule::new(0x04, StatusField::MaxBolus, 1, FieldEncoding::U16Le).scaled(0.01),
        ],
        temp_basal: Some(TempBasalRule { opcode: Opcode(0x05), offset: 0, rate_scale: 0.01 }),
        quirks: Vec::new(),
        refresh_opcodes: HashMap::from([
            (RefreshKind::PumpStatus, Opcode(0x02)),
            (RefreshKind::RemainingInsulin, Opcode(0x02)),
            (RefreshKind::BatteryStatus, Opcode(0x02)),
            (RefreshKind::Configuration, Opcode(0x04)),
            (RefreshKind::TemporaryBasal, Opcode(0x05)),
            (RefreshKind::PumpHistory, Opcode(0x10)),
        ]),
    }
}

/// Capsule/patch pump: encrypted, single-byte sync, 16-bit sum integrity.
pub fn patch_pump() -> FamilyDescriptor {
    FamilyDescriptor {
        name: "patch".to_string(),
        sync: vec![0xAA],
        opcode_width: OpcodeWidth::One,
        integrity: IntegrityKind::Sum16,
        encrypted: true,
        handshake_opcode: Opcode(0x0E),
        max_payload: 96,
        max_sequence: u16::MAX,
        status_rules: vec![
            StatusRule::new(0x30, StatusField::ReservoirUnits, 0, FieldEncoding::U16Le).scaled(0.05),
            StatusRule::new(0x30, StatusField::BatteryPercent, 2, FieldEncoding::U8),
            StatusRule::new(0x30, StatusField::BatteryVoltage, 3, FieldEncoding::U16Le)
                .scaled(0.001),
        ],
        temp_basal: Some(TempBasalRule { opcode: Opcode(0x31), offset: 0, rate_scale: 0.025 }),
        quirks: Vec::new(),
        refresh_opcodes: HashMap::from([
            (RefreshKind::PumpStatus, Opcode(0x30)),
            (RefreshKind::BatteryStatus, Opcode(0x30)),
            (RefreshKind::TemporaryBasal, Opcode(0x31)),
            (RefreshKind::PumpHistory, Opcode(0x40)),
        ]),
    }
}
