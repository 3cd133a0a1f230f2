//! Pump family descriptors.
//!
//! Every pump family speaks the same record structure with different
//! parameters: sync prefix, opcode width, integrity kind, whether records are
//! encrypted, and which payload bytes carry which status values. A
//! [`FamilyDescriptor`] captures all of that as data, so one codec and one
//! status decoder serve every family.
//!
//! Descriptors can be built in code, taken from [`presets`], or loaded from
//! YAML:
//!
//! ```rust
//! use pumplink::family::FamilyDescriptor;
//!
//! let yaml = r#"
//! name: bench-pump
//! sync: [0xAA]
//! opcode_width: One
//! integrity: Xor8
//! encrypted: false
//! handshake_opcode: 0x01
//! max_payload: 64
//! max_sequence: 255
//! "#;
//! let family = FamilyDescriptor::from_yaml_str(yaml).unwrap();
//! assert_eq!(family.header_len(), 8);
//! ```

mod integrity;
pub mod presets;

pub use integrity::{IntegrityKind, crc16_ccitt_false};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::refresh::RefreshKind;
use crate::types::{Opcode, StatusField};
use crate::{PumpError, Result};

/// Size of the ChaCha20-Poly1305 authentication tag appended to sealed payloads.
pub const AEAD_TAG_LEN: usize = 16;

/// Width of the opcode field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpcodeWidth {
    One,
    Two,
}

impl OpcodeWidth {
    pub const fn len(self) -> usize {
        match self {
            OpcodeWidth::One => 1,
            OpcodeWidth::Two => 2,
        }
    }

    pub fn fits(self, opcode: Opcode) -> bool {
        match self {
            OpcodeWidth::One => opcode.0 <= 0xFF,
            OpcodeWidth::Two => true,
        }
    }
}

/// How a scalar is laid out in a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldEncoding {
    U8,
    U16Le,
    U16Be,
    /// Single bit of the byte at the rule's offset.
    Bit(u8),
}

impl FieldEncoding {
    pub const fn len(self) -> usize {
        match self {
            FieldEncoding::U8 | FieldEncoding::Bit(_) => 1,
            FieldEncoding::U16Le | FieldEncoding::U16Be => 2,
        }
    }
}

fn unit_scale() -> f64 {
    1.0
}

/// Maps bytes of one opcode's payload onto a status field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRule {
    pub opcode: Opcode,
    pub field: StatusField,
    pub offset: usize,
    pub encoding: FieldEncoding,
    #[serde(default = "unit_scale")]
    pub scale: f64,
}

impl StatusRule {
    pub fn new(opcode: u16, field: StatusField, offset: usize, encoding: FieldEncoding) -> Self {
        Self { opcode: Opcode(opcode), field, offset, encoding, scale: 1.0 }
    }

    pub fn scaled(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    /// Decode the field, or `None` when the payload is too short.
    pub fn extract(&self, payload: &[u8]) -> Option<f64> {
        let end = self.offset.checked_add(self.encoding.len())?;
        let bytes = payload.get(self.offset..end)?;
        let raw = match self.encoding {
            FieldEncoding::U8 => f64::from(bytes[0]),
            FieldEncoding::U16Le => f64::from(u16::from_le_bytes([bytes[0], bytes[1]])),
            FieldEncoding::U16Be => f64::from(u16::from_be_bytes([bytes[0], bytes[1]])),
            FieldEncoding::Bit(bit) => f64::from((bytes[0] >> (bit & 7)) & 1),
        };
        Some(raw * self.scale)
    }
}

/// Decodes a temp basal reported as `[is_percent u8][rate u16 BE][duration min u16 BE]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TempBasalRule {
    pub opcode: Opcode,
    #[serde(default)]
    pub offset: usize,
    /// Units per hour represented by one raw step of an absolute rate.
    pub rate_scale: f64,
}

impl TempBasalRule {
    pub const ENCODED_LEN: usize = 5;

    /// Returns `(rate, is_percent, duration_minutes)`, or `None` when truncated.
    pub fn extract(&self, payload: &[u8]) -> Option<(f64, bool, u16)> {
        let end = self.offset.checked_add(Self::ENCODED_LEN)?;
        let bytes = payload.get(self.offset..end)?;
        let is_percent = bytes[0] == 1;
        let raw_rate = f64::from(u16::from_be_bytes([bytes[1], bytes[2]]));
        let rate = if is_percent { raw_rate } else { raw_rate * self.rate_scale };
        let duration = u16::from_be_bytes([bytes[3], bytes[4]]);
        Some((rate, is_percent, duration))
    }
}

/// Post-decode adjustment applied to one field whenever a frame sets it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldQuirk {
    /// Replace the decoded value, e.g. a variant that reports a step it cannot use.
    Force { field: StatusField, value: f64 },
    Clamp { field: StatusField, min: f64, max: f64 },
}

impl FieldQuirk {
    pub fn field(&self) -> StatusField {
        match self {
            FieldQuirk::Force { field, .. } | FieldQuirk::Clamp { field, .. } => *field,
        }
    }

    pub fn apply(&self, value: f64) -> f64 {
        match self {
            FieldQuirk::Force { value: forced, .. } => *forced,
            FieldQuirk::Clamp { min, max, .. } => value.max(*min).min(*max),
        }
    }

    fn check(&self) -> Result<()> {
        match self {
            FieldQuirk::Force { field, value } if !value.is_finite() => {
                Err(PumpError::config(format!("forced value for {:?} must be finite", field)))
            }
            FieldQuirk::Clamp { field, min, max } if !(min.is_finite() && max.is_finite() && min <= max) => {
                Err(PumpError::config(format!(
                    "clamp bounds for {:?} must be finite with min <= max, got {}..{}",
                    field, min, max
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Capability set of one pump family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FamilyDescriptor {
    pub name: String,
    #[serde(default)]
    pub sync: Vec<u8>,
    pub opcode_width: OpcodeWidth,
    pub integrity: IntegrityKind,
    pub encrypted: bool,
    pub handshake_opcode: Opcode,
    /// Largest plaintext payload a record may carry.
    pub max_payload: usize,
    /// Sequence numbers above this expire the session.
    pub max_sequence: u16,
    #[serde(default)]
    pub status_rules: Vec<StatusRule>,
    #[serde(default)]
    pub temp_basal: Option<TempBasalRule>,
    #[serde(default)]
    pub quirks: Vec<FieldQuirk>,
    #[serde(default)]
    pub refresh_opcodes: HashMap<RefreshKind, Opcode>,
}

impl FamilyDescriptor {
    /// Parse and validate a descriptor from YAML.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let family: FamilyDescriptor = serde_yaml_ng::from_str(yaml)?;
        family.validate()?;
        Ok(family)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|e| {
            PumpError::config_with_source(
                format!("cannot read family descriptor {}", path.display()),
                Box::new(e),
            )
        })?;
        Self::from_yaml_str(&yaml)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(PumpError::config("family name is empty"));
        }
        if !self.opcode_width.fits(self.handshake_opcode) {
            return Err(PumpError::config(format!(
                "handshake opcode {} does not fit a one-byte opcode field",
                self.handshake_opcode
            )));
        }
        if self.max_payload == 0 || self.max_payload + AEAD_TAG_LEN > usize::from(u16::MAX) {
            return Err(PumpError::config(format!(
                "max_payload {} must be between 1 and {}",
                self.max_payload,
                usize::from(u16::MAX) - AEAD_TAG_LEN
            )));
        }
        if self.max_sequence == 0 {
            return Err(PumpError::config("max_sequence must be at least 1"));
        }
        for rule in &self.status_rules {
            if !self.opcode_width.fits(rule.opcode) {
                return Err(PumpError::config(format!(
                    "status rule opcode {} does not fit the opcode field",
                    rule.opcode
                )));
            }
        }
        for quirk in &self.quirks {
            quirk.check()?;
        }
        for (kind, opcode) in &self.refresh_opcodes {
            if !self.opcode_width.fits(*opcode) {
                return Err(PumpError::config(format!(
                    "refresh opcode {} for {:?} does not fit the opcode field",
                    opcode, kind
                )));
            }
        }
        Ok(())
    }

    /// Header length including sync prefix, excluding the session tag.
    pub fn header_len(&self) -> usize {
        // opcode + flags + sequence(2) + fragment + length(2)
        self.sync.len() + self.opcode_width.len() + 6
    }

    /// Smallest possible record on the wire.
    pub fn min_record_len(&self) -> usize {
        self.header_len() + self.integrity.len()
    }

    /// Largest payload length a record may declare.
    pub fn max_wire_payload(&self) -> usize {
        if self.encrypted { self.max_payload + AEAD_TAG_LEN } else { self.max_payload }
    }

    pub fn refresh_opcode(&self, kind: RefreshKind) -> Option<Opcode> {
        self.refresh_opcodes.get(&kind).copied()
    }

    pub fn rules_for(&self, opcode: Opcode) -> impl Iterator<Item = &StatusRule> {
        self.status_rules.iter().filter(move |rule| rule.opcode == opcode)
    }

    pub fn quirks_for(&self, field: StatusField) -> impl Iterator<Item = &FieldQuirk> {
        self.quirks.iter().filter(move |quirk| quirk.field() == field)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn presets_validate() {
        for family in [presets::dana_r(), presets::dana_r_korean(), presets::dana_rs(), presets::patch_pump()] {
            family.validate().unwrap_or_else(|e| panic!("{} invalid: {}", family.name, e));
        }
    }

    #[test]
    fn rejects_wide_opcodes_on_narrow_families() {
        let mut family = presets::patch_pump();
        family.handshake_opcode = Opcode(0x1234);
        assert!(matches!(family.validate(), Err(PumpError::Config { .. })));
    }

    #[test]
    fn rejects_oversized_payload_limit() {
        let mut family = presets::dana_r();
        family.max_payload = usize::from(u16::MAX);
        assert!(family.validate().is_err());
    }

    #[test]
    fn yaml_round_trip_of_preset() {
        let family = presets::dana_rs();
        let yaml = serde_yaml_ng::to_string(&family).expect("serialize");
        let parsed = FamilyDescriptor::from_yaml_str(&yaml).expect("parse");
        assert_eq!(parsed, family);
    }

    #[test]
    fn missing_file_is_config_error() {
        let err = FamilyDescriptor::from_path("/nonexistent/family.yaml").unwrap_err();
        assert!(matches!(err, PumpError::Config { source: Some(_), .. }));
    }

    #[test]
    fn bit_and_scaled_extraction() {
        let payload = [0b0000_0101, 0x32, 0x03, 0xE8];
        let bit0 = StatusRule::new(0x0302, StatusField::ExtendedBolusEnabled, 0, FieldEncoding::Bit(0));
        let bit1 = StatusRule::new(0x0302, StatusField::ExtendedBolusEnabled, 0, FieldEncoding::Bit(1));
        let step = StatusRule::new(0x0302, StatusField::BolusStep, 1, FieldEncoding::U8).scaled(0.01);
        let max = StatusRule::new(0x0302, StatusField::MaxBolus, 2, FieldEncoding::U16Be).scaled(0.01);

        assert_eq!(bit0.extract(&payload), Some(1.0));
        assert_eq!(bit1.extract(&payload), Some(0.0));
        assert!((step.extract(&payload).unwrap() - 0.5).abs() < 1e-9);
        assert!((max.extract(&payload).unwrap() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn temp_basal_extraction() {
        let rule = TempBasalRule { opcode: Opcode(0x0205), offset: 0, rate_scale: 0.025 };
        assert_eq!(rule.extract(&[1, 0, 150, 0, 60]), Some((150.0, true, 60)));
        let (rate, is_percent, duration) = rule.extract(&[0, 0, 40, 0, 30]).unwrap();
        assert!((rate - 1.0).abs() < 1e-9);
        assert!(!is_percent);
        assert_eq!(duration, 30);
        assert_eq!(rule.extract(&[0, 0, 40, 0]), None);
    }

    #[test]
    fn quirks_force_and_clamp() {
        let force = FieldQuirk::Force { field: StatusField::BasalStep, value: 0.01 };
        let clamp = FieldQuirk::Clamp { field: StatusField::MaxBolus, min: 0.0, max: 25.0 };
        assert_eq!(force.apply(0.1), 0.01);
        assert_eq!(clamp.apply(40.0), 25.0);
        assert_eq!(clamp.apply(3.0), 3.0);
    }

    #[test]
    fn rejects_unusable_quirks() {
        let unusable = [
            FieldQuirk::Clamp { field: StatusField::MaxBolus, min: 25.0, max: 0.0 },
            FieldQuirk::Clamp { field: StatusField::MaxBolus, min: f64::NAN, max: 25.0 },
            FieldQuirk::Clamp { field: StatusField::MaxBolus, min: 0.0, max: f64::INFINITY },
            FieldQuirk::Force { field: StatusField::BasalStep, value: f64::NAN },
        ];
        for quirk in unusable {
            let mut family = presets::dana_r_korean();
            family.quirks.push(quirk.clone());
            assert!(
                matches!(family.validate(), Err(PumpError::Config { .. })),
                "{:?} accepted",
                quirk
            );
        }

        let mut family = presets::dana_r();
        family.quirks.push(FieldQuirk::Clamp { field: StatusField::MaxBolus, min: 5.0, max: 5.0 });
        family.validate().expect("degenerate range is usable");
    }

    proptest! {
        #[test]
        fn extraction_never_reads_past_payload(
            offset in 0usize..64,
            payload in prop::collection::vec(any::<u8>(), 0..32),
        ) {
            let rule = StatusRule::new(1, StatusField::ReservoirUnits, offset, FieldEncoding::U16Le);
            let result = rule.extract(&payload);
            prop_assert_eq!(result.is_some(), offset + 2 <= payload.len());
        }
    }
}
