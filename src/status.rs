//! Status store
//!
//! Owns the current [`StatusSnapshot`] and publishes replacements on a watch
//! channel. Every decoded frame is offered to [`StatusStore::update`]; the
//! family descriptor decides which bytes feed which field. A frame that
//! cannot be decoded in full leaves the published snapshot untouched.

use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::family::FamilyDescriptor;
use crate::types::{Frame, StatusSnapshot, TempBasalDescriptor};

/// Publishes [`StatusSnapshot`] values derived from decoded frames.
#[derive(Debug)]
pub struct StatusStore {
    family: Arc<FamilyDescriptor>,
    tx: watch::Sender<Arc<StatusSnapshot>>,
}

impl StatusStore {
    pub fn new(family: Arc<FamilyDescriptor>) -> Self {
        let (tx, _) = watch::channel(Arc::new(StatusSnapshot::default()));
        Self { family, tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<StatusSnapshot>> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> Arc<StatusSnapshot> {
        self.tx.borrow().clone()
    }

    /// Apply a validated frame. Returns `false` when the frame was rejected.
    pub fn update(&self, frame: &Frame, received_at: SystemTime) -> bool {
        let current = self.current();
        match apply_frame(&self.family, &current, frame, received_at) {
            Some(next) => {
                self.tx.send_replace(Arc::new(next));
                true
            }
            None => {
                debug!("Frame {} too short for its status rules, snapshot unchanged", frame.opcode);
                false
            }
        }
    }
}

/// Build the snapshot that results from `frame`, or `None` if any rule cannot be decoded.
fn apply_frame(
    family: &FamilyDescriptor,
    current: &StatusSnapshot,
    frame: &Frame,
    received_at: SystemTime,
) -> Option<StatusSnapshot> {
    let mut next = current.clone();
    next.last_communication = Some(received_at);
    if frame.is_nack() {
        return Some(next);
    }

    for rule in family.rules_for(frame.opcode) {
        let mut value = rule.extract(&frame.payload)?;
        for quirk in family.quirks_for(rule.field) {
            value = quirk.apply(value);
        }
        trace!("{:?} = {} from {}", rule.field, value, frame.opcode);
        next.set_field(rule.field, value);
    }

    if let Some(rule) = family.temp_basal.as_ref().filter(|rule| rule.opcode == frame.opcode) {
        let (rate, is_percent, duration) = rule.extract(&frame.payload)?;
        let temp_basal = TempBasalDescriptor::new(rate, is_percent, duration);
        if temp_basal.is_cancel() {
            next.clear_temp_basal();
        } else {
            next.set_temp_basal(Some(temp_basal), received_at);
        }
    }

    Some(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::family::presets;
    use crate::types::{FrameFlags, Opcode};
    use std::time::Duration;

    fn frame(opcode: u16, payload: &[u8]) -> Frame {
        Frame {
            opcode: Opcode(opcode),
            flags: FrameFlags::new(FrameFlags::FROM_PUMP),
            sequence: 1,
            fragment: 0,
            payload: payload.to_vec(),
        }
    }

    fn at(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[test]
    fn bolus_settings_decode_with_scale() {
        let store = StatusStore::new(Arc::new(presets::dana_r()));
        // extended bolus bit set, step 0.05 U, max bolus 20 U
        assert!(store.update(&frame(0x0302, &[0x01, 5, 0x07, 0xD0]), at(10)));

        let snapshot = store.current();
        assert_eq!(snapshot.extended_bolus_enabled, Some(true));
        assert!((snapshot.bolus_step.unwrap() - 0.05).abs() < 1e-9);
        assert!((snapshot.max_bolus.unwrap() - 20.0).abs() < 1e-9);
        assert_eq!(snapshot.last_communication, Some(at(10)));
    }

    #[test]
    fn short_frame_leaves_snapshot_untouched() {
        let store = StatusStore::new(Arc::new(presets::dana_r()));
        store.update(&frame(0x0302, &[0x00, 10, 0x03, 0xE8]), at(1));
        let before = store.current();

        assert!(!store.update(&frame(0x0302, &[0x01, 20]), at(2)));
        assert_eq!(store.current(), before);
    }

    #[test]
    fn korean_variant_forces_basal_step() {
        let store = StatusStore::new(Arc::new(presets::dana_r_korean()));
        store.update(&frame(0x3203, &[10, 5]), at(1));
        assert_eq!(store.current().basal_step, Some(0.01));

        let regular = StatusStore::new(Arc::new(presets::dana_r()));
        regular.update(&frame(0x3203, &[10, 5]), at(1));
        assert!((regular.current().basal_step.unwrap() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn temp_basal_set_and_cancel() {
        let store = StatusStore::new(Arc::new(presets::dana_r()));
        store.update(&frame(0x0205, &[1, 0, 150, 0, 30]), at(100));
        let snapshot = store.current();
        let tbr = snapshot.temp_basal.expect("temp basal");
        assert!(tbr.is_percent);
        assert_eq!(tbr.rate, 150.0);
        assert_eq!(snapshot.temp_basal_end(), Some(at(100 + 1_800)));

        store.update(&frame(0x0205, &[0, 0, 0, 0, 0]), at(200));
        assert_eq!(store.current().temp_basal, None);
        assert_eq!(store.current().temp_basal_end(), None);
    }

    #[test]
    fn nack_only_touches_last_communication() {
        let store = StatusStore::new(Arc::new(presets::dana_r()));
        let mut nack = frame(0x0302, &[0x21]);
        nack.flags = nack.flags.with(FrameFlags::NACK, true);
        assert!(store.update(&nack, at(5)));
        assert_eq!(store.current().extended_bolus_enabled, None);
        assert_eq!(store.current().last_communication, Some(at(5)));
    }

    #[test]
    fn subscribers_see_whole_snapshots() {
        let store = StatusStore::new(Arc::new(presets::dana_r()));
        let mut rx = store.subscribe();
        store.update(&frame(0x0302, &[0x01, 5, 0x07, 0xD0]), at(1));
        assert!(rx.has_changed().unwrap());
        let seen = rx.borrow_and_update().clone();
        assert_eq!(seen.extended_bolus_enabled, Some(true));
        assert!(seen.max_bolus.is_some());
    }
}
