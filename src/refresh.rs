//! Periodic status refresh.
//!
//! A [`RefreshSchedule`] keeps the next due time per [`RefreshKind`]; the
//! [`Refresher`] task polls it and submits the family's query for every kind
//! that is due, then schedules the kind again from the configured interval.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RefreshIntervals;
use crate::connection::{CommandSender, PumpConnection};
use crate::family::FamilyDescriptor;
use crate::types::{Command, ResponseShape};
use crate::PumpError;

/// Pump data that is refreshed periodically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RefreshKind {
    PumpHistory,
    Configuration,
    RemainingInsulin,
    BatteryStatus,
    PumpTime,
    PumpStatus,
    TemporaryBasal,
}

impl RefreshKind {
    pub const ALL: [RefreshKind; 7] = [
        RefreshKind::PumpHistory,
        RefreshKind::Configuration,
        RefreshKind::RemainingInsulin,
        RefreshKind::BatteryStatus,
        RefreshKind::PumpTime,
        RefreshKind::PumpStatus,
        RefreshKind::TemporaryBasal,
    ];
}

/// Next due time per refresh kind.
#[derive(Debug, Clone)]
pub struct RefreshSchedule {
    intervals: RefreshIntervals,
    next_due: HashMap<RefreshKind, Instant>,
}

impl RefreshSchedule {
    pub fn new(intervals: RefreshIntervals) -> Self {
        Self { intervals, next_due: HashMap::new() }
    }

    /// Schedule every kind with an interval as due at `now`.
    pub fn all_due(intervals: RefreshIntervals, now: Instant) -> Self {
        let mut schedule = Self::new(intervals);
        for kind in RefreshKind::ALL {
            if schedule.intervals.interval(kind).is_some() {
                schedule.schedule_at(kind, now);
            }
        }
        schedule
    }

    /// Next refresh one interval after `now`; kinds without an interval are removed.
    pub fn schedule(&mut self, kind: RefreshKind, now: Instant) {
        match self.intervals.interval(kind) {
            Some(interval) => self.schedule_at(kind, now + interval),
            None => self.remove(kind),
        }
    }

    pub fn schedule_at(&mut self, kind: RefreshKind, when: Instant) {
        self.next_due.insert(kind, when);
    }

    /// Align `kind` with whatever `other` is scheduled for.
    pub fn schedule_same_as(&mut self, kind: RefreshKind, other: RefreshKind) {
        match self.next_due.get(&other).copied() {
            Some(when) => self.schedule_at(kind, when),
            None => debug!("{:?} is not scheduled, leaving {:?} unchanged", other, kind),
        }
    }

    pub fn remove(&mut self, kind: RefreshKind) {
        self.next_due.remove(&kind);
    }

    pub fn next_due(&self, kind: RefreshKind) -> Option<Instant> {
        self.next_due.get(&kind).copied()
    }

    /// Kinds due at `now`, earliest first.
    pub fn due(&self, now: Instant) -> Vec<RefreshKind> {
        let mut due: Vec<_> = self.next_due.iter().filter(|(_, when)| **when <= now).collect();
        due.sort_by_key(|(kind, when)| (**when, **kind));
        due.into_iter().map(|(kind, _)| *kind).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.next_due.is_empty()
    }
}

/// Shortest polling period the refresher accepts.
pub const MIN_REFRESH_TICK: Duration = Duration::from_millis(10);

/// Background task issuing scheduled refresh queries.
pub struct Refresher;

impl Refresher {
    /// Poll `schedule` every `tick` and submit due refreshes through `connection`.
    ///
    /// Refreshes run one after another, so a kind is never in flight twice.
    /// A `tick` below [`MIN_REFRESH_TICK`] is raised to it. The task ends
    /// when the connection is dropped.
    pub fn spawn(connection: &PumpConnection, schedule: RefreshSchedule, tick: Duration) -> JoinHandle<()> {
        let commands = connection.commands();
        let family = connection.family().clone();
        let shutdown = connection.shutdown_token();
        tokio::spawn(async move {
            Self::run(commands, family, schedule, tick, shutdown).await;
        })
    }

    async fn run(
        commands: CommandSender,
        family: FamilyDescriptor,
        mut schedule: RefreshSchedule,
        tick: Duration,
        shutdown: CancellationToken,
    ) {
        info!("Refresher started for {} pump", family.name);
        if tick < MIN_REFRESH_TICK {
            warn!("Refresh tick {:?} is too short, using {:?}", tick, MIN_REFRESH_TICK);
        }
        let mut ticker = tokio::time::interval(tick.max(MIN_REFRESH_TICK));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        'outer: loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            for kind in schedule.due(Instant::now()) {
                let Some(opcode) = family.refresh_opcode(kind) else {
                    warn!("{} has no opcode for {:?}, dropping it from the schedule", family.name, kind);
                    schedule.remove(kind);
                    continue;
                };
                let shape = if kind == RefreshKind::PumpHistory {
                    ResponseShape::MultiFrame
                } else {
                    ResponseShape::Single
                };

                let pending = commands.submit(Command::query(opcode).with_shape(shape));
                let outcome = tokio::select! {
                    _ = shutdown.cancelled() => break 'outer,
                    outcome = pending => outcome,
                };
                match outcome {
                    Ok(_) => debug!("Refreshed {:?}", kind),
                    Err(PumpError::EngineStopped) => break 'outer,
                    Err(err) => warn!("Refresh of {:?} failed: {}", kind, err),
                }
                schedule.schedule(kind, Instant::now());
            }
        }
        info!("Refresher stopped");
    }
}
