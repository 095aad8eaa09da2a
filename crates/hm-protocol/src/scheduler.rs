//! ---
//! hm_section: "02-protocol-engine"
//! hm_subsection: "module"
//! hm_type: "source"
//! hm_scope: "code"
//! hm_description: "Device protocol translation engine."
//! hm_version: "v0.1.0"
//! hm_owner: "tbd"
//! ---
//! Poll and response-timeout bookkeeping.
//!
//! The scheduler owns no timers itself. Callers pass the current instant to
//! [`PollScheduler::tick`], run the returned [`TickPlan`] and call
//! [`PollScheduler::fire`] once an armed deadline elapses. Every armed timer
//! carries a [`TimerToken`]; firing with any other token is a no-op.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use crate::definition::DeviceDefinition;
use crate::device::Device;

/// Timing parameters shared by every device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerSettings {
    /// How long a device may stay silent after a refresh request.
    pub response_timeout: Duration,
    /// Spacing between refresh requests issued in the same tick.
    pub stagger: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(15),
            stagger: Duration::from_millis(100),
        }
    }
}

/// Identity of one armed response timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerToken(u64);

impl TimerToken {
    /// Raw token value.
    pub fn get(self) -> u64 {
        self.0
    }
}

/// An armed response timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArmedTimer {
    /// Token to pass back to [`PollScheduler::fire`].
    pub token: TimerToken,
    /// Instant after which the device counts as unreachable.
    pub deadline: Instant,
}

/// One refresh request to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollRequest {
    /// Index of the message definition within the family.
    pub index: usize,
    /// Publish slot of the message definition.
    pub slot: String,
    /// Wire payload to publish.
    pub payload: String,
    /// Delay relative to the tick before publishing: `index` times the
    /// configured stagger.
    pub delay: Duration,
}

/// Work produced by one tick for one device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickPlan {
    /// Refresh requests in message order.
    pub requests: Vec<PollRequest>,
    /// Timer armed by this tick; `None` when nothing was requested or a
    /// timer was already running.
    pub armed: Option<ArmedTimer>,
}

impl TickPlan {
    /// Whether the tick produced nothing to do.
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

/// Reachability of a device as observed by the scheduler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Availability {
    /// No response and no timeout seen yet.
    #[default]
    Unknown,
    /// Last event was a parsed response.
    Online,
    /// Last event was a response timeout.
    Offline,
}

impl Availability {
    /// Availability topic payload; `None` while unknown.
    pub fn payload(self) -> Option<&'static str> {
        match self {
            Availability::Unknown => None,
            Availability::Online => Some("online"),
            Availability::Offline => Some("offline"),
        }
    }
}

/// Raised exactly once when an armed timer expires without a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceUnreachable {
    /// Silent device.
    pub device: Device,
    /// Deadline that elapsed.
    pub deadline: Instant,
    /// Instant the expiry was processed.
    pub fired_at: Instant,
}

/// Lifecycle of one message definition for one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotPhase {
    /// Requested recently or answered; nothing to do.
    Idle,
    /// Interval elapsed (or never requested); next tick will request.
    Due,
    /// Request sent, response timer running.
    Requested,
    /// Request sent and the response timer fired.
    Overdue,
}

/// Result of [`PollScheduler::record_response`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseOutcome {
    /// A timer was armed and has been cleared.
    pub disarmed: bool,
    /// The device was not online before this response.
    pub came_online: bool,
}

#[derive(Debug, Default)]
struct Schedule {
    last_request: Vec<Option<Instant>>,
    last_response: Option<Instant>,
    timer: Option<ArmedTimer>,
    availability: Availability,
    overdue: bool,
}

impl Schedule {
    fn last_request(&self, index: usize) -> Option<Instant> {
        self.last_request.get(index).copied().flatten()
    }

    fn stamp(&mut self, index: usize, now: Instant) {
        if self.last_request.len() <= index {
            self.last_request.resize(index + 1, None);
        }
        self.last_request[index] = Some(now);
    }
}

fn is_due(last: Option<Instant>, interval: Duration, now: Instant) -> bool {
    match last {
        None => true,
        Some(last) => now > last + interval,
    }
}

/// Per-device poll and response-timer state machine.
#[derive(Debug)]
pub struct PollScheduler {
    settings: SchedulerSettings,
    next_token: AtomicU64,
    devices: Mutex<HashMap<Device, Schedule>>,
}

impl PollScheduler {
    /// Scheduler using `settings`.
    pub fn new(settings: SchedulerSettings) -> Self {
        Self {
            settings,
            next_token: AtomicU64::new(1),
            devices: Mutex::new(HashMap::new()),
        }
    }

    /// Active settings.
    pub fn settings(&self) -> SchedulerSettings {
        self.settings
    }

    /// Stamp every due message of `device` and return the refresh requests.
    ///
    /// Arms a response timer when at least one request is produced and no
    /// timer is already armed.
    pub fn tick(&self, device: &Device, definition: &DeviceDefinition, now: Instant) -> TickPlan {
        let mut devices = self.devices.lock();
        let schedule = devices.entry(device.clone()).or_default();

        let mut plan = TickPlan::default();
        for (index, message) in definition.messages().iter().enumerate() {
            if !is_due(schedule.last_request(index), message.poll_interval(), now) {
                continue;
            }
            schedule.stamp(index, now);
            plan.requests.push(PollRequest {
                index,
                slot: message.publish_slot().to_owned(),
                payload: message.refresh_payload().to_owned(),
                delay: self.settings.stagger * index as u32,
            });
        }

        if !plan.requests.is_empty() && schedule.timer.is_none() {
            let timer = ArmedTimer {
                token: TimerToken(self.next_token.fetch_add(1, Ordering::Relaxed)),
                deadline: now + self.settings.response_timeout,
            };
            schedule.timer = Some(timer);
            plan.armed = Some(timer);
        }
        plan
    }

    /// Record a parsed response from `device`; disarms any timer.
    pub fn record_response(&self, device: &Device, now: Instant) -> ResponseOutcome {
        let mut devices = self.devices.lock();
        let schedule = devices.entry(device.clone()).or_default();
        let disarmed = schedule.timer.take().is_some();
        let came_online = schedule.availability != Availability::Online;
        schedule.availability = Availability::Online;
        schedule.last_response = Some(now);
        schedule.overdue = false;
        ResponseOutcome {
            disarmed,
            came_online,
        }
    }

    /// Clear the armed timer without touching availability.
    pub fn disarm(&self, device: &Device) -> Option<ArmedTimer> {
        self.devices
            .lock()
            .get_mut(device)
            .and_then(|schedule| schedule.timer.take())
    }

    /// Process expiry of the timer identified by `token`.
    ///
    /// Returns the unreachable event only when `token` is the currently
    /// armed timer; stale or cleared tokens return `None`.
    pub fn fire(
        &self,
        device: &Device,
        token: TimerToken,
        now: Instant,
    ) -> Option<DeviceUnreachable> {
        let mut devices = self.devices.lock();
        let schedule = devices.get_mut(device)?;
        let timer = schedule.timer.filter(|timer| timer.token == token)?;
        schedule.timer = None;
        schedule.availability = Availability::Offline;
        schedule.overdue = true;
        Some(DeviceUnreachable {
            device: device.clone(),
            deadline: timer.deadline,
            fired_at: now,
        })
    }

    /// Currently armed timer of `device`.
    pub fn armed_timer(&self, device: &Device) -> Option<ArmedTimer> {
        self.devices.lock().get(device).and_then(|schedule| schedule.timer)
    }

    /// Observed availability of `device`.
    pub fn availability(&self, device: &Device) -> Availability {
        self.devices
            .lock()
            .get(device)
            .map(|schedule| schedule.availability)
            .unwrap_or_default()
    }

    /// Phase of message `index` of `definition` for `device` at `now`.
    pub fn phase(
        &self,
        device: &Device,
        definition: &DeviceDefinition,
        index: usize,
        now: Instant,
    ) -> Option<SlotPhase> {
        let message = definition.messages().get(index)?;
        let devices = self.devices.lock();
        let Some(schedule) = devices.get(device) else {
            return Some(SlotPhase::Due);
        };
        let last = schedule.last_request(index);
        let unanswered = match (last, schedule.last_response) {
            (Some(request), Some(response)) => response < request,
            (Some(_), None) => true,
            (None, _) => false,
        };
        let phase = if schedule.overdue && unanswered {
            SlotPhase::Overdue
        } else if is_due(last, message.poll_interval(), now) {
            SlotPhase::Due
        } else if schedule.timer.is_some() && unanswered {
            SlotPhase::Requested
        } else {
            SlotPhase::Idle
        };
        Some(phase)
    }

    /// Drop all bookkeeping for `device`.
    pub fn forget(&self, device: &Device) {
        self.devices.lock().remove(device);
    }
}

impl Default for PollScheduler {
    fn default() -> Self {
        Self::new(SchedulerSettings::default())
    }
}
