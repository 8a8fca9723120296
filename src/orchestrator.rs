use log::debug;
use log::error;
use log::info;
use log::warn;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::ops::Deref;
use std::ops::DerefMut;
use std::time::Duration;

use crate::event_shim::desired_state_or_off;
use crate::event_shim::EventSignalSource;
use crate::modbus_shim::TransportClient;
use crate::relay_ctl::RelayController;
use crate::relay_types::RelayId;
use crate::relay_types::RelayState;

/// Suspension point of the control loop.
pub trait Pause {
    /// Sleeps for `duration`. Returns false if cancelled before it elapsed.
    fn pause(&mut self, duration: Duration) -> bool;

    fn is_cancelled(&self) -> bool;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Schedule {
    /// Idle time between two reconciliation cycles.
    pub poll_interval: Duration,
    /// Delay between failed connection attempts.
    pub backoff: Duration,
    /// Attempts per relay and cycle before giving up on it.
    pub attempts: u32,
    pub retry_delay: Duration,
}

impl Default for Schedule {
    fn default() -> Self {
        Schedule {
            poll_interval: Duration::from_secs(30),
            backoff: Duration::from_secs(5),
            attempts: 3,
            retry_delay: Duration::from_millis(100),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Steady(RelayState),
    Changed {
        from: Option<RelayState>,
        to: RelayState,
    },
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayReport {
    pub relay: RelayId,
    pub desired: RelayState,
    pub outcome: Outcome,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Cycle {
    Completed(Vec<RelayReport>),
    Cancelled,
}

/// Open connection of one cycle. Closed when dropped, whatever way the
/// cycle ends.
struct Session<'a, T: TransportClient> {
    controller: &'a mut RelayController<T>,
}

impl<'a, T: TransportClient> Deref for Session<'a, T> {
    type Target = RelayController<T>;

    fn deref(&self) -> &Self::Target {
        self.controller
    }
}

impl<'a, T: TransportClient> DerefMut for Session<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.controller
    }
}

impl<'a, T: TransportClient> Drop for Session<'a, T> {
    fn drop(&mut self) {
        self.controller.close();
        debug!("Session closed");
    }
}

pub struct Orchestrator<T, S, P>
where
    T: TransportClient,
    S: EventSignalSource,
    P: Pause,
{
    controller: RelayController<T>,
    source: S,
    pause: P,
    relays: BTreeMap<RelayId, String>,
    schedule: Schedule,
    observed: HashMap<RelayId, RelayState>,
}

impl<T, S, P> Orchestrator<T, S, P>
where
    T: TransportClient,
    S: EventSignalSource,
    P: Pause,
{
    pub fn new(
        controller: RelayController<T>,
        source: S,
        pause: P,
        relays: BTreeMap<RelayId, String>,
        schedule: Schedule,
    ) -> Orchestrator<T, S, P> {
        Orchestrator {
            controller,
            source,
            pause,
            relays,
            schedule,
            observed: HashMap::new(),
        }
    }

    /// Reconciles the relays every poll interval until cancelled.
    pub fn run(&mut self) {
        info!(
            "Reconciling {} relay(s) of unit {} every {:?}",
            self.relays.len(),
            self.controller.slave(),
            self.schedule.poll_interval
        );
        loop {
            match self.run_cycle() {
                Cycle::Cancelled => break,
                Cycle::Completed(reports) => {
                    let failed = reports
                        .iter()
                        .filter(|report| report.outcome == Outcome::Failed)
                        .count();
                    debug!(
                        "Cycle done, {} of {} relay(s) failed",
                        failed,
                        reports.len()
                    );
                }
            }
            if !self.pause.pause(self.schedule.poll_interval) {
                break;
            }
        }
        info!("Stopped");
    }

    /// Connects, reconciles every relay in address order and disconnects.
    pub fn run_cycle(&mut self) -> Cycle {
        let Orchestrator {
            controller,
            source,
            pause,
            relays,
            schedule,
            observed,
        } = self;

        let mut session = match open_session(controller, pause, schedule.backoff) {
            Some(session) => session,
            None => return Cycle::Cancelled,
        };

        let mut reports = Vec::with_capacity(relays.len());
        for (relay, endpoint) in relays.iter() {
            if pause.is_cancelled() {
                return Cycle::Cancelled;
            }

            let relay = *relay;
            let desired = RelayState::from(desired_state_or_off(&*source, endpoint));
            let outcome = match reconcile(&mut *session, pause, schedule, relay, desired) {
                Attempt::Interrupted => return Cycle::Cancelled,
                Attempt::Done(state) => match observed.insert(relay, state) {
                    Some(previous) if previous == state => Outcome::Steady(state),
                    previous => Outcome::Changed {
                        from: previous,
                        to: state,
                    },
                },
                Attempt::GaveUp => Outcome::Failed,
            };
            let report = RelayReport {
                relay,
                desired,
                outcome,
            };
            log_report(&report);
            reports.push(report);
        }

        Cycle::Completed(reports)
    }

    /// Switches every configured relay on, then every relay off again.
    /// Returns false if cancelled.
    pub fn exercise(&mut self) -> bool {
        let Orchestrator {
            controller,
            pause,
            relays,
            schedule,
            ..
        } = self;

        let mut session = match open_session(controller, pause, schedule.backoff) {
            Some(session) => session,
            None => return false,
        };

        for desired in [RelayState::On, RelayState::Off] {
            for relay in relays.keys() {
                if pause.is_cancelled() {
                    return false;
                }
                let result = match desired {
                    RelayState::On => session.turn_on(*relay),
                    RelayState::Off => session.turn_off(*relay),
                };
                match result {
                    Ok(state) => info!("'{}' is '{}'", relay, state),
                    Err(e) => error!("Failed to set '{}' to '{}': {}", relay, desired, e),
                }
                if !pause.pause(schedule.retry_delay) {
                    return false;
                }
            }
        }
        true
    }
}

fn log_report(report: &RelayReport) {
    let relay = report.relay;
    match report.outcome {
        Outcome::Steady(state) => debug!("'{}' stays '{}'", relay, state),
        Outcome::Changed {
            from: Some(from),
            to,
        } => info!("'{}' changed from '{}' to '{}'", relay, from, to),
        Outcome::Changed { from: None, to } => info!("'{}' is '{}'", relay, to),
        Outcome::Failed => warn!(
            "'{}' left as is until the next cycle, wanted '{}'",
            relay, report.desired
        ),
    }
}

fn open_session<'a, T, P>(
    controller: &'a mut RelayController<T>,
    pause: &mut P,
    backoff: Duration,
) -> Option<Session<'a, T>>
where
    T: TransportClient,
    P: Pause,
{
    loop {
        if pause.is_cancelled() {
            return None;
        }
        match controller.connect() {
            Ok(()) => return Some(Session { controller }),
            Err(e) => {
                error!("{}, retrying in {:?}", e, backoff);
                if !pause.pause(backoff) {
                    return None;
                }
            }
        }
    }
}

enum Attempt {
    Done(RelayState),
    GaveUp,
    Interrupted,
}

fn reconcile<T, P>(
    controller: &mut RelayController<T>,
    pause: &mut P,
    schedule: &Schedule,
    relay: RelayId,
    desired: RelayState,
) -> Attempt
where
    T: TransportClient,
    P: Pause,
{
    let mut attempt = 1;
    loop {
        match controller.set_relay_status(desired, relay) {
            Ok(state) => return Attempt::Done(state),
            Err(e) if !e.is_link() => {
                error!("Failed to set '{}' to '{}': {}", relay, desired, e);
                return Attempt::GaveUp;
            }
            Err(e) if attempt >= schedule.attempts => {
                error!(
                    "Giving up on '{}' after {} attempt(s): {}",
                    relay, attempt, e
                );
                return Attempt::GaveUp;
            }
            Err(e) => {
                warn!("Attempt {} to set '{}' failed: {}", attempt, relay, e);
                if !pause.pause(schedule.retry_delay) {
                    return Attempt::Interrupted;
                }
                attempt += 1;
            }
        }
    }
}
