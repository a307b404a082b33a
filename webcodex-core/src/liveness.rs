//! Liveness monitor: periodic ping/pong sweep over every open terminal
//! transport.
//!
//! Each transport carries a [`LivenessCell`]. On every tick the monitor
//! advances each cell:
//!
//! ```text
//! Alive --tick/ping--> AwaitingPong --pong--> Alive
//!                      AwaitingPong --tick--> Terminated
//! ```
//!
//! A peer that stops answering is therefore dropped on the second tick after
//! its last ping, and there is never more than one ping in flight.

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::registry::{SessionCommand, SessionRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Liveness {
    Alive = 0,
    AwaitingPong = 1,
    Terminated = 2,
}

impl Liveness {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Liveness::Alive,
            1 => Liveness::AwaitingPong,
            _ => Liveness::Terminated,
        }
    }
}

/// What a sweep decided for one transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    /// Was alive, now awaiting a pong: send a ping.
    Ping,
    /// Missed the previous ping: drop the transport.
    Terminate,
    /// Already terminated, nothing to do.
    Skip,
}

/// Atomic liveness state shared between the monitor and a transport's relay.
#[derive(Debug)]
pub struct LivenessCell(AtomicU8);

impl Default for LivenessCell {
    fn default() -> Self {
        Self(AtomicU8::new(Liveness::Alive as u8))
    }
}

impl LivenessCell {
    pub fn get(&self) -> Liveness {
        Liveness::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Pong received. Returns `false` if the transport was already
    /// terminated, which is final.
    pub fn on_pong(&self) -> bool {
        match self.transition(Liveness::AwaitingPong, Liveness::Alive) {
            Ok(()) => true,
            Err(current) => current != Liveness::Terminated,
        }
    }

    /// Advance the state for one monitor tick.
    pub fn advance(&self) -> Probe {
        loop {
            match self.get() {
                Liveness::Alive => {
                    if self
                        .transition(Liveness::Alive, Liveness::AwaitingPong)
                        .is_ok()
                    {
                        return Probe::Ping;
                    }
                }
                Liveness::AwaitingPong => {
                    if self
                        .transition(Liveness::AwaitingPong, Liveness::Terminated)
                        .is_ok()
                    {
                        return Probe::Terminate;
                    }
                }
                Liveness::Terminated => return Probe::Skip,
            }
            // Lost a race with a pong, re-read and try again
        }
    }

    /// Mark terminated regardless of the current state.
    pub fn terminate(&self) {
        self.0.store(Liveness::Terminated as u8, Ordering::Release);
    }

    fn transition(&self, from: Liveness, to: Liveness) -> Result<(), Liveness> {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(Liveness::from_u8)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub pinged: usize,
    pub terminated: usize,
}

pub struct LivenessMonitor {
    registry: SessionRegistry,
    interval: Duration,
}

impl LivenessMonitor {
    pub fn new(registry: SessionRegistry, interval: Duration) -> Self {
        Self { registry, interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run a single tick over every registered transport.
    pub fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        for handle in self.registry.handles() {
            match handle.liveness().advance() {
                Probe::Ping => {
                    // A failed send leaves the entry awaiting a pong, so the
                    // next tick reclaims it like any other silent peer.
                    handle.send(SessionCommand::Ping);
                    report.pinged += 1;
                }
                Probe::Terminate => {
                    info!(session_id = %handle.id(), "Terminal peer missed heartbeat, terminating");
                    handle.send(SessionCommand::Terminate);
                    report.terminated += 1;
                }
                Probe::Skip => {}
            }
        }

        report
    }

    /// Sweep on every interval until `cancel` fires. The first sweep happens
    /// one full interval after start.
    pub async fn run(self, cancel: CancellationToken) {
        let start = tokio::time::Instant::now() + self.interval;
        let mut ticker = tokio::time::interval_at(start, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Liveness monitor stopped");
                    return;
                }
                _ = ticker.tick() => {
                    let report = self.sweep();
                    if report.pinged > 0 || report.terminated > 0 {
                        debug!(pinged = report.pinged, terminated = report.terminated, "Heartbeat sweep");
                    }
                }
            }
        }
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }
}
