//! The association release/reject timer (ARTIM, PS3.8 §9.1.5).
//!
//! The timer posts [`Event::Evt18`](super::Event) ticks
//! into the machine's event queue.
//! Stopping the timer does not recall a tick already scheduled;
//! instead, every tick carries the generation it was armed under,
//! and the machine discards ticks from a superseded generation
//! upon arrival.

use std::sync::mpsc::SyncSender;
use std::thread;
use std::time::Duration;

use super::StateEvent;

/// The default ARTIM timeout.
pub(crate) const DEFAULT_ARTIM_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub(crate) struct Artim {
    events: SyncSender<StateEvent>,
    timeout: Duration,
    generation: u64,
}

impl Artim {
    pub fn new(events: SyncSender<StateEvent>, timeout: Duration) -> Self {
        Artim {
            events,
            timeout,
            generation: 0,
        }
    }

    /// Arm a new one-shot tick, superseding any pending one.
    pub fn start(&mut self) {
        self.generation += 1;
        let generation = self.generation;
        let timeout = self.timeout;
        let events = self.events.clone();
        thread::spawn(move || {
            thread::sleep(timeout);
            // delivery fails once the machine has terminated
            let _ = events.send(StateEvent::timer_tick(generation));
        });
    }

    /// Cancel and re-arm.
    pub fn restart(&mut self) {
        self.start();
    }

    /// Cancel the timer; a tick already scheduled becomes stale.
    pub fn stop(&mut self) {
        self.generation += 1;
    }

    /// Whether a tick of the given generation is still meaningful.
    pub fn is_current(&self, generation: u64) -> bool {
        generation == self.generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::sync_channel;

    #[test]
    fn ticks_from_the_armed_generation_are_current() {
        let (tx, rx) = sync_channel(4);
        let mut artim = Artim::new(tx, Duration::from_millis(10));
        artim.start();
        let tick = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(artim.is_current(tick.timer_generation));
    }

    #[test]
    fn stopping_invalidates_a_pending_tick() {
        let (tx, rx) = sync_channel(4);
        let mut artim = Artim::new(tx, Duration::from_millis(10));
        artim.start();
        artim.stop();
        let tick = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(!artim.is_current(tick.timer_generation));
    }

    #[test]
    fn restarting_supersedes_the_previous_tick() {
        let (tx, rx) = sync_channel(4);
        let mut artim = Artim::new(tx, Duration::from_millis(10));
        artim.start();
        artim.restart();
        let first = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        let second = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        // exactly one of the two ticks survives
        assert!(artim.is_current(first.timer_generation) ^ artim.is_current(second.timer_generation));
    }
}
