use crate::common::ActuatorError;
use crate::hardware::gpio::OutputPin;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Retry delay when the relock write itself fails.
const RELOCK_RETRY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Locked,
    /// Output is being driven high.
    Unlocking,
    /// Output is high and a relock deadline is scheduled.
    UnlockedTimed,
}

/// Outcome of a successful `unlock()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnlockPulse {
    /// True when the door was already open and only the timer was restarted.
    pub extended: bool,
    pub relock_at: Instant,
}

pub trait LockActuator: Send + Sync {
    fn unlock(&self) -> Result<UnlockPulse, ActuatorError>;
    fn lock(&self) -> Result<(), ActuatorError>;
    fn state(&self) -> LockState;
}

struct Shared {
    pin: Box<dyn OutputPin>,
    state: LockState,
    deadline: Option<Instant>,
    generation: u64,
    relocks: u64,
    shutdown: bool,
}

struct Inner {
    shared: Mutex<Shared>,
    wake: Condvar,
}

impl Inner {
    fn guard(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Lock actuator with an automatic relock timer.
///
/// The timer lives on its own thread and shares one mutex with `unlock`/`lock`,
/// so a relock can never interleave with a new unlock. Every state change bumps
/// `generation`, which invalidates whatever deadline the timer was sleeping on.
pub struct TimedLock {
    inner: Arc<Inner>,
    duration: Duration,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl TimedLock {
    pub fn new(pin: Box<dyn OutputPin>, duration: Duration) -> Self {
        let inner = Arc::new(Inner {
            shared: Mutex::new(Shared {
                pin,
                state: LockState::Locked,
                deadline: None,
                generation: 0,
                relocks: 0,
                shutdown: false,
            }),
            wake: Condvar::new(),
        });

        let timer_inner = Arc::clone(&inner);
        let timer = thread::Builder::new()
            .name("relock-timer".into())
            .spawn(move || relock_timer(timer_inner))
            .ok();
        if timer.is_none() {
            tracing::error!("Failed to spawn relock timer; unlocks will be refused");
            inner.guard().shutdown = true;
        }

        Self {
            inner,
            duration,
            timer: Mutex::new(timer),
        }
    }

    pub fn unlock_duration(&self) -> Duration {
        self.duration
    }

    pub fn relock_deadline(&self) -> Option<Instant> {
        self.inner.guard().deadline
    }

    /// Number of automatic relocks performed by the timer.
    pub fn relock_count(&self) -> u64 {
        self.inner.guard().relocks
    }

    /// Forces the output low, stops the timer thread and refuses further unlocks.
    pub fn shutdown(&self) -> Result<(), ActuatorError> {
        let forced = self.lock();
        {
            let mut shared = self.inner.guard();
            shared.shutdown = true;
        }
        self.inner.wake.notify_all();

        let handle = self
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("Relock timer thread panicked");
            }
        }
        forced
    }
}

impl LockActuator for TimedLock {
    fn unlock(&self) -> Result<UnlockPulse, ActuatorError> {
        let mut shared = self.inner.guard();
        if shared.shutdown {
            return Err(ActuatorError::ShutDown);
        }

        let extended = match shared.state {
            LockState::Locked => {
                shared.state = LockState::Unlocking;
                if let Err(e) = shared.pin.set_high() {
                    shared.state = LockState::Locked;
                    if let Err(low) = shared.pin.set_low() {
                        tracing::error!("Failed to restore lock output after unlock error: {}", low);
                    }
                    return Err(e);
                }
                false
            }
            LockState::Unlocking | LockState::UnlockedTimed => true,
        };

        let relock_at = Instant::now() + self.duration;
        shared.state = LockState::UnlockedTimed;
        shared.deadline = Some(relock_at);
        shared.generation += 1;
        drop(shared);
        self.inner.wake.notify_all();

        if extended {
            tracing::debug!("Unlock window restarted");
        } else {
            tracing::info!("Lock released for {} ms", self.duration.as_millis());
        }
        Ok(UnlockPulse { extended, relock_at })
    }

    fn lock(&self) -> Result<(), ActuatorError> {
        let mut shared = self.inner.guard();
        if shared.state != LockState::Locked {
            shared.pin.set_low()?;
            shared.state = LockState::Locked;
            tracing::info!("Lock engaged");
        }
        shared.deadline = None;
        shared.generation += 1;
        drop(shared);
        self.inner.wake.notify_all();
        Ok(())
    }

    fn state(&self) -> LockState {
        self.inner.guard().state
    }
}

impl Drop for TimedLock {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::error!("Failed to engage lock on drop: {}", e);
        }
    }
}

fn relock_timer(inner: Arc<Inner>) {
    let mut shared = inner.guard();
    loop {
        if shared.shutdown {
            return;
        }

        match shared.deadline {
            None => {
                shared = inner.wake.wait(shared).unwrap_or_else(PoisonError::into_inner);
            }
            Some(deadline) => {
                let now = Instant::now();
                if now < deadline {
                    let generation = shared.generation;
                    let (guard, _) = inner
                        .wake
                        .wait_timeout(shared, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner);
                    shared = guard;
                    if shared.generation != generation {
                        tracing::trace!("Relock deadline superseded");
                    }
                    continue;
                }

                match shared.pin.set_low() {
                    Ok(()) => {
                        shared.state = LockState::Locked;
                        shared.deadline = None;
                        shared.generation += 1;
                        shared.relocks += 1;
                        tracing::info!("Relock timer expired, lock engaged");
                    }
                    Err(e) => {
                        tracing::error!("Relock failed, retrying: {}", e);
                        shared.deadline = Some(now + RELOCK_RETRY);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Default)]
    struct RecordingPin {
        levels: Arc<Mutex<Vec<(bool, Instant)>>>,
        fail_high: bool,
    }

    impl RecordingPin {
        fn transitions(&self) -> Vec<bool> {
            self.levels.lock().unwrap().iter().map(|(level, _)| *level).collect()
        }
    }

    impl OutputPin for RecordingPin {
        fn set_high(&mut self) -> Result<(), ActuatorError> {
            if self.fail_high {
                return Err(ActuatorError::Gpio {
                    pin: 7,
                    source: std::io::Error::new(std::io::ErrorKind::Other, "bus error"),
                });
            }
            self.levels.lock().unwrap().push((true, Instant::now()));
            Ok(())
        }

        fn set_low(&mut self) -> Result<(), ActuatorError> {
            self.levels.lock().unwrap().push((false, Instant::now()));
            Ok(())
        }
    }

    #[test]
    fn relocks_after_duration() {
        let pin = RecordingPin::default();
        let lock = TimedLock::new(Box::new(pin.clone()), Duration::from_millis(100));

        let started = Instant::now();
        let pulse = lock.unlock().unwrap();
        assert!(!pulse.extended);
        assert_eq!(lock.state(), LockState::UnlockedTimed);

        thread::sleep(Duration::from_millis(250));
        assert_eq!(lock.state(), LockState::Locked);
        assert_eq!(lock.relock_count(), 1);

        let levels = pin.levels.lock().unwrap().clone();
        assert_eq!(levels.len(), 2);
        assert!(levels[1].1.duration_since(started) >= Duration::from_millis(100));
    }

    #[test]
    fn repeated_unlocks_extend_without_double_pulse() {
        let pin = RecordingPin::default();
        let lock = TimedLock::new(Box::new(pin.clone()), Duration::from_millis(200));

        lock.unlock().unwrap();
        thread::sleep(Duration::from_millis(100));
        let second = lock.unlock().unwrap();
        assert!(second.extended);
        thread::sleep(Duration::from_millis(100));
        let last = lock.unlock().unwrap();
        let last_call = Instant::now();

        // past the first window, still inside the last one
        thread::sleep(Duration::from_millis(120));
        assert_eq!(lock.state(), LockState::UnlockedTimed);

        thread::sleep(Duration::from_millis(250));
        assert_eq!(lock.state(), LockState::Locked);
        assert_eq!(lock.relock_count(), 1);
        assert_eq!(pin.transitions(), vec![true, false]);

        let relocked_at = pin.levels.lock().unwrap()[1].1;
        assert!(relocked_at >= last.relock_at);
        assert!(relocked_at.duration_since(last_call) >= Duration::from_millis(195));
    }

    #[test]
    fn explicit_lock_cancels_pending_relock() {
        let pin = RecordingPin::default();
        let lock = TimedLock::new(Box::new(pin.clone()), Duration::from_millis(400));

        lock.unlock().unwrap();
        thread::sleep(Duration::from_millis(100));
        lock.lock().unwrap();
        assert_eq!(lock.state(), LockState::Locked);
        assert!(lock.relock_deadline().is_none());

        thread::sleep(Duration::from_millis(450));
        assert_eq!(lock.relock_count(), 0);
        assert_eq!(pin.transitions(), vec![true, false]);
    }

    #[test]
    fn lock_while_locked_does_not_touch_output() {
        let pin = RecordingPin::default();
        let lock = TimedLock::new(Box::new(pin.clone()), Duration::from_millis(100));
        lock.lock().unwrap();
        assert!(pin.transitions().is_empty());
    }

    #[test]
    fn failed_gpio_write_leaves_door_locked() {
        let pin = RecordingPin { fail_high: true, ..Default::default() };
        let lock = TimedLock::new(Box::new(pin.clone()), Duration::from_millis(100));

        let err = lock.unlock().unwrap_err();
        assert!(matches!(err, ActuatorError::Gpio { pin: 7, .. }));
        assert_eq!(lock.state(), LockState::Locked);
        assert!(lock.relock_deadline().is_none());
    }

    #[test]
    fn shutdown_forces_lock_and_refuses_unlock() {
        let pin = RecordingPin::default();
        let lock = TimedLock::new(Box::new(pin.clone()), Duration::from_secs(10));

        lock.unlock().unwrap();
        lock.shutdown().unwrap();
        assert_eq!(lock.state(), LockState::Locked);
        assert!(matches!(lock.unlock(), Err(ActuatorError::ShutDown)));
        assert_eq!(pin.transitions(), vec![true, false]);
    }
}
