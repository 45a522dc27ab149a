pub mod gpio;
pub mod lock;

pub use gpio::{OutputPin, SysfsPin};
pub use lock::{LockActuator, LockState, TimedLock, UnlockPulse};
