use std::time::Duration;

/// Waits between status polls
///
/// The engine never picks a delay of its own: it sleeps for the
/// `bwPollTimeout` the device reported.
pub trait Sleeper {
    fn sleep(&mut self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&mut self, duration: Duration) {
        std::thread::sleep(duration)
    }
}
