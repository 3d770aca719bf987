use gwh::cancel::Cancellation;
use log::debug;
use std::sync::atomic::{AtomicU8, Ordering};

/// Shuts the server down gracefully on the first signal and immediately on the second.
pub struct ShutdownHandler<F> {
    signal_count: AtomicU8,
    cancellation: Cancellation,
    stop_serving: F,
}

impl<F> ShutdownHandler<F>
where
    F: Fn() + Send + Sync + 'static,
{
    pub fn new(cancellation: Cancellation, stop_serving: F) -> Self {
        ShutdownHandler {
            signal_count: AtomicU8::new(0),
            cancellation,
            stop_serving,
        }
    }

    /// Handle the termination signals on a background thread.
    #[cfg(unix)]
    pub fn listen(self) {
        use log::warn;
        use signal_hook::{
            consts::TERM_SIGNALS,
            iterator::{exfiltrator::SignalOnly, SignalsInfo},
        };
        use std::thread;

        match SignalsInfo::<SignalOnly>::new(TERM_SIGNALS) {
            Ok(mut signals) => {
                thread::spawn(move || self.handle(&mut signals));
            }
            Err(err) => warn!("Failed setting up signal handler: {err}."),
        }
    }

    #[cfg(not(unix))]
    pub fn listen(self) {
        debug!("Signal handlers are not supported on non-unix systems.");
    }

    fn handle<I>(&self, signals: I)
    where
        I: IntoIterator<Item = i32>,
    {
        use std::{process, thread::sleep, time::Duration};

        for signal in signals {
            let previous = self.signal_count.fetch_add(1, Ordering::AcqRel);
            if previous == 0 {
                debug!("Got signal {signal}, terminating after the running requests finished.");
                self.cancellation.cancel();
                (self.stop_serving)();
            } else {
                // Allow a little time for the clean shutdown to still happen.
                sleep(Duration::from_millis(100));
                debug!("Got signal {signal}, terminating right now.");
                process::exit(signal);
            }
        }
    }
}
