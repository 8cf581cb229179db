use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

enum Signal {
    Touch,
    Cancel,
}

/// Coalescing timer: every `signal` resets a deadline, and the action
/// fires once when the deadline passes without another signal. Built as a
/// channel plus a dedicated thread so there is no cancellable timer
/// object to race against.
///
/// A reason string travels with each signal for diagnostics; when a burst
/// collapses into one firing, the most recent reason wins.
pub struct Debouncer {
    tx: mpsc::Sender<Signal>,
    delay: Duration,
    action: Arc<dyn Fn(&str) + Send + Sync>,
    reason: Arc<Mutex<String>>,
}

impl Debouncer {
    pub fn new<F>(delay: Duration, action: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let action: Arc<dyn Fn(&str) + Send + Sync> = Arc::new(action);
        let reason = Arc::new(Mutex::new(String::new()));

        let loop_action = Arc::clone(&action);
        let loop_reason = Arc::clone(&reason);
        thread::spawn(move || run_loop(rx, delay, loop_action, loop_reason));

        Self {
            tx,
            delay,
            action,
            reason,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Reset the deadline; the action runs `delay` after the last signal.
    pub fn signal(&self, reason: &str) {
        self.set_reason(reason);
        let _ = self.tx.send(Signal::Touch);
    }

    /// Drop any pending firing without running the action.
    pub fn cancel(&self) {
        let _ = self.tx.send(Signal::Cancel);
    }

    /// Cancel the pending deadline and run the action synchronously on
    /// the caller's thread, for operations that must observe the result
    /// in the same request.
    pub fn force(&self, reason: &str) {
        self.set_reason(reason);
        let _ = self.tx.send(Signal::Cancel);
        let reason = self.current_reason();
        (self.action.as_ref())(&reason);
    }

    fn set_reason(&self, reason: &str) {
        if reason.is_empty() {
            return;
        }
        if let Ok(mut slot) = self.reason.lock() {
            *slot = reason.to_string();
        }
    }

    fn current_reason(&self) -> String {
        self.reason.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

fn run_loop(
    rx: mpsc::Receiver<Signal>,
    delay: Duration,
    action: Arc<dyn Fn(&str) + Send + Sync>,
    reason: Arc<Mutex<String>>,
) {
    let mut deadline: Option<Instant> = None;

    loop {
        let message = match deadline {
            // Idle: block until the next signal.
            None => match rx.recv() {
                Ok(message) => message,
                Err(_) => break,
            },
            Some(due) => {
                let now = Instant::now();
                if now >= due {
                    deadline = None;
                    fire(&action, &reason);
                    continue;
                }
                match rx.recv_timeout(due - now) {
                    Ok(message) => message,
                    Err(mpsc::RecvTimeoutError::Timeout) => {
                        deadline = None;
                        fire(&action, &reason);
                        continue;
                    }
                    Err(mpsc::RecvTimeoutError::Disconnected) => break,
                }
            }
        };

        match message {
            Signal::Touch => deadline = Some(Instant::now() + delay),
            Signal::Cancel => deadline = None,
        }
    }
}

fn fire(action: &Arc<dyn Fn(&str) + Send + Sync>, reason: &Arc<Mutex<String>>) {
    let reason = reason.lock().map(|r| r.clone()).unwrap_or_default();
    (action.as_ref())(&reason);
}

/// Suppression window for self-inflicted filesystem events: before a
/// batch of its own writes, the mutation layer extends the deadline, and
/// watch events arriving before it are dropped.
#[derive(Default)]
pub struct EventSuppressor {
    deadline: Mutex<Option<Instant>>,
}

impl EventSuppressor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ignore watch events for the next `window`. Never shortens an
    /// already-longer window.
    pub fn suppress_for(&self, window: Duration) {
        let candidate = Instant::now() + window;
        if let Ok(mut deadline) = self.deadline.lock() {
            match *deadline {
                Some(current) if current >= candidate => {}
                _ => *deadline = Some(candidate),
            }
        }
    }

    pub fn is_suppressed(&self) -> bool {
        match self.deadline.lock() {
            Ok(deadline) => matches!(*deadline, Some(due) if Instant::now() <= due),
            Err(_) => false,
        }
    }
}
