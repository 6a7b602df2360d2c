use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Consumer of idle ticks (garbage collectors, replay throttling).
pub trait IdleTickConsumer: Send + Sync {
    fn on_idle_tick(&self);
}

/// Detects request-idle phases and drives the registered consumers.
///
/// The engine notifies request activity; once no activity was seen for
/// the threshold, each `tick` call fans out to the consumers. Tests can
/// force the idle state.
pub struct IdleDetector {
    consumers: RwLock<Vec<(String, Arc<dyn IdleTickConsumer>)>>,
    last_activity: Mutex<Instant>,
    idle_threshold: Duration,
    forced_idle: AtomicBool,
}

impl IdleDetector {
    pub fn new(idle_threshold: Duration) -> Self {
        Self {
            consumers: RwLock::new(Vec::new()),
            last_activity: Mutex::new(Instant::now()),
            idle_threshold,
            forced_idle: AtomicBool::new(false),
        }
    }

    pub fn register_consumer(&self, name: &str, consumer: Arc<dyn IdleTickConsumer>) {
        self.consumers
            .write()
            .unwrap()
            .push((name.to_string(), consumer));
    }

    /// Called on every served request.
    pub fn notify_activity(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    pub fn is_idle(&self) -> bool {
        if self.forced_idle.load(Ordering::SeqCst) {
            return true;
        }
        self.last_activity.lock().unwrap().elapsed() >= self.idle_threshold
    }

    pub fn force_idle(&self, forced: bool) {
        self.forced_idle.store(forced, Ordering::SeqCst);
    }

    /// Delivers one idle tick to every consumer if the system is idle.
    pub fn tick(&self) {
        if !self.is_idle() {
            return;
        }
        let consumers = self.consumers.read().unwrap();
        for (name, consumer) in consumers.iter() {
            log::trace!("idle tick for '{name}'");
            consumer.on_idle_tick();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicU64;

    struct Counter(AtomicU64);

    impl IdleTickConsumer for Counter {
        fn on_idle_tick(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn ticks_only_reach_consumers_while_idle() {
        let detector = IdleDetector::new(Duration::from_secs(3600));
        let counter = Arc::new(Counter(AtomicU64::new(0)));
        detector.register_consumer("counter", counter.clone());

        detector.notify_activity();
        detector.tick();
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);

        detector.force_idle(true);
        detector.tick();
        detector.tick();
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);

        detector.force_idle(false);
        detector.tick();
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
    }
}
