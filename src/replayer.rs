use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{bail, Error};

use dedup_datastore::{IdleDetector, OperationLog, ReplayMode};

/// Consecutive replay failures after which the replayer gives up.
const MAX_CONSECUTIVE_FAILURES: u64 = 16;

/// Configuration of the background log replayer.
#[derive(Clone, Debug)]
pub struct LogReplayerConfig {
    /// Sleep between batches in milliseconds (0 disables throttling).
    pub throttle_default: u64,
    /// Sleep between batches while the log is nearly full.
    pub throttle_nearly_full: u64,
    /// Batch size while the system is idle.
    pub area_size_system_idle: u64,
    /// Batch size while the log is nearly full.
    pub area_size_log_full: u64,
}

impl Default for LogReplayerConfig {
    fn default() -> Self {
        Self {
            throttle_default: 10,
            throttle_nearly_full: 0,
            area_size_system_idle: 4096,
            area_size_log_full: 4096,
        }
    }
}

impl LogReplayerConfig {
    pub fn set_option(&mut self, name: &str, value: &str) -> Result<(), Error> {
        match name {
            "throttle.default" => {
                // deactivated via throttle.default=false
                self.throttle_default = if value == "false" { 0 } else { value.parse()? };
            }
            "throttle.nearly-full" => {
                self.throttle_nearly_full = if value == "false" { 0 } else { value.parse()? };
            }
            "area-size-system-idle" => self.area_size_system_idle = value.parse()?,
            "area-size-log-full" => self.area_size_log_full = value.parse()?,
            _ => bail!("unknown log replayer option '{name}'"),
        }
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LogReplayerState {
    Created,
    Started,
    Running,
    Paused,
    Stopped,
    Failed,
}

struct Shared {
    state: Mutex<LogReplayerState>,
    changed: Condvar,
}

/// Background thread consuming the operation log.
///
/// The replayer runs while the system is idle or the log is nearly full,
/// throttled by the configured sleep times. Repeated consumer failures
/// mark it failed; a failed replayer requires operator intervention.
pub struct LogReplayer {
    config: LogReplayerConfig,
    log: Arc<OperationLog>,
    idle: Arc<IdleDetector>,
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl LogReplayer {
    pub fn new(
        config: LogReplayerConfig,
        log: Arc<OperationLog>,
        idle: Arc<IdleDetector>,
    ) -> Self {
        if config.throttle_nearly_full > config.throttle_default {
            log::warn!(
                "nearly full throttling higher than default throttling: {}, {}",
                config.throttle_nearly_full,
                config.throttle_default
            );
        }
        Self {
            config,
            log,
            idle,
            shared: Arc::new(Shared {
                state: Mutex::new(LogReplayerState::Created),
                changed: Condvar::new(),
            }),
            thread: Mutex::new(None),
        }
    }

    pub fn state(&self) -> LogReplayerState {
        *self.shared.state.lock().unwrap()
    }

    pub fn start(&self) -> Result<(), Error> {
        {
            let mut state = self.shared.state.lock().unwrap();
            if *state != LogReplayerState::Created {
                bail!("log replayer already started");
            }
            *state = LogReplayerState::Started;
        }

        let config = self.config.clone();
        let log = Arc::clone(&self.log);
        let idle = Arc::clone(&self.idle);
        let shared = Arc::clone(&self.shared);

        let handle = std::thread::Builder::new()
            .name("log-replayer".to_string())
            .spawn(move || Self::run(config, log, idle, shared))?;
        *self.thread.lock().unwrap() = Some(handle);
        Ok(())
    }

    fn run(
        config: LogReplayerConfig,
        log: Arc<OperationLog>,
        idle: Arc<IdleDetector>,
        shared: Arc<Shared>,
    ) {
        {
            let mut state = shared.state.lock().unwrap();
            if *state == LogReplayerState::Started {
                *state = LogReplayerState::Running;
            }
        }
        let mut failures: u64 = 0;
        loop {
            {
                let mut state = shared.state.lock().unwrap();
                loop {
                    match *state {
                        LogReplayerState::Stopped | LogReplayerState::Failed => return,
                        LogReplayerState::Paused => {
                            state = shared.changed.wait(state).unwrap();
                        }
                        _ => break,
                    }
                }
            }

            let nearly_full = log.is_nearly_full();
            if !nearly_full && !idle.is_idle() && !log.is_empty() {
                // neither idle nor under pressure; check again shortly
                std::thread::sleep(Duration::from_millis(std::cmp::max(
                    10,
                    config.throttle_default,
                )));
                continue;
            }

            let batch = if nearly_full {
                config.area_size_log_full
            } else {
                config.area_size_system_idle
            };
            match log.replay(ReplayMode::Background, batch) {
                Ok(_) => failures = 0,
                Err(err) => {
                    failures += 1;
                    log::error!("background replay failed ({failures}) - {err:#}");
                    if failures >= MAX_CONSECUTIVE_FAILURES {
                        log::error!("log replayer failed permanently");
                        *shared.state.lock().unwrap() = LogReplayerState::Failed;
                        shared.changed.notify_all();
                        return;
                    }
                    // back off before the retry
                    std::thread::sleep(Duration::from_millis(100 * failures));
                    continue;
                }
            }

            let throttle = if nearly_full {
                config.throttle_nearly_full
            } else {
                config.throttle_default
            };
            if throttle > 0 {
                std::thread::sleep(Duration::from_millis(throttle));
            } else if log.is_empty() {
                std::thread::sleep(Duration::from_millis(10));
            }
        }
    }

    pub fn pause(&self) -> Result<(), Error> {
        let mut state = self.shared.state.lock().unwrap();
        match *state {
            LogReplayerState::Running | LogReplayerState::Started => {
                *state = LogReplayerState::Paused;
                self.shared.changed.notify_all();
                Ok(())
            }
            other => bail!("cannot pause log replayer in state {other:?}"),
        }
    }

    pub fn resume(&self) -> Result<(), Error> {
        let mut state = self.shared.state.lock().unwrap();
        match *state {
            LogReplayerState::Paused => {
                *state = LogReplayerState::Running;
                self.shared.changed.notify_all();
                Ok(())
            }
            other => bail!("cannot resume log replayer in state {other:?}"),
        }
    }

    pub fn stop(&self) -> Result<(), Error> {
        {
            let mut state = self.shared.state.lock().unwrap();
            if *state == LogReplayerState::Created {
                *state = LogReplayerState::Stopped;
                return Ok(());
            }
            if *state != LogReplayerState::Failed {
                *state = LogReplayerState::Stopped;
            }
            self.shared.changed.notify_all();
        }
        if let Some(handle) = self.thread.lock().unwrap().take() {
            handle
                .join()
                .map_err(|_| anyhow::format_err!("log replayer thread panicked"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testutil::TestDir;
    use dedup_datastore::{EventPayload, LogConfig};

    #[test]
    fn replayer_drains_log_in_background() {
        let dir = TestDir::new("replayer-drain");
        let log = Arc::new(
            OperationLog::start(
                LogConfig {
                    filename: dir.path().join("op.log"),
                    max_log_size: 1024 * 1024,
                    sync: false,
                    ..Default::default()
                },
                true,
            )
            .unwrap(),
        );
        for i in 0..32 {
            log.commit_event(EventPayload::VolumeAttached { volume_id: i })
                .unwrap();
        }

        let idle = Arc::new(IdleDetector::new(Duration::from_secs(3600)));
        idle.force_idle(true);

        let replayer = LogReplayer::new(
            LogReplayerConfig {
                throttle_default: 1,
                ..Default::default()
            },
            Arc::clone(&log),
            idle,
        );
        replayer.start().unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while !log.is_empty() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(log.is_empty());

        replayer.pause().unwrap();
        assert_eq!(replayer.state(), LogReplayerState::Paused);
        replayer.resume().unwrap();
        replayer.stop().unwrap();
        assert_eq!(replayer.state(), LogReplayerState::Stopped);
    }
}
