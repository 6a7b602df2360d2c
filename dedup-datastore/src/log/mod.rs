//! Bounded circular operation log.
//!
//! Every committed entry gets a unique, monotonically increasing log id
//! and is published synchronously to the registered consumers on the
//! committing thread ("direct" phase). A replayer later consumes the same
//! entries in the background ("replay" phase) and advances the durable
//! replay cursor, which reclaims log space.
//!
//! Frames never cross the physical end of the log file; the writer pads
//! the remainder with an explicit pad frame (or zeros, when not even a
//! frame header fits) and continues at offset zero. Recovery scans from
//! the durable cursor and accepts frames while the checksum verifies and
//! the log ids are consecutive.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::Duration;

use anyhow::{bail, format_err, Context, Error};
use serde::{Deserialize, Serialize};

use dedup_index::file::DataFile;
use dedup_index::framed::{read_framed_file, write_framed_file};
use dedup_index::parse_size;

mod events;
pub use events::{EventPayload, LogConsumer, LogEvent, ReplayMode};

/// payload size (u32), event type (u16), log id (u64)
const FRAME_HEADER_SIZE: u64 = 4 + 2 + 8;
const FRAME_TRAILER_SIZE: u64 = 4;
const MIN_FRAME_SIZE: u64 = FRAME_HEADER_SIZE + FRAME_TRAILER_SIZE;

const PAD_EVENT_TYPE: u16 = 0xffff;

/// Replay cursor persistence interval (events).
const CURSOR_PERSIST_INTERVAL: u64 = 32;

/// How long a producer waits for replay to free log space.
const COMMIT_FULL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LogInfo {
    /// Virtual offset of the durable replay cursor.
    tail: u64,
    /// Next log id at the time the info was written.
    next_log_id: u64,
    /// Log id expected at the cursor position. Recovery rejects frames
    /// with any other id, which keeps stale frames of earlier laps from
    /// being mistaken for live entries.
    tail_log_id: u64,
}

#[derive(Debug)]
struct LogState {
    /// Virtual write position (monotonic; physical is modulo the size).
    head: u64,
    /// Virtual replay position.
    tail: u64,
    /// Durable replay position; commits never overwrite beyond it.
    durable_tail: u64,
    next_log_id: u64,
    /// Log id of the last entry whose replay completed.
    replayed_log_id: u64,
    empty_notified: bool,
}

/// Configuration of the [OperationLog].
#[derive(Clone, Debug)]
pub struct LogConfig {
    pub filename: PathBuf,
    pub max_log_size: u64,
    pub info_filename: Option<PathBuf>,
    pub sync: bool,
    /// Fill ratio above which the log reports nearly-full.
    pub nearly_full_ratio: f64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filename: PathBuf::new(),
            max_log_size: 32 * 1024 * 1024,
            info_filename: None,
            sync: true,
            nearly_full_ratio: 0.8,
        }
    }
}

impl LogConfig {
    pub fn set_option(&mut self, name: &str, value: &str) -> Result<(), Error> {
        match name {
            "filename" => self.filename = PathBuf::from(value),
            "max-log-size" => self.max_log_size = parse_size(value)?,
            "info.filename" => self.info_filename = Some(PathBuf::from(value)),
            "info.max-item-count" => {
                // accepted for compatibility; the cursor file is a single record
            }
            "sync" => self.sync = dedup_index::parse_bool(value)?,
            "nearly-full-ratio" => self.nearly_full_ratio = value.parse()?,
            _ => bail!("unknown log option '{name}'"),
        }
        Ok(())
    }
}

/// The bounded circular event journal.
pub struct OperationLog {
    file: DataFile,
    size: u64,
    sync: bool,
    nearly_full_ratio: f64,
    info_path: PathBuf,
    state: Mutex<LogState>,
    space_freed: Condvar,
    consumers: RwLock<Vec<(String, Arc<dyn LogConsumer>)>>,
    replay_failures: AtomicU64,
}

impl OperationLog {
    pub fn start(config: LogConfig, create: bool) -> Result<Self, Error> {
        if config.filename.as_os_str().is_empty() {
            bail!("operation log has no filename");
        }
        if config.max_log_size < 4096 {
            bail!("log size {} too small", config.max_log_size);
        }
        let info_path = config
            .info_filename
            .clone()
            .unwrap_or_else(|| config.filename.with_extension("info"));

        let file = DataFile::open(&config.filename, create)?;
        if file.size()? < config.max_log_size {
            file.allocate(config.max_log_size)?;
        }

        let state = if create {
            if read_framed_file::<LogInfo, _>(&info_path)?.is_some() {
                bail!("log info file {:?} already exists", info_path);
            }
            let info = LogInfo {
                tail: 0,
                next_log_id: 1,
                tail_log_id: 1,
            };
            write_framed_file(&info_path, &info)?;
            LogState {
                head: 0,
                tail: 0,
                durable_tail: 0,
                next_log_id: 1,
                replayed_log_id: 0,
                empty_notified: true,
            }
        } else {
            let info: LogInfo = read_framed_file(&info_path)?
                .ok_or_else(|| format_err!("log info file {:?} missing", info_path))?;
            let mut state = LogState {
                head: info.tail,
                tail: info.tail,
                durable_tail: info.tail,
                next_log_id: info.next_log_id,
                replayed_log_id: info.tail_log_id.saturating_sub(1),
                empty_notified: false,
            };
            Self::recover_head(&file, config.max_log_size, info.tail_log_id, &mut state)?;
            state
        };

        Ok(Self {
            file,
            size: config.max_log_size,
            sync: config.sync,
            nearly_full_ratio: config.nearly_full_ratio,
            info_path,
            state: Mutex::new(state),
            space_freed: Condvar::new(),
            consumers: RwLock::new(Vec::new()),
            replay_failures: AtomicU64::new(0),
        })
    }

    /// Scans forward from the durable cursor to find the write position
    /// and the next log id. Only the consecutive id chain starting at
    /// `tail_log_id` counts; anything else is a stale remainder.
    fn recover_head(
        file: &DataFile,
        size: u64,
        tail_log_id: u64,
        state: &mut LogState,
    ) -> Result<(), Error> {
        let mut pos = state.tail;
        let mut last_good = pos;
        let mut expected_id = tail_log_id;
        let mut found_any = false;

        loop {
            match Self::read_frame_raw(file, size, pos)? {
                RawFrame::Pad { next } => {
                    pos = next;
                }
                RawFrame::Frame {
                    log_id,
                    event_type,
                    payload,
                    next,
                } => {
                    if log_id != expected_id {
                        break;
                    }
                    // frames must parse; a corrupt payload ends the scan
                    if EventPayload::decode(event_type, &payload).is_err() {
                        break;
                    }
                    found_any = true;
                    expected_id = log_id + 1;
                    pos = next;
                    last_good = pos;
                }
                RawFrame::Invalid => break,
            }
            if pos >= state.tail + size {
                // one full lap; the log cannot hold more
                break;
            }
        }

        state.head = last_good;
        if found_any {
            state.next_log_id = std::cmp::max(state.next_log_id, expected_id);
        }
        state.empty_notified = state.head == state.tail;
        log::info!(
            "log recovered: head {} tail {} next id {}",
            state.head,
            state.tail,
            state.next_log_id
        );
        Ok(())
    }

    fn read_frame_raw(file: &DataFile, size: u64, pos: u64) -> Result<RawFrame, Error> {
        let phys = pos % size;
        let remaining = size - phys;
        if remaining < MIN_FRAME_SIZE {
            return Ok(RawFrame::Pad {
                next: pos + remaining,
            });
        }

        let mut header = [0u8; FRAME_HEADER_SIZE as usize];
        file.read_at(phys, &mut header)?;
        let payload_size = u32::from_le_bytes(header[0..4].try_into().unwrap()) as u64;
        let event_type = u16::from_le_bytes(header[4..6].try_into().unwrap());
        let log_id = u64::from_le_bytes(header[6..14].try_into().unwrap());

        let frame_size = FRAME_HEADER_SIZE + payload_size + FRAME_TRAILER_SIZE;
        if frame_size > remaining {
            return Ok(RawFrame::Invalid);
        }

        let mut rest = vec![0u8; (payload_size + FRAME_TRAILER_SIZE) as usize];
        file.read_at(phys + FRAME_HEADER_SIZE, &mut rest)?;
        let payload = &rest[..payload_size as usize];
        let crc = u32::from_le_bytes(rest[payload_size as usize..].try_into().unwrap());

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&header);
        hasher.update(payload);
        if hasher.finalize() != crc {
            return Ok(RawFrame::Invalid);
        }

        if event_type == PAD_EVENT_TYPE {
            return Ok(RawFrame::Pad {
                next: pos + frame_size,
            });
        }
        Ok(RawFrame::Frame {
            log_id,
            event_type,
            payload: payload.to_vec(),
            next: pos + frame_size,
        })
    }

    fn write_frame(
        &self,
        pos: u64,
        event_type: u16,
        log_id: u64,
        payload: &[u8],
    ) -> Result<(), Error> {
        let mut buf =
            Vec::with_capacity((FRAME_HEADER_SIZE + FRAME_TRAILER_SIZE) as usize + payload.len());
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&event_type.to_le_bytes());
        buf.extend_from_slice(&log_id.to_le_bytes());
        buf.extend_from_slice(payload);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&buf);
        buf.extend_from_slice(&hasher.finalize().to_le_bytes());

        self.file.write_at(pos % self.size, &buf)
    }

    pub fn register_consumer(
        &self,
        name: &str,
        consumer: Arc<dyn LogConsumer>,
    ) -> Result<(), Error> {
        let mut consumers = self.consumers.write().unwrap();
        if consumers.iter().any(|(n, _)| n == name) {
            bail!("log consumer '{name}' already registered");
        }
        consumers.push((name.to_string(), consumer));
        Ok(())
    }

    pub fn unregister_consumer(&self, name: &str) -> Result<(), Error> {
        let mut consumers = self.consumers.write().unwrap();
        let before = consumers.len();
        consumers.retain(|(n, _)| n != name);
        if consumers.len() == before {
            bail!("log consumer '{name}' not registered");
        }
        Ok(())
    }

    /// Appends an event, makes it durable and publishes it synchronously
    /// to all registered consumers in registration order.
    ///
    /// Returns the assigned log id. When a direct consumer fails the
    /// commit call fails, but the entry remains on disk and is delivered
    /// again during replay.
    ///
    /// Direct consumers run on the committing thread under the commit
    /// lock and must not commit events themselves.
    pub fn commit_event(&self, payload: EventPayload) -> Result<u64, Error> {
        let encoded = payload.encode()?;
        let frame_size = FRAME_HEADER_SIZE + encoded.len() as u64 + FRAME_TRAILER_SIZE;
        if frame_size > self.size / 2 {
            bail!("event of {} bytes too large for the log", encoded.len());
        }

        let mut state = self.state.lock().unwrap();

        // the frame must fit contiguously; account for boundary padding
        loop {
            let phys = state.head % self.size;
            let pad = if self.size - phys < frame_size {
                self.size - phys
            } else {
                0
            };
            let used = state.head - state.durable_tail;
            if used + pad + frame_size <= self.size {
                if pad > 0 {
                    self.write_pad(state.head, pad)?;
                    state.head += pad;
                }
                break;
            }
            let (next, timeout) = self
                .space_freed
                .wait_timeout(state, COMMIT_FULL_TIMEOUT)
                .unwrap();
            state = next;
            if timeout.timed_out() {
                bail!("log full - replay does not advance");
            }
        }

        let log_id = state.next_log_id;
        self.write_frame(state.head, payload.event_type(), log_id, &encoded)?;
        if self.sync {
            self.file.sync()?;
        }
        state.next_log_id += 1;
        state.head += frame_size;
        state.empty_notified = false;

        let event = LogEvent {
            log_id,
            payload: payload.clone(),
        };
        let consumers = self.consumers.read().unwrap();
        for (name, consumer) in consumers.iter() {
            consumer
                .log_replay(&event, ReplayMode::Direct)
                .with_context(|| {
                    format!(
                        "direct consumer '{}' failed for {} event {}",
                        name,
                        payload.type_name(),
                        log_id
                    )
                })?;
        }
        Ok(log_id)
    }

    fn write_pad(&self, pos: u64, pad: u64) -> Result<(), Error> {
        if pad < MIN_FRAME_SIZE {
            // not even a header fits; recovery skips the zeroed remainder
            self.file.write_at(pos % self.size, &vec![0u8; pad as usize])
        } else {
            let payload = vec![0u8; (pad - MIN_FRAME_SIZE) as usize];
            self.write_frame(pos, PAD_EVENT_TYPE, 0, &payload)
        }
    }

    /// Replays up to `max_events` entries to all registered consumers.
    ///
    /// Returns the number of replayed entries; zero means the log is
    /// drained (a synthetic `LogEmpty` event is delivered once per drain
    /// transition). Delivery is at-least-once: the cursor only advances
    /// after every consumer accepted the event.
    pub fn replay(&self, mode: ReplayMode, max_events: u64) -> Result<u64, Error> {
        if mode == ReplayMode::Direct {
            bail!("direct mode is reserved for commit-time publication");
        }
        let mut replayed = 0;
        while replayed < max_events {
            // consumers may commit follow-up events (block promotions);
            // free the replayed space first so they cannot starve
            if self.is_nearly_full() {
                self.persist_cursor()?;
            }
            let frame = {
                let mut state = self.state.lock().unwrap();
                let mut frame = None;
                while state.tail < state.head {
                    match Self::read_frame_raw(&self.file, self.size, state.tail)? {
                        RawFrame::Pad { next } => state.tail = next,
                        RawFrame::Frame {
                            log_id,
                            event_type,
                            payload,
                            next,
                        } => {
                            frame = Some((log_id, event_type, payload, next));
                            break;
                        }
                        RawFrame::Invalid => {
                            bail!("corrupt log frame at replay position {}", state.tail);
                        }
                    }
                }
                if frame.is_none() && !state.empty_notified {
                    state.empty_notified = true;
                    let log_id = state.next_log_id;
                    drop(state);
                    self.deliver_all(
                        &LogEvent {
                            log_id,
                            payload: EventPayload::LogEmpty,
                        },
                        mode,
                    )?;
                    self.persist_cursor()?;
                    return Ok(replayed);
                }
                frame
            };

            let (log_id, event_type, payload, next) = match frame {
                Some(frame) => frame,
                None => return Ok(replayed),
            };
            let event = LogEvent {
                log_id,
                payload: EventPayload::decode(event_type, &payload)?,
            };
            if let Err(err) = self.deliver_all(&event, mode) {
                self.replay_failures.fetch_add(1, Ordering::SeqCst);
                return Err(err);
            }

            let persist = {
                let mut state = self.state.lock().unwrap();
                state.tail = next;
                state.replayed_log_id = log_id;
                state.tail - state.durable_tail >= CURSOR_PERSIST_INTERVAL * MIN_FRAME_SIZE
            };
            if persist {
                self.persist_cursor()?;
            }
            replayed += 1;
        }
        Ok(replayed)
    }

    fn deliver_all(&self, event: &LogEvent, mode: ReplayMode) -> Result<(), Error> {
        let consumers = self.consumers.read().unwrap();
        for (name, consumer) in consumers.iter() {
            consumer.log_replay(event, mode).with_context(|| {
                format!(
                    "consumer '{}' failed for {} event {}",
                    name,
                    event.payload.type_name(),
                    event.log_id
                )
            })?;
        }
        Ok(())
    }

    /// Persists the replay cursor, freeing the space before it.
    pub fn persist_cursor(&self) -> Result<(), Error> {
        let info = {
            let state = self.state.lock().unwrap();
            LogInfo {
                tail: state.tail,
                next_log_id: state.next_log_id,
                tail_log_id: state.replayed_log_id + 1,
            }
        };
        write_framed_file(&self.info_path, &info)?;
        {
            let mut state = self.state.lock().unwrap();
            state.durable_tail = std::cmp::max(state.durable_tail, info.tail);
        }
        self.space_freed.notify_all();
        Ok(())
    }

    /// Replays everything up to the current head. Used for the dirty
    /// replay at startup and for draining on writeback stop.
    pub fn replay_all(&self, mode: ReplayMode) -> Result<u64, Error> {
        let mut total = 0;
        loop {
            let replayed = self.replay(mode, 1024)?;
            total += replayed;
            if replayed == 0 {
                break;
            }
        }
        self.persist_cursor()?;
        Ok(total)
    }

    pub fn is_empty(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.tail >= state.head
    }

    pub fn fill_ratio(&self) -> f64 {
        let state = self.state.lock().unwrap();
        (state.head - state.durable_tail) as f64 / self.size as f64
    }

    pub fn is_nearly_full(&self) -> bool {
        self.fill_ratio() >= self.nearly_full_ratio
    }

    pub fn last_log_id(&self) -> u64 {
        self.state.lock().unwrap().next_log_id - 1
    }

    pub fn replayed_log_id(&self) -> u64 {
        self.state.lock().unwrap().replayed_log_id
    }

    pub fn replay_failure_count(&self) -> u64 {
        self.replay_failures.load(Ordering::SeqCst)
    }

    /// Flushes the durable cursor and syncs the log file.
    pub fn close(&self) -> Result<(), Error> {
        self.persist_cursor()?;
        self.file.sync()?;
        Ok(())
    }

    /// Status summary for the inspection surface.
    pub fn info(&self) -> serde_json::Value {
        let state = self.state.lock().unwrap();
        serde_json::json!({
            "size": self.size,
            "head": state.head,
            "tail": state.tail,
            "durable-tail": state.durable_tail,
            "next-log-id": state.next_log_id,
            "replayed-log-id": state.replayed_log_id,
            "fill-ratio": (state.head - state.durable_tail) as f64 / self.size as f64,
            "replay-failures": self.replay_failures.load(Ordering::SeqCst),
        })
    }

    /// Reads committed events without touching the replay cursor
    /// (inspection surface).
    pub fn read_events(&self, start_position: u64, max: usize) -> Result<Vec<LogEvent>, Error> {
        let (mut pos, head) = {
            let state = self.state.lock().unwrap();
            (start_position, state.head)
        };
        let mut events = Vec::new();
        while pos < head && events.len() < max {
            match Self::read_frame_raw(&self.file, self.size, pos)? {
                RawFrame::Pad { next } => pos = next,
                RawFrame::Frame {
                    log_id,
                    event_type,
                    payload,
                    next,
                } => {
                    events.push(LogEvent {
                        log_id,
                        payload: EventPayload::decode(event_type, &payload)?,
                    });
                    pos = next;
                }
                RawFrame::Invalid => break,
            }
        }
        Ok(events)
    }
}

enum RawFrame {
    Frame {
        log_id: u64,
        event_type: u16,
        payload: Vec<u8>,
        next: u64,
    },
    Pad {
        next: u64,
    },
    Invalid,
}
