//! Recording session state machine.
//!
//! The controller is either `Idle` or `Active`. While Active it owns exactly
//! one open [`PersistenceWriter`]; every sample recorded is appended to it and
//! counted. Transitions are serialized by a mutex, and the command telling
//! producers to start or stop is dispatched while that mutex is held so
//! producers observe commands in transition order.
//!
//! `is_active` and `sample_count` read atomics and never wait on the mutex.
//! The last recorded readings are kept in a bounded ring that survives
//! `stop` and is cleared by the next `start`.

use chrono::{DateTime, Local, Utc};
use loadlink_protocol::Role;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dispatcher::CommandDispatcher;
use crate::error::BrokerError;
use crate::persistence::{file_name_of, PersistenceWriter};
use crate::recent::{RecentReading, RecentReadings};
use crate::registry::ConnectionRegistry;
use crate::sample::Sample;

const EVENT_CAPACITY: usize = 64;

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Samples update the cache only.
    Idle,
    /// Samples are persisted and relayed.
    Active,
}

/// Session lifecycle notifications, for logging and metrics.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A session began recording.
    Started { id: Uuid, path: PathBuf },
    /// A start while Active closed the previous session.
    Restarted {
        previous_id: Uuid,
        previous_sample_count: u64,
    },
    /// The session was stopped.
    Stopped {
        id: Uuid,
        sample_count: u64,
        duration: Duration,
    },
    /// A producer went away while a session was recording.
    ProducerLost {
        remaining_producers: usize,
        sample_count: u64,
    },
}

/// Result of a successful start.
#[derive(Debug, Clone)]
pub struct SessionStarted {
    pub id: Uuid,
    pub storage_path: PathBuf,
    pub file_name: String,
    pub start_time: DateTime<Utc>,
}

/// Result of a successful stop.
///
/// The optional fields are `None` when the controller was already Idle.
#[derive(Debug, Clone)]
pub struct SessionStopped {
    pub id: Option<Uuid>,
    pub sample_count: u64,
    pub storage_path: Option<PathBuf>,
    pub file_name: Option<String>,
}

struct ActiveSession {
    id: Uuid,
    started_at: Instant,
    writer: PersistenceWriter,
    sample_count: u64,
}

/// Owns the current session and its log.
pub struct SessionController {
    data_dir: PathBuf,
    file_prefix: String,
    registry: Arc<ConnectionRegistry>,
    dispatcher: Arc<CommandDispatcher>,
    active: AtomicBool,
    sample_count: AtomicU64,
    current: Mutex<Option<ActiveSession>>,
    // Locked after `current`, never before
    recent: Mutex<RecentReadings>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionController {
    /// Create an Idle controller writing session logs under `data_dir`.
    #[must_use]
    pub fn new(
        data_dir: impl Into<PathBuf>,
        file_prefix: impl Into<String>,
        registry: Arc<ConnectionRegistry>,
        dispatcher: Arc<CommandDispatcher>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            data_dir: data_dir.into(),
            file_prefix: file_prefix.into(),
            registry,
            dispatcher,
            active: AtomicBool::new(false),
            sample_count: AtomicU64::new(0),
            current: Mutex::new(None),
            recent: Mutex::new(RecentReadings::default()),
            events,
        }
    }

    /// Start a new session.
    ///
    /// Starting while Active closes the previous session first. The new log
    /// is created before anything else changes, so a failed start leaves the
    /// controller exactly as it was.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::NoProducer`] if no producer is registered, or
    /// [`BrokerError::Persistence`] if the session log cannot be created.
    pub fn start(&self) -> Result<SessionStarted, BrokerError> {
        let mut current = self.lock();
        self.require_producer()?;

        let start_time = Utc::now();
        let writer = PersistenceWriter::create_in(
            &self.data_dir,
            &self.file_prefix,
            start_time.with_timezone(&Local),
        )?;

        if let Some(previous) = current.take() {
            warn!(
                session = %previous.id,
                samples = previous.sample_count,
                "Start while recording, closing previous session"
            );
            previous.writer.close();
            self.emit(SessionEvent::Restarted {
                previous_id: previous.id,
                previous_sample_count: previous.sample_count,
            });
        }

        let started = SessionStarted {
            id: Uuid::new_v4(),
            storage_path: writer.path().to_path_buf(),
            file_name: writer.file_name(),
            start_time,
        };

        *current = Some(ActiveSession {
            id: started.id,
            started_at: Instant::now(),
            writer,
            sample_count: 0,
        });
        {
            let mut recent = self.lock_recent();
            recent.clear();
            self.sample_count.store(0, Ordering::SeqCst);
        }
        self.active.store(true, Ordering::SeqCst);

        info!(session = %started.id, file = %started.file_name, "Session started");
        self.emit(SessionEvent::Started {
            id: started.id,
            path: started.storage_path.clone(),
        });
        self.dispatcher.send("start");

        Ok(started)
    }

    /// Stop the current session.
    ///
    /// Stopping while Idle succeeds and reports an empty session, as long as
    /// a producer is there to receive the command.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::NoProducer`] if no producer is registered.
    pub fn stop(&self) -> Result<SessionStopped, BrokerError> {
        let mut current = self.lock();
        self.require_producer()?;

        self.active.store(false, Ordering::SeqCst);

        let stopped = match current.take() {
            Some(session) => {
                let path = session.writer.close();
                self.sample_count.store(session.sample_count, Ordering::SeqCst);

                info!(session = %session.id, samples = session.sample_count, "Session stopped");
                self.emit(SessionEvent::Stopped {
                    id: session.id,
                    sample_count: session.sample_count,
                    duration: session.started_at.elapsed(),
                });

                SessionStopped {
                    id: Some(session.id),
                    sample_count: session.sample_count,
                    file_name: Some(file_name_of(&path)),
                    storage_path: Some(path),
                }
            }
            None => {
                debug!("Stop while idle");
                SessionStopped {
                    id: None,
                    sample_count: 0,
                    storage_path: None,
                    file_name: None,
                }
            }
        };

        self.dispatcher.send("stop");
        Ok(stopped)
    }

    /// Record a batch into the current session.
    ///
    /// `observe` is called for every sample in order, recorded or not. Returns
    /// the number of rows persisted, or `None` if no session was recording.
    pub fn record_batch(&self, samples: &[Sample], mut observe: impl FnMut(&Sample)) -> Option<u64> {
        if !self.is_active() {
            samples.iter().for_each(observe);
            return None;
        }

        let mut current = self.lock();
        let Some(session) = current.as_mut() else {
            // Stopped between the check and the lock
            samples.iter().for_each(observe);
            return None;
        };

        let mut recent = self.lock_recent();
        let mut persisted = 0;
        for sample in samples {
            observe(sample);
            if session.writer.append(sample).is_ok() {
                session.sample_count += 1;
                persisted += 1;
                recent.push(sample);
            }
        }
        self.sample_count.store(session.sample_count, Ordering::SeqCst);

        Some(persisted)
    }

    /// Check if a session is recording.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        if self.is_active() {
            SessionState::Active
        } else {
            SessionState::Idle
        }
    }

    /// Rows persisted in the current or most recently stopped session.
    #[must_use]
    pub fn sample_count(&self) -> u64 {
        self.sample_count.load(Ordering::SeqCst)
    }

    /// Sample count and the last recorded readings, oldest first, read
    /// together.
    #[must_use]
    pub fn recent_readings(&self) -> (u64, Vec<RecentReading>) {
        let recent = self.lock_recent();
        (self.sample_count(), recent.to_vec())
    }

    /// Path of the current session's log, if recording.
    #[must_use]
    pub fn storage_path(&self) -> Option<PathBuf> {
        self.lock()
            .as_ref()
            .map(|session| session.writer.path().to_path_buf())
    }

    /// Subscribe to session events.
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Report that a producer disconnected. Emits an event only while Active.
    pub fn notify_producer_lost(&self, remaining_producers: usize) {
        if self.is_active() {
            self.emit(SessionEvent::ProducerLost {
                remaining_producers,
                sample_count: self.sample_count(),
            });
        }
    }

    fn require_producer(&self) -> Result<(), BrokerError> {
        if self.registry.count(Role::Producer) == 0 {
            return Err(BrokerError::NoProducer);
        }
        Ok(())
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn lock(&self) -> MutexGuard<'_, Option<ActiveSession>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_recent(&self) -> MutexGuard<'_, RecentReadings> {
        self.recent.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
