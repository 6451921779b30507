//! Execution engine seam.
//!
//! The engine (language runtime, job scheduler, audio mixer) lives outside
//! the bridge. Inbound handlers talk to it only through [`Engine`]; the
//! engine reports asynchronous results back through an [`EventSender`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use chrono::NaiveDate;

use crate::bridge::protocol::{OutboundEvent, VersionReport};
use crate::outbound::{EventSender, QueueClosed};
use crate::version::ReleaseVersion;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("{operation} is not supported by this engine")]
    Unsupported { operation: &'static str },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("engine I/O error")]
    Io(#[from] std::io::Error),

    #[error("event queue closed")]
    QueueClosed(#[from] QueueClosed),

    #[error("{0}")]
    Other(String),
}

impl EngineError {
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }
}

/// Request to complete a snippet or re-indent a selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndentRequest {
    pub id: String,
    pub buffer: String,
    pub start_line: i32,
    pub finish_line: i32,
    pub point_line: i32,
    pub point_index: i32,
}

/// Request to reformat a whole buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeautifyRequest {
    pub id: String,
    pub buffer: String,
    pub line: i32,
    pub index: i32,
    pub first_line: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordingCommand {
    Start,
    Stop,
    Delete,
    Save { filename: String },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MixerCommand {
    InvertStereo,
    StandardStereo,
    StereoMode,
    MonoMode,
    /// High-pass filter cutoff in Hz.
    EnableHpf(f64),
    DisableHpf,
    /// Low-pass filter cutoff in Hz.
    EnableLpf(f64),
    DisableLpf,
}

/// Operations the bridge invokes on the execution engine.
///
/// Calls are made one at a time from a blocking-capable thread. Results
/// that the GUI should see are reported through the engine's event sender.
/// Optional capabilities default to [`EngineError::Unsupported`].
pub trait Engine: Send + Sync + 'static {
    /// Evaluate source code, optionally on behalf of a named workspace.
    fn eval(&self, code: &str, workspace: Option<&str>) -> Result<(), EngineError>;

    fn save_buffer(&self, buffer_id: &str, content: &str) -> Result<(), EngineError>;

    /// Load a persisted buffer; content is reported as a replace-buffer event.
    fn load_buffer(&self, buffer_id: &str) -> Result<(), EngineError>;

    /// Shut the engine down. Expected to enqueue [`OutboundEvent::Exit`].
    fn exit(&self) -> Result<(), EngineError>;

    fn stop_jobs(&self) -> Result<(), EngineError>;

    fn current_version(&self) -> Result<ReleaseVersion, EngineError>;

    fn complete_snippet_or_indent_lines(&self, request: IndentRequest) -> Result<(), EngineError> {
        let _ = request;
        Err(EngineError::Unsupported {
            operation: "complete_snippet_or_indent_lines",
        })
    }

    fn beautify_buffer(&self, request: BeautifyRequest) -> Result<(), EngineError> {
        let _ = request;
        Err(EngineError::Unsupported {
            operation: "beautify_buffer",
        })
    }

    fn recording(&self, command: RecordingCommand) -> Result<(), EngineError> {
        let _ = command;
        Err(EngineError::Unsupported {
            operation: "recording",
        })
    }

    fn mixer(&self, command: MixerCommand) -> Result<(), EngineError> {
        let _ = command;
        Err(EngineError::Unsupported { operation: "mixer" })
    }

    fn set_update_checking(&self, enabled: bool) -> Result<(), EngineError> {
        let _ = enabled;
        Err(EngineError::Unsupported {
            operation: "set_update_checking",
        })
    }

    fn check_for_updates_now(&self) -> Result<(), EngineError> {
        Err(EngineError::Unsupported {
            operation: "check_for_updates_now",
        })
    }

    /// Newest release known to the engine.
    fn latest_version(&self) -> Result<ReleaseVersion, EngineError> {
        self.current_version()
    }

    /// Date of the last update check; the default date means never.
    fn last_update_check(&self) -> Result<NaiveDate, EngineError> {
        Ok(NaiveDate::default())
    }

    fn gui_heartbeat(&self, sender_id: &str) -> Result<(), EngineError> {
        tracing::trace!(sender_id, "GUI heartbeat ignored");
        Ok(())
    }

    /// Reload engine sources (development aid).
    fn reload(&self) -> Result<(), EngineError> {
        Err(EngineError::Unsupported { operation: "reload" })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum RecordingState {
    #[default]
    Idle,
    Recording,
    /// A finished take waiting to be saved or deleted.
    Stopped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MixerState {
    pub invert_stereo: bool,
    pub mono: bool,
    pub hpf: Option<f64>,
    pub lpf: Option<f64>,
}

#[derive(Default)]
struct LoopbackState {
    buffers: HashMap<String, String>,
    recording: RecordingState,
    mixer: MixerState,
    update_checking: bool,
    last_update_check: NaiveDate,
    next_job: i32,
    heartbeats: HashMap<String, Instant>,
}

/// In-process engine used when no language runtime is attached.
///
/// Keeps buffers in memory (mirrored to `<store>/<buffer_id>.spi` when a store
/// directory is configured), tracks recording and mixer state, and echoes
/// editor requests back unchanged.
pub struct LoopbackEngine {
    events: EventSender,
    store: Option<PathBuf>,
    state: Mutex<LoopbackState>,
}

impl LoopbackEngine {
    pub fn new(events: EventSender) -> Self {
        Self {
            events,
            store: None,
            state: Mutex::new(LoopbackState {
                update_checking: true,
                ..LoopbackState::default()
            }),
        }
    }

    /// Persist buffers under `dir`, creating it if needed.
    pub fn with_store(mut self, dir: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        self.store = Some(dir);
        Ok(self)
    }

    pub fn mixer_state(&self) -> Result<MixerState, EngineError> {
        Ok(self.state()?.mixer)
    }

    pub fn update_checking(&self) -> Result<bool, EngineError> {
        Ok(self.state()?.update_checking)
    }

    pub fn last_heartbeat(&self, sender_id: &str) -> Result<Option<Instant>, EngineError> {
        Ok(self.state()?.heartbeats.get(sender_id).copied())
    }

    fn state(&self) -> Result<MutexGuard<'_, LoopbackState>, EngineError> {
        self.state
            .lock()
            .map_err(|_| EngineError::Other("engine state lock poisoned".to_string()))
    }

    fn buffer_path(store: &Path, buffer_id: &str) -> Result<PathBuf, EngineError> {
        let valid = !buffer_id.is_empty()
            && buffer_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(EngineError::invalid_argument(format!(
                "buffer id {buffer_id:?} is not a plain name"
            )));
        }
        Ok(store.join(format!("{buffer_id}.spi")))
    }

    fn read_stored(&self, buffer_id: &str) -> Result<Option<String>, EngineError> {
        let Some(store) = &self.store else {
            return Ok(None);
        };
        let path = Self::buffer_path(store, buffer_id)?;
        match std::fs::read_to_string(&path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn report(&self, event: OutboundEvent) -> Result<(), EngineError> {
        self.events.send(event)?;
        Ok(())
    }
}

/// Lines `start..=finish` (0-based, clamped) of `text`.
fn select_lines(text: &str, start: i32, finish: i32) -> String {
    let start = usize::try_from(start).unwrap_or(0);
    let finish = usize::try_from(finish).unwrap_or(0).max(start);
    text.lines()
        .skip(start)
        .take(finish - start + 1)
        .collect::<Vec<_>>()
        .join("\n")
}

impl Engine for LoopbackEngine {
    fn eval(&self, code: &str, workspace: Option<&str>) -> Result<(), EngineError> {
        let job = {
            let mut state = self.state()?;
            state.next_job += 1;
            state.next_job
        };
        tracing::info!(job, workspace, lines = code.lines().count(), "Run received");
        self.report(OutboundEvent::info(format!(
            "No engine attached: run {job} ({} lines) was not executed",
            code.lines().count()
        )))
    }

    fn save_buffer(&self, buffer_id: &str, content: &str) -> Result<(), EngineError> {
        if let Some(store) = &self.store {
            std::fs::write(Self::buffer_path(store, buffer_id)?, content)?;
        }
        self.state()?
            .buffers
            .insert(buffer_id.to_string(), content.to_string());
        tracing::debug!(buffer_id, bytes = content.len(), "Buffer saved");
        Ok(())
    }

    fn load_buffer(&self, buffer_id: &str) -> Result<(), EngineError> {
        let cached = self.state()?.buffers.get(buffer_id).cloned();
        let content = match cached {
            Some(content) => content,
            None => self.read_stored(buffer_id)?.unwrap_or_default(),
        };
        self.report(OutboundEvent::ReplaceBuffer {
            buffer_id: buffer_id.to_string(),
            content: Some(content),
            line: 0,
            index: 0,
            first_line: 0,
        })
    }

    fn exit(&self) -> Result<(), EngineError> {
        tracing::info!("Engine exit requested");
        self.report(OutboundEvent::Exit)
    }

    fn stop_jobs(&self) -> Result<(), EngineError> {
        self.report(OutboundEvent::info("Stopping all runs..."))
    }

    fn complete_snippet_or_indent_lines(&self, request: IndentRequest) -> Result<(), EngineError> {
        let content = select_lines(&request.buffer, request.start_line, request.finish_line);
        self.report(OutboundEvent::ReplaceLines {
            buffer_id: request.id,
            content: Some(content),
            start_line: Some(request.start_line),
            finish_line: Some(request.finish_line),
            point_line: request.point_line,
            point_index: request.point_index,
        })
    }

    fn beautify_buffer(&self, request: BeautifyRequest) -> Result<(), EngineError> {
        self.report(OutboundEvent::ReplaceBuffer {
            buffer_id: request.id,
            content: Some(request.buffer),
            line: request.line,
            index: request.index,
            first_line: request.first_line,
        })
    }

    fn recording(&self, command: RecordingCommand) -> Result<(), EngineError> {
        let mut state = self.state()?;
        let next = match (&command, state.recording) {
            (RecordingCommand::Start, RecordingState::Recording) => {
                return Err(EngineError::invalid_state("already recording"));
            }
            (RecordingCommand::Start, _) => RecordingState::Recording,
            (RecordingCommand::Stop, RecordingState::Recording) => RecordingState::Stopped,
            (RecordingCommand::Stop, _) => {
                return Err(EngineError::invalid_state("not recording"));
            }
            (RecordingCommand::Delete | RecordingCommand::Save { .. }, RecordingState::Stopped) => {
                RecordingState::Idle
            }
            (RecordingCommand::Delete | RecordingCommand::Save { .. }, _) => {
                return Err(EngineError::invalid_state("no finished recording"));
            }
        };
        state.recording = next;
        drop(state);

        tracing::debug!(?command, "Recording updated");
        if let RecordingCommand::Save { filename } = command {
            self.report(OutboundEvent::info(format!(
                "No audio attached: nothing written to {filename}"
            )))?;
        }
        Ok(())
    }

    fn mixer(&self, command: MixerCommand) -> Result<(), EngineError> {
        let cutoff = |freq: f64| {
            if freq.is_finite() && freq > 0.0 {
                Ok(freq)
            } else {
                Err(EngineError::invalid_argument(format!(
                    "filter cutoff must be a positive frequency, got {freq}"
                )))
            }
        };

        let mut state = self.state()?;
        let mixer = &mut state.mixer;
        match command {
            MixerCommand::InvertStereo => mixer.invert_stereo = true,
            MixerCommand::StandardStereo => mixer.invert_stereo = false,
            MixerCommand::StereoMode => mixer.mono = false,
            MixerCommand::MonoMode => mixer.mono = true,
            MixerCommand::EnableHpf(freq) => mixer.hpf = Some(cutoff(freq)?),
            MixerCommand::DisableHpf => mixer.hpf = None,
            MixerCommand::EnableLpf(freq) => mixer.lpf = Some(cutoff(freq)?),
            MixerCommand::DisableLpf => mixer.lpf = None,
        }
        tracing::debug!(?command, "Mixer updated");
        Ok(())
    }

    fn set_update_checking(&self, enabled: bool) -> Result<(), EngineError> {
        self.state()?.update_checking = enabled;
        Ok(())
    }

    fn check_for_updates_now(&self) -> Result<(), EngineError> {
        let today = chrono::Local::now().date_naive();
        self.state()?.last_update_check = today;

        let current = self.current_version()?;
        let latest = self.latest_version()?;
        self.report(OutboundEvent::VersionInfo(VersionReport {
            version: current.label,
            version_num: current.number,
            latest: latest.label,
            latest_num: latest.number,
            last_checked: today,
        }))
    }

    fn current_version(&self) -> Result<ReleaseVersion, EngineError> {
        Ok(ReleaseVersion::current())
    }

    fn last_update_check(&self) -> Result<NaiveDate, EngineError> {
        Ok(self.state()?.last_update_check)
    }

    fn gui_heartbeat(&self, sender_id: &str) -> Result<(), EngineError> {
        self.state()?
            .heartbeats
            .insert(sender_id.to_string(), Instant::now());
        tracing::trace!(sender_id, "GUI heartbeat");
        Ok(())
    }

    fn reload(&self) -> Result<(), EngineError> {
        let dropped = {
            let mut state = self.state()?;
            let n = state.buffers.len();
            if self.store.is_some() {
                state.buffers.clear();
            }
            n
        };
        tracing::info!(cached_buffers = dropped, "Reloaded");
        self.report(OutboundEvent::info("Reloaded"))
    }
}
