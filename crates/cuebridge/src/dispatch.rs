//! Inbound dispatch: address registry and per-message failure isolation.
//!
//! Every inbound message is routed by exact address to at most one handler.
//! Whatever a handler does wrong (bad arguments, an engine error, a panic)
//! is recorded as a [`HandlerFailure`], logged, and forgotten; the next
//! message is processed normally.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::collections::HashMap;
use std::error::Error as _;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Once};

use tokio::sync::mpsc;

use crate::bridge::osc::{OscArg, OscMessage};
use crate::engine::{Engine, EngineError};
use crate::outbound::{EventSender, QueueClosed};

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("missing argument {index}")]
    MissingArgument { index: usize },

    #[error("argument {index}: expected {expected}, got {found}")]
    TypeMismatch {
        index: usize,
        expected: &'static str,
        found: String,
    },

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    QueueClosed(#[from] QueueClosed),
}

/// Positional view over an inbound message's arguments.
#[derive(Debug, Clone, Copy)]
pub struct Args<'a> {
    values: &'a [OscArg],
}

impl<'a> Args<'a> {
    pub fn new(values: &'a [OscArg]) -> Self {
        Self { values }
    }

    fn get(&self, index: usize) -> Result<&'a OscArg, HandlerError> {
        self.values
            .get(index)
            .ok_or(HandlerError::MissingArgument { index })
    }

    /// The argument as sent, for values echoed back verbatim.
    pub fn raw(&self, index: usize) -> Result<OscArg, HandlerError> {
        self.get(index).cloned()
    }

    /// A string argument. Numbers are rendered in decimal.
    pub fn text(&self, index: usize) -> Result<String, HandlerError> {
        match self.get(index)? {
            OscArg::Str(s) => Ok(s.clone()),
            OscArg::Int(v) => Ok(v.to_string()),
            OscArg::Long(v) => Ok(v.to_string()),
            OscArg::Float(v) => Ok(v.to_string()),
            OscArg::Double(v) => Ok(v.to_string()),
            other => Err(mismatch(index, "string", other)),
        }
    }

    /// An integer argument. Accepts 64-bit values in range and numeric strings.
    pub fn int(&self, index: usize) -> Result<i32, HandlerError> {
        let arg = self.get(index)?;
        let value = match arg {
            OscArg::Int(v) => Some(*v),
            OscArg::Long(v) => i32::try_from(*v).ok(),
            OscArg::Str(s) => s.trim().parse().ok(),
            _ => None,
        };
        value.ok_or_else(|| mismatch(index, "integer", arg))
    }

    /// A floating point argument. Accepts any number and numeric strings.
    pub fn float(&self, index: usize) -> Result<f64, HandlerError> {
        let arg = self.get(index)?;
        let value = match arg {
            OscArg::Int(v) => Some(f64::from(*v)),
            OscArg::Long(v) => Some(*v as f64),
            OscArg::Float(v) => Some(f64::from(*v)),
            OscArg::Double(v) => Some(*v),
            OscArg::Str(s) => s.trim().parse().ok(),
            _ => None,
        };
        value.ok_or_else(|| mismatch(index, "float", arg))
    }
}

fn mismatch(index: usize, expected: &'static str, found: &OscArg) -> HandlerError {
    HandlerError::TypeMismatch {
        index,
        expected,
        found: found.to_string(),
    }
}

/// What a handler may touch.
pub struct HandlerContext {
    pub engine: Arc<dyn Engine>,
    pub events: EventSender,
}

pub type Handler =
    Box<dyn Fn(&HandlerContext, &Args<'_>) -> Result<(), HandlerError> + Send + Sync>;

/// A handler invocation that did not complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerFailure {
    pub address: String,
    pub description: String,
    /// Underlying causes, outermost first.
    pub trace: Vec<String>,
}

impl HandlerFailure {
    fn from_error(address: &str, err: &HandlerError) -> Self {
        let mut trace = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            trace.push(cause.to_string());
            source = cause.source();
        }
        Self {
            address: address.to_string(),
            description: err.to_string(),
            trace,
        }
    }

    fn from_panic(address: &str, payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };
        Self {
            address: address.to_string(),
            description: format!("handler panicked: {message}"),
            trace: take_panic_trace(),
        }
    }
}

thread_local! {
    /// Location and backtrace of the last panic on this thread.
    static PANIC_TRACE: RefCell<Option<Vec<String>>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

/// Chain a panic hook that records where each panic happened, so a contained
/// handler panic can be reported with a trace. The previous hook still runs.
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let mut trace = Vec::new();
            if let Some(location) = info.location() {
                trace.push(format!("at {location}"));
            }
            let backtrace = Backtrace::force_capture().to_string();
            trace.extend(
                backtrace
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(String::from),
            );
            PANIC_TRACE.with(|slot| *slot.borrow_mut() = Some(trace));
            previous(info);
        }));
    });
}

fn take_panic_trace() -> Vec<String> {
    PANIC_TRACE
        .with(|slot| slot.borrow_mut().take())
        .unwrap_or_default()
}

impl fmt::Display for HandlerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.address, self.description)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Handled,
    /// No handler is registered for the address.
    Unhandled,
    Failed(HandlerFailure),
}

/// Routes inbound messages to registered handlers.
///
/// Routes are fixed once the dispatcher starts running.
pub struct Dispatcher {
    routes: HashMap<String, Handler>,
    context: HandlerContext,
}

impl Dispatcher {
    pub fn new(engine: Arc<dyn Engine>, events: EventSender) -> Self {
        install_panic_hook();
        Self {
            routes: HashMap::new(),
            context: HandlerContext { engine, events },
        }
    }

    /// Register `handler` for an exact address, replacing any previous one.
    pub fn register<F>(&mut self, address: &str, handler: F)
    where
        F: Fn(&HandlerContext, &Args<'_>) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        if self
            .routes
            .insert(address.to_string(), Box::new(handler))
            .is_some()
        {
            tracing::warn!(address, "Replaced existing handler");
        }
    }

    pub fn addresses(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    /// Run the handler for one message, containing any failure.
    pub fn dispatch(&self, message: &OscMessage) -> DispatchOutcome {
        let address = message.address.as_str();
        let Some(handler) = self.routes.get(address) else {
            tracing::debug!(address, "No handler registered, ignoring message");
            return DispatchOutcome::Unhandled;
        };

        tracing::trace!(%message, "Dispatching");
        let args = Args::new(&message.args);
        let result = panic::catch_unwind(AssertUnwindSafe(|| handler(&self.context, &args)));

        let failure = match result {
            Ok(Ok(())) => return DispatchOutcome::Handled,
            Ok(Err(e)) => HandlerFailure::from_error(address, &e),
            Err(payload) => HandlerFailure::from_panic(address, payload.as_ref()),
        };
        tracing::error!(
            address,
            description = %failure.description,
            trace = ?failure.trace,
            "Handler failed"
        );
        DispatchOutcome::Failed(failure)
    }

    /// Dispatch messages from `rx` one at a time until the channel closes.
    ///
    /// Handlers run on the blocking pool since engine calls are synchronous.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<OscMessage>) {
        tracing::debug!(routes = self.routes.len(), "Dispatcher started");
        while let Some(message) = rx.recv().await {
            let dispatcher = Arc::clone(&self);
            let joined = tokio::task::spawn_blocking(move || dispatcher.dispatch(&message)).await;
            if let Err(e) = joined {
                tracing::error!(error = %e, "Dispatch task did not complete");
            }
        }
        tracing::debug!("Dispatcher stopped");
    }
}
