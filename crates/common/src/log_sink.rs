// Autossh Tray - Log Sink
// Bounded, observable log buffer fed by supervisors and shown by the UI

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, error};

/// Default number of entries kept in history
pub const DEFAULT_CAPACITY: usize = 100;

/// Callback invoked with every formatted log line
pub type ObserverFn = Arc<dyn Fn(&str) + Send + Sync + 'static>;

/// Handle returned by [`LogSink::add_observer`], used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObserverToken(u64);

/// Something that can be written to the sink
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogPayload {
    /// Plain text
    Text(String),
    /// Raw process output, decoded as UTF-8 (lossy)
    Bytes(Vec<u8>),
    /// Several values joined with single spaces
    Parts(Vec<LogPayload>),
}

impl LogPayload {
    /// Join the given values with single spaces
    pub fn parts<I, T>(parts: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<LogPayload>,
    {
        LogPayload::Parts(parts.into_iter().map(Into::into).collect())
    }

    /// Any displayable value
    pub fn display(value: impl fmt::Display) -> Self {
        LogPayload::Text(value.to_string())
    }

    /// Format into the single line stored in history
    pub fn format(&self) -> String {
        match self {
            LogPayload::Text(text) => text.trim().to_string(),
            LogPayload::Bytes(bytes) => String::from_utf8_lossy(bytes).trim().to_string(),
            LogPayload::Parts(parts) => parts
                .iter()
                .map(LogPayload::format)
                .collect::<Vec<_>>()
                .join(" "),
        }
    }
}

impl From<&str> for LogPayload {
    fn from(value: &str) -> Self {
        LogPayload::Text(value.to_string())
    }
}

impl From<String> for LogPayload {
    fn from(value: String) -> Self {
        LogPayload::Text(value)
    }
}

impl From<&String> for LogPayload {
    fn from(value: &String) -> Self {
        LogPayload::Text(value.clone())
    }
}

impl From<Vec<u8>> for LogPayload {
    fn from(value: Vec<u8>) -> Self {
        LogPayload::Bytes(value)
    }
}

impl From<&[u8]> for LogPayload {
    fn from(value: &[u8]) -> Self {
        LogPayload::Bytes(value.to_vec())
    }
}

impl From<Vec<String>> for LogPayload {
    fn from(value: Vec<String>) -> Self {
        LogPayload::parts(value)
    }
}

impl From<&[&str]> for LogPayload {
    fn from(value: &[&str]) -> Self {
        LogPayload::parts(value.iter().copied())
    }
}

struct Observer {
    name: String,
    callback: ObserverFn,
}

struct SinkState {
    capacity: usize,
    entries: VecDeque<String>,
    observers: BTreeMap<ObserverToken, Observer>,
    next_token: u64,
}

/// Thread-safe circular log buffer with synchronous observers
///
/// Cloning is cheap and every clone shares the same buffer. Observers are
/// called on the emitting thread (often a supervisor's pump task), outside
/// the internal lock, so they may call back into the sink.
#[derive(Clone)]
pub struct LogSink {
    state: Arc<Mutex<SinkState>>,
}

impl Default for LogSink {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl fmt::Debug for LogSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("LogSink")
            .field("capacity", &state.capacity)
            .field("entries", &state.entries.len())
            .field("observers", &state.observers.len())
            .finish()
    }
}

impl LogSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(SinkState {
                capacity,
                entries: VecDeque::with_capacity(capacity.min(1024)),
                observers: BTreeMap::new(),
                next_token: 1,
            })),
        }
    }

    /// Append a line (evicting the oldest when full) and notify every observer
    ///
    /// Returns the formatted line.
    pub fn emit(&self, payload: impl Into<LogPayload>) -> String {
        let line = payload.into().format();

        let observers = {
            let mut state = self.lock();
            if state.capacity > 0 {
                while state.entries.len() >= state.capacity {
                    state.entries.pop_front();
                }
                state.entries.push_back(line.clone());
            }
            state
                .observers
                .values()
                .map(|o| (o.name.clone(), o.callback.clone()))
                .collect::<Vec<_>>()
        };

        for (name, callback) in observers {
            notify(&name, &callback, &line);
        }

        line
    }

    /// Register an observer
    ///
    /// An observer already registered under the same name is replaced; its
    /// token stops being valid.
    pub fn add_observer<F>(&self, name: impl Into<String>, callback: F) -> ObserverToken
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let name = name.into();
        let mut state = self.lock();

        let replaced: Vec<ObserverToken> = state
            .observers
            .iter()
            .filter(|(_, o)| o.name == name)
            .map(|(token, _)| *token)
            .collect();
        for token in replaced {
            state.observers.remove(&token);
            debug!("Observer {} replaced", name);
        }

        let token = ObserverToken(state.next_token);
        state.next_token += 1;
        state.observers.insert(
            token,
            Observer {
                name,
                callback: Arc::new(callback),
            },
        );
        token
    }

    /// Unregister an observer; it receives one farewell line
    ///
    /// Unknown or already removed tokens are ignored. Returns whether an
    /// observer was removed.
    pub fn remove_observer(&self, token: ObserverToken) -> bool {
        let removed = self.lock().observers.remove(&token);
        match removed {
            Some(observer) => {
                farewell(observer);
                true
            }
            None => false,
        }
    }

    /// Unregister an observer by the name it was registered under
    pub fn remove_observer_by_name(&self, name: &str) -> bool {
        let removed = {
            let mut state = self.lock();
            let token = state
                .observers
                .iter()
                .find(|(_, o)| o.name == name)
                .map(|(token, _)| *token);
            token.and_then(|t| state.observers.remove(&t))
        };
        match removed {
            Some(observer) => {
                farewell(observer);
                true
            }
            None => false,
        }
    }

    /// Resize the buffer, keeping the newest `min(capacity, len)` entries in order
    pub fn set_capacity(&self, capacity: usize) {
        let mut state = self.lock();
        let len = state.entries.len();
        if len > capacity {
            state.entries.drain(..len - capacity);
        }
        state.capacity = capacity;
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity
    }

    /// Current buffer, oldest first
    pub fn history(&self) -> Vec<String> {
        self.lock().entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn observer_count(&self) -> usize {
        self.lock().observers.len()
    }

    // A panicking observer must not poison the sink for every other thread.
    fn lock(&self) -> MutexGuard<'_, SinkState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn farewell(observer: Observer) {
    let message = format!("Observer {} unregistered", observer.name);
    notify(&observer.name, &observer.callback, &message);
}

fn notify(name: &str, callback: &ObserverFn, line: &str) {
    if catch_unwind(AssertUnwindSafe(|| callback(line))).is_err() {
        error!("Log observer {} panicked while handling a log line", name);
    }
}
