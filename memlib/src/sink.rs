use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// Receives the human-readable trace messages emitted by the components
///
/// The simulation never reads anything back from a sink, so an implementation is free to drop
/// messages entirely
pub trait TraceSink {
    fn emit(&self, message: fmt::Arguments<'_>);
}

/// Shared handle to a sink. Physical memory and the cache usually share one
pub type SharedSink = Rc<dyn TraceSink>;

/// Discards every message
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl TraceSink for NullSink {
    fn emit(&self, _message: fmt::Arguments<'_>) {}
}

/// Collects every message in order. Used by the tests and the snapshot output of the driver
#[derive(Debug, Default)]
pub struct RecordingSink {
    lines: RefCell<Vec<String>>,
}

impl RecordingSink {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// Returns a copy of all messages recorded so far
    pub fn lines(&self) -> Vec<String> {
        self.lines.borrow().clone()
    }

    /// Removes and returns all messages recorded so far
    pub fn drain(&self) -> Vec<String> {
        std::mem::take(&mut *self.lines.borrow_mut())
    }

    /// True if any recorded message contains `needle`
    pub fn contains(&self, needle: &str) -> bool {
        self.lines.borrow().iter().any(|line| line.contains(needle))
    }

    pub fn is_empty(&self) -> bool {
        self.lines.borrow().is_empty()
    }
}

impl TraceSink for RecordingSink {
    fn emit(&self, message: fmt::Arguments<'_>) {
        self.lines.borrow_mut().push(message.to_string());
    }
}

/// Forwards messages to the `log` facade at info level, tagged with the layer they came from
#[derive(Debug, Clone)]
pub struct LogSink {
    prefix: &'static str,
}

impl LogSink {
    pub fn new(prefix: &'static str) -> Rc<Self> {
        Rc::new(Self { prefix })
    }
}

impl TraceSink for LogSink {
    fn emit(&self, message: fmt::Arguments<'_>) {
        log::info!("[{}] {}", self.prefix, message);
    }
}

/// Shorthand for `sink.emit(format_args!(..))`
macro_rules! trace_event {
    ($sink:expr, $($arg:tt)*) => {
        $sink.emit(format_args!($($arg)*))
    };
}

pub(crate) use trace_event;
