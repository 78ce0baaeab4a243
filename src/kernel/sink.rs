//! UI/log sink
//!
//! The supervisor's only way to show anything: process log lines, TTY
//! output and its own diagnostics all end up in one `print` call. Hosts
//! that draw a terminal implement `UiSink` themselves.

use super::process::WindowId;
use crate::console_log;
use std::cell::RefCell;
use std::rc::Rc;

/// How a printed line should be styled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Style {
    Info,
    Warn,
    Error,
    Stdout,
    Stderr,
    System,
}

impl Style {
    pub fn tag(self) -> &'static str {
        match self {
            Style::Info => "info",
            Style::Warn => "warn",
            Style::Error => "error",
            Style::Stdout => "stdout",
            Style::Stderr => "stderr",
            Style::System => "system",
        }
    }
}

pub trait UiSink {
    fn print(&self, message: &str, style: Style);

    /// A process showing in `window` went away
    fn detach_window(&self, _window: WindowId) {}
}

/// Forwards everything to the console log
pub struct ConsoleSink;

impl UiSink for ConsoleSink {
    fn print(&self, message: &str, style: Style) {
        console_log!("[{}] {}", style.tag(), message);
    }

    fn detach_window(&self, window: WindowId) {
        console_log!("[system] window {} detached", window.0);
    }
}

/// Records every line; clones share the record
#[derive(Clone, Default)]
pub struct MemorySink {
    lines: Rc<RefCell<Vec<(String, Style)>>>,
    detached: Rc<RefCell<Vec<WindowId>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<(String, Style)> {
        self.lines.borrow().clone()
    }

    /// Lines printed with one style
    pub fn with_style(&self, style: Style) -> Vec<String> {
        self.lines
            .borrow()
            .iter()
            .filter(|(_, s)| *s == style)
            .map(|(line, _)| line.clone())
            .collect()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines.borrow().iter().any(|(line, _)| line.contains(needle))
    }

    pub fn detached(&self) -> Vec<WindowId> {
        self.detached.borrow().clone()
    }

    pub fn clear(&self) {
        self.lines.borrow_mut().clear();
    }
}

impl UiSink for MemorySink {
    fn print(&self, message: &str, style: Style) {
        self.lines.borrow_mut().push((message.to_string(), style));
    }

    fn detach_window(&self, window: WindowId) {
        self.detached.borrow_mut().push(window);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_shares_record() {
        let sink = MemorySink::new();
        let handle = sink.clone();

        sink.print("hello", Style::Stdout);
        sink.print("careful", Style::Warn);
        sink.detach_window(WindowId(3));

        assert_eq!(handle.lines().len(), 2);
        assert_eq!(handle.with_style(Style::Warn), vec!["careful".to_string()]);
        assert!(handle.contains("hell"));
        assert_eq!(handle.detached(), vec![WindowId(3)]);
    }
}
