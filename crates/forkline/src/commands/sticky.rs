//! Append-only log of sticky commands, shared by every stream of a session.
//!
//! Singly-linked list whose `next` cells are set at most once, so appends
//! race through compare-and-set without a lock and readers walk the list
//! with their own cursor. Nodes are never removed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use crate::bridge::protocol::Command;

#[derive(Debug)]
pub(crate) struct StickyNode {
    command: Command,
    next: OnceLock<Arc<StickyNode>>,
}

impl StickyNode {
    pub(crate) fn command(&self) -> &Command {
        &self.command
    }
}

#[derive(Debug, Default)]
pub(crate) struct StickyLog {
    head: OnceLock<Arc<StickyNode>>,
    len: AtomicUsize,
}

impl StickyLog {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Append `command` unless an equal command is already logged.
    /// Returns whether it was appended.
    pub(crate) fn append_if_absent(&self, command: &Command) -> bool {
        let mut cell = &self.head;
        loop {
            match cell.get() {
                Some(node) if node.command == *command => return false,
                Some(node) => cell = &node.next,
                None => {
                    let node = Arc::new(StickyNode {
                        command: command.clone(),
                        next: OnceLock::new(),
                    });
                    // Another appender may win this cell; then re-check it.
                    if cell.set(node).is_ok() {
                        self.len.fetch_add(1, Ordering::AcqRel);
                        return true;
                    }
                }
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// Node after `cursor`, or the head when the cursor has not moved yet.
    pub(crate) fn next_after(&self, cursor: Option<&Arc<StickyNode>>) -> Option<Arc<StickyNode>> {
        match cursor {
            None => self.head.get().cloned(),
            Some(node) => node.next.get().cloned(),
        }
    }

    pub(crate) fn snapshot(&self) -> Vec<Command> {
        let mut commands = Vec::with_capacity(self.len());
        let mut cursor = self.next_after(None);
        while let Some(node) = cursor {
            commands.push(node.command.clone());
            cursor = self.next_after(Some(&node));
        }
        commands
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::ShutdownKind;

    #[test]
    fn duplicates_are_appended_once() {
        let log = StickyLog::new();
        assert!(log.append_if_absent(&Command::Shutdown(ShutdownKind::Exit)));
        assert!(!log.append_if_absent(&Command::Shutdown(ShutdownKind::Exit)));
        assert!(log.append_if_absent(&Command::Shutdown(ShutdownKind::Kill)));
        assert!(log.append_if_absent(&Command::Noop));
        assert_eq!(log.len(), 3);
        assert_eq!(
            log.snapshot(),
            vec![
                Command::Shutdown(ShutdownKind::Exit),
                Command::Shutdown(ShutdownKind::Kill),
                Command::Noop,
            ]
        );
    }

    #[test]
    fn cursor_walks_in_append_order() {
        let log = StickyLog::new();
        assert!(log.next_after(None).is_none());
        log.append_if_absent(&Command::SkipRemaining);
        let first = log.next_after(None).unwrap();
        assert_eq!(first.command(), &Command::SkipRemaining);
        assert!(log.next_after(Some(&first)).is_none());

        log.append_if_absent(&Command::ByeAck);
        let second = log.next_after(Some(&first)).unwrap();
        assert_eq!(second.command(), &Command::ByeAck);
    }

    #[test]
    fn concurrent_appends_keep_one_copy_each() {
        let log = Arc::new(StickyLog::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let log = Arc::clone(&log);
                std::thread::spawn(move || {
                    for command in [Command::Noop, Command::SkipRemaining, Command::ByeAck] {
                        log.append_if_absent(&command);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(log.len(), 3);
        let mut seen = log.snapshot();
        seen.sort_by_key(|c| format!("{c:?}"));
        assert_eq!(seen, vec![Command::ByeAck, Command::Noop, Command::SkipRemaining]);
    }
}
