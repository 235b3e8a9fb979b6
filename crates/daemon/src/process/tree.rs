//! Process-tree termination.
//!
//! Shells start their own children (editors, pagers, builds), and a signal to
//! the shell alone can leave them orphaned. [`TreeTerminator`] walks the
//! process table and signals descendants before the root. Where the process
//! table is unavailable, [`DirectTerminator`] signals the root only.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use sysinfo::{ProcessesToUpdate, System};

use super::signal::{send_signal, TerminationSignal};

/// Strategy for terminating a session process and its children.
pub trait ProcessTerminator: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Signal `pid` and, where supported, its descendants.
    ///
    /// Returns the number of processes that were signaled. Failures are
    /// logged and otherwise ignored.
    fn terminate_tree(&self, pid: u32, signal: TerminationSignal) -> usize;

    /// Forcefully kill `pid` and its descendants.
    fn kill_tree(&self, pid: u32) -> usize {
        self.terminate_tree(pid, TerminationSignal::Kill)
    }
}

/// Pick the best terminator for this platform.
pub fn select_terminator() -> Arc<dyn ProcessTerminator> {
    if sysinfo::IS_SUPPORTED_SYSTEM {
        Arc::new(TreeTerminator::new())
    } else {
        tracing::debug!("Process table unavailable, terminating root processes only");
        Arc::new(DirectTerminator)
    }
}

/// Signals descendants deepest-first, then the root.
pub struct TreeTerminator {
    system: Mutex<System>,
}

impl TreeTerminator {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }

    /// Current descendants of `pid`, deepest first.
    pub fn descendants(&self, pid: u32) -> Vec<u32> {
        let mut system = self.system.lock();
        system.refresh_processes(ProcessesToUpdate::All, true);

        let table: Vec<(u32, u32)> = system
            .processes()
            .iter()
            .filter_map(|(child, process)| {
                process
                    .parent()
                    .map(|parent| (child.as_u32(), parent.as_u32()))
            })
            .collect();

        order_descendants(pid, &table)
    }
}

impl Default for TreeTerminator {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTerminator for TreeTerminator {
    fn name(&self) -> &'static str {
        "tree"
    }

    fn terminate_tree(&self, pid: u32, signal: TerminationSignal) -> usize {
        let mut signaled = 0;

        for child in self.descendants(pid) {
            match send_signal(child, signal) {
                Ok(()) => signaled += 1,
                Err(e) => tracing::debug!(pid = child, root = pid, error = %e, "Failed to signal descendant"),
            }
        }

        match send_signal(pid, signal) {
            Ok(()) => signaled += 1,
            Err(e) => tracing::debug!(pid, error = %e, "Failed to signal process"),
        }

        tracing::debug!(pid, ?signal, signaled, "Terminated process tree");
        signaled
    }
}

/// Signals only the given pid.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectTerminator;

impl ProcessTerminator for DirectTerminator {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn terminate_tree(&self, pid: u32, signal: TerminationSignal) -> usize {
        match send_signal(pid, signal) {
            Ok(()) => 1,
            Err(e) => {
                tracing::debug!(pid, ?signal, error = %e, "Failed to signal process");
                0
            }
        }
    }
}

/// Order the descendants of `root` so that children precede their parents.
///
/// `table` holds `(pid, parent_pid)` pairs.
fn order_descendants(root: u32, table: &[(u32, u32)]) -> Vec<u32> {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for &(pid, parent) in table {
        if pid != parent {
            children.entry(parent).or_default().push(pid);
        }
    }

    let mut seen = HashSet::from([root]);
    let mut order = Vec::new();
    let mut queue = VecDeque::from([root]);

    while let Some(current) = queue.pop_front() {
        let Some(kids) = children.get(&current) else {
            continue;
        };
        for &kid in kids {
            if seen.insert(kid) {
                order.push(kid);
                queue.push_back(kid);
            }
        }
    }

    order.reverse();
    order
}
