//! Process registry for running agent CLI invocations.
//!
//! `forceFailNode` (spec.md §4.6) needs to kill the OS process backing a
//! running node without waiting on the executor to notice a cancellation;
//! this registry is the engine's only handle on that PID.

use anyhow::Result;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::domain::NodeId;

#[derive(Debug, Clone)]
pub struct RunningProcess {
    pub pid: u32,
    pub agent_id: String,
}

static RUNNING: Lazy<Mutex<HashMap<NodeId, RunningProcess>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

pub fn register(node_id: NodeId, pid: u32, agent_id: impl Into<String>) {
    let mut guard = RUNNING.lock().unwrap_or_else(|e| e.into_inner());
    guard.insert(
        node_id,
        RunningProcess {
            pid,
            agent_id: agent_id.into(),
        },
    );
}

pub fn unregister(node_id: NodeId) {
    let mut guard = RUNNING.lock().unwrap_or_else(|e| e.into_inner());
    guard.remove(&node_id);
}

pub fn get(node_id: NodeId) -> Option<RunningProcess> {
    let guard = RUNNING.lock().unwrap_or_else(|e| e.into_inner());
    guard.get(&node_id).cloned()
}

/// Send SIGINT to the registered process for the given node.
pub fn interrupt(node_id: NodeId) -> Result<bool> {
    let Some(proc) = get(node_id) else {
        return Ok(false);
    };

    #[cfg(unix)]
    unsafe {
        let rc = libc::kill(proc.pid as i32, libc::SIGINT);
        return Ok(rc == 0);
    }

    #[cfg(not(unix))]
    {
        let _ = proc;
        Ok(false)
    }
}

/// Send SIGKILL to the registered process for the given node. Used by
/// `forceFailNode`'s best-effort process-tree kill.
pub fn kill(node_id: NodeId) -> Result<bool> {
    let Some(proc) = get(node_id) else {
        return Ok(false);
    };

    #[cfg(unix)]
    unsafe {
        let rc = libc::kill(proc.pid as i32, libc::SIGKILL);
        return Ok(rc == 0);
    }

    #[cfg(not(unix))]
    {
        let _ = proc;
        Ok(false)
    }
}
