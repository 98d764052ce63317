//! Identifier helpers for tasks and sessions
//!
//! Task ids are stable strings so they survive checkpoint round-trips and
//! stay readable in event streams: `st-3`, `fixup-st-3-1`, `replan-0`,
//! `verify-fix-2`.

use uuid::Uuid;

/// Id for a subtask produced by decomposition (zero-based index)
pub fn subtask_id(index: usize) -> String {
    format!("st-{}", index)
}

/// Id for a fix-up task targeting `fixes`, disambiguated by a counter
pub fn fixup_id(fixes: &str, counter: usize) -> String {
    format!("fixup-{}-{}", fixes, counter)
}

/// Id for a task appended by a mid-swarm replan
pub fn replan_id(index: usize) -> String {
    format!("replan-{}", index)
}

/// Id for a fix-up task spawned by verification failure
pub fn verify_fix_id(index: usize) -> String {
    format!("verify-fix-{}", index)
}

/// Generate a fresh session id (UUIDv7, sortable by creation time)
pub fn session_id() -> String {
    Uuid::now_v7().to_string()
}

/// Check whether an id belongs to a fix-up task (wave-joining, capped retries)
pub fn is_fixup(id: &str) -> bool {
    id.starts_with("fixup-") || id.starts_with("verify-fix-")
}
