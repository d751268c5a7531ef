// ABOUTME: Session reconciliation: converging declared sessions onto live
// containers with the right worktree

pub mod keyed_mutex;
pub mod reconciler;

pub use keyed_mutex::KeyedMutex;
pub use reconciler::{ReconcileError, SessionReconciler};
