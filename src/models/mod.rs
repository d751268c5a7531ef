// ABOUTME: Data model types shared across the store, reconciler, and API layers

pub mod agent;
pub mod environment;
pub mod session;
pub mod user;

pub use agent::Agent;
pub use environment::{Environment, EnvironmentStatus};
pub use session::{Session, SessionStatus, SessionType};
pub use user::User;

/// Lowercase a name into a slug safe for container names and paths.
///
/// Anything outside `[a-z0-9-]` collapses to `-`; runs of dashes are
/// squeezed and the ends trimmed so `feature/My Thing` becomes
/// `feature-my-thing`.
pub fn slug(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_dash = true;
    for c in name.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_alphanumeric() {
            out.push(c);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    if out.is_empty() {
        "x".to_string()
    } else {
        out
    }
}
