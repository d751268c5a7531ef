// ABOUTME: Terminal multiplexer invocations inside session containers; the
// mux session, not the websocket, is what persists terminal state

/// Attach to the named mux session, creating it in `working_dir` on first
/// use. `-A` attaches instead of failing when the session exists, `-D`
/// detaches other clients so the newest attach is the live one.
pub fn attach_or_create_argv(pty_mux_name: &str, working_dir: &str) -> Vec<String> {
    vec![
        "tmux".to_string(),
        "new-session".to_string(),
        "-A".to_string(),
        "-D".to_string(),
        "-s".to_string(),
        pty_mux_name.to_string(),
        "-c".to_string(),
        working_dir.to_string(),
    ]
}

pub fn has_session_argv(pty_mux_name: &str) -> Vec<String> {
    vec![
        "tmux".to_string(),
        "has-session".to_string(),
        "-t".to_string(),
        format!("={pty_mux_name}"),
    ]
}

pub fn list_sessions_argv() -> Vec<String> {
    vec![
        "tmux".to_string(),
        "list-sessions".to_string(),
        "-F".to_string(),
        "#{session_name}".to_string(),
    ]
}

pub fn kill_session_argv(pty_mux_name: &str) -> Vec<String> {
    vec![
        "tmux".to_string(),
        "kill-session".to_string(),
        "-t".to_string(),
        format!("={pty_mux_name}"),
    ]
}
