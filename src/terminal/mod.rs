// ABOUTME: Terminal attachment: wire protocol, pty-mux commands, and the
// websocket bridge pipeline

pub mod pipeline;
pub mod protocol;
pub mod pty_mux;

pub use pipeline::{
    PtyAttachPipeline, CLOSE_INTERNAL_ERROR, CLOSE_NORMAL, CLOSE_POLICY_VIOLATION,
};
pub use protocol::{ClientMessage, ServerMessage};
