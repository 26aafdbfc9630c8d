//! Output forwarding seam.
//!
//! The executor tees every chunk of child stdout/stderr both to the
//! capture files (for later replay) and to a [`Logger`]. The logger is a
//! seam so the CLI can write straight through to its own streams while
//! tests capture chunks in memory. Lifecycle events (running, fresh,
//! restored, failed) go through `tracing` instead; this trait carries
//! only raw script output.

use std::io::Write;

use derive_more::Display;

use crate::script::ScriptReference;

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display)]
pub enum OutputStream {
    #[display("stdout")]
    Stdout,
    #[display("stderr")]
    Stderr,
}

pub trait Logger: Send + Sync + 'static {
    /// A chunk of script output, either live from a running child or
    /// replayed from a previous capture. Chunk boundaries are arbitrary.
    fn output(&self, script: &ScriptReference, stream: OutputStream, chunk: &[u8]);
}

/// Forwards output verbatim to this process's own stdout and stderr.
#[derive(Copy, Clone, Debug, Default)]
pub struct ConsoleLogger;

impl Logger for ConsoleLogger {
    fn output(&self, _script: &ScriptReference, stream: OutputStream, chunk: &[u8]) {
        // Best effort: a broken console pipe shouldn't fail the build.
        let _ = match stream {
            OutputStream::Stdout => std::io::stdout().lock().write_all(chunk),
            OutputStream::Stderr => std::io::stderr().lock().write_all(chunk),
        };
    }
}

/// Discards output. Useful for callers that only care about statuses.
#[derive(Copy, Clone, Debug, Default)]
pub struct QuietLogger;

impl Logger for QuietLogger {
    fn output(&self, _script: &ScriptReference, _stream: OutputStream, _chunk: &[u8]) {}
}
