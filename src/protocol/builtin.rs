//! Command descriptors every worker answers, plus the diagnostic commands
//! registered by the stock `corral-worker` binary.

use crate::protocol::command::{Command, Field, FieldKind};

/// Round-trips its `text` argument. Doubles as a liveness probe.
pub const ECHO: Command = Command {
    name: "echo",
    args: &[Field {
        name: "text",
        kind: FieldKind::Str,
    }],
    response: &[Field {
        name: "text",
        kind: FieldKind::Str,
    }],
    requires_answer: true,
};

/// Returns the worker's OS process id.
pub const PID: Command = Command {
    name: "pid",
    args: &[],
    response: &[Field {
        name: "pid",
        kind: FieldKind::Int,
    }],
    requires_answer: true,
};

/// Instructs the dispatcher to acknowledge, close its connection cleanly
/// and exit.
pub const SHUTDOWN: Command = Command {
    name: "shutdown",
    args: &[],
    response: &[],
    requires_answer: true,
};

/// Diagnostic: returns a per-process monotonically increasing counter.
pub const SEQ: Command = Command {
    name: "seq",
    args: &[],
    response: &[Field {
        name: "seq",
        kind: FieldKind::Int,
    }],
    requires_answer: true,
};

/// Diagnostic: sleeps for `millis` before answering.
pub const SLEEP: Command = Command {
    name: "sleep",
    args: &[Field {
        name: "millis",
        kind: FieldKind::Int,
    }],
    response: &[Field {
        name: "millis",
        kind: FieldKind::Int,
    }],
    requires_answer: true,
};

/// Diagnostic: terminates the worker process with `code` without answering.
pub const EXIT: Command = Command {
    name: "exit",
    args: &[Field {
        name: "code",
        kind: FieldKind::Int,
    }],
    response: &[],
    requires_answer: true,
};
