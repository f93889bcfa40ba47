//! Child-side command dispatch.
//!
//! [`serve`] runs the worker half of the protocol: read boxes from the
//! request channel, look up the named handler in the [`Registry`], execute
//! it, and write an answer or error box back when the request asked for
//! one. Handlers run sequentially — a worker is a single-concurrency unit,
//! so there is never more than one job in flight, and a handler is free to
//! block.
//!
//! The loop ends cleanly when the host closes the request channel or after
//! acknowledging the shutdown command. Malformed input (a bad box, a
//! request without a command name) is a protocol error: the loop bails out
//! and the worker process exits non-zero, which the host treats as a crash.

use std::collections::HashMap;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

use crate::error::{CorralError, Result};
use crate::protocol::boxes::{self, BoxFields, BoxParser};
use crate::protocol::builtin;
use crate::protocol::command::{self, Command, FieldValues};

/// A handler failure, reported to the caller as a `COMMAND_FAILED` error
/// box. The worker stays usable.
#[derive(Debug)]
pub struct HandlerError {
    pub message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

pub type HandlerResult = std::result::Result<FieldValues, HandlerError>;

type Handler = Box<dyn Fn(&FieldValues) -> HandlerResult + Send + Sync>;

/// The named handlers a worker answers.
#[derive(Default)]
pub struct Registry {
    handlers: HashMap<&'static str, (Command, Handler)>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-loaded with the commands every worker must answer
    /// (echo, pid, shutdown).
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::worker::builtins::register(&mut registry);
        registry
    }

    /// Register a handler for `command`, replacing any previous one.
    pub fn register<F>(&mut self, command: Command, handler: F)
    where
        F: Fn(&FieldValues) -> HandlerResult + Send + Sync + 'static,
    {
        self.handlers
            .insert(command.name, (command, Box::new(handler)));
    }

    pub(crate) fn get(&self, name: &str) -> Option<&(Command, Handler)> {
        self.handlers.get(name)
    }
}

/// Run the dispatch loop over the worker's protocol channels: the
/// dedicated descriptors wired by the launcher, or stdin/stdout when they
/// are absent.
pub async fn serve(registry: Registry) -> Result<()> {
    let (reader, writer) = open_channels()?;
    run(registry, reader, writer).await
}

/// Run the dispatch loop over stdin/stdout unconditionally.
pub async fn serve_stdio(registry: Registry) -> Result<()> {
    run(
        registry,
        Box::new(tokio::io::stdin()),
        Box::new(tokio::io::stdout()),
    )
    .await
}

type ChannelPair = (
    Box<dyn AsyncRead + Send + Unpin>,
    Box<dyn AsyncWrite + Send + Unpin>,
);

#[cfg(unix)]
fn open_channels() -> Result<ChannelPair> {
    use crate::launcher::{self, REQUEST_FD, RESPONSE_FD, WORKER_FDS_ENV};
    use std::os::fd::{FromRawFd, OwnedFd};
    use tokio::net::unix::pipe;

    if std::env::var_os(WORKER_FDS_ENV).is_none() {
        return Ok((Box::new(tokio::io::stdin()), Box::new(tokio::io::stdout())));
    }
    // SAFETY: the launcher wired these descriptors before exec and nothing
    // else in this process owns them.
    let read_fd = unsafe { OwnedFd::from_raw_fd(REQUEST_FD) };
    let write_fd = unsafe { OwnedFd::from_raw_fd(RESPONSE_FD) };
    launcher::set_nonblocking(REQUEST_FD)?;
    launcher::set_nonblocking(RESPONSE_FD)?;
    let reader = pipe::Receiver::from_owned_fd(read_fd)?;
    let writer = pipe::Sender::from_owned_fd(write_fd)?;
    Ok((Box::new(reader), Box::new(writer)))
}

#[cfg(not(unix))]
fn open_channels() -> Result<ChannelPair> {
    Ok((Box::new(tokio::io::stdin()), Box::new(tokio::io::stdout())))
}

async fn run(
    registry: Registry,
    mut reader: Box<dyn AsyncRead + Send + Unpin>,
    mut writer: Box<dyn AsyncWrite + Send + Unpin>,
) -> Result<()> {
    let mut parser = BoxParser::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            if parser.is_mid_box() {
                return Err(CorralError::Protocol(
                    "connection closed mid-box".to_string(),
                ));
            }
            // host closed the channel: clean shutdown
            return Ok(());
        }
        parser.feed(&buf[..n]);
        while let Some(fields) = parser.next_box()? {
            if handle_box(&registry, fields, &mut writer).await? {
                return Ok(());
            }
        }
    }
}

/// Execute one request box. Returns `Ok(true)` after acknowledging a
/// shutdown, which ends the dispatch loop.
async fn handle_box(
    registry: &Registry,
    fields: BoxFields,
    writer: &mut Box<dyn AsyncWrite + Send + Unpin>,
) -> Result<bool> {
    let Some(name) = command::lookup(&fields, command::KEY_COMMAND) else {
        return Err(CorralError::Protocol(
            "request box has no _command".to_string(),
        ));
    };
    let name = name.to_string();
    let ask = command::lookup(&fields, command::KEY_ASK).map(str::to_owned);

    let Some((cmd, handler)) = registry.get(&name) else {
        tracing::warn!(command = %name, "no handler registered");
        if let Some(ask) = ask {
            let response = command::error_box(
                &ask,
                command::ERROR_KIND_UNKNOWN_COMMAND,
                &format!("no handler for '{name}'"),
            );
            boxes::write_box(writer, &response).await?;
        }
        return Ok(false);
    };

    let args = match command::decode_fields(cmd.args, &fields) {
        Ok(args) => args,
        Err(e) => {
            tracing::warn!(command = %name, "bad arguments: {e}");
            if let Some(ask) = ask {
                let response =
                    command::error_box(&ask, command::ERROR_KIND_BAD_ARGUMENTS, &e.to_string());
                boxes::write_box(writer, &response).await?;
            }
            return Ok(false);
        }
    };

    let shutting_down = name == builtin::SHUTDOWN.name;
    match handler(&args) {
        Ok(values) => {
            if let Some(ask) = ask {
                let response = match command::answer_box(&ask, cmd, &values) {
                    Ok(response) => response,
                    Err(e) => {
                        tracing::error!(command = %name, "unencodable response: {e}");
                        command::error_box(&ask, command::ERROR_KIND_COMMAND_FAILED, &e.to_string())
                    }
                };
                boxes::write_box(writer, &response).await?;
            }
        }
        Err(e) => {
            if let Some(ask) = ask {
                let response =
                    command::error_box(&ask, command::ERROR_KIND_COMMAND_FAILED, &e.message);
                boxes::write_box(writer, &response).await?;
            } else {
                tracing::warn!(command = %name, "fire-and-forget handler failed: {}", e.message);
            }
        }
    }

    if shutting_down {
        tracing::info!("shutdown acknowledged, closing connection");
    }
    Ok(shutting_down)
}
