//! Bridges one worker process's I/O to the protocol layer.
//!
//! Every worker gets one connector task. The task owns the request channel,
//! the response channel, the incremental box parser, the correlation table
//! and the child handle, and multiplexes them with `select!`:
//!
//! - outbound [`WorkerClient`] requests are encoded and written, allocating
//!   a correlation id only when the command requires an answer;
//! - inbound bytes feed the box parser; `_answer` and `_error` boxes
//!   resolve or reject the matching pending call;
//! - stdout/stderr of the process are forwarded to the diagnostic log and
//!   never parsed as protocol data;
//! - malformed protocol input is fatal: all pending calls are rejected and
//!   the process is terminated;
//! - process exit rejects whatever is still pending and resolves the
//!   worker's [`CompletionHandle`] with the captured [`ExitOutcome`].

use std::collections::HashMap;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, BufReader};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot, watch};

use crate::config::Signal;
use crate::error::{CorralError, Result};
use crate::launcher::{self, SpawnedWorker};
use crate::protocol::boxes::{self, BoxFields, BoxParser};
use crate::protocol::command::{self, Command, FieldValues};

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Exit status 0.
    Clean,
    /// Non-zero exit code.
    Code(i32),
    /// Killed by a signal (Unix).
    Signal(i32),
}

impl ExitOutcome {
    pub fn is_clean(self) -> bool {
        matches!(self, ExitOutcome::Clean)
    }

    pub(crate) fn from_status(status: std::process::ExitStatus) -> Self {
        if status.success() {
            return ExitOutcome::Clean;
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return ExitOutcome::Signal(signal);
            }
        }
        ExitOutcome::Code(status.code().unwrap_or(-1))
    }
}

impl std::fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitOutcome::Clean => write!(f, "exited cleanly"),
            ExitOutcome::Code(code) => write!(f, "exited with code {code}"),
            ExitOutcome::Signal(signal) => write!(f, "killed by signal {signal}"),
        }
    }
}

/// Resolves when the worker's OS process has exited, for any reason.
///
/// Clones observe the same outcome; `wait` is idempotent.
#[derive(Debug, Clone)]
pub struct CompletionHandle {
    rx: watch::Receiver<Option<ExitOutcome>>,
}

impl CompletionHandle {
    /// Wait for the process to exit and return the outcome.
    pub async fn wait(&mut self) -> ExitOutcome {
        loop {
            if let Some(outcome) = *self.rx.borrow() {
                return outcome;
            }
            if self.rx.changed().await.is_err() {
                // connector died without publishing; report an unknown failure
                return (*self.rx.borrow()).unwrap_or(ExitOutcome::Code(-1));
            }
        }
    }

    /// The outcome, if the process has already exited.
    pub fn try_get(&self) -> Option<ExitOutcome> {
        *self.rx.borrow()
    }
}

/// Host-side handle to one worker's protocol connection.
#[derive(Debug, Clone)]
pub struct WorkerClient {
    tx: mpsc::UnboundedSender<ClientRequest>,
    pid: u32,
}

impl WorkerClient {
    /// Issue a request. `reply` resolves with the decoded response fields,
    /// immediately with empty fields for fire-and-forget commands, or with
    /// the dispatch error.
    ///
    /// Returns `false` if the connector is already gone (the process
    /// exited); `reply` is dropped in that case.
    pub(crate) fn call(
        &self,
        command: Command,
        args: FieldValues,
        reply: oneshot::Sender<Result<FieldValues>>,
    ) -> bool {
        self.tx
            .send(ClientRequest {
                command,
                args,
                reply,
            })
            .is_ok()
    }

    /// True once the connector task has gone away (the process exited).
    pub(crate) fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }
}

struct ClientRequest {
    command: Command,
    args: FieldValues,
    reply: oneshot::Sender<Result<FieldValues>>,
}

struct PendingCall {
    command: Command,
    reply: oneshot::Sender<Result<FieldValues>>,
}

/// A worker's client handle plus its completion handle.
pub(crate) struct ConnectorHandle {
    pub client: WorkerClient,
    pub completion: CompletionHandle,
}

/// Spawn the connector task (and the stdout/stderr forwarders) for a
/// freshly launched worker.
pub(crate) fn spawn_connector(worker_id: String, spawned: SpawnedWorker) -> ConnectorHandle {
    let SpawnedWorker {
        child,
        pid,
        writer,
        reader,
        stdout,
        stderr,
    } = spawned;

    if let Some(stdout) = stdout {
        let id = worker_id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(worker = %id, "stdout: {line}");
            }
        });
    }
    if let Some(stderr) = stderr {
        let id = worker_id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::warn!(worker = %id, "stderr: {line}");
            }
        });
    }

    let (tx, rx) = mpsc::unbounded_channel();
    let (done_tx, done_rx) = watch::channel(None);
    tokio::spawn(run_connector(
        worker_id, pid, child, writer, reader, rx, done_tx,
    ));

    ConnectorHandle {
        client: WorkerClient { tx, pid },
        completion: CompletionHandle { rx: done_rx },
    }
}

async fn run_connector(
    worker_id: String,
    pid: u32,
    mut child: Child,
    mut writer: Box<dyn AsyncWrite + Send + Unpin>,
    mut reader: Box<dyn AsyncRead + Send + Unpin>,
    mut requests: mpsc::UnboundedReceiver<ClientRequest>,
    done: watch::Sender<Option<ExitOutcome>>,
) {
    let mut parser = BoxParser::new();
    let mut pending: HashMap<u64, PendingCall> = HashMap::new();
    let mut next_ask: u64 = 1;
    let mut buf = [0u8; 8192];
    let mut requests_open = true;
    let mut reading = true;

    let outcome = loop {
        tokio::select! {
            // biased: drain buffered responses before acting on an exit,
            // so an answer written just before the process died still
            // resolves its call
            biased;
            read = reader.read(&mut buf), if reading => {
                match read {
                    Ok(0) => {
                        if parser.is_mid_box() {
                            protocol_failure(&worker_id, pid, &mut pending, "connection closed mid-box");
                        }
                        reading = false;
                    }
                    Ok(n) => {
                        parser.feed(&buf[..n]);
                        loop {
                            match parser.next_box() {
                                Ok(Some(fields)) => {
                                    if let Err(e) = handle_inbound(&worker_id, fields, &mut pending) {
                                        protocol_failure(&worker_id, pid, &mut pending, &e.to_string());
                                        reading = false;
                                        break;
                                    }
                                }
                                Ok(None) => break,
                                Err(e) => {
                                    protocol_failure(&worker_id, pid, &mut pending, &e.to_string());
                                    reading = false;
                                    break;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(worker = %worker_id, "read failed: {e}");
                        reading = false;
                    }
                }
            }
            request = requests.recv(), if requests_open => {
                match request {
                    Some(request) => {
                        handle_request(&worker_id, request, &mut writer, &mut pending, &mut next_ask)
                            .await;
                    }
                    // all client handles dropped; keep servicing reads
                    // until the process exits
                    None => requests_open = false,
                }
            }
            status = child.wait() => {
                break match status {
                    Ok(status) => ExitOutcome::from_status(status),
                    Err(e) => {
                        tracing::warn!(worker = %worker_id, "wait failed: {e}");
                        ExitOutcome::Code(-1)
                    }
                };
            }
        }
    };

    // reject the in-flight calls...
    for (_, call) in pending.drain() {
        let _ = call.reply.send(Err(CorralError::WorkerLost(outcome.to_string())));
    }
    // ...and any requests queued behind the exit
    requests.close();
    while let Ok(request) = requests.try_recv() {
        let _ = request
            .reply
            .send(Err(CorralError::WorkerLost(outcome.to_string())));
    }

    if outcome.is_clean() {
        tracing::debug!(worker = %worker_id, "worker exited cleanly");
    } else {
        tracing::warn!(worker = %worker_id, "worker {outcome}");
    }
    let _ = done.send(Some(outcome));
}

async fn handle_request(
    worker_id: &str,
    request: ClientRequest,
    writer: &mut Box<dyn AsyncWrite + Send + Unpin>,
    pending: &mut HashMap<u64, PendingCall>,
    next_ask: &mut u64,
) {
    let ClientRequest {
        command,
        args,
        reply,
    } = request;

    let ask = if command.requires_answer {
        let id = *next_ask;
        *next_ask += 1;
        Some(id)
    } else {
        None
    };

    let fields = match command::request_box(&command, &args, ask) {
        Ok(fields) => fields,
        Err(e) => {
            let _ = reply.send(Err(e));
            return;
        }
    };

    if let Err(e) = boxes::write_box(writer, &fields).await {
        tracing::warn!(worker = %worker_id, command = command.name, "request write failed: {e}");
        let _ = reply.send(Err(CorralError::WorkerLost(format!(
            "request write failed: {e}"
        ))));
        return;
    }

    match ask {
        Some(id) => {
            pending.insert(id, PendingCall { command, reply });
        }
        // fire-and-forget: complete as soon as the bytes are written
        None => {
            let _ = reply.send(Ok(FieldValues::new()));
        }
    }
}

/// Route one inbound box. An error return is protocol-fatal.
fn handle_inbound(
    worker_id: &str,
    fields: BoxFields,
    pending: &mut HashMap<u64, PendingCall>,
) -> Result<()> {
    if let Some(id_text) = command::lookup(&fields, command::KEY_ANSWER) {
        let id = parse_correlation(id_text)?;
        match pending.remove(&id) {
            Some(call) => {
                let result = command::decode_fields(call.command.response, &fields);
                let _ = call.reply.send(result);
            }
            None => tracing::warn!(worker = %worker_id, "answer for unknown call {id}"),
        }
        return Ok(());
    }

    if let Some(id_text) = command::lookup(&fields, command::KEY_ERROR) {
        let id = parse_correlation(id_text)?;
        match pending.remove(&id) {
            Some(call) => {
                let kind = command::lookup(&fields, command::KEY_ERROR_KIND)
                    .unwrap_or(command::ERROR_KIND_COMMAND_FAILED);
                let message = command::lookup(&fields, command::KEY_ERROR_MSG).unwrap_or_default();
                let error = if kind == command::ERROR_KIND_UNKNOWN_COMMAND {
                    CorralError::UnknownCommand(call.command.name.to_string())
                } else {
                    CorralError::Command {
                        name: call.command.name.to_string(),
                        kind: kind.to_string(),
                        message: message.to_string(),
                    }
                };
                let _ = call.reply.send(Err(error));
            }
            None => tracing::warn!(worker = %worker_id, "error for unknown call {id}"),
        }
        return Ok(());
    }

    tracing::warn!(worker = %worker_id, "unexpected box from worker (no _answer or _error)");
    Ok(())
}

fn parse_correlation(text: &str) -> Result<u64> {
    text.parse()
        .map_err(|_| CorralError::Protocol(format!("correlation id is not numeric: {text:?}")))
}

fn protocol_failure(
    worker_id: &str,
    pid: u32,
    pending: &mut HashMap<u64, PendingCall>,
    reason: &str,
) {
    tracing::warn!(worker = %worker_id, "protocol failure, terminating worker: {reason}");
    for (_, call) in pending.drain() {
        let _ = call.reply.send(Err(CorralError::Protocol(reason.to_string())));
    }
    launcher::kill_worker(pid, Signal::Kill);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LaunchSpec;
    use crate::protocol::builtin;

    #[cfg(unix)]
    #[test]
    fn test_exit_outcome_from_status() {
        use std::os::unix::process::ExitStatusExt;
        use std::process::ExitStatus;

        assert_eq!(
            ExitOutcome::from_status(ExitStatus::from_raw(0)),
            ExitOutcome::Clean
        );
        // wait(2) encodes the exit code in the high byte
        assert_eq!(
            ExitOutcome::from_status(ExitStatus::from_raw(3 << 8)),
            ExitOutcome::Code(3)
        );
        assert_eq!(
            ExitOutcome::from_status(ExitStatus::from_raw(libc::SIGKILL)),
            ExitOutcome::Signal(libc::SIGKILL)
        );
    }

    #[cfg(unix)]
    fn sh_worker(script: &str) -> SpawnedWorker {
        let mut spec = LaunchSpec::new("/bin/sh");
        spec.args = vec!["-c".to_string(), script.to_string()];
        launcher::spawn_worker(&spec).unwrap()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_completion_clean_exit() {
        let handle = spawn_connector("worker-test".to_string(), sh_worker("exit 0"));
        let mut completion = handle.completion;
        assert_eq!(completion.wait().await, ExitOutcome::Clean);
        // idempotent
        assert_eq!(completion.wait().await, ExitOutcome::Clean);
        assert_eq!(completion.try_get(), Some(ExitOutcome::Clean));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_completion_exit_code() {
        let handle = spawn_connector("worker-test".to_string(), sh_worker("exit 3"));
        let mut completion = handle.completion;
        assert_eq!(completion.wait().await, ExitOutcome::Code(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_completion_signal() {
        let spawned = sh_worker("sleep 30");
        let pid = spawned.pid;
        let handle = spawn_connector("worker-test".to_string(), spawned);
        launcher::kill_worker(pid, Signal::Kill);
        let mut completion = handle.completion;
        assert_eq!(completion.wait().await, ExitOutcome::Signal(libc::SIGKILL));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_pending_call_rejected_on_exit() {
        // consumes the start of the request and exits without answering
        let handle = spawn_connector(
            "worker-test".to_string(),
            sh_worker("head -c 1 <&3 >/dev/null; exit 7"),
        );
        let (tx, rx) = oneshot::channel();
        let args = FieldValues::new().with("text", "hello");
        assert!(handle.client.call(builtin::ECHO, args, tx));
        let result = rx.await.unwrap();
        assert!(matches!(result, Err(CorralError::WorkerLost(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_garbage_response_is_protocol_fatal() {
        // writes bytes that cannot be a box (key length 0xffff)
        let handle = spawn_connector(
            "worker-test".to_string(),
            sh_worker(r"printf '\377\377garbage' >&4; sleep 30"),
        );
        let (tx, rx) = oneshot::channel();
        let args = FieldValues::new().with("text", "hello");
        assert!(handle.client.call(builtin::ECHO, args, tx));
        let result = rx.await.unwrap();
        assert!(matches!(
            result,
            Err(CorralError::Protocol(_)) | Err(CorralError::WorkerLost(_))
        ));
        // the connector kills the worker on protocol failure
        let mut completion = handle.completion;
        assert_eq!(completion.wait().await, ExitOutcome::Signal(libc::SIGKILL));
    }

    #[test]
    fn test_handle_inbound_resolves_answer() {
        let (tx, mut rx) = oneshot::channel();
        let mut pending = HashMap::new();
        pending.insert(
            5,
            PendingCall {
                command: builtin::PID,
                reply: tx,
            },
        );

        let fields = vec![
            ("_answer".to_string(), "5".to_string()),
            ("pid".to_string(), "4321".to_string()),
        ];
        handle_inbound("worker-test", fields, &mut pending).unwrap();
        assert!(pending.is_empty());
        let values = rx.try_recv().unwrap().unwrap();
        assert_eq!(values.get_int("pid"), Some(4321));
    }

    #[test]
    fn test_handle_inbound_rejects_error() {
        let (tx, mut rx) = oneshot::channel();
        let mut pending = HashMap::new();
        pending.insert(
            9,
            PendingCall {
                command: builtin::ECHO,
                reply: tx,
            },
        );

        let fields = vec![
            ("_error".to_string(), "9".to_string()),
            ("_error_kind".to_string(), "COMMAND_FAILED".to_string()),
            ("_error_msg".to_string(), "boom".to_string()),
        ];
        handle_inbound("worker-test", fields, &mut pending).unwrap();
        match rx.try_recv().unwrap() {
            Err(CorralError::Command { name, kind, message }) => {
                assert_eq!(name, "echo");
                assert_eq!(kind, "COMMAND_FAILED");
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_handle_inbound_unknown_command_error() {
        let (tx, mut rx) = oneshot::channel();
        let mut pending = HashMap::new();
        pending.insert(
            1,
            PendingCall {
                command: builtin::ECHO,
                reply: tx,
            },
        );

        let fields = vec![
            ("_error".to_string(), "1".to_string()),
            ("_error_kind".to_string(), "UNKNOWN_COMMAND".to_string()),
            ("_error_msg".to_string(), "no handler".to_string()),
        ];
        handle_inbound("worker-test", fields, &mut pending).unwrap();
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(CorralError::UnknownCommand(name)) if name == "echo"
        ));
    }

    #[test]
    fn test_handle_inbound_non_numeric_correlation_is_fatal() {
        let mut pending = HashMap::new();
        let fields = vec![("_answer".to_string(), "abc".to_string())];
        assert!(matches!(
            handle_inbound("worker-test", fields, &mut pending),
            Err(CorralError::Protocol(_))
        ));
    }
}
