//! OS process invocation with chunked output capture.

use kubechat_protocol::OutputStream;
use log::{debug, warn};
use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How long to wait for a killed process to be reaped, and for its pipes to drain.
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Called for every chunk read from a pipe, in read order per stream.
///
/// Chunks end on character boundaries: a multi-byte sequence split by a read
/// is held back until the rest of it arrives.
pub type ChunkSink = Arc<dyn Fn(OutputStream, &str) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Exited { code: Option<i32> },
    TimedOut,
    Cancelled,
}

#[derive(Debug)]
pub struct ProcessOutput {
    pub outcome: ProcessOutcome,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ProcessOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Stdout followed by stderr.
    pub fn combined_lossy(&self) -> String {
        let mut bytes = self.stdout.clone();
        bytes.extend_from_slice(&self.stderr);
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// Options for one run.
#[derive(Clone)]
pub struct RunOptions {
    pub timeout: Duration,
    pub chunk_size: usize,
    pub sink: Option<ChunkSink>,
}

enum Stop {
    Exited(io::Result<ExitStatus>),
    Cancelled,
    TimedOut,
}

/// Spawn `argv` directly (no shell) and wait for it under the timeout.
///
/// Cancelling `token` and hitting the timeout both kill the process through
/// the same path. Spawn failures are returned as errors; everything after a
/// successful spawn yields a [`ProcessOutput`].
pub async fn run(argv: &[&str], options: RunOptions, token: &CancellationToken) -> io::Result<ProcessOutput> {
    let Some((program, args)) = argv.split_first() else {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty command"));
    };

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;
    let pid = child.id();
    debug!("spawned {} (pid {:?})", program, pid);

    let stdout_task = spawn_reader(
        child.stdout.take(),
        OutputStream::Stdout,
        options.chunk_size,
        options.sink.clone(),
    );
    let stderr_task = spawn_reader(
        child.stderr.take(),
        OutputStream::Stderr,
        options.chunk_size,
        options.sink.clone(),
    );

    let stop = tokio::select! {
        status = child.wait() => Stop::Exited(status),
        _ = token.cancelled() => Stop::Cancelled,
        _ = tokio::time::sleep(options.timeout) => Stop::TimedOut,
    };

    let outcome = match stop {
        Stop::Exited(Ok(status)) => ProcessOutcome::Exited {
            code: status.code(),
        },
        Stop::Exited(Err(e)) => {
            terminate(&mut child, pid).await;
            stdout_task.abort();
            stderr_task.abort();
            return Err(e);
        }
        Stop::Cancelled => {
            terminate(&mut child, pid).await;
            ProcessOutcome::Cancelled
        }
        Stop::TimedOut => {
            terminate(&mut child, pid).await;
            ProcessOutcome::TimedOut
        }
    };

    let stdout = collect(stdout_task).await;
    let stderr = collect(stderr_task).await;

    Ok(ProcessOutput {
        outcome,
        stdout,
        stderr,
    })
}

/// Kill the process and wait for it to be reaped.
async fn terminate(child: &mut Child, pid: Option<u32>) {
    if let Err(e) = child.start_kill() {
        // Already exited
        debug!("kill pid {:?}: {}", pid, e);
    }
    match tokio::time::timeout(REAP_TIMEOUT, child.wait()).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => warn!("Error waiting for process {:?}: {:?}", pid, e),
        Err(_) => warn!("Timeout waiting for process {:?} to exit", pid),
    }
}

fn spawn_reader<R>(
    reader: Option<R>,
    stream: OutputStream,
    chunk_size: usize,
    sink: Option<ChunkSink>,
) -> JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(mut reader) = reader else {
            return Vec::new();
        };
        let mut buffer = vec![0u8; chunk_size.max(1)];
        let mut collected = Vec::new();
        let mut pending = Vec::new();
        loop {
            match reader.read(&mut buffer).await {
                Ok(0) => break,
                Ok(n) => {
                    collected.extend_from_slice(&buffer[..n]);
                    if let Some(sink) = &sink {
                        pending.extend_from_slice(&buffer[..n]);
                        if let Some(text) = take_complete(&mut pending) {
                            sink(stream, &text);
                        }
                    }
                }
                Err(e) => {
                    debug!("{} reader stopped: {}", stream, e);
                    break;
                }
            }
        }
        // A truncated sequence at end of stream is flushed as-is
        if let Some(sink) = &sink
            && !pending.is_empty()
        {
            sink(stream, &String::from_utf8_lossy(&pending));
        }
        collected
    })
}

/// Split off the longest prefix of `pending` that does not end inside a
/// multi-byte character. Invalid sequences are replaced, not held back.
fn take_complete(pending: &mut Vec<u8>) -> Option<String> {
    let cut = match std::str::from_utf8(pending) {
        Ok(_) => pending.len(),
        Err(e) => match e.error_len() {
            // Incomplete tail: keep it for the next read
            None => e.valid_up_to(),
            Some(_) => {
                let cut = pending.len() - incomplete_tail(pending);
                cut.max(e.valid_up_to() + 1)
            }
        },
    };
    if cut == 0 {
        return None;
    }
    let head: Vec<u8> = pending.drain(..cut).collect();
    Some(String::from_utf8_lossy(&head).into_owned())
}

/// Length of a trailing, possibly valid but unfinished UTF-8 sequence.
fn incomplete_tail(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let byte = bytes[bytes.len() - back];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let width = match byte {
            b if b & 0xE0 == 0xC0 => 2,
            b if b & 0xF0 == 0xE0 => 3,
            b if b & 0xF8 == 0xF0 => 4,
            _ => 1,
        };
        return if width > back { back } else { 0 };
    }
    0
}

async fn collect(task: JoinHandle<Vec<u8>>) -> Vec<u8> {
    let abort = task.abort_handle();
    match tokio::time::timeout(REAP_TIMEOUT, task).await {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(e)) => {
            warn!("output reader failed: {}", e);
            Vec::new()
        }
        Err(_) => {
            // A grandchild may still hold the pipe open
            abort.abort();
            Vec::new()
        }
    }
}
