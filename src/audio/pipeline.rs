//! External process pipeline producing raw PCM
//!
//! An optional fetch stage writes compressed audio to its stdout, a pump task copies
//! it into the transcode stage's stdin, and the transcode stage's stdout becomes the
//! [`PcmStream`]. A supervisor task owns both children: transcode exiting, fetch
//! failing or the pump failing tears the whole pipeline down. Teardown closes the
//! transcode input, waits a grace period, then kills whatever is still running.

use crate::error::SourceError;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWriteExt, BufReader, ReadBuf};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const PUMP_BUFFER: usize = 1 << 16;

/// Readable PCM (s16le, 48kHz, stereo)
///
/// Reads after the stream was released or cancelled, and I/O errors raised while the
/// owning pipeline is being torn down, are reported as end of stream.
pub struct PcmStream {
    reader: Pin<Box<dyn AsyncRead + Send>>,
    pipeline: Option<ProcessPipeline>,
}

impl PcmStream {
    /// Wrap an in-process reader (no child processes to supervise)
    pub fn from_reader<R>(reader: R) -> Self
    where
        R: AsyncRead + Send + 'static,
    {
        Self {
            reader: Box::pin(reader),
            pipeline: None,
        }
    }

    pub fn pipeline(&self) -> Option<&ProcessPipeline> {
        self.pipeline.as_ref()
    }

    /// Release the stream and wait for its processes to be gone
    pub async fn close(self) {
        let PcmStream { reader, pipeline } = self;
        // Closing our end first unblocks a transcoder stuck writing to a full pipe
        drop(reader);
        if let Some(mut pipeline) = pipeline {
            pipeline.close().await;
        }
    }
}

impl AsyncRead for PcmStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if let Some(pipeline) = &this.pipeline {
            if pipeline.is_released() {
                return Poll::Ready(Ok(()));
            }
        }

        match this.reader.as_mut().poll_read(cx, buf) {
            Poll::Ready(Err(e)) => match &this.pipeline {
                Some(pipeline) if pipeline.is_stopping() => {
                    debug!(error = %e, "PCM read failed during teardown, treating as EOF");
                    Poll::Ready(Ok(()))
                }
                _ => Poll::Ready(Err(e)),
            },
            other => other,
        }
    }
}

/// Handle over a running fetch/transcode pair
pub struct ProcessPipeline {
    parent: CancellationToken,
    stop: CancellationToken,
    released: Arc<AtomicBool>,
    transcode_pid: Option<u32>,
    supervisor: Option<JoinHandle<()>>,
    pump: Option<JoinHandle<()>>,
}

impl ProcessPipeline {
    /// Start the pipeline and return its PCM output.
    ///
    /// With a fetch command the transcode stage reads from stdin; without one it is
    /// expected to open its input itself. `cancel` is the scope the pipeline lives in.
    pub fn spawn(
        fetch: Option<Command>,
        mut transcode: Command,
        grace: Duration,
        cancel: &CancellationToken,
    ) -> Result<PcmStream, SourceError> {
        let mut fetch_child = match fetch {
            Some(mut cmd) => {
                cmd.stdin(Stdio::null())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::null())
                    .kill_on_drop(true);
                let child = spawn_child(&mut cmd)?;
                info!(pid = ?child.id(), program = ?program_of(&cmd), "Fetch stage started");
                Some(child)
            }
            None => None,
        };

        transcode
            .stdin(if fetch_child.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut transcode_child = match spawn_child(&mut transcode) {
            Ok(child) => child,
            Err(e) => {
                if let Some(fetch) = fetch_child.as_mut() {
                    let _ = fetch.start_kill();
                }
                return Err(e);
            }
        };
        let transcode_pid = transcode_child.id();
        info!(pid = ?transcode_pid, program = ?program_of(&transcode), "Transcode stage started");

        let stdout = take_pipe(transcode_child.stdout.take(), "transcode stdout")?;

        let stop = cancel.child_token();

        let pump = match fetch_child.as_mut() {
            Some(fetch) => {
                let from = take_pipe(fetch.stdout.take(), "fetch stdout")?;
                let to = take_pipe(transcode_child.stdin.take(), "transcode stdin")?;
                Some(tokio::spawn(pump(from, to, stop.clone())))
            }
            None => None,
        };

        let supervisor = tokio::spawn(supervise(
            fetch_child,
            transcode_child,
            stop.clone(),
            grace,
        ));

        let pipeline = ProcessPipeline {
            parent: cancel.clone(),
            stop,
            released: Arc::new(AtomicBool::new(false)),
            transcode_pid,
            supervisor: Some(supervisor),
            pump,
        };

        Ok(PcmStream {
            reader: Box::pin(stdout),
            pipeline: Some(pipeline),
        })
    }

    pub fn transcode_pid(&self) -> Option<u32> {
        self.transcode_pid
    }

    /// Start teardown without waiting for it. Safe to call any number of times.
    pub fn terminate(&self) {
        self.released.store(true, Ordering::SeqCst);
        self.stop.cancel();
    }

    /// Tear down and wait until both processes have been reaped
    pub async fn close(&mut self) {
        self.terminate();
        if let Some(pump) = self.pump.take() {
            let _ = pump.await;
        }
        if let Some(supervisor) = self.supervisor.take() {
            if let Err(e) = supervisor.await {
                warn!(error = %e, "Pipeline supervisor task failed");
            }
        }
    }

    fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst) || self.parent.is_cancelled()
    }

    fn is_stopping(&self) -> bool {
        self.stop.is_cancelled()
    }
}

impl Drop for ProcessPipeline {
    fn drop(&mut self) {
        // Supervisor keeps running and finishes the teardown in the background
        self.terminate();
    }
}

fn spawn_child(cmd: &mut Command) -> Result<Child, SourceError> {
    cmd.spawn().map_err(|source| SourceError::Spawn {
        program: program_of(cmd),
        source,
    })
}

fn program_of(cmd: &Command) -> PathBuf {
    PathBuf::from(cmd.as_std().get_program())
}

fn take_pipe<T>(pipe: Option<T>, what: &str) -> Result<T, SourceError> {
    pipe.ok_or_else(|| SourceError::Io(io::Error::other(format!("{} not captured", what))))
}

async fn pump(from: ChildStdout, mut to: ChildStdin, stop: CancellationToken) {
    let mut from = BufReader::with_capacity(PUMP_BUFFER, from);

    let outcome = tokio::select! {
        res = tokio::io::copy_buf(&mut from, &mut to) => Some(res),
        _ = stop.cancelled() => None,
    };

    match outcome {
        Some(Ok(bytes)) => {
            debug!(bytes, "Fetch output drained into transcode");
            let _ = to.shutdown().await;
        }
        Some(Err(e)) => {
            if !stop.is_cancelled() {
                warn!(error = %e, "Pipeline pump failed");
                stop.cancel();
            }
        }
        None => debug!("Pump stopped by teardown"),
    }
    // Dropping stdin lets transcode drain what it already received
    drop(to);
}

async fn supervise(
    mut fetch: Option<Child>,
    mut transcode: Child,
    stop: CancellationToken,
    grace: Duration,
) {
    let mut fetch_done = fetch.is_none();
    let mut transcode_done = false;

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            status = wait_fetch(&mut fetch), if !fetch_done => {
                fetch_done = true;
                match status {
                    Ok(status) if status.success() => debug!("Fetch stage finished"),
                    Ok(status) => {
                        warn!(%status, "Fetch stage failed, stopping pipeline");
                        stop.cancel();
                    }
                    Err(e) => {
                        warn!(error = %e, "Waiting on fetch stage failed");
                        stop.cancel();
                    }
                }
            }
            status = transcode.wait(), if !transcode_done => {
                transcode_done = true;
                debug!(status = ?status, "Transcode stage exited");
                stop.cancel();
            }
        }
    }

    let drained = tokio::time::timeout(grace, async {
        if !fetch_done {
            let _ = wait_fetch(&mut fetch).await;
        }
        if !transcode_done {
            let _ = transcode.wait().await;
        }
    })
    .await;

    if drained.is_err() {
        debug!(grace_ms = grace.as_millis() as u64, "Grace period elapsed, killing pipeline");
    }

    if let Some(fetch) = fetch.as_mut() {
        kill_if_running(fetch, "fetch").await;
    }
    kill_if_running(&mut transcode, "transcode").await;
}

async fn wait_fetch(fetch: &mut Option<Child>) -> io::Result<ExitStatus> {
    match fetch {
        Some(child) => child.wait().await,
        None => std::future::pending().await,
    }
}

async fn kill_if_running(child: &mut Child, stage: &str) {
    match child.try_wait() {
        Ok(Some(_)) => {}
        _ => {
            if let Err(e) = child.kill().await {
                debug!(stage, error = %e, "Kill failed (already gone?)");
            } else {
                debug!(stage, "Killed lingering process");
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    const GRACE: Duration = Duration::from_millis(100);
    const LIMIT: Duration = Duration::from_secs(10);

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[tokio::test]
    async fn test_two_stage_pipeline() {
        let token = CancellationToken::new();
        let mut stream =
            ProcessPipeline::spawn(Some(sh("printf hello")), Command::new("cat"), GRACE, &token)
                .unwrap();

        let mut out = Vec::new();
        tokio::time::timeout(LIMIT, stream.read_to_end(&mut out))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out, b"hello");
        stream.close().await;
    }

    #[tokio::test]
    async fn test_transcode_only_pipeline() {
        let token = CancellationToken::new();
        let mut stream = ProcessPipeline::spawn(None, sh("printf abc"), GRACE, &token).unwrap();

        let mut out = Vec::new();
        tokio::time::timeout(LIMIT, stream.read_to_end(&mut out))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out, b"abc");
    }

    #[tokio::test]
    async fn test_killed_transcode_reads_as_eof() {
        let token = CancellationToken::new();
        let mut stream = ProcessPipeline::spawn(
            Some(sh("printf abcd; exec sleep 30")),
            Command::new("cat"),
            GRACE,
            &token,
        )
        .unwrap();

        let mut head = [0u8; 4];
        tokio::time::timeout(LIMIT, stream.read_exact(&mut head))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&head, b"abcd");

        let pid = stream.pipeline().unwrap().transcode_pid().unwrap();
        let status = Command::new("kill")
            .arg("-9")
            .arg(pid.to_string())
            .status()
            .await
            .unwrap();
        assert!(status.success());

        let mut rest = [0u8; 16];
        let n = tokio::time::timeout(LIMIT, stream.read(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);

        tokio::time::timeout(LIMIT, stream.close()).await.unwrap();
    }

    #[tokio::test]
    async fn test_terminate_mid_read_is_eof() {
        let token = CancellationToken::new();
        let mut stream = ProcessPipeline::spawn(
            Some(sh("printf abcd; exec sleep 30")),
            Command::new("cat"),
            GRACE,
            &token,
        )
        .unwrap();

        let mut head = [0u8; 4];
        stream.read_exact(&mut head).await.unwrap();

        stream.pipeline().unwrap().terminate();
        let mut rest = [0u8; 16];
        assert_eq!(stream.read(&mut rest).await.unwrap(), 0);

        // Teardown is idempotent
        stream.pipeline().unwrap().terminate();
        tokio::time::timeout(LIMIT, stream.close()).await.unwrap();
    }

    #[tokio::test]
    async fn test_parent_cancel_ends_stream() {
        let token = CancellationToken::new();
        let mut stream =
            ProcessPipeline::spawn(Some(sh("exec sleep 30")), Command::new("cat"), GRACE, &token)
                .unwrap();

        token.cancel();
        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(LIMIT, stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
        tokio::time::timeout(LIMIT, stream.close()).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_fetch_ends_stream() {
        let token = CancellationToken::new();
        let mut stream =
            ProcessPipeline::spawn(Some(sh("exit 3")), Command::new("cat"), GRACE, &token)
                .unwrap();

        let mut out = Vec::new();
        tokio::time::timeout(LIMIT, stream.read_to_end(&mut out))
            .await
            .unwrap()
            .unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let token = CancellationToken::new();
        let result = ProcessPipeline::spawn(
            Some(Command::new("/nonexistent/yt-dlp")),
            Command::new("cat"),
            GRACE,
            &token,
        );
        assert!(matches!(result, Err(SourceError::Spawn { .. })));
    }
}
