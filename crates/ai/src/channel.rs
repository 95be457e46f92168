//! Engine channel: one long-lived engine process spoken to over stdin/stdout.
//!
//! - Writes go through a single writer task, so concurrent senders never
//!   interleave bytes within a line.
//! - One reader task drains stdout, reassembles lines from arbitrary chunks
//!   and hands each complete line to the correlator, in arrival order.
//! - stderr is drained separately into the log and never parsed.
//! - When the process exits, every pending call fails with a transport
//!   failure and the channel stays dead until someone builds a new one.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::Value as JsonValue;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::correlator::{CorrelationMode, Correlator, PendingGuard};
use crate::result::{BridgeError, BridgeResult};
use crate::wire::{self, EngineCall, ReplyLine};

/// Longest reply line accepted from the engine.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

const READ_CHUNK_BYTES: usize = 8 * 1024;
const LOGGED_LINE_BYTES: usize = 256;

/// How to start the engine process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineCommand {
    pub program: String,
    pub args: Vec<String>,
    pub current_dir: Option<PathBuf>,
}

impl EngineCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Split a whitespace-separated command line (`python main.py`).
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let program = parts.next()?;
        Some(Self {
            program: program.to_string(),
            args: parts.map(str::to_string).collect(),
            current_dir: None,
        })
    }

    fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

impl core::fmt::Display for EngineCommand {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// A line that could not be framed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The line exceeded the size limit and was discarded.
    TooLong { len: usize },
    /// The line was not valid UTF-8.
    InvalidUtf8,
}

/// Reassembles newline-terminated lines from arbitrarily split chunks.
#[derive(Debug)]
pub struct LineBuffer {
    pending: Vec<u8>,
    max_line: usize,
    /// Bytes dropped from an oversized line still awaiting its terminator.
    discarding: Option<usize>,
}

impl LineBuffer {
    pub fn new(max_line: usize) -> Self {
        Self {
            pending: Vec::new(),
            max_line,
            discarding: None,
        }
    }

    /// Feed one chunk; returns every line it completed, in order.
    ///
    /// A trailing partial line stays buffered until its `\n` arrives. `\r\n`
    /// terminators are accepted.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<String, FrameError>> {
        let mut out = Vec::new();
        let mut rest = chunk;

        while let Some(pos) = rest.iter().position(|b| *b == b'\n') {
            let (head, tail) = rest.split_at(pos);
            rest = &tail[1..];

            if let Some(dropped) = self.discarding.take() {
                out.push(Err(FrameError::TooLong {
                    len: dropped + head.len(),
                }));
                continue;
            }

            if self.pending.len() + head.len() > self.max_line {
                let len = self.pending.len() + head.len();
                self.pending.clear();
                out.push(Err(FrameError::TooLong { len }));
                continue;
            }

            self.pending.extend_from_slice(head);
            let mut line = std::mem::take(&mut self.pending);
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            out.push(String::from_utf8(line).map_err(|_| FrameError::InvalidUtf8));
        }

        if !rest.is_empty() {
            match self.discarding.as_mut() {
                Some(dropped) => *dropped += rest.len(),
                None if self.pending.len() + rest.len() > self.max_line => {
                    self.discarding = Some(self.pending.len() + rest.len());
                    self.pending.clear();
                }
                None => self.pending.extend_from_slice(rest),
            }
        }

        out
    }

    /// Bytes of an unterminated line currently held.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }
}

/// A live (or dead) connection to one engine process.
///
/// Construct with [`EngineChannel::spawn`] for a real subprocess, or with
/// [`EngineChannel::from_io`] over any byte streams (tests use an in-memory
/// duplex pipe as a fake engine).
#[derive(Debug)]
pub struct EngineChannel {
    mode: CorrelationMode,
    correlator: Arc<Correlator>,
    alive: Arc<AtomicBool>,
    writer_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    single_flight: Semaphore,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl EngineChannel {
    /// Start the engine process and attach reader, writer and stderr tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        command: &EngineCommand,
        correlator: Arc<Correlator>,
        mode: CorrelationMode,
    ) -> BridgeResult<Self> {
        let mut child = command
            .to_command()
            .spawn()
            .map_err(|e| BridgeError::transport(format!("failed to start engine `{command}`: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BridgeError::transport("failed to capture engine stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::transport("failed to capture engine stdout"))?;
        let stderr = child.stderr.take();

        info!(engine = %command, pid = child.id(), mode = mode.as_str(), "engine process started");

        let channel = Self::from_io(stdout, stdin, correlator, mode);

        let (kill_tx, kill_rx) = oneshot::channel();
        let mut tasks = Vec::new();
        if let Some(stderr) = stderr {
            tasks.push(tokio::spawn(drain_stderr(stderr)));
        }
        tasks.push(tokio::spawn(supervise(
            child,
            kill_rx,
            channel.alive.clone(),
            channel.correlator.clone(),
        )));

        *channel.kill_tx.lock().unwrap_or_else(PoisonError::into_inner) = Some(kill_tx);
        channel
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(tasks);

        Ok(channel)
    }

    /// Attach to an engine reachable through arbitrary byte streams.
    pub fn from_io<R, W>(
        reader: R,
        writer: W,
        correlator: Arc<Correlator>,
        mode: CorrelationMode,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        correlator.set_mode(mode);
        let alive = Arc::new(AtomicBool::new(true));
        let (writer_tx, writer_rx) = mpsc::unbounded_channel::<String>();

        let writer = tokio::spawn(writer_loop(
            writer,
            writer_rx,
            alive.clone(),
            correlator.clone(),
        ));
        let reader = tokio::spawn(reader_loop(
            reader,
            mode,
            alive.clone(),
            correlator.clone(),
        ));

        Self {
            mode,
            correlator,
            alive,
            writer_tx: Mutex::new(Some(writer_tx)),
            single_flight: Semaphore::new(1),
            kill_tx: Mutex::new(None),
            tasks: Mutex::new(vec![writer, reader]),
        }
    }

    pub fn mode(&self) -> CorrelationMode {
        self.mode
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn pending_calls(&self) -> usize {
        self.correlator.pending_len()
    }

    /// Queue one line (a newline is appended) and return without waiting.
    pub fn send(&self, line: String) -> BridgeResult<()> {
        if !self.is_alive() {
            return Err(BridgeError::transport("engine channel is down"));
        }
        let guard = self.writer_tx.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = guard
            .as_ref()
            .ok_or_else(|| BridgeError::transport("engine channel is shut down"))?;
        tx.send(line)
            .map_err(|_| BridgeError::transport("engine writer has stopped"))
    }

    /// Send one call and wait for its reply, at most `timeout`.
    ///
    /// Dropping the returned future cancels the call; a reply arriving later
    /// is discarded.
    ///
    /// `timeout` covers the whole call. In FIFO mode that includes waiting
    /// for the single-flight permit behind other callers.
    pub async fn call(&self, call: EngineCall<'_>, timeout: Duration) -> BridgeResult<JsonValue> {
        let deadline = tokio::time::Instant::now() + timeout;

        let _permit = match self.mode {
            CorrelationMode::Fifo => {
                match tokio::time::timeout_at(deadline, self.single_flight.acquire()).await {
                    Ok(Ok(permit)) => Some(permit),
                    Ok(Err(_)) => return Err(BridgeError::transport("engine channel is shut down")),
                    Err(_) => {
                        warn!(kind = call.op().as_str(), timeout_ms = timeout.as_millis() as u64, "engine call timed out waiting for its turn");
                        return Err(BridgeError::Timeout);
                    }
                }
            }
            CorrelationMode::Tagged => None,
        };

        if !self.is_alive() {
            return Err(BridgeError::transport("engine channel is down"));
        }

        let (id, mut rx) = self.correlator.register();
        let _guard = PendingGuard::new(&self.correlator, id);

        let line = match self.mode {
            CorrelationMode::Tagged => wire::encode_tagged(id, call)?,
            CorrelationMode::Fifo => wire::encode_legacy(call)?,
        };
        self.send(line)?;
        self.correlator.mark_sent(id);
        debug!(call_id = %id, kind = call.op().as_str(), "engine call sent");

        match tokio::time::timeout_at(deadline, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(BridgeError::Cancelled),
            Err(_) => {
                self.correlator.expire(id);
                warn!(
                    call_id = %id,
                    kind = call.op().as_str(),
                    timeout_ms = timeout.as_millis() as u64,
                    owed_replies = self.correlator.owed_replies(),
                    "engine call timed out"
                );
                Err(BridgeError::Timeout)
            }
        }
    }

    /// Close stdin, give the process `grace` to exit, then kill it.
    pub async fn shutdown(&self, grace: Duration) {
        self.writer_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.single_flight.close();

        let tasks: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner),
        );

        let waited = tokio::time::timeout(grace, async {
            while self.is_alive() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;

        if waited.is_err() {
            warn!(grace_ms = grace.as_millis() as u64, "engine did not exit after stdin closed; killing");
        }
        if let Some(kill) = self
            .kill_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = kill.send(());
        }

        for mut task in tasks {
            if tokio::time::timeout(grace, &mut task).await.is_err() {
                debug!("engine channel task did not finish within grace period; aborting");
                task.abort();
            }
        }

        self.alive.store(false, Ordering::Release);
        let failed = self
            .correlator
            .fail_all(BridgeError::transport("engine channel shut down"));
        if failed > 0 {
            warn!(failed, "pending engine calls failed by shutdown");
        }
        info!("engine channel shut down");
    }
}

fn mark_dead(alive: &AtomicBool, correlator: &Correlator, reason: &str) {
    let was_alive = alive.swap(false, Ordering::AcqRel);
    let failed = correlator.fail_all(BridgeError::transport(reason.to_string()));
    if was_alive || failed > 0 {
        warn!(reason, failed, "engine channel is down");
    }
}

async fn writer_loop<W>(
    writer: W,
    mut rx: mpsc::UnboundedReceiver<String>,
    alive: Arc<AtomicBool>,
    correlator: Arc<Correlator>,
) where
    W: AsyncWrite + Unpin,
{
    let mut writer = tokio::io::BufWriter::new(writer);
    while let Some(mut line) = rx.recv().await {
        line.push('\n');
        let written = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        }
        .await;

        if let Err(e) = written {
            warn!(error = %e, "write to engine failed");
            mark_dead(&alive, &correlator, "engine input closed");
            return;
        }
    }
    // Sender dropped: closing our half tells the engine to exit.
    let _ = writer.shutdown().await;
}

async fn reader_loop<R>(
    mut reader: R,
    mode: CorrelationMode,
    alive: Arc<AtomicBool>,
    correlator: Arc<Correlator>,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = LineBuffer::new(MAX_LINE_BYTES);
    let mut chunk = vec![0u8; READ_CHUNK_BYTES];

    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "read from engine failed");
                break;
            }
        };

        for framed in lines.push(&chunk[..n]) {
            match framed {
                Ok(line) => dispatch_line(&correlator, mode, &line),
                Err(FrameError::TooLong { len }) => {
                    warn!(len, limit = MAX_LINE_BYTES, "engine reply exceeds size limit; dropped")
                }
                Err(FrameError::InvalidUtf8) => warn!("engine reply is not valid UTF-8; dropped"),
            }
        }
    }

    if lines.buffered() > 0 {
        debug!(bytes = lines.buffered(), "unterminated engine output discarded at EOF");
    }
    mark_dead(&alive, &correlator, "engine output closed");
}

/// Route one complete reply line to its pending call.
fn dispatch_line(correlator: &Correlator, mode: CorrelationMode, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }

    let reply = match wire::parse_reply(line) {
        Ok(reply) => reply,
        Err(e) => {
            warn!(error = %e, raw = %truncate(line), "undecodable engine reply dropped");
            return;
        }
    };

    match (mode, reply) {
        (CorrelationMode::Tagged, ReplyLine::Tagged { id, outcome }) => {
            correlator.resolve(id, outcome);
        }
        (CorrelationMode::Tagged, ReplyLine::Untagged(_)) => {
            warn!(raw = %truncate(line), "engine reply without correlation id dropped");
        }
        (CorrelationMode::Fifo, ReplyLine::Tagged { outcome, .. }) => {
            correlator.resolve_oldest(outcome);
        }
        (CorrelationMode::Fifo, ReplyLine::Untagged(payload)) => {
            correlator.resolve_oldest(Ok(payload));
        }
    }
}

fn truncate(line: &str) -> &str {
    wire::truncate_for_log(line, LOGGED_LINE_BYTES)
}

async fn drain_stderr<R>(stderr: R)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => info!(target: "engine.stderr", "{line}"),
            Ok(None) => break,
            Err(e) => {
                debug!(target: "engine.stderr", error = %e, "stderr stream error");
                break;
            }
        }
    }
}

async fn supervise(
    mut child: Child,
    mut kill_rx: oneshot::Receiver<()>,
    alive: Arc<AtomicBool>,
    correlator: Arc<Correlator>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = &mut kill_rx => {
            let _ = child.start_kill();
            child.wait().await
        }
    };

    match &status {
        Ok(s) if s.success() => info!(status = %s, "engine process exited"),
        Ok(s) => warn!(status = %s, "engine process exited unexpectedly"),
        Err(e) => warn!(error = %e, "failed to wait on engine process"),
    }
    mark_dead(&alive, &correlator, "engine process exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;
    use tokio::io::{DuplexStream, duplex};

    use crate::wire::EngineAnalyzeRequest;
    use finadvisor_core::{Transaction, UserProfile};

    #[test]
    fn partial_lines_wait_for_terminator() {
        let mut buf = LineBuffer::new(64);
        assert!(buf.push(b"{\"id\":1,").is_empty());
        assert_eq!(buf.buffered(), 8);
        let lines = buf.push(b"\"result\":1}\n");
        assert_eq!(lines, vec![Ok("{\"id\":1,\"result\":1}".to_string())]);
        assert_eq!(buf.buffered(), 0);
    }

    #[test]
    fn several_lines_in_one_chunk_are_split_in_order() {
        let mut buf = LineBuffer::new(64);
        let lines = buf.push(b"a\r\nb\nc");
        assert_eq!(lines, vec![Ok("a".to_string()), Ok("b".to_string())]);
        assert_eq!(buf.push(b"\n"), vec![Ok("c".to_string())]);
    }

    #[test]
    fn oversized_line_is_reported_and_skipped() {
        let mut buf = LineBuffer::new(4);
        assert!(buf.push(b"abc").is_empty());
        assert!(buf.push(b"defg").is_empty());
        let lines = buf.push(b"h\nok\n");
        assert_eq!(
            lines,
            vec![Err(FrameError::TooLong { len: 8 }), Ok("ok".to_string())]
        );
    }

    #[test]
    fn invalid_utf8_is_reported() {
        let mut buf = LineBuffer::new(16);
        assert_eq!(buf.push(&[0xff, 0xfe, b'\n']), vec![Err(FrameError::InvalidUtf8)]);
    }

    #[test]
    fn command_line_is_split_on_whitespace() {
        let cmd = EngineCommand::parse("python  main.py --stdio").unwrap();
        assert_eq!(cmd.program, "python");
        assert_eq!(cmd.args, vec!["main.py", "--stdio"]);
        assert_eq!(cmd.to_string(), "python main.py --stdio");
        assert!(EngineCommand::parse("   ").is_none());
    }

    proptest! {
        /// Property: how the byte stream is chunked never changes the lines.
        #[test]
        fn chunking_does_not_change_lines(
            lines in prop::collection::vec("[a-z0-9{}:\",]{0,12}", 0..8),
            cuts in prop::collection::vec(0usize..128, 0..8),
        ) {
            let stream: String = lines.iter().map(|l| format!("{l}\n")).collect();
            let bytes = stream.as_bytes();

            let mut points: Vec<usize> = cuts.into_iter().map(|c| c % (bytes.len() + 1)).collect();
            points.push(0);
            points.push(bytes.len());
            points.sort_unstable();

            let mut buf = LineBuffer::new(MAX_LINE_BYTES);
            let mut got = Vec::new();
            for w in points.windows(2) {
                for line in buf.push(&bytes[w[0]..w[1]]) {
                    got.push(line.unwrap());
                }
            }
            prop_assert_eq!(got, lines);
        }
    }

    fn request() -> EngineAnalyzeRequest {
        EngineAnalyzeRequest {
            transactions: vec![Transaction {
                date: "2024-03-02".to_string(),
                amount: -45.0,
                category: "Groceries".to_string(),
                description: "Weekly grocery shopping".to_string(),
            }],
            user_profile: UserProfile {
                age: 35,
                annual_income: 85_000.0,
                super_balance: 150_000.0,
                emergency_fund: 20_000.0,
                investment_assets: 50_000.0,
                super_contributions: 10_000.0,
                work_expenses: 5_000.0,
                investment_diversity: 2,
            },
        }
    }

    /// Fake engine end of a duplex pair: reads request lines, writes replies.
    struct FakeEngine {
        lines: tokio::io::Lines<BufReader<tokio::io::ReadHalf<DuplexStream>>>,
        out: tokio::io::WriteHalf<DuplexStream>,
    }

    impl FakeEngine {
        async fn next_request(&mut self) -> JsonValue {
            let line = self.lines.next_line().await.unwrap().expect("request line");
            serde_json::from_str(&line).unwrap_or(JsonValue::String(line))
        }

        async fn write_raw(&mut self, bytes: &[u8]) {
            self.out.write_all(bytes).await.unwrap();
            self.out.flush().await.unwrap();
        }
    }

    fn channel_pair(mode: CorrelationMode) -> (Arc<EngineChannel>, FakeEngine) {
        let (bridge_side, engine_side) = duplex(64 * 1024);
        let (bridge_read, bridge_write) = tokio::io::split(bridge_side);
        let (engine_read, engine_write) = tokio::io::split(engine_side);

        let channel = EngineChannel::from_io(
            bridge_read,
            bridge_write,
            Arc::new(Correlator::new()),
            mode,
        );
        let engine = FakeEngine {
            lines: BufReader::new(engine_read).lines(),
            out: engine_write,
        };
        (Arc::new(channel), engine)
    }

    #[tokio::test]
    async fn replies_in_reverse_order_reach_their_callers() {
        let (channel, mut engine) = channel_pair(CorrelationMode::Tagged);
        let req = request();

        let c1 = channel.clone();
        let first = tokio::spawn(async move { c1.call(EngineCall::Health, Duration::from_secs(5)).await });
        let r1 = engine.next_request().await;

        let c2 = channel.clone();
        let second = tokio::spawn(async move {
            c2.call(EngineCall::Analyze(&req), Duration::from_secs(5)).await
        });
        let r2 = engine.next_request().await;
        assert_eq!(r2["kind"], json!("analyze"));

        // Answer the second request first, split across two writes.
        let reply2 = format!("{{\"id\":{},\"result\":\"second\"}}\n", r2["id"]);
        let (a, b) = reply2.as_bytes().split_at(7);
        engine.write_raw(a).await;
        engine.write_raw(b).await;
        engine
            .write_raw(format!("{{\"id\":{},\"result\":\"first\"}}\n", r1["id"]).as_bytes())
            .await;

        assert_eq!(second.await.unwrap().unwrap(), json!("second"));
        assert_eq!(first.await.unwrap().unwrap(), json!("first"));
        assert_eq!(channel.pending_calls(), 0);
    }

    #[tokio::test]
    async fn malformed_line_is_dropped_without_resolving_anything() {
        let (channel, mut engine) = channel_pair(CorrelationMode::Tagged);

        let c = channel.clone();
        let call = tokio::spawn(async move { c.call(EngineCall::Health, Duration::from_secs(5)).await });
        let req = engine.next_request().await;

        engine.write_raw(b"not-json\n").await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(channel.pending_calls(), 1);
        assert!(channel.is_alive());

        engine
            .write_raw(format!("{{\"id\":{},\"result\":{{\"status\":\"healthy\"}}}}\n", req["id"]).as_bytes())
            .await;
        assert_eq!(call.await.unwrap().unwrap(), json!({"status": "healthy"}));
    }

    #[tokio::test]
    async fn timeout_empties_the_table_and_late_reply_is_ignored() {
        let (channel, mut engine) = channel_pair(CorrelationMode::Tagged);

        let result = channel.call(EngineCall::Health, Duration::from_millis(30)).await;
        assert_eq!(result, Err(BridgeError::Timeout));
        assert_eq!(channel.pending_calls(), 0);

        let req = engine.next_request().await;
        engine
            .write_raw(format!("{{\"id\":{},\"result\":\"late\"}}\n", req["id"]).as_bytes())
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(channel.pending_calls(), 0);
        assert!(channel.is_alive());
    }

    #[tokio::test]
    async fn engine_error_reply_is_surfaced() {
        let (channel, mut engine) = channel_pair(CorrelationMode::Tagged);

        let c = channel.clone();
        let call = tokio::spawn(async move { c.call(EngineCall::Health, Duration::from_secs(5)).await });
        let req = engine.next_request().await;
        engine
            .write_raw(format!("{{\"id\":{},\"error\":\"model not loaded\"}}\n", req["id"]).as_bytes())
            .await;

        assert_eq!(
            call.await.unwrap(),
            Err(BridgeError::engine(None, "model not loaded"))
        );
    }

    #[tokio::test]
    async fn closed_output_fails_all_pending_calls() {
        let (channel, mut engine) = channel_pair(CorrelationMode::Tagged);

        let mut calls = Vec::new();
        for _ in 0..3 {
            let c = channel.clone();
            calls.push(tokio::spawn(async move {
                c.call(EngineCall::Health, Duration::from_secs(5)).await
            }));
        }
        for _ in 0..3 {
            engine.next_request().await;
        }

        drop(engine);

        for call in calls {
            let err = call.await.unwrap().unwrap_err();
            assert!(matches!(err, BridgeError::TransportFailure(_)), "got {err:?}");
        }
        assert_eq!(channel.pending_calls(), 0);
        assert!(!channel.is_alive());

        let err = channel.call(EngineCall::Health, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, BridgeError::TransportFailure(_)));
    }

    #[tokio::test]
    async fn fifo_mode_sends_legacy_lines_one_at_a_time() {
        let (channel, mut engine) = channel_pair(CorrelationMode::Fifo);

        let c1 = channel.clone();
        let first = tokio::spawn(async move { c1.call(EngineCall::Health, Duration::from_secs(5)).await });
        let c2 = channel.clone();
        let second = tokio::spawn(async move { c2.call(EngineCall::Health, Duration::from_secs(5)).await });

        assert_eq!(engine.next_request().await, json!("health"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        // The second call is still waiting for the single-flight permit.
        assert_eq!(channel.pending_calls(), 1);

        engine.write_raw(b"{\"status\":\"healthy\",\"version\":\"1\"}\n").await;
        assert_eq!(engine.next_request().await, json!("health"));
        engine.write_raw(b"{\"status\":\"healthy\",\"version\":\"2\"}\n").await;

        let a = first.await.unwrap().unwrap();
        let b = second.await.unwrap().unwrap();
        let mut versions = vec![a["version"].clone(), b["version"].clone()];
        versions.sort_by_key(|v| v.to_string());
        assert_eq!(versions, vec![json!("1"), json!("2")]);
    }

    #[tokio::test]
    async fn queued_fifo_call_times_out_within_its_own_window() {
        let (channel, mut engine) = channel_pair(CorrelationMode::Fifo);
        let window = Duration::from_millis(300);

        let c1 = channel.clone();
        let first = tokio::spawn(async move { c1.call(EngineCall::Health, window).await });
        assert_eq!(engine.next_request().await, json!("health"));

        // The engine never answers; the second caller waits behind the first.
        let started = std::time::Instant::now();
        let second = channel.call(EngineCall::Health, window).await;
        let elapsed = started.elapsed();

        assert_eq!(second, Err(BridgeError::Timeout));
        assert!(elapsed < window + Duration::from_millis(150), "waited {elapsed:?}");
        assert_eq!(first.await.unwrap(), Err(BridgeError::Timeout));
        assert_eq!(channel.pending_calls(), 0);
        assert!(channel.is_alive());
    }

    #[tokio::test]
    async fn many_concurrent_calls_each_get_their_own_reply() {
        const CALLERS: usize = 32;
        let (channel, mut engine) = channel_pair(CorrelationMode::Tagged);

        let mut calls = Vec::new();
        for i in 0..CALLERS {
            let c = channel.clone();
            let mut req = request();
            req.transactions[0].description = format!("caller {i}");
            calls.push(tokio::spawn(async move {
                c.call(EngineCall::Analyze(&req), Duration::from_secs(10)).await
            }));
        }

        // Every line must be one whole request; interleaved writes would not parse.
        let mut received = Vec::new();
        for _ in 0..CALLERS {
            let line = engine.lines.next_line().await.unwrap().expect("request line");
            let req: JsonValue = serde_json::from_str(&line).unwrap();
            assert_eq!(req["kind"], json!("analyze"));
            let description = req["payload"]["transactions"][0]["description"].clone();
            received.push((req["id"].clone(), description));
        }

        // Evens from the back, then odds from the front.
        let order: Vec<usize> = (0..CALLERS)
            .rev()
            .filter(|i| i % 2 == 0)
            .chain((0..CALLERS).filter(|i| i % 2 == 1))
            .collect();
        for i in order {
            let (id, description) = &received[i];
            engine
                .write_raw(format!("{{\"id\":{id},\"result\":{description}}}\n").as_bytes())
                .await;
        }

        for (i, call) in calls.into_iter().enumerate() {
            assert_eq!(call.await.unwrap().unwrap(), json!(format!("caller {i}")));
        }
        assert_eq!(channel.pending_calls(), 0);
    }

    #[tokio::test]
    async fn dropped_call_future_leaves_no_pending_entry() {
        let (channel, mut engine) = channel_pair(CorrelationMode::Tagged);

        let c = channel.clone();
        let call = tokio::spawn(async move { c.call(EngineCall::Health, Duration::from_secs(30)).await });
        engine.next_request().await;
        assert_eq!(channel.pending_calls(), 1);

        call.abort();
        let _ = call.await;
        assert_eq!(channel.pending_calls(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn subprocess_exit_fails_pending_calls() {
        // Reads one request line, then exits without answering.
        let command = EngineCommand::new("sh").arg("-c").arg("read line; exit 3");
        let channel = Arc::new(
            EngineChannel::spawn(&command, Arc::new(Correlator::new()), CorrelationMode::Tagged)
                .unwrap(),
        );

        let err = channel
            .call(EngineCall::Health, Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::TransportFailure(_)), "got {err:?}");
        assert_eq!(channel.pending_calls(), 0);

        tokio::time::timeout(Duration::from_secs(5), async {
            while channel.is_alive() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn subprocess_starts_in_configured_directory() {
        let dir = std::env::temp_dir().canonicalize().unwrap();
        let command = EngineCommand::new("sh")
            .arg("-c")
            .arg(r#"read line; printf '{"cwd":"%s"}\n' "$(pwd -P)""#)
            .with_current_dir(&dir);
        let channel = EngineChannel::spawn(&command, Arc::new(Correlator::new()), CorrelationMode::Fifo)
            .unwrap();

        let reply = channel.call(EngineCall::Health, Duration::from_secs(10)).await.unwrap();
        assert_eq!(reply["cwd"], json!(dir.to_string_lossy()));
        channel.shutdown(Duration::from_secs(2)).await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn subprocess_round_trip_and_shutdown() {
        // Answers every request line with a fixed tagged reply for id 1.
        let command = EngineCommand::new("sh")
            .arg("-c")
            .arg(r#"while read line; do echo '{"id":1,"result":{"status":"healthy"}}'; done"#);
        let channel = EngineChannel::spawn(&command, Arc::new(Correlator::new()), CorrelationMode::Tagged)
            .unwrap();

        let reply = channel.call(EngineCall::Health, Duration::from_secs(10)).await.unwrap();
        assert_eq!(reply, json!({"status": "healthy"}));

        channel.shutdown(Duration::from_secs(2)).await;
        assert!(!channel.is_alive());
        assert!(channel.send("health".to_string()).is_err());
    }
}
