//! Pipe protocol between the worker and its child processes
//!
//! A child process reads [`ParentMessage`] frames on stdin and writes
//! [`ChildMessage`] frames on a duplicate of its original stdout; its stdout
//! itself is pointed at stderr so stray prints from handlers never corrupt the
//! stream. The child announces `Ready` whenever it can take an activation, and
//! a bridge thread in the worker answers from the inbound queue.

use crate::child::{
    record_outcome, ActivationSource, ChildExecutor, ChildOptions, Fetch, ResultSink,
};
use crate::idempotency::AtMostOnceGate;
use crate::shutdown::ShutdownSignal;
use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use std::ffi::OsString;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::os::unix::io::FromRawFd;
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use taskworker_core::{
    ChildMessage, FrameCodec, ParentMessage, ProcessingResult, Serializer, TaskActivation,
};
use taskworker_telemetry::ExecutionTimer;
use tracing::{debug, error, info, warn};

type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;

// ============ Child side ============

/// Activation source reading frames from the worker
pub struct PipeSource<R> {
    reader: R,
    writer: SharedWriter,
    codec: FrameCodec,
}

impl<R: Read> PipeSource<R> {
    pub fn new(reader: R, writer: SharedWriter, codec: FrameCodec) -> Self {
        Self {
            reader,
            writer,
            codec,
        }
    }
}

impl<R: Read> ActivationSource for PipeSource<R> {
    // blocks until the worker answers; the worker sends Shutdown when it wants the child gone
    fn fetch(&mut self, _timeout: Duration) -> Fetch {
        if let Err(e) = self
            .codec
            .write_frame(&mut *self.writer.lock(), &ChildMessage::Ready)
        {
            debug!("Failed to announce readiness: {}", e);
            return Fetch::Closed;
        }

        match self.codec.read_frame::<_, ParentMessage>(&mut self.reader) {
            Ok(Some(ParentMessage::Activation(activation))) => Fetch::Activation(activation),
            Ok(Some(ParentMessage::Shutdown)) => Fetch::Shutdown,
            Ok(None) => Fetch::Closed,
            Err(e) => {
                error!("Failed to read from worker: {}", e);
                Fetch::Closed
            }
        }
    }
}

/// Result sink writing frames to the worker
pub struct PipeSink {
    writer: SharedWriter,
    codec: FrameCodec,
}

impl PipeSink {
    pub fn new(writer: SharedWriter, codec: FrameCodec) -> Self {
        Self { writer, codec }
    }
}

impl ResultSink for PipeSink {
    fn send(&mut self, result: ProcessingResult) -> bool {
        match self
            .codec
            .write_frame(&mut *self.writer.lock(), &ChildMessage::Result(result))
        {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to send result to worker: {}", e);
                false
            }
        }
    }
}

/// Take over stdout for the protocol and send everything else written to stdout to stderr
fn protocol_pipes() -> io::Result<(impl Read, File)> {
    // SAFETY: the standard descriptors stay open for the life of the process
    let protocol_fd = unsafe { libc::dup(libc::STDOUT_FILENO) };
    if protocol_fd < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::dup2(libc::STDERR_FILENO, libc::STDOUT_FILENO) } < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: protocol_fd was just returned by dup and nothing else owns it
    let writer = unsafe { File::from_raw_fd(protocol_fd) };
    Ok((BufReader::new(io::stdin()), writer))
}

fn ignore_interrupts() -> nix::Result<()> {
    use nix::sys::signal::{signal, SigHandler, Signal};
    // SAFETY: SIG_IGN installs no handler code
    unsafe { signal(Signal::SIGINT, SigHandler::SigIgn) }.map(|_| ())
}

/// Entry point of a child process. Returns the process exit status.
pub fn child_main(executor: ChildExecutor, serializer: Serializer) -> i32 {
    // the worker owns shutdown; Ctrl-C in a terminal reaches the whole process group
    if let Err(e) = ignore_interrupts() {
        warn!("Failed to ignore SIGINT: {}", e);
    }

    let (reader, writer) = match protocol_pipes() {
        Ok(pipes) => pipes,
        Err(e) => {
            error!("Failed to set up worker pipes: {}", e);
            return 1;
        }
    };

    let codec = FrameCodec::new(serializer);
    let writer: SharedWriter =
        Arc::new(Mutex::new(Box::new(BufWriter::new(writer)) as Box<dyn Write + Send>));
    let mut source = PipeSource::new(reader, Arc::clone(&writer), codec);
    let mut sink = PipeSink::new(writer, codec);

    info!(pid = std::process::id(), "Child started");
    let exit = executor.run(&mut source, &mut sink, &ShutdownSignal::new());
    info!(pid = std::process::id(), ?exit, "Child exiting");
    exit.exit_code()
}

// ============ Worker side ============

/// How to start a child process
#[derive(Debug, Clone)]
pub struct ProcessCommand {
    program: PathBuf,
    args: Vec<OsString>,
}

impl ProcessCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Re-run the current executable
    pub fn current_exe() -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append the `child` subcommand with the executor settings
    pub fn child_args(mut self, options: &ChildOptions, serializer: Serializer) -> Self {
        self = self.arg("child");
        if let Some(max) = options.max_task_count.filter(|max| *max > 0) {
            self = self.arg("--max-task-count").arg(max.to_string());
        }
        self = self
            .arg("--default-deadline")
            .arg(options.default_deadline.as_secs().max(1).to_string());
        if let Some(deadline) = options.deadline_override {
            self = self
                .arg("--deadline-override")
                .arg(deadline.as_secs().max(1).to_string());
        }
        let serializer = match serializer {
            Serializer::Json => "json",
            Serializer::MessagePack => "msgpack",
        };
        self.arg("--serializer").arg(serializer)
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }

    pub fn args(&self) -> &[OsString] {
        &self.args
    }
}

/// Queues a bridge moves messages between
#[derive(Clone)]
pub struct BridgeQueues {
    pub inbound: Receiver<TaskActivation>,
    /// Used to put back an activation a child could not take
    pub requeue: Sender<TaskActivation>,
    pub outbound: Sender<ProcessingResult>,
}

/// A running child process and the thread serving its pipes
pub struct ProcessChild {
    pub child: Child,
    pub bridge: JoinHandle<()>,
}

/// Start a child process and its bridge thread
pub fn spawn_process(
    command: &ProcessCommand,
    codec: FrameCodec,
    queues: BridgeQueues,
    shutdown: ShutdownSignal,
    poll_interval: Duration,
    processed: Arc<AtomicU64>,
    at_most_once: Option<Arc<AtMostOnceGate>>,
) -> io::Result<ProcessChild> {
    let mut child = Command::new(&command.program)
        .args(&command.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()?;

    let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
        (Some(stdin), Some(stdout)) => (stdin, stdout),
        _ => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "child pipes unavailable"));
        }
    };

    let pid = child.id();
    let bridge = Bridge {
        pid,
        stdin,
        stdout: BufReader::new(stdout),
        codec,
        queues,
        shutdown,
        poll_interval,
        processed,
        at_most_once,
        in_flight: None,
    };
    let handle = std::thread::Builder::new()
        .name(format!("child-bridge-{}", pid))
        .spawn(move || bridge.run());

    match handle {
        Ok(bridge) => Ok(ProcessChild { child, bridge }),
        Err(e) => {
            let _ = child.kill();
            let _ = child.wait();
            Err(e)
        }
    }
}

struct Bridge {
    pid: u32,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    codec: FrameCodec,
    queues: BridgeQueues,
    shutdown: ShutdownSignal,
    poll_interval: Duration,
    processed: Arc<AtomicU64>,
    at_most_once: Option<Arc<AtMostOnceGate>>,
    in_flight: Option<InFlight>,
}

/// Activation the child is working on
struct InFlight {
    namespace: String,
    taskname: String,
    timer: ExecutionTimer,
}

impl InFlight {
    fn new(activation: &TaskActivation) -> Self {
        Self {
            namespace: activation.namespace.clone(),
            taskname: activation.taskname.clone(),
            timer: ExecutionTimer::start(&activation.namespace, &activation.taskname),
        }
    }

    // child processes keep no metrics of their own
    fn finish(self, result: &ProcessingResult) {
        record_outcome(&self.namespace, &self.taskname, result);
        drop(self.timer);
    }
}

impl Bridge {
    fn run(mut self) {
        loop {
            match self.codec.read_frame::<_, ChildMessage>(&mut self.stdout) {
                Ok(Some(ChildMessage::Ready)) => {
                    if !self.dispatch() {
                        break;
                    }
                }
                Ok(Some(ChildMessage::Result(result))) => {
                    self.processed.fetch_add(1, Ordering::Relaxed);
                    if let Some(in_flight) = self.in_flight.take() {
                        in_flight.finish(&result);
                    }
                    if self.queues.outbound.send(result).is_err() {
                        warn!(pid = self.pid, "Result queue closed, dropping result");
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!(pid = self.pid, "Bad frame from child: {}", e);
                    break;
                }
            }
        }
        debug!(pid = self.pid, "Bridge finished");
    }

    /// Hand the next activation to an idle child. Returns false when the bridge should stop.
    fn dispatch(&mut self) -> bool {
        loop {
            if self.shutdown.is_set() {
                return self.send_shutdown();
            }
            match self.queues.inbound.recv_timeout(self.poll_interval) {
                Ok(activation) => {
                    if let Some(gate) = &self.at_most_once {
                        if !gate.admit(&activation) {
                            continue;
                        }
                    }
                    let in_flight = InFlight::new(&activation);
                    let message = ParentMessage::Activation(activation);
                    if let Err(e) = self.codec.write_frame(&mut self.stdin, &message) {
                        warn!(pid = self.pid, "Failed to send activation to child: {}", e);
                        if let ParentMessage::Activation(activation) = message {
                            self.requeue(activation);
                        }
                        return false;
                    }
                    self.in_flight = Some(in_flight);
                    return true;
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return self.send_shutdown(),
            }
        }
    }

    fn send_shutdown(&mut self) -> bool {
        if let Err(e) = self.codec.write_frame(&mut self.stdin, &ParentMessage::Shutdown) {
            debug!(pid = self.pid, "Failed to send shutdown to child: {}", e);
            return false;
        }
        // keep reading until the child closes its end
        true
    }

    fn requeue(&self, activation: TaskActivation) {
        match self.queues.requeue.try_send(activation) {
            Ok(()) => {}
            Err(TrySendError::Full(activation)) | Err(TrySendError::Disconnected(activation)) => {
                warn!(
                    task_id = %activation.id,
                    "Could not requeue activation, broker will redeliver it"
                );
            }
        }
    }
}

/// Ask a child process to stop, then kill it
pub fn kill_graceful(child: &mut Child, grace: Duration) -> io::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let _ = kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM);
    let deadline = std::time::Instant::now() + grace;
    while std::time::Instant::now() < deadline {
        if child.try_wait()?.is_some() {
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    let _ = child.kill();
    child.wait().map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel;
    use std::io::Cursor;

    fn frames(codec: FrameCodec, messages: &[ParentMessage]) -> Vec<u8> {
        let mut buf = Vec::new();
        for m in messages {
            codec.write_frame(&mut buf, m).unwrap();
        }
        buf
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_pipe_source_announces_ready() {
        let codec = FrameCodec::new(Serializer::Json);
        let activation = TaskActivation::new("111", "examples", "examples.simple_task");
        let input = frames(
            codec,
            &[ParentMessage::Activation(activation.clone()), ParentMessage::Shutdown],
        );
        let captured = Captured::default();
        let writer: SharedWriter =
            Arc::new(Mutex::new(Box::new(captured.clone()) as Box<dyn Write + Send>));
        let mut source = PipeSource::new(Cursor::new(input), writer, codec);

        match source.fetch(Duration::from_millis(10)) {
            Fetch::Activation(a) => assert_eq!(a, activation),
            other => panic!("unexpected fetch {:?}", other),
        }
        assert!(matches!(source.fetch(Duration::from_millis(10)), Fetch::Shutdown));
        assert!(matches!(source.fetch(Duration::from_millis(10)), Fetch::Closed));

        let written = captured.0.lock().clone();
        let mut reader = Cursor::new(written);
        let mut readies = 0;
        while let Some(ChildMessage::Ready) = codec.read_frame(&mut reader).unwrap() {
            readies += 1;
        }
        assert_eq!(readies, 3);
    }

    #[test]
    fn test_pipe_sink_writes_results() {
        let codec = FrameCodec::new(Serializer::MessagePack);
        let captured = Captured::default();
        let writer: SharedWriter =
            Arc::new(Mutex::new(Box::new(captured.clone()) as Box<dyn Write + Send>));
        let mut sink = PipeSink::new(writer, codec);
        assert!(sink.send(ProcessingResult::complete("111")));

        let written = captured.0.lock().clone();
        let message: Option<ChildMessage> = codec.read_frame(&mut Cursor::new(written)).unwrap();
        assert_eq!(message, Some(ChildMessage::Result(ProcessingResult::complete("111"))));
    }

    #[test]
    fn test_child_args() {
        let options = ChildOptions {
            max_task_count: Some(2),
            deadline_override: Some(Duration::from_secs(5)),
            ..Default::default()
        };
        let command = ProcessCommand::new("/bin/taskworker").child_args(&options, Serializer::Json);
        let args: Vec<String> = command
            .args()
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec![
                "child",
                "--max-task-count",
                "2",
                "--default-deadline",
                "10",
                "--deadline-override",
                "5",
                "--serializer",
                "json"
            ]
        );
    }

    #[test]
    fn test_child_args_omit_zero_task_limit() {
        let options = ChildOptions {
            max_task_count: Some(0),
            ..Default::default()
        };
        let command = ProcessCommand::new("/bin/taskworker").child_args(&options, Serializer::Json);
        assert!(!command.args().iter().any(|a| a == "--max-task-count"));
    }

    #[test]
    fn test_bridge_ends_when_child_exits() {
        let (inbound_tx, inbound_rx) = channel::bounded(2);
        let (outbound_tx, _outbound_rx) = channel::bounded(2);
        // `true` exits without ever announcing readiness
        let command = ProcessCommand::new("true");
        let mut process = spawn_process(
            &command,
            FrameCodec::default(),
            BridgeQueues {
                inbound: inbound_rx.clone(),
                requeue: inbound_tx.clone(),
                outbound: outbound_tx,
            },
            ShutdownSignal::new(),
            Duration::from_millis(10),
            Arc::new(AtomicU64::new(0)),
            None,
        )
        .unwrap();

        process.child.wait().unwrap();
        process.bridge.join().unwrap();
        inbound_tx
            .send(TaskActivation::new("111", "examples", "examples.simple_task"))
            .unwrap();
        assert_eq!(inbound_rx.len(), 1);
    }
}
