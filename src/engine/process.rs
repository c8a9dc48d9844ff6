use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    process::ExitStatus,
    sync::Arc,
    time::Duration,
};

use log::{debug, error, info, trace, warn};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    process::{Child, ChildStderr, ChildStdin, ChildStdout, Command},
    sync::Mutex,
    task::JoinHandle,
    time::timeout,
};

use super::{
    communication::{Step, UciSession},
    types::{
        EngineError, EngineLog, EngineResult, SearchRequest, SearchResult, ENGINE_QUIT_GRACE,
        STDERR_TAIL_LINES,
    },
};

#[cfg(target_os = "windows")]
const CREATE_NO_WINDOW: u32 = 0x08000000;

type StderrTail = Arc<Mutex<VecDeque<String>>>;

/// One engine subprocess, owned for the duration of a single search.
///
/// The child is spawned with `kill_on_drop`, so even a dropped future (an
/// aborted task, a panicking caller) does not leave the process behind.
/// The normal exit path is still `shutdown`, which asks politely first.
#[derive(Debug)]
pub struct EngineProcess {
    path: PathBuf,
    stdin: ChildStdin,
    lines: Lines<BufReader<ChildStdout>>,
    child: Option<Child>,
    stderr_tail: StderrTail,
    stderr_task: Option<JoinHandle<()>>,
    logs: Vec<EngineLog>,
}

impl EngineProcess {
    /// Spawn the binary with piped stdio
    pub fn spawn(path: &Path) -> EngineResult<Self> {
        info!("Starting engine process: {:?}", path);

        let mut child = Self::spawn_engine_process(path)?;
        let (stdin, lines) = Self::get_io_handles(&mut child)?;
        let stderr_tail: StderrTail = Arc::new(Mutex::new(VecDeque::new()));
        let stderr_task = Self::spawn_stderr_handler(child.stderr.take(), stderr_tail.clone());

        Ok(Self {
            path: path.to_path_buf(),
            stdin,
            lines,
            child: Some(child),
            stderr_tail,
            stderr_task,
            logs: Vec::new(),
        })
    }

    pub fn logs(&self) -> &[EngineLog] {
        &self.logs
    }

    /// Write one command line. A closed pipe means the engine is gone.
    pub async fn send_command(&mut self, command: &str) -> EngineResult<()> {
        debug!("Sending UCI command: {}", command);

        let write = async {
            self.stdin.write_all(command.as_bytes()).await?;
            self.stdin.write_all(b"\n").await?;
            self.stdin.flush().await
        };

        if let Err(e) = write.await {
            return match e.kind() {
                std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::ConnectionReset => {
                    warn!("Broken pipe while sending command: {}", command);
                    Err(self.premature_exit(&format!("write failed: {e}")).await)
                }
                _ => {
                    error!("Failed to send command '{}': {}", command, e);
                    Err(EngineError::Io(e))
                }
            };
        }

        self.logs.push(EngineLog::Gui(command.to_string()));
        Ok(())
    }

    /// Next stdout line. End of stream and read errors both mean the engine
    /// stopped talking before the search was over.
    pub async fn read_line(&mut self) -> EngineResult<String> {
        match self.lines.next_line().await {
            Ok(Some(line)) => {
                trace!("Engine stdout: {}", line);
                self.logs.push(EngineLog::Engine(line.clone()));
                Ok(line)
            }
            Ok(None) => Err(self.premature_exit("stdout closed").await),
            Err(e) => Err(self.premature_exit(&format!("stdout read failed: {e}")).await),
        }
    }

    /// Send `quit`, give the engine a moment, then kill and reap it
    pub async fn shutdown(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };

        if let Ok(Some(status)) = child.try_wait() {
            debug!("Engine {:?} already exited with {}", self.path, status);
        } else {
            if let Err(e) = self.stdin.write_all(b"quit\n").await {
                debug!("Could not send quit, engine already gone: {}", e);
            }
            if let Err(e) = self.stdin.flush().await {
                debug!("Could not flush quit: {}", e);
            }

            match timeout(ENGINE_QUIT_GRACE, child.wait()).await {
                Ok(Ok(status)) => debug!("Engine exited after quit with {}", status),
                Ok(Err(e)) => warn!("Error waiting for engine to quit: {}", e),
                Err(_) => {
                    debug!("Engine ignored quit, killing {:?}", self.path);
                    if let Err(e) = child.kill().await {
                        warn!("Failed to kill engine process: {}", e);
                    }
                }
            }
        }

        // reap even after kill so no zombie is left behind
        if let Err(e) = child.wait().await {
            warn!("Error reaping engine process: {}", e);
        }
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
    }

    /// Build a `PrematureExit` carrying exit status and the stderr tail
    async fn premature_exit(&mut self, cause: &str) -> EngineError {
        // let the stderr reader catch up with whatever the engine printed last
        if let Some(task) = self.stderr_task.as_mut() {
            if timeout(ENGINE_QUIT_GRACE, task).await.is_ok() {
                self.stderr_task = None;
            }
        }

        let status = self
            .child
            .as_mut()
            .and_then(|child| child.try_wait().ok().flatten());
        let diagnostics = format_diagnostics(cause, status, &*self.stderr_tail.lock().await);

        error!("Engine {:?} exited prematurely: {}", self.path, diagnostics);
        EngineError::PrematureExit { diagnostics }
    }

    fn spawn_engine_process(path: &Path) -> EngineResult<Child> {
        debug!("Spawning engine process: {:?}", path);

        let mut command = Command::new(path);
        if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            command.current_dir(dir);
        }
        command
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .env("TERM", "dumb")
            .kill_on_drop(true);

        #[cfg(target_os = "windows")]
        command.creation_flags(CREATE_NO_WINDOW);

        command.spawn().map_err(|source| {
            error!("Failed to spawn engine process {:?}: {}", path, source);
            EngineError::Spawn {
                path: path.to_path_buf(),
                source,
            }
        })
    }

    fn get_io_handles(
        child: &mut Child,
    ) -> EngineResult<(ChildStdin, Lines<BufReader<ChildStdout>>)> {
        let stdin = child.stdin.take().ok_or_else(|| {
            error!("Failed to get stdin handle from engine process");
            EngineError::NoStdin
        })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            error!("Failed to get stdout handle from engine process");
            EngineError::NoStdout
        })?;

        Ok((stdin, BufReader::with_capacity(1024, stdout).lines()))
    }

    fn spawn_stderr_handler(
        stderr: Option<ChildStderr>,
        tail: StderrTail,
    ) -> Option<JoinHandle<()>> {
        let stderr = stderr?;
        Some(tokio::spawn(async move {
            let mut stderr_lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = stderr_lines.next_line().await {
                warn!("Engine stderr: {}", line);
                let mut tail = tail.lock().await;
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
        }))
    }
}

fn format_diagnostics(cause: &str, status: Option<ExitStatus>, stderr: &VecDeque<String>) -> String {
    let mut text = cause.to_string();
    if let Some(status) = status {
        text.push_str(&format!("; {status}"));
    }
    if stderr.is_empty() {
        text.push_str("; no stderr output");
    } else {
        let joined: Vec<&str> = stderr.iter().map(String::as_str).collect();
        text.push_str(&format!("; stderr: {}", joined.join(" | ")));
    }
    text
}

/// Run one complete search against the engine at `path`.
///
/// The request is validated before anything is spawned. A single timer
/// covers the whole exchange from handshake to `bestmove`, and the process
/// is shut down on every exit path.
pub async fn run_search(
    path: &Path,
    request: &SearchRequest,
    default_skill: u8,
    limit: Duration,
) -> EngineResult<SearchResult> {
    let mut session = UciSession::new(request, default_skill)?;
    let mut process = EngineProcess::spawn(path)?;

    let outcome = timeout(limit, drive(&mut process, &mut session)).await;
    process.shutdown().await;

    match outcome {
        Ok(Ok(result)) => {
            info!(
                "Search finished with bestmove {} at depth {}",
                result.best_move, result.depth
            );
            Ok(result)
        }
        Ok(Err(e)) => {
            debug!(
                "Search failed after {} protocol lines: {}",
                process.logs().len(),
                e
            );
            Err(e)
        }
        Err(_) => {
            error!("Engine search timed out after {:?} in stage {:?}", limit, session.stage());
            Err(EngineError::Timeout(limit))
        }
    }
}

async fn drive(process: &mut EngineProcess, session: &mut UciSession) -> EngineResult<SearchResult> {
    for command in session.opening_commands() {
        process.send_command(&command).await?;
    }

    loop {
        let line = process.read_line().await?;
        match session.on_line(&line)? {
            Step::Wait => {}
            Step::Send(commands) => {
                for command in commands {
                    process.send_command(&command).await?;
                }
            }
            Step::Finished(result) => return Ok(result),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use tempfile::TempDir;

    use super::*;
    use crate::engine::types::Evaluation;

    const WELL_BEHAVED: &str = r#"#!/bin/sh
while read -r line; do
  case "$line" in
    uci) echo "id name Fake"; echo "uciok" ;;
    isready) echo "readyok" ;;
    go*)
      echo "info depth 5 score cp 12 pv d2d4"
      echo "info depth 10 seldepth 14 score cp 31 nodes 1000 pv e2e4 e7e5"
      echo "bestmove e2e4 ponder e7e5" ;;
    quit) exit 0 ;;
  esac
done
"#;

    const NEVER_MOVES: &str = r#"#!/bin/sh
while read -r line; do
  case "$line" in
    uci) echo "uciok" ;;
    isready) echo "readyok" ;;
    quit) exit 0 ;;
  esac
done
"#;

    const CRASHES: &str = r#"#!/bin/sh
read -r line
echo "uciok"
read -r line
echo "fatal: simulated crash" >&2
exit 3
"#;

    fn fake_engine(script: &str) -> (TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fake-engine");
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        (dir, path)
    }

    #[tokio::test]
    async fn completes_search_against_scripted_engine() {
        let (_dir, path) = fake_engine(WELL_BEHAVED);
        let request = SearchRequest::default().depth(10);

        let result = run_search(&path, &request, 20, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(result.best_move, "e2e4");
        assert_eq!(result.ponder.as_deref(), Some("e7e5"));
        assert_eq!(result.evaluation, Some(Evaluation::Centipawns(31)));
        assert_eq!(result.depth, 10);
        assert_eq!(result.pv, vec!["e2e4", "e7e5"]);
        assert_eq!(result.lines[0].san_moves, vec!["e4", "e5"]);
    }

    #[tokio::test]
    async fn times_out_when_no_best_move_arrives() {
        let (_dir, path) = fake_engine(NEVER_MOVES);
        let limit = Duration::from_millis(300);

        let err = run_search(&path, &SearchRequest::default(), 20, limit)
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::Timeout(d) if d == limit));
    }

    #[tokio::test]
    async fn reports_premature_exit_with_stderr() {
        let (_dir, path) = fake_engine(CRASHES);

        let err = run_search(&path, &SearchRequest::default(), 20, Duration::from_secs(5))
            .await
            .unwrap_err();

        match err {
            EngineError::PrematureExit { diagnostics } => {
                assert!(diagnostics.contains("simulated crash"), "{diagnostics}");
            }
            other => panic!("expected premature exit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn spawn_failure_is_typed() {
        let err = run_search(
            Path::new("/nonexistent/engine/binary"),
            &SearchRequest::default(),
            20,
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, EngineError::Spawn { .. }));
    }

    #[tokio::test]
    async fn invalid_position_fails_before_spawn() {
        let request = SearchRequest::from_fen("garbage");
        let err = run_search(
            Path::new("/nonexistent/engine/binary"),
            &request,
            20,
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, EngineError::InvalidPosition(_)));
    }

    #[test]
    fn diagnostics_include_stderr_tail() {
        let mut tail = VecDeque::new();
        assert!(format_diagnostics("stdout closed", None, &tail).contains("no stderr output"));
        tail.push_back("a".to_string());
        tail.push_back("b".to_string());
        assert_eq!(
            format_diagnostics("stdout closed", None, &tail),
            "stdout closed; stderr: a | b"
        );
    }
}
