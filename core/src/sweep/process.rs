use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout};
use tokio::task::JoinHandle;

use crate::prelude::{CoreError, CoreResult};
use crate::sweep::backend::{classify_exit, classify_spawn_error, prepare, SweepBackend, TunePlan};

const STDERR_TAIL_LINES: usize = 20;
const REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// A live sweep subprocess with its stdout line reader and a rolling stderr tail.
pub struct SweepProcess {
    child: Child,
    stdout: BufReader<ChildStdout>,
    /// Bytes of the line being read; kept across cancelled reads.
    pending: Vec<u8>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    stderr_task: JoinHandle<()>,
    plan: TunePlan,
}

impl SweepProcess {
    pub fn spawn(backend: &dyn SweepBackend, plan: &TunePlan) -> CoreResult<Self> {
        let mut child = prepare(backend.sweep_command(plan)).spawn().map_err(|err| {
            CoreError::from_fault(
                classify_spawn_error(&err),
                format!("spawning {}: {}", backend.name(), err),
            )
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CoreError::SubprocessCrash("sweep stdout not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| CoreError::SubprocessCrash("sweep stderr not captured".into()))?;

        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        let tail = stderr_tail.clone();
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                log::debug!("[sweep stderr] {}", line);
                if let Ok(mut tail) = tail.lock() {
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            }
        });

        Ok(Self {
            child,
            stdout: BufReader::new(stdout),
            pending: Vec::new(),
            stderr_tail,
            stderr_task,
            plan: plan.clone(),
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn plan(&self) -> &TunePlan {
        &self.plan
    }

    /// Next stdout line, or `None` at end of output; cancel safe.
    ///
    /// Bytes that are not UTF-8 are replaced rather than failing the read, so
    /// a garbled line reaches the parser and is counted as malformed.
    pub async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        let read = self.stdout.read_until(b'\n', &mut self.pending).await?;
        if read == 0 && self.pending.is_empty() {
            return Ok(None);
        }
        let line = String::from_utf8_lossy(&self.pending)
            .trim_end_matches(['\r', '\n'])
            .to_string();
        self.pending.clear();
        Ok(Some(line))
    }

    fn stderr_text(&self) -> String {
        match self.stderr_tail.lock() {
            Ok(tail) => tail.iter().cloned().collect::<Vec<_>>().join("\n"),
            Err(_) => String::new(),
        }
    }

    /// Reaps a process whose stdout closed and classifies why it went away.
    pub async fn exit_fault(&mut self) -> CoreError {
        let status = tokio::time::timeout(REAP_TIMEOUT, self.child.wait()).await;
        let _ = tokio::time::timeout(Duration::from_millis(500), &mut self.stderr_task).await;
        let stderr = self.stderr_text();
        let detail = match status {
            Ok(Ok(status)) => format!("sweep exited with {}: {}", status, stderr.trim()),
            Ok(Err(err)) => format!("waiting on sweep process: {}", err),
            Err(_) => {
                let _ = self.child.kill().await;
                format!("sweep closed stdout but did not exit: {}", stderr.trim())
            }
        };
        CoreError::from_fault(classify_exit(&stderr), detail)
    }

    /// Kills and reaps the subprocess.
    pub async fn terminate(mut self) {
        if let Err(err) = self.child.start_kill() {
            log::debug!("sweep process already gone: {}", err);
        }
        if tokio::time::timeout(REAP_TIMEOUT, self.child.wait())
            .await
            .is_err()
        {
            log::warn!("sweep process did not exit within {:?}", REAP_TIMEOUT);
        }
        self.stderr_task.abort();
    }
}
