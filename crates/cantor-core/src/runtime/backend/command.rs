//! Inference backend that drives the external generation program.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::protocol::{GeneratedAudio, GenerationJob, InferenceBackend, InferenceError, ProgressSink};

const LYRICS_FILE: &str = "input.lrc";
const OUTPUT_DIR: &str = "output";
const STDERR_TAIL_LINES: usize = 20;
const MAX_LINE_BYTES: usize = 8 * 1024;

// Share of the progress bar covered by the program's own percentage output.
const GENERATE_FLOOR: f32 = 0.30;
const GENERATE_SPAN: f32 = 0.65;

/// Runs `<program> <script> --lrc-path … --output-dir …` as a child process.
///
/// The child is killed if the returned future is dropped, so wrapping
/// [`InferenceBackend::generate`] in a timeout stops the process too.
#[derive(Debug, Clone)]
pub struct CommandBackend {
    program: PathBuf,
    script: PathBuf,
    workdir: Option<PathBuf>,
    cuda_device: String,
}

impl CommandBackend {
    pub fn new(program: impl Into<PathBuf>, script: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            script: script.into(),
            workdir: None,
            cuda_device: "0".to_owned(),
        }
    }

    /// Directory the program runs in; also appended to `PYTHONPATH`.
    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    /// Value for `CUDA_VISIBLE_DEVICES`.
    pub fn with_cuda_device(mut self, device: impl Into<String>) -> Self {
        self.cuda_device = device.into();
        self
    }

    fn command(&self, job: &GenerationJob, lrc_path: &Path, output_dir: &Path) -> Command {
        let request = &job.request;
        let mut cmd = Command::new(&self.program);
        cmd.arg(&self.script)
            .arg("--lrc-path")
            .arg(lrc_path)
            .arg("--ref-prompt")
            .arg(&request.style_prompt)
            .arg("--audio-length")
            .arg(request.audio_length.seconds().to_string())
            .arg("--repo-id")
            .arg(&request.model_id)
            .arg("--output-dir")
            .arg(output_dir)
            .arg("--batch-infer-num")
            .arg(request.batch_count.to_string());
        if request.chunked {
            cmd.arg("--chunked");
        }

        cmd.env("CUDA_VISIBLE_DEVICES", &self.cuda_device);
        if let Some(workdir) = &self.workdir {
            cmd.current_dir(workdir);
            if let Some(path) = python_path(workdir) {
                cmd.env("PYTHONPATH", path);
            }
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl InferenceBackend for CommandBackend {
    async fn generate(
        &self,
        job: &GenerationJob,
        progress: ProgressSink,
    ) -> Result<GeneratedAudio, InferenceError> {
        progress.phase(10, "Initializing model...");

        let output_dir = job.work_dir.join(OUTPUT_DIR);
        tokio::fs::create_dir_all(&output_dir)
            .await
            .map_err(|e| failed(format!("failed to prepare work dir: {e}")))?;
        let lrc_path = job.work_dir.join(LYRICS_FILE);
        tokio::fs::write(&lrc_path, job.request.lyrics.as_bytes())
            .await
            .map_err(|e| failed(format!("failed to write lyrics file: {e}")))?;

        let mut cmd = self.command(job, &lrc_path, &output_dir);
        info!(
            task_id = %job.task_id,
            program = %self.program.display(),
            script = %self.script.display(),
            model = %job.request.model_id,
            "spawning inference process"
        );
        let mut child = cmd
            .spawn()
            .map_err(|e| failed(format!("failed to start {}: {e}", self.program.display())))?;
        progress.phase(30, "Generating music...");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let stdout_task = async {
            if let Some(out) = stdout {
                let _ = read_segments(out, |line| {
                    debug!(task_id = %job.task_id, "{line}");
                    forward_percent(&progress, line);
                })
                .await;
            }
        };
        let stderr_task = async {
            let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
            if let Some(err) = stderr {
                let _ = read_segments(err, |line| {
                    forward_percent(&progress, line);
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line.to_owned());
                })
                .await;
            }
            tail
        };

        let (status, (), tail) = tokio::join!(child.wait(), stdout_task, stderr_task);
        let status = status.map_err(|e| failed(format!("failed to wait for process: {e}")))?;

        if !status.success() {
            let stderr_text = Vec::from(tail).join("\n");
            let detail = if stderr_text.is_empty() {
                "Unknown error".to_owned()
            } else {
                stderr_text
            };
            warn!(task_id = %job.task_id, %status, "inference process failed");
            return Err(classify_failure(detail));
        }

        let path = find_output(&output_dir).await.ok_or_else(|| InferenceError::InvalidOutput {
            message: "No output file found after generation".to_owned(),
        })?;
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| failed(format!("failed to read {}: {e}", path.display())))?;
        debug!(task_id = %job.task_id, path = %path.display(), size = bytes.len(), "inference output read");
        Ok(GeneratedAudio {
            bytes: Bytes::from(bytes),
        })
    }
}

fn failed(message: String) -> InferenceError {
    InferenceError::Failed { message }
}

fn python_path(workdir: &Path) -> Option<OsString> {
    let mut paths: Vec<PathBuf> = std::env::var_os("PYTHONPATH")
        .map(|p| std::env::split_paths(&p).collect())
        .unwrap_or_default();
    paths.push(workdir.to_path_buf());
    std::env::join_paths(paths).ok()
}

/// Map a non-zero exit to an error, spotting device memory exhaustion.
fn classify_failure(stderr: String) -> InferenceError {
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("out of memory") || lower.contains("outofmemory") || lower.contains("cuda error") {
        InferenceError::ResourceExhausted {
            message: format!("GPU out of memory: {stderr}"),
        }
    } else {
        InferenceError::Failed {
            message: format!("Generation process failed: {stderr}"),
        }
    }
}

fn forward_percent(progress: &ProgressSink, line: &str) {
    if let Some(pct) = parse_percent(line) {
        progress.fraction(GENERATE_FLOOR + GENERATE_SPAN * (pct / 100.0));
    }
}

/// First `NN%` token in a line, as printed by tqdm-style progress bars.
pub(crate) fn parse_percent(line: &str) -> Option<f32> {
    let bytes = line.as_bytes();
    for (idx, _) in line.match_indices('%') {
        let start = bytes[..idx]
            .iter()
            .rposition(|b| !(b.is_ascii_digit() || *b == b'.'))
            .map_or(0, |p| p + 1);
        if start == idx {
            continue;
        }
        if let Ok(value) = line[start..idx].parse::<f32>() {
            if (0.0..=100.0).contains(&value) {
                return Some(value);
            }
        }
    }
    None
}

/// Call `on_line` for every `\n`- or `\r`-terminated segment.
async fn read_segments<R>(reader: R, mut on_line: impl FnMut(&str)) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    loop {
        let chunk = reader.fill_buf().await?;
        if chunk.is_empty() {
            if !line.is_empty() {
                on_line(&String::from_utf8_lossy(&line));
            }
            return Ok(());
        }
        let consumed = chunk.len();
        for &b in chunk {
            if b == b'\n' || b == b'\r' {
                if !line.is_empty() {
                    on_line(&String::from_utf8_lossy(&line));
                    line.clear();
                }
            } else if line.len() < MAX_LINE_BYTES {
                line.push(b);
            }
        }
        reader.consume(consumed);
    }
}

/// First `*.wav` in `dir` by name, else the first `*.mp3`.
async fn find_output(dir: &Path) -> Option<PathBuf> {
    let mut entries = tokio::fs::read_dir(dir).await.ok()?;
    let mut files = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        if entry.file_type().await.is_ok_and(|t| t.is_file()) {
            files.push(entry.path());
        }
    }
    files.sort();
    ["wav", "mp3"].into_iter().find_map(|ext| {
        files
            .iter()
            .find(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| e.eq_ignore_ascii_case(ext))
            })
            .cloned()
    })
}
