//! Blocking wrapper around the external duration probe and encoder.

use std::ffi::OsStr;
use std::fmt;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::error::ToolError;
use crate::task_manager::CancelToken;

const POLL_INTERVAL: Duration = Duration::from_millis(20);
const SPAWN_RETRIES: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tool {
    /// Reports a video's duration (`ffprobe`).
    Probe,
    /// Rasterizes frames and GIFs (`ffmpeg`).
    Encoder,
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tool::Probe => f.write_str("duration probe"),
            Tool::Encoder => f.write_str("encoder"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessRunner {
    ffprobe: PathBuf,
    ffmpeg: PathBuf,
    timeout: Option<Duration>,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new("ffprobe", "ffmpeg")
    }
}

impl ProcessRunner {
    pub fn new(ffprobe: impl Into<PathBuf>, ffmpeg: impl Into<PathBuf>) -> Self {
        Self {
            ffprobe: ffprobe.into(),
            ffmpeg: ffmpeg.into(),
            timeout: None,
        }
    }

    /// Deadline applied to every invocation; the child is killed when it expires.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn program(&self, tool: Tool) -> &Path {
        match tool {
            Tool::Probe => &self.ffprobe,
            Tool::Encoder => &self.ffmpeg,
        }
    }

    pub fn is_available(&self, tool: Tool) -> bool {
        match self.run(tool, ["-version"], None) {
            Ok(_) => true,
            Err(e) => {
                debug!("{} unavailable: {}", tool, e);
                false
            }
        }
    }

    /// Runs `tool` to completion and returns its combined stdout+stderr.
    pub fn run<I, S>(&self, tool: Tool, args: I, cancel: Option<&CancelToken>) -> Result<String, ToolError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let program = self.program(tool);
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!("Running {}: {:?}", tool, command);

        let mut child = spawn(&mut command).map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                ToolError::NotFound {
                    tool,
                    program: program.to_path_buf(),
                }
            } else {
                ToolError::Spawn { tool, source }
            }
        })?;

        let readers = [
            read_in_background(child.stdout.take()),
            read_in_background(child.stderr.take()),
        ];

        let status = self.wait(tool, &mut child, cancel)?;
        let output = collect_output(tool, readers)?;

        if !status.success() {
            return Err(ToolError::NonZeroExit {
                tool,
                code: status.code(),
                output,
            });
        }

        Ok(output)
    }

    /// Runs `tool` and additionally requires a non-empty file at `output_path`.
    pub fn run_producing<I, S>(
        &self,
        tool: Tool,
        args: I,
        output_path: &Path,
        cancel: Option<&CancelToken>,
    ) -> Result<String, ToolError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let output = self.run(tool, args, cancel)?;

        let produced = std::fs::metadata(output_path)
            .map(|m| m.is_file() && m.len() > 0)
            .unwrap_or(false);
        if !produced {
            return Err(ToolError::MissingOutput {
                tool,
                path: output_path.to_path_buf(),
                output,
            });
        }

        Ok(output)
    }

    /// Duration of `source` in seconds.
    pub fn probe_duration(&self, source: &Path, cancel: Option<&CancelToken>) -> Result<f64, ToolError> {
        let output = self.run(
            Tool::Probe,
            [
                OsStr::new("-v"),
                OsStr::new("error"),
                OsStr::new("-show_entries"),
                OsStr::new("format=duration"),
                OsStr::new("-of"),
                OsStr::new("default=noprint_wrappers=1:nokey=1"),
                source.as_os_str(),
            ],
            cancel,
        )?;

        parse_duration(&output).ok_or(ToolError::Probe {
            tool: Tool::Probe,
            output,
        })
    }

    fn wait(&self, tool: Tool, child: &mut Child, cancel: Option<&CancelToken>) -> Result<ExitStatus, ToolError> {
        let started = Instant::now();
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) => {}
                Err(source) => {
                    kill(tool, child);
                    return Err(ToolError::Io { tool, source });
                }
            }

            if cancel.is_some_and(CancelToken::is_cancelled) {
                kill(tool, child);
                return Err(ToolError::Cancelled { tool });
            }

            if let Some(limit) = self.timeout {
                if started.elapsed() >= limit {
                    kill(tool, child);
                    return Err(ToolError::TimedOut { tool, after: limit });
                }
            }

            thread::sleep(POLL_INTERVAL);
        }
    }
}

fn spawn(command: &mut Command) -> io::Result<Child> {
    let mut attempt = 0;
    loop {
        match command.spawn() {
            // ETXTBSY: a freshly written executable may still be held open by
            // a child forked concurrently elsewhere in the process.
            Err(e) if e.raw_os_error() == Some(26) && cfg!(unix) && attempt < SPAWN_RETRIES => {
                attempt += 1;
                thread::sleep(Duration::from_millis(10 * u64::from(attempt)));
            }
            result => return result,
        }
    }
}

fn kill(tool: Tool, child: &mut Child) {
    if let Err(e) = child.kill() {
        warn!("Failed to kill {} (pid {}): {}", tool, child.id(), e);
    }
    if let Err(e) = child.wait() {
        warn!("Failed to reap {} (pid {}): {}", tool, child.id(), e);
    }
}

fn read_in_background<R: Read + Send + 'static>(pipe: Option<R>) -> JoinHandle<io::Result<Vec<u8>>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            pipe.read_to_end(&mut buf)?;
        }
        Ok(buf)
    })
}

fn collect_output(tool: Tool, readers: [JoinHandle<io::Result<Vec<u8>>>; 2]) -> Result<String, ToolError> {
    let mut combined = Vec::new();
    for reader in readers {
        let bytes = reader
            .join()
            .map_err(|_| ToolError::Io {
                tool,
                source: io::Error::other("output reader panicked"),
            })?
            .map_err(|source| ToolError::Io { tool, source })?;
        combined.extend_from_slice(&bytes);
    }
    Ok(String::from_utf8_lossy(&combined).trim().to_string())
}

fn parse_duration(output: &str) -> Option<f64> {
    output
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())?
        .parse::<f64>()
        .ok()
        .filter(|d| d.is_finite() && *d >= 0.0)
}

#[cfg(all(test, unix))]
pub(crate) mod test_support {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};

    /// Writes an executable `sh` script standing in for a real tool.
    pub fn fake_tool(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_probe_output() {
        assert_eq!(parse_duration("20.480000\n"), Some(20.48));
        assert_eq!(parse_duration("\n  3.0 \n"), Some(3.0));
        assert_eq!(parse_duration("N/A"), None);
        assert_eq!(parse_duration(""), None);
    }

    #[test]
    fn missing_executable_is_not_found() {
        let runner = ProcessRunner::new("/nonexistent/ffprobe", "/nonexistent/ffmpeg");
        let err = runner.run(Tool::Encoder, ["-version"], None).unwrap_err();
        assert!(err.is_not_found(), "{:?}", err);
        assert!(!runner.is_available(Tool::Probe));
    }

    #[cfg(unix)]
    mod with_fake_tools {
        use super::super::test_support::fake_tool;
        use super::*;

        #[test]
        fn non_zero_exit_carries_output() {
            let dir = tempfile::tempdir().unwrap();
            let ffmpeg = fake_tool(dir.path(), "ffmpeg", "echo out; echo broken filter >&2; exit 3");
            let runner = ProcessRunner::new("ffprobe", ffmpeg);

            match runner.run(Tool::Encoder, ["-i", "x"], None) {
                Err(ToolError::NonZeroExit { code, output, .. }) => {
                    assert_eq!(code, Some(3));
                    assert!(output.contains("out"));
                    assert!(output.contains("broken filter"));
                }
                other => panic!("unexpected result: {:?}", other),
            }
        }

        #[test]
        fn success_without_output_file_is_failure() {
            let dir = tempfile::tempdir().unwrap();
            let ffmpeg = fake_tool(dir.path(), "ffmpeg", "exit 0");
            let runner = ProcessRunner::new("ffprobe", ffmpeg);
            let target = dir.path().join("out.gif");

            let err = runner
                .run_producing(Tool::Encoder, ["-y"], &target, None)
                .unwrap_err();
            assert!(matches!(err, ToolError::MissingOutput { .. }), "{:?}", err);
        }

        #[test]
        fn hung_tool_is_killed_at_deadline() {
            let dir = tempfile::tempdir().unwrap();
            let ffmpeg = fake_tool(dir.path(), "ffmpeg", "exec sleep 10");
            let runner = ProcessRunner::new("ffprobe", ffmpeg)
                .with_timeout(Some(Duration::from_millis(200)));

            let started = Instant::now();
            let err = runner.run(Tool::Encoder, ["-y"], None).unwrap_err();
            assert!(matches!(err, ToolError::TimedOut { .. }), "{:?}", err);
            assert!(started.elapsed() < Duration::from_secs(5));
        }

        #[test]
        fn cancelled_token_kills_tool() {
            let dir = tempfile::tempdir().unwrap();
            let ffmpeg = fake_tool(dir.path(), "ffmpeg", "exec sleep 10");
            let runner = ProcessRunner::new("ffprobe", ffmpeg);
            let token = CancelToken::new();
            token.cancel();

            let err = runner.run(Tool::Encoder, ["-y"], Some(&token)).unwrap_err();
            assert!(matches!(err, ToolError::Cancelled { .. }), "{:?}", err);
        }

        #[test]
        fn probe_reads_duration() {
            let dir = tempfile::tempdir().unwrap();
            let ffprobe = fake_tool(dir.path(), "ffprobe", "echo 20.5");
            let runner = ProcessRunner::new(ffprobe, "ffmpeg");
            let duration = runner.probe_duration(Path::new("clip.mp4"), None).unwrap();
            assert_eq!(duration, 20.5);
        }

        #[test]
        fn unparsable_probe_output_is_an_error() {
            let dir = tempfile::tempdir().unwrap();
            let ffprobe = fake_tool(dir.path(), "ffprobe", "echo N/A");
            let runner = ProcessRunner::new(ffprobe, "ffmpeg");
            let err = runner.probe_duration(Path::new("clip.mp4"), None).unwrap_err();
            assert!(matches!(err, ToolError::Probe { .. }), "{:?}", err);
        }
    }
}
