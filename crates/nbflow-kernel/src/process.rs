use crate::protocol::{KernelMessage, KernelRequest};
use crate::{KernelChannels, KernelError, KernelLauncher};
use nbflow_core::frame::{decode_frame, encode_frame, DEFAULT_MAX_FRAME_BYTES};
use nbflow_core::settings::KernelSettings;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const DRIVER_SOURCE: &str = include_str!("driver.py");
const CHANNEL_CAPACITY: usize = 256;

/// Launches the kernel as a child process speaking NDJSON over stdio.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: String,
    args: Vec<String>,
    max_frame_bytes: usize,
}

impl ProcessLauncher {
    pub fn embedded_python() -> Self {
        Self {
            program: "python3".to_string(),
            args: vec!["-u".to_string(), "-c".to_string(), DRIVER_SOURCE.to_string()],
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    pub fn from_command(command: &[String]) -> Result<Self, KernelError> {
        let (program, args) = command.split_first().ok_or(KernelError::EmptyCommand)?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        })
    }

    pub fn from_settings(settings: &KernelSettings) -> Self {
        Self::from_command(&settings.command).unwrap_or_else(|_| Self::embedded_python())
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

impl KernelLauncher for ProcessLauncher {
    fn launch(&self) -> Result<KernelChannels, KernelError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        info!(event = "kernel_spawned", program = %self.program, pid = ?child.id());

        let stdin = child.stdin.take().ok_or(KernelError::Unavailable)?;
        let stdout = child.stdout.take().ok_or(KernelError::Unavailable)?;
        let stderr = child.stderr.take();

        let (request_tx, request_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (reply_tx, reply_rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(request_writer(stdin, request_rx, self.max_frame_bytes));
        tokio::spawn(reply_reader(stdout, reply_tx, self.max_frame_bytes));
        if let Some(stderr) = stderr {
            tokio::spawn(stderr_logger(stderr));
        }

        Ok(KernelChannels {
            requests: request_tx,
            replies: reply_rx,
            process: Some(child),
        })
    }
}

async fn request_writer(
    mut stdin: ChildStdin,
    mut rx: mpsc::Receiver<KernelRequest>,
    max_frame_bytes: usize,
) {
    while let Some(request) = rx.recv().await {
        let frame = match encode_frame(&request, max_frame_bytes) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(event = "kernel_encode_error", msg_id = %request.msg_id, error = %err);
                continue;
            }
        };
        let write = async {
            stdin.write_all(&frame).await?;
            stdin.flush().await
        };
        if let Err(err) = write.await {
            warn!(event = "kernel_write_error", error = %err);
            break;
        }
    }
    debug!(event = "kernel_writer_closed");
}

async fn reply_reader<R>(stdout: R, tx: mpsc::Sender<KernelMessage>, max_frame_bytes: usize)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stdout);
    while let Some(message) = read_next_message(&mut reader, max_frame_bytes).await {
        if tx.send(message).await.is_err() {
            break;
        }
    }
    info!(event = "kernel_output_closed");
}

async fn read_next_message<R>(reader: &mut BufReader<R>, max_frame_bytes: usize) -> Option<KernelMessage>
where
    R: AsyncRead + Unpin,
{
    loop {
        let mut line = Vec::new();
        let n = match reader.read_until(b'\n', &mut line).await {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "kernel_read_error", error = %err);
                return None;
            }
        };
        if n == 0 {
            return None;
        }
        if line.iter().all(|b| b.is_ascii_whitespace()) {
            continue;
        }
        match decode_frame::<KernelMessage>(&line, max_frame_bytes) {
            Ok(message) => return Some(message),
            Err(err) => {
                warn!(event = "kernel_decode_error", error = %err);
                continue;
            }
        }
    }
}

async fn stderr_logger<R>(stderr: R)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(event = "kernel_stderr", line = %line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_command_falls_back_to_embedded_driver() {
        let launcher = ProcessLauncher::from_settings(&KernelSettings::default());
        assert_eq!(launcher.program(), "python3");
        assert_eq!(launcher.args[2], DRIVER_SOURCE);

        let custom = ProcessLauncher::from_command(&[
            "/opt/py/bin/python".to_string(),
            "driver.py".to_string(),
        ])
        .expect("custom command");
        assert_eq!(custom.program(), "/opt/py/bin/python");
        assert_eq!(custom.args, vec!["driver.py".to_string()]);

        assert!(matches!(
            ProcessLauncher::from_command(&[]),
            Err(KernelError::EmptyCommand)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reader_skips_blank_and_malformed_lines() {
        let input: &[u8] = b"\n{not json}\n{\"correlation_id\":\"x\",\"kind\":\"status\",\"payload\":{\"execution_state\":\"idle\"}}\n";
        let mut reader = BufReader::new(input);
        let message = read_next_message(&mut reader, DEFAULT_MAX_FRAME_BYTES)
            .await
            .expect("message");
        assert_eq!(message.correlation_id, "x");
        assert!(message.event.is_idle());
        assert!(read_next_message(&mut reader, DEFAULT_MAX_FRAME_BYTES).await.is_none());
    }
}
