use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Forward every line a child writes on `reader` (usually stderr) to tracing.
///
/// Lines mentioning an error are raised to `warn`. The task ends at EOF.
pub fn spawn_line_logger<R>(program: impl Into<String>, reader: R) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let program = program.into();
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim_end();
                    if line.is_empty() {
                        continue;
                    }
                    if line.contains("Error") || line.contains("error") {
                        warn!(program = %program, "{}", line);
                    } else {
                        debug!(program = %program, "{}", line);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(program = %program, error = %e, "Stopped reading process output");
                    break;
                }
            }
        }
    })
}
