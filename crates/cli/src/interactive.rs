use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use common::export::{ExportEvent, LocationPicker, SaveError};
use tokio::task::JoinHandle;

/// Asks on the terminal where each bundle should be saved
#[derive(Debug, Clone)]
pub struct PromptPicker {
    default_dir: PathBuf,
}

impl PromptPicker {
    pub fn new(default_dir: impl Into<PathBuf>) -> Self {
        Self {
            default_dir: default_dir.into(),
        }
    }
}

/// Empty answer takes the suggestion, `n`/`no` declines, anything else is a
///  path (a directory gets the suggested file name appended)
pub fn interpret_answer(answer: &str, suggested: &Path) -> Option<PathBuf> {
    let answer = answer.trim();
    match answer.to_ascii_lowercase().as_str() {
        "" | "y" | "yes" => Some(suggested.to_path_buf()),
        "n" | "no" => None,
        _ => {
            let path = PathBuf::from(answer);
            if path.is_dir() {
                Some(path.join(suggested.file_name().unwrap_or_default()))
            } else {
                Some(path)
            }
        }
    }
}

#[async_trait::async_trait]
impl LocationPicker for PromptPicker {
    async fn pick(&self, suggested_name: &str) -> Result<Option<PathBuf>, SaveError> {
        let suggested = self.default_dir.join(suggested_name);
        let prompt = format!(
            "Save {} to {}? [Y/n/path] ",
            suggested_name,
            suggested.display()
        );

        let answer = tokio::task::spawn_blocking(move || -> std::io::Result<String> {
            let mut stderr = std::io::stderr();
            stderr.write_all(prompt.as_bytes())?;
            stderr.flush()?;
            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line)?;
            Ok(line)
        })
        .await
        .map_err(|e| SaveError::Picker(e.to_string()))?
        .map_err(|e| SaveError::Picker(e.to_string()))?;

        Ok(interpret_answer(&answer, &suggested))
    }
}

/// Render progress events on stderr until the sending side is dropped.
///  Log events are already written by the tracing subscriber.
pub fn spawn_progress_printer(events: flume::Receiver<ExportEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_stage = String::new();
        while let Ok(event) = events.recv_async().await {
            if let ExportEvent::Progress(progress) = event {
                if progress.stage != last_stage {
                    eprintln!(
                        "[{}] {}/{}",
                        progress.stage, progress.current, progress.total
                    );
                    last_stage = progress.stage;
                }
            }
        }
    })
}
