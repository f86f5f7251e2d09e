use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use common::export::{
    EventSink, ExportController, ExportJob, JobState, LogLevel, SaveTargets,
};
use common::fetch::DownloadManager;
use tokio::task::JoinHandle;

use atvault::interactive::{spawn_progress_printer, PromptPicker};
use atvault::HttpFetcher;

use crate::cli::op::OpContext;

/// Flags shared by the export commands
#[derive(clap::Args, Debug, Clone)]
pub struct ExportFlags {
    /// Directory bundles are written to (defaults to the configured output dir)
    #[arg(long, short)]
    pub out: Option<PathBuf>,

    /// Ask where to save each bundle; answering `n` skips that part
    #[arg(long, short)]
    pub interactive: bool,

    /// Split jobs with more items than this into parts
    #[arg(long)]
    pub chunk_threshold: Option<usize>,

    /// Parallel blob downloads
    #[arg(long)]
    pub concurrency: Option<usize>,
}

impl ExportFlags {
    pub fn output_dir(&self, ctx: &OpContext) -> PathBuf {
        self.out.clone().unwrap_or_else(|| ctx.state.output_dir())
    }

    /// Picker when interactive, otherwise straight into the output dir
    pub fn save_targets(&self, ctx: &OpContext) -> SaveTargets {
        let dir = self.output_dir(ctx);
        if self.interactive {
            SaveTargets::new().with_picker(Arc::new(PromptPicker::new(dir)))
        } else {
            SaveTargets::directory(dir)
        }
    }

    /// Controller wired to config, flag overrides, HTTP fetching and a
    ///  progress printer. The printer stops once the controller is dropped.
    pub fn controller(&self, ctx: &OpContext) -> (ExportController, JoinHandle<()>) {
        let config = &ctx.state.config;

        let mut downloads = config.download_config();
        if let Some(concurrency) = self.concurrency {
            downloads.concurrency = concurrency;
        }
        let mut settings = config.export_settings();
        if let Some(threshold) = self.chunk_threshold {
            settings.chunk_threshold = threshold;
        }

        let fetcher = Arc::new(HttpFetcher::new(ctx.client.http_client().clone()));
        let (sink, events) = EventSink::bounded(256);
        let printer = spawn_progress_printer(events);

        let controller = ExportController::new(
            settings,
            DownloadManager::new(downloads, fetcher),
            self.save_targets(ctx),
        )
        .with_events(sink);

        (controller, printer)
    }
}

/// Wait for the progress printer to drain. Returns false if it panicked
///  or was aborted.
pub async fn join_printer(printer: JoinHandle<()>) -> bool {
    match printer.await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!("progress printer stopped abnormally: {}", e);
            false
        }
    }
}

/// Human readable end-of-job report
#[derive(Debug)]
pub struct JobSummary(pub ExportJob);

impl fmt::Display for JobSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let job = &self.0;
        let state = match job.state {
            JobState::Complete => "complete",
            JobState::Cancelled => "cancelled",
        };
        writeln!(
            f,
            "{} export {}: {} item(s) bundled, {} failed, {} part(s)",
            job.kind.as_str(),
            state,
            job.succeeded_count(),
            job.failed_count,
            job.parts.len()
        )?;
        for part in &job.parts {
            let saved = part.saved_as.as_deref().unwrap_or("not saved");
            writeln!(
                f,
                "  part {}: {}/{} ok -> {}",
                part.index, part.succeeded, part.total_in_part, saved
            )?;
        }
        let problems = job
            .logs
            .iter()
            .filter(|entry| matches!(entry.level, LogLevel::Warn | LogLevel::Error))
            .count();
        write!(f, "{} warning(s) or error(s) logged", problems)
    }
}
