use clap::Args;
use common::export::ExportError;

use atvault::process::cancel_on_interrupt;
use atvault::{ApiError, PdsBlobSource};

use super::job::{join_printer, ExportFlags, JobSummary};

#[derive(Args, Debug, Clone)]
pub struct ExportBlobs {
    /// Handle or DID whose blobs are exported
    #[arg(long)]
    pub did: String,

    #[command(flatten)]
    pub flags: ExportFlags,
}

#[derive(Debug, thiserror::Error)]
pub enum ExportBlobsError {
    #[error("failed to resolve account: {0}")]
    Api(#[from] ApiError),
    #[error("export failed: {0}")]
    Export(#[from] ExportError),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for ExportBlobs {
    type Error = ExportBlobsError;
    type Output = JobSummary;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let identity = ctx.client.resolve(&self.did).await?;
        let source = PdsBlobSource::new(ctx.client.clone(), identity.pds.clone());

        let cancel = cancel_on_interrupt();
        let (controller, printer) = self.flags.controller(ctx);
        let job = controller
            .export_blobs(&identity.did, &source, &cancel)
            .await;
        drop(controller);
        join_printer(printer).await;

        Ok(JobSummary(job?))
    }
}
