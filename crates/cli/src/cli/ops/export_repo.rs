use std::path::PathBuf;

use clap::Args;
use common::export::ExportError;
use common::repo::{decode_car, extract_records, CarError};

use atvault::process::cancel_on_interrupt;
use atvault::ApiError;

use super::job::{join_printer, ExportFlags, JobSummary};

#[derive(Args, Debug, Clone)]
#[command(group(
    clap::ArgGroup::new("input")
        .required(true)
        .args(["car", "did"]),
))]
pub struct ExportRepo {
    /// Local repository archive (.car) to export
    #[arg(long)]
    pub car: Option<PathBuf>,

    /// Handle or DID whose repository is downloaded from its PDS. With
    ///  `--car`, only used to attribute records when there is no commit.
    #[arg(long)]
    pub did: Option<String>,

    #[command(flatten)]
    pub flags: ExportFlags,
}

#[derive(Debug, thiserror::Error)]
pub enum ExportRepoError {
    #[error("either --car or --did is required")]
    MissingInput,
    #[error("failed to read {0}: {1}")]
    Read(PathBuf, std::io::Error),
    #[error("failed to fetch repository: {0}")]
    Api(#[from] ApiError),
    #[error("not a readable archive: {0}")]
    Car(#[from] CarError),
    #[error("export failed: {0}")]
    Export(#[from] ExportError),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for ExportRepo {
    type Error = ExportRepoError;
    type Output = JobSummary;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let (bytes, known_owner) = match (&self.car, &self.did) {
            (Some(path), did) => {
                let bytes = tokio::fs::read(path)
                    .await
                    .map_err(|e| ExportRepoError::Read(path.clone(), e))?;
                (bytes, did.clone())
            }
            (None, Some(actor)) => {
                let identity = ctx.client.resolve(actor).await?;
                let bytes = ctx.client.get_repo(&identity.pds, &identity.did).await?;
                (bytes.to_vec(), Some(identity.did))
            }
            (None, None) => return Err(ExportRepoError::MissingInput),
        };

        let archive = decode_car(&bytes).await?;
        drop(bytes);
        let extraction = extract_records(&archive, known_owner.as_deref());
        drop(archive);

        let cancel = cancel_on_interrupt();
        let (controller, printer) = self.flags.controller(ctx);
        let job = controller.export_records(&extraction, &cancel).await;
        drop(controller);
        join_printer(printer).await;

        Ok(JobSummary(job?))
    }
}
