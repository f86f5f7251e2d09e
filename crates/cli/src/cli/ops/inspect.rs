use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use clap::Args;
use common::linked_data::LinkedData;
use common::repo::{collection_counts, decode_car, extract_records, CarError, WalkStats};
use serde::Serialize;

#[derive(Args, Debug, Clone)]
pub struct Inspect {
    /// Repository archive (.car) to read
    #[arg(long)]
    pub car: PathBuf,

    /// Owner to attribute records to when the archive has no commit
    #[arg(long)]
    pub did: Option<String>,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum InspectError {
    #[error("failed to read {0}: {1}")]
    Read(PathBuf, std::io::Error),
    #[error("not a readable archive: {0}")]
    Car(#[from] CarError),
    #[error("failed to render report: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Serialize)]
pub struct InspectReport {
    pub total_blocks: usize,
    pub decode_errors: usize,
    pub owner_id: Option<String>,
    pub revision: Option<String>,
    pub records: usize,
    pub collections: BTreeMap<String, usize>,
    pub walk: WalkStats,
}

#[derive(Debug)]
pub enum InspectOutput {
    Text(InspectReport),
    Json(String),
}

impl fmt::Display for InspectOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let report = match self {
            InspectOutput::Json(json) => return write!(f, "{}", json),
            InspectOutput::Text(report) => report,
        };

        writeln!(
            f,
            "blocks: {} ({} undecodable)",
            report.total_blocks, report.decode_errors
        )?;
        match &report.owner_id {
            Some(owner) => writeln!(
                f,
                "owner: {} (rev {})",
                owner,
                report.revision.as_deref().unwrap_or("unknown")
            )?,
            None => writeln!(f, "owner: unknown (no commit found)")?,
        }
        writeln!(f, "records: {}", report.records)?;
        for (collection, count) in &report.collections {
            writeln!(f, "  {:<40} {}", collection, count)?;
        }
        let walk = &report.walk;
        write!(
            f,
            "tree: {} node(s), {} orphan subtree(s), {} missing block(s), {} malformed key(s)",
            walk.nodes_visited, walk.orphan_subtrees, walk.missing_blocks, walk.malformed_keys
        )
    }
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Inspect {
    type Error = InspectError;
    type Output = InspectOutput;

    async fn execute(&self, _ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let bytes = tokio::fs::read(&self.car)
            .await
            .map_err(|e| InspectError::Read(self.car.clone(), e))?;

        let archive = decode_car(&bytes).await?;
        let extraction = extract_records(&archive, self.did.as_deref());

        let revision = extraction
            .commit
            .as_ref()
            .map(|commit| match &commit.revision {
                LinkedData::String(rev) => rev.clone(),
                other => format!("{:?}", other),
            });

        let report = InspectReport {
            total_blocks: extraction.total_blocks,
            decode_errors: extraction.decode_errors,
            owner_id: extraction.owner_id.clone(),
            revision,
            records: extraction.records.len(),
            collections: collection_counts(&extraction.records),
            walk: extraction.stats,
        };

        if self.json {
            Ok(InspectOutput::Json(serde_json::to_string_pretty(&report)?))
        } else {
            Ok(InspectOutput::Text(report))
        }
    }
}
