//! Refresh command - bring the index up to date with disk.

use std::path::Path;

use anyhow::Result;
use clap::Args;

#[derive(Args)]
pub struct RefreshCmd;

impl RefreshCmd {
    pub async fn run(&self, index_dir: Option<&Path>) -> Result<()> {
        let service = super::open_service(index_dir, false).await?;
        let report = service.refresh().await?;

        let meta = report.snapshot.metadata;
        println!(
            "Tree: {} directories, {} files",
            meta.total_directories, meta.total_files
        );
        println!(
            "Content: {} re-indexed, {} purged, {} failed",
            report.summary.indexed,
            report.purged,
            report.summary.failures.len()
        );
        for failure in &report.summary.failures {
            println!("  failed: {} - {}", failure.path.to_fs_path().display(), failure.error);
        }
        for root in &report.removed_roots {
            println!("  root gone, dropped: {}", root.display());
        }
        for issue in &report.crawl_errors {
            println!("  unreadable: {} - {}", issue.path.display(), issue.error);
        }

        Ok(())
    }
}
