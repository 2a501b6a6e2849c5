//! Index command - crawl directories and build the tree and content index.

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::Args;

use crate::local::IndexOptions;

#[derive(Args)]
pub struct IndexCmd {
    /// Directories to index (must not contain each other)
    #[arg(required = true)]
    pub roots: Vec<PathBuf>,

    /// Store the vector database here instead of the index directory
    #[arg(long)]
    pub db_path: Option<PathBuf>,

    /// Base name of the vector tables
    #[arg(long)]
    pub table: Option<String>,

    /// Write the tree snapshot to this file
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Add placeholder nodes for every ancestor of each root
    #[arg(long)]
    pub synthesize_ancestors: bool,
}

impl IndexCmd {
    pub async fn run(&self, index_dir: Option<&Path>) -> Result<()> {
        let service = super::open_service(index_dir, true).await?;

        let start = std::time::Instant::now();
        let options = IndexOptions {
            db_path: self.db_path.clone(),
            table_name: self.table.clone(),
            output_path: self.output.clone(),
            synthesize_ancestors: self.synthesize_ancestors,
        };
        let report = service.run_index(&self.roots, options).await?;
        let elapsed = start.elapsed().as_secs_f64();

        for root in &report.roots {
            println!("Indexed {}", root.display());
        }
        let meta = report.snapshot.metadata;
        println!(
            "{} directories, {} files in {:.1}s",
            meta.total_directories, meta.total_files, elapsed
        );
        println!(
            "Content: {} indexed, {} skipped, {} failed",
            report.summary.indexed,
            report.summary.skipped,
            report.summary.failures.len()
        );

        for failure in &report.summary.failures {
            println!("  failed: {} - {}", failure.path.to_fs_path().display(), failure.error);
        }
        for issue in &report.crawl_errors {
            println!("  unreadable: {} - {}", issue.path.display(), issue.error);
        }

        Ok(())
    }
}
