//! Search command - find indexed documents or images by meaning.

use std::path::Path;

use anyhow::Result;
use clap::Args;

use crate::types::Modality;

#[derive(Args)]
pub struct SearchCmd {
    /// Natural language query (for --image, a description of the picture)
    pub query: String,

    /// Search images instead of text
    #[arg(short, long)]
    pub image: bool,

    /// Max results (default from config)
    #[arg(short, long)]
    pub limit: Option<usize>,

    /// Print the response as JSON
    #[arg(long)]
    pub json: bool,
}

impl SearchCmd {
    pub async fn run(&self, index_dir: Option<&Path>) -> Result<()> {
        let service = super::open_service(index_dir, false).await?;
        let modality = if self.image {
            Modality::Image
        } else {
            Modality::Text
        };

        let start = std::time::Instant::now();
        let response = service.search(&self.query, modality, self.limit).await?;
        let elapsed = start.elapsed().as_millis();

        if self.json {
            println!("{}", serde_json::to_string_pretty(&response)?);
            return Ok(());
        }

        println!(
            "Found {} {} results in {}ms\n",
            response.total_results, modality, elapsed
        );

        for (i, r) in response.results.iter().enumerate() {
            let marker = if r.unresolved { " (no longer in tree)" } else { "" };
            println!(
                "{}. {} (score: {:.2}){}",
                i + 1,
                r.path.to_fs_path().display(),
                r.score,
                marker
            );
        }

        Ok(())
    }
}
