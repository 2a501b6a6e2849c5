//! Clear command - drop the content index, the saved tree and the root list.

use std::path::Path;

use anyhow::Result;
use clap::Args;

use crate::local;

#[derive(Args)]
pub struct ClearCmd {
    /// Skip confirmation prompt
    #[arg(long, short = 'y')]
    pub yes: bool,
}

impl ClearCmd {
    pub async fn run(&self, index_dir: Option<&Path>) -> Result<()> {
        let dir = match local::resolve_index_dir(index_dir, false) {
            Ok(dir) if dir.is_dir() => dir,
            _ => {
                println!("No {} directory found.", local::INDEX_DIR_NAME);
                return Ok(());
            }
        };

        if !self.yes {
            println!("This will clear the index in: {}", dir.display());
            print!("Continue? [y/N] ");
            std::io::Write::flush(&mut std::io::stdout())?;

            let mut input = String::new();
            std::io::stdin().read_line(&mut input)?;

            if !input.trim().eq_ignore_ascii_case("y") {
                println!("Aborted.");
                return Ok(());
            }
        }

        let service = super::open_service(Some(&dir), false).await?;
        service.clear_all().await?;
        println!("Cleared {}", dir.display());

        Ok(())
    }
}
