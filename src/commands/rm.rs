//! Rm command - delete an indexed file or folder.

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::Args;

use crate::local::DeleteMode;

#[derive(Args)]
pub struct RmCmd {
    /// Indexed file or folder
    pub path: PathBuf,

    /// Skip confirmation prompt
    #[arg(long, short = 'y')]
    pub yes: bool,
}

impl RmCmd {
    pub async fn run(&self, index_dir: Option<&Path>) -> Result<()> {
        let service = super::open_service(index_dir, false).await?;
        let key = super::to_key(&self.path)?;
        let fs_path = key.to_fs_path();

        if !self.yes {
            let action = match service.config().delete_mode {
                DeleteMode::Trash => "move to trash",
                DeleteMode::Hard => "permanently delete",
            };
            println!("This will {}: {}", action, fs_path.display());
            print!("Continue? [y/N] ");
            std::io::Write::flush(&mut std::io::stdout())?;

            let mut input = String::new();
            std::io::stdin().read_line(&mut input)?;

            if !input.trim().eq_ignore_ascii_case("y") {
                println!("Aborted.");
                return Ok(());
            }
        }

        let outcome = service.delete(&key).await?;
        println!("Deleted {}", fs_path.display());
        super::print_warnings(&outcome);

        Ok(())
    }
}
