//! Mkdir command - create a folder inside the indexed tree.

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::Args;

#[derive(Args)]
pub struct MkdirCmd {
    /// Indexed parent directory
    pub parent: PathBuf,

    /// Name of the new folder
    pub name: String,
}

impl MkdirCmd {
    pub async fn run(&self, index_dir: Option<&Path>) -> Result<()> {
        let service = super::open_service(index_dir, false).await?;
        let parent = super::to_key(&self.parent)?;

        let outcome = service.create_folder(&parent, &self.name).await?;
        let path = outcome.path.to_fs_path();
        if outcome.existed {
            println!("Already exists: {}", path.display());
        } else {
            println!("Created {}", path.display());
        }
        super::print_warnings(&outcome);

        Ok(())
    }
}
