//! Rename command - rename an indexed file or folder.

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::Args;

#[derive(Args)]
pub struct RenameCmd {
    /// Indexed file or folder
    pub path: PathBuf,

    /// New name (files keep their extension when none is given)
    pub new_name: String,
}

impl RenameCmd {
    pub async fn run(&self, index_dir: Option<&Path>) -> Result<()> {
        let service = super::open_service(index_dir, false).await?;
        let old = super::to_key(&self.path)?;

        let outcome = service.rename(&old, &self.new_name).await?;
        println!(
            "Renamed {} -> {}",
            old.to_fs_path().display(),
            outcome.path.to_fs_path().display()
        );
        super::print_warnings(&outcome);

        Ok(())
    }
}
