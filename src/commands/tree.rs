//! Tree command - print the indexed tree.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;

use crate::types::{NodeId, TreeSnapshot};

#[derive(Args)]
pub struct TreeCmd {
    /// Start from this indexed directory instead of the roots
    pub path: Option<PathBuf>,

    /// Maximum depth to print
    #[arg(short, long)]
    pub depth: Option<usize>,

    /// Print the full snapshot as JSON
    #[arg(long)]
    pub json: bool,
}

impl TreeCmd {
    pub async fn run(&self, index_dir: Option<&Path>) -> Result<()> {
        let service = super::open_service(index_dir, false).await?;
        let snapshot = service.get_tree().await?;

        if self.json {
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
            return Ok(());
        }

        let starts = match &self.path {
            Some(path) => {
                let key = super::to_key(path)?;
                let node = service
                    .resolve(&key)
                    .with_context(|| format!("Not indexed: {}", path.display()))?;
                vec![node.id]
            }
            None => snapshot.root_ids.clone(),
        };

        if starts.is_empty() {
            println!("Nothing indexed. Run `tidx index <dir>` first.");
            return Ok(());
        }

        let mut out = String::new();
        for id in starts {
            render(&snapshot, id, 0, self.depth, &mut out);
        }
        print!("{}", out);

        let meta = snapshot.metadata;
        println!();
        println!(
            "{} directories, {} files",
            meta.total_directories - meta.synthetic_directories,
            meta.total_files
        );
        Ok(())
    }
}

fn render(snapshot: &TreeSnapshot, id: NodeId, depth: usize, max_depth: Option<usize>, out: &mut String) {
    let Some(node) = snapshot.nodes.get(&id) else {
        return;
    };

    let indent = "  ".repeat(depth);
    let name = if depth == 0 {
        node.absolute_path.to_fs_path().display().to_string()
    } else {
        node.display_name.clone()
    };
    if node.is_directory {
        out.push_str(&format!("{indent}{name}/"));
    } else {
        out.push_str(&format!("{indent}{name}"));
    }
    if node.is_synthetic {
        out.push_str(" (placeholder)");
    }
    out.push('\n');

    if max_depth.is_some_and(|max| depth >= max) {
        return;
    }
    for child in snapshot.adjacency_list.get(&id).into_iter().flatten() {
        render(snapshot, *child, depth + 1, max_depth, out);
    }
}
