//! Stats command - show index statistics.

use std::path::Path;

use anyhow::Result;
use clap::Args;
use walkdir::WalkDir;

#[derive(Args)]
pub struct StatsCmd;

impl StatsCmd {
    pub async fn run(&self, index_dir: Option<&Path>) -> Result<()> {
        let service = super::open_service(index_dir, false).await?;
        let stats = service.stats().await?;

        let vectors_size = get_dir_size(&stats.db_path);
        let snapshot_size = std::fs::metadata(&stats.snapshot_path)
            .map(|m| m.len())
            .unwrap_or(0);
        let trash_size = get_dir_size(&stats.index_dir.join("trash"));

        println!("Index: {}", stats.index_dir.display());
        println!();
        println!("Roots:         {}", stats.roots.len());
        for root in &stats.roots {
            println!("  {}", root.display());
        }
        println!();
        println!("Directories:   {}", stats.tree.total_directories);
        if stats.tree.synthetic_directories > 0 {
            println!("  placeholder: {}", stats.tree.synthetic_directories);
        }
        println!("Files:         {}", stats.tree.total_files);
        println!();
        println!("Records ({}):", stats.table_name);
        println!("  text:        {}", stats.text_records);
        println!("  image:       {}", stats.image_records);
        println!();
        println!("Storage:");
        println!("  Vectors:     {}", format_size(vectors_size));
        println!("  Snapshot:    {}", format_size(snapshot_size));
        println!("  Trash:       {}", format_size(trash_size));
        println!(
            "  Total:       {}",
            format_size(vectors_size + snapshot_size + trash_size)
        );

        Ok(())
    }
}

fn get_dir_size(path: &Path) -> u64 {
    WalkDir::new(path)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|m| m.len())
        .sum()
}

fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.00 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.00 MB");
    }

    #[test]
    fn test_get_dir_size_counts_nested_files() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b")).unwrap();
        std::fs::write(dir.path().join("x"), [0u8; 10]).unwrap();
        std::fs::write(dir.path().join("a/b/y"), [0u8; 5]).unwrap();
        assert_eq!(get_dir_size(dir.path()), 15);
        assert_eq!(get_dir_size(&dir.path().join("missing")), 0);
    }
}
