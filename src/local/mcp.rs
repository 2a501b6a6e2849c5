//! Local MCP server implementation.
//!
//! Tree paths in tool inputs and outputs are flat keys (`/|home|ana|notes.txt`).

use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use rmcp::{
    ErrorData as McpError, ServerHandler, ServiceExt,
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::*,
    schemars, tool, tool_handler, tool_router,
    transport::io::stdio,
};
use serde::{Deserialize, Serialize};

use super::config::LocalConfig;
use super::content::{IndexFailure, ProgressSnapshot};
use super::embed::HttpEmbedder;
use super::mutation::{MutationKind, MutationOutcome, MutationStage};
use super::service::{IndexOptions, TreeService, TreeStats};
use crate::crawler::CrawlIssue;
use crate::types::{FlatKey, Modality, NodeId, SnapshotMetadata, TreeSnapshot};

/// Local MCP server for the indexed tree.
pub struct TreeMcpServer {
    service: Arc<TreeService<HttpEmbedder>>,
    tool_router: ToolRouter<TreeMcpServer>,
}

#[derive(Debug, Default, Deserialize, schemars::JsonSchema)]
pub struct SnapshotInput {
    /// Return only the metadata and root ids instead of every node
    #[serde(default)]
    pub summary_only: bool,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct RunIndexInput {
    /// Flat key of the directory to index (e.g. "/|home|ana|docs")
    pub root_path: String,
    /// Alternate directory for the vector database
    #[serde(default)]
    pub db_path: Option<String>,
    /// Base name of the vector tables
    #[serde(default)]
    pub table_name: Option<String>,
    /// Alternate file for the tree snapshot
    #[serde(default)]
    pub output_path: Option<String>,
    /// Add placeholder nodes for every ancestor of the root
    #[serde(default)]
    pub synthesize_ancestors: bool,
    /// Leave the tree snapshot out of the reply
    #[serde(default)]
    pub summary_only: bool,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct CreateFolderInput {
    /// Flat key of the parent directory
    pub parent_path: String,
    /// Name of the new folder
    pub name: String,
    /// Leave the tree snapshot out of the reply
    #[serde(default)]
    pub summary_only: bool,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct RenameInput {
    /// Flat key of the entry to rename
    pub old_path: String,
    /// New name (not a path). Files keep their extension if none is given.
    pub new_name: String,
    /// Leave the tree snapshot out of the reply
    #[serde(default)]
    pub summary_only: bool,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct DeleteInput {
    /// Flat key of the entry to delete
    pub path: String,
    /// Leave the tree snapshot out of the reply
    #[serde(default)]
    pub summary_only: bool,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct SearchTextInput {
    /// What the document should be about
    pub query: String,
    /// Maximum results to return (default from config)
    #[serde(default)]
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct SearchImageInput {
    /// Description of the picture to find
    pub query_description: String,
    /// Maximum results to return (default from config)
    #[serde(default)]
    pub limit: Option<u32>,
}

#[derive(Serialize)]
struct TreeSummary<'a> {
    root_ids: &'a [NodeId],
    metadata: SnapshotMetadata,
}

/// Snapshot part of a reply: the full tree, or only its counts.
#[derive(Serialize)]
struct SnapshotPart<'a> {
    metadata: SnapshotMetadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    snapshot: Option<&'a TreeSnapshot>,
}

impl<'a> SnapshotPart<'a> {
    fn new(snapshot: &'a TreeSnapshot, summary_only: bool) -> Self {
        Self {
            metadata: snapshot.metadata,
            snapshot: (!summary_only).then_some(snapshot),
        }
    }
}

#[derive(Serialize)]
struct IndexReply<'a> {
    roots: &'a [PathBuf],
    indexed: usize,
    skipped: usize,
    failures: &'a [IndexFailure],
    crawl_errors: &'a [CrawlIssue],
    #[serde(flatten)]
    tree: SnapshotPart<'a>,
}

#[derive(Serialize)]
struct RefreshReply<'a> {
    purged: usize,
    indexed: usize,
    failures: &'a [IndexFailure],
    crawl_errors: &'a [CrawlIssue],
    removed_roots: &'a [PathBuf],
    #[serde(flatten)]
    tree: SnapshotPart<'a>,
}

#[derive(Serialize)]
struct MutationReply<'a> {
    operation: MutationKind,
    stage: MutationStage,
    path: &'a FlatKey,
    existed: bool,
    index_warnings: &'a [String],
    #[serde(flatten)]
    tree: SnapshotPart<'a>,
}

impl<'a> MutationReply<'a> {
    fn new(outcome: &'a MutationOutcome, summary_only: bool) -> Self {
        Self {
            operation: outcome.operation,
            stage: outcome.stage,
            path: &outcome.path,
            existed: outcome.existed,
            index_warnings: &outcome.index_warnings,
            tree: SnapshotPart::new(&outcome.snapshot, summary_only),
        }
    }
}

#[derive(Serialize)]
struct StatsReply<'a> {
    #[serde(flatten)]
    stats: &'a TreeStats,
    /// Counters of the last index or refresh run by this server.
    progress: ProgressSnapshot,
}

fn json<T: Serialize>(value: &T) -> Result<CallToolResult, McpError> {
    serde_json::to_string_pretty(value)
        .map(|text| CallToolResult::success(vec![Content::text(text)]))
        .map_err(|e| McpError::internal_error(e.to_string(), None))
}

fn failed(action: &str, e: impl Display) -> Result<CallToolResult, McpError> {
    Ok(CallToolResult::error(vec![Content::text(format!(
        "{action} failed: {e}"
    ))]))
}

#[tool_router]
impl TreeMcpServer {
    /// Create a new server over the index at `index_dir`.
    pub async fn new(index_dir: &Path) -> Result<Self> {
        let config = LocalConfig::load()?;
        let embedder = Arc::new(HttpEmbedder::from_config(&config));
        let service = TreeService::open(index_dir, config, embedder).await?;
        Ok(Self {
            service: Arc::new(service),
            tool_router: Self::tool_router(),
        })
    }

    #[tool(
        description = "Get the indexed file tree: nodes keyed by id, child id lists in display order, root ids and counts."
    )]
    async fn get_tree(
        &self,
        Parameters(input): Parameters<SnapshotInput>,
    ) -> Result<CallToolResult, McpError> {
        match self.service.get_tree().await {
            Ok(snapshot) if input.summary_only => json(&TreeSummary {
                root_ids: &snapshot.root_ids,
                metadata: snapshot.metadata,
            }),
            Ok(snapshot) => json(&snapshot),
            Err(e) => failed("get_tree", e),
        }
    }

    #[tool(
        description = "Crawl a directory and rebuild the tree and content index from it, replacing the previous index."
    )]
    async fn run_index(
        &self,
        Parameters(input): Parameters<RunIndexInput>,
    ) -> Result<CallToolResult, McpError> {
        let root = match FlatKey::parse(&input.root_path) {
            Ok(key) => key.to_fs_path(),
            Err(e) => return failed("run_index", e),
        };
        let options = IndexOptions {
            db_path: input.db_path.map(PathBuf::from),
            table_name: input.table_name,
            output_path: input.output_path.map(PathBuf::from),
            synthesize_ancestors: input.synthesize_ancestors,
        };
        let summary_only = input.summary_only;

        match self.service.run_index(&[root], options).await {
            Ok(report) => json(&IndexReply {
                roots: &report.roots,
                indexed: report.summary.indexed,
                skipped: report.summary.skipped,
                failures: &report.summary.failures,
                crawl_errors: &report.crawl_errors,
                tree: SnapshotPart::new(&report.snapshot, summary_only),
            }),
            Err(e) => failed("run_index", e),
        }
    }

    #[tool(
        description = "Re-crawl the indexed roots and bring the tree and content index up to date with disk."
    )]
    async fn refresh(
        &self,
        Parameters(input): Parameters<SnapshotInput>,
    ) -> Result<CallToolResult, McpError> {
        match self.service.refresh().await {
            Ok(report) => json(&RefreshReply {
                purged: report.purged,
                indexed: report.summary.indexed,
                failures: &report.summary.failures,
                crawl_errors: &report.crawl_errors,
                removed_roots: &report.removed_roots,
                tree: SnapshotPart::new(&report.snapshot, input.summary_only),
            }),
            Err(e) => failed("refresh", e),
        }
    }

    #[tool(description = "Create a folder inside an indexed directory.")]
    async fn create_folder(
        &self,
        Parameters(input): Parameters<CreateFolderInput>,
    ) -> Result<CallToolResult, McpError> {
        let parent = match FlatKey::parse(&input.parent_path) {
            Ok(key) => key,
            Err(e) => return failed("create_folder", e),
        };
        match self.service.create_folder(&parent, &input.name).await {
            Ok(outcome) => json(&MutationReply::new(&outcome, input.summary_only)),
            Err(e) => failed("create_folder", e),
        }
    }

    #[tool(
        description = "Rename an indexed file or folder in place. Folder contents and search records follow the new path."
    )]
    async fn rename(
        &self,
        Parameters(input): Parameters<RenameInput>,
    ) -> Result<CallToolResult, McpError> {
        let old = match FlatKey::parse(&input.old_path) {
            Ok(key) => key,
            Err(e) => return failed("rename", e),
        };
        match self.service.rename(&old, &input.new_name).await {
            Ok(outcome) => json(&MutationReply::new(&outcome, input.summary_only)),
            Err(e) => failed("rename", e),
        }
    }

    #[tool(
        description = "Delete an indexed file or folder (moved to the index trash unless hard delete is configured)."
    )]
    async fn delete(
        &self,
        Parameters(input): Parameters<DeleteInput>,
    ) -> Result<CallToolResult, McpError> {
        let path = match FlatKey::parse(&input.path) {
            Ok(key) => key,
            Err(e) => return failed("delete", e),
        };
        match self.service.delete(&path).await {
            Ok(outcome) => json(&MutationReply::new(&outcome, input.summary_only)),
            Err(e) => failed("delete", e),
        }
    }

    #[tool(description = "Drop the content index, the saved tree and the list of indexed roots.")]
    async fn clear_all(&self) -> Result<CallToolResult, McpError> {
        match self.service.clear_all().await {
            Ok(()) => Ok(CallToolResult::success(vec![Content::text("Index cleared.")])),
            Err(e) => failed("clear_all", e),
        }
    }

    #[tool(
        description = "Semantic search over the text of indexed documents (txt, md, html, pdf, docx, source files)."
    )]
    async fn search_text(
        &self,
        Parameters(input): Parameters<SearchTextInput>,
    ) -> Result<CallToolResult, McpError> {
        let limit = input.limit.map(|l| l as usize);
        match self.service.search(&input.query, Modality::Text, limit).await {
            Ok(response) => json(&response),
            Err(e) => failed("search_text", e),
        }
    }

    #[tool(description = "Find indexed images (jpg, png, webp) matching a text description.")]
    async fn search_image(
        &self,
        Parameters(input): Parameters<SearchImageInput>,
    ) -> Result<CallToolResult, McpError> {
        let limit = input.limit.map(|l| l as usize);
        match self
            .service
            .search(&input.query_description, Modality::Image, limit)
            .await
        {
            Ok(response) => json(&response),
            Err(e) => failed("search_image", e),
        }
    }

    #[tool(
        description = "Show index locations, tree counts, records per modality and progress of the last index run."
    )]
    async fn stats(&self) -> Result<CallToolResult, McpError> {
        match self.service.stats().await {
            Ok(stats) => json(&StatsReply {
                stats: &stats,
                progress: self.service.progress(),
            }),
            Err(e) => failed("stats", e),
        }
    }
}

#[tool_handler]
impl ServerHandler for TreeMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "treeindex-local".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                title: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Indexed file tree with text and image search. Paths are flat keys: \
                 segments joined by '|', with '|' and '\\' in names escaped by '\\'. \
                 Tools: get_tree, run_index, refresh, create_folder, rename, delete, \
                 clear_all, search_text, search_image, stats."
                    .to_string(),
            ),
        }
    }
}

/// Run the local MCP server over stdio.
pub async fn run_local(index_dir: &Path) -> Result<()> {
    let server = TreeMcpServer::new(index_dir).await?;
    let service = server.serve(stdio()).await?;
    service.waiting().await?;
    Ok(())
}
