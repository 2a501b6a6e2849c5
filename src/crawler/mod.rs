//! File-system crawler.
//!
//! Walks a root directory and emits one [`TreeNode`](crate::types::TreeNode)
//! per entry, with ids derived from flat path keys. The walk is exposed as a
//! step iterator ([`CrawlSteps`]); [`crawl`] drains it into a [`CrawlOutput`].

mod options;
mod walk;

pub use options::CrawlOptions;
pub use walk::{CrawlIssue, CrawlOutput, CrawlStep, CrawlSteps, crawl, crawl_roots, crawl_subtree};
