//! `/apt/repos/list`: APT repositories configured on the device
//!
//! Reads one-line style sources from `sources.list` and
//! `sources.list.d/*.list`. Commented-out `deb` lines are reported as
//! disabled repositories; any other comment is ignored.

use crate::dispatch::{CommandHandler, CommandRequest, HandlerContext, HandlerOutcome};
use crate::error::HandlerError;
use crate::status::StatusIntent;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const APT_REPOS_LIST_TOPIC: &str = "/apt/repos/list";

/// One repository line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AptRepository {
    pub enabled: bool,
    /// `deb-src` rather than `deb`
    pub source_repo: bool,
    /// Contents of the `[...]` block, without brackets
    pub options: String,
    pub uri: String,
    pub distribution: String,
    /// Space separated component list
    pub components: String,
    /// Trailing `#` comment
    pub comment: String,
}

/// Parse one line; None for blanks, plain comments and malformed entries
pub fn parse_source_line(line: &str) -> Option<AptRepository> {
    let mut rest = line.trim();
    if rest.is_empty() {
        return None;
    }

    let enabled = !rest.starts_with('#');
    if !enabled {
        rest = rest.trim_start_matches('#').trim_start();
    }

    let (body, comment) = match rest.split_once('#') {
        Some((body, comment)) => (body, comment.trim()),
        None => (rest, ""),
    };

    let mut tokens = body.split_whitespace().peekable();
    let source_repo = match tokens.next()? {
        "deb" => false,
        "deb-src" => true,
        _ => return None,
    };

    let mut options = Vec::new();
    if tokens.peek().is_some_and(|t| t.starts_with('[')) {
        for token in tokens.by_ref() {
            let closed = token.ends_with(']');
            options.push(token.trim_start_matches('[').trim_end_matches(']'));
            if closed {
                break;
            }
        }
    }

    let uri = tokens.next()?;
    let distribution = tokens.next()?;
    let components: Vec<&str> = tokens.collect();

    Some(AptRepository {
        enabled,
        source_repo,
        options: options
            .into_iter()
            .filter(|o| !o.is_empty())
            .collect::<Vec<_>>()
            .join(" "),
        uri: uri.to_string(),
        distribution: distribution.to_string(),
        components: components.join(" "),
        comment: comment.to_string(),
    })
}

pub fn parse_sources(content: &str) -> Vec<AptRepository> {
    content.lines().filter_map(parse_source_line).collect()
}

async fn read_optional(path: &Path) -> io::Result<Option<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Sorted `*.list` files in `sources.list.d`
async fn source_parts(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut parts = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "list") {
            parts.push(path);
        }
    }
    parts.sort();
    Ok(parts)
}

/// Every repository configured under `sources_dir` (usually `/etc/apt`)
pub async fn list_repositories(sources_dir: &Path) -> io::Result<Vec<AptRepository>> {
    let mut files = vec![sources_dir.join("sources.list")];
    files.extend(source_parts(&sources_dir.join("sources.list.d")).await?);

    let mut repositories = Vec::new();
    for file in files {
        if let Some(content) = read_optional(&file).await? {
            let parsed = parse_sources(&content);
            debug!(file = %file.display(), count = parsed.len(), "Parsed APT sources");
            repositories.extend(parsed);
        }
    }
    Ok(repositories)
}

/// Handler bound to [`APT_REPOS_LIST_TOPIC`]
pub struct AptRepositoryListHandler {
    sources_dir: PathBuf,
}

impl AptRepositoryListHandler {
    pub fn new(sources_dir: impl Into<PathBuf>) -> Self {
        Self {
            sources_dir: sources_dir.into(),
        }
    }
}

#[async_trait]
impl CommandHandler for AptRepositoryListHandler {
    fn name(&self) -> &str {
        "apt_repos_list"
    }

    async fn handle(
        &self,
        _request: CommandRequest,
        _ctx: HandlerContext,
    ) -> Result<HandlerOutcome, HandlerError> {
        let repositories = list_repositories(&self.sources_dir).await?;
        let reply = serde_json::to_value(&repositories)?;
        Ok(HandlerOutcome::json(reply).with_intent(StatusIntent::RepositoriesListed(repositories)))
    }
}
