//! Feed binding for the standalone binary
//!
//! The real change feed (a document store driver and its aggregation
//! pipeline) is an external collaborator linked in by the embedding build.
//! The standalone binary binds a development feed instead: newline-delimited
//! `ChangeRecord` JSON on stdin, enabled with `WEBHOOK_FEED=stdin`. Resume
//! tokens are accepted but ignored, since stdin cannot seek.

use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tracing::warn;

use webhook_core::{ChangeRecord, Config, ResumeToken};
use webhook_service::error::FeedError;
use webhook_service::feed::{ChangeFeed, ChangeStream};

pub fn build_feed(_config: &Config) -> anyhow::Result<Arc<dyn ChangeFeed>> {
    match std::env::var("WEBHOOK_FEED").as_deref() {
        Ok("stdin") => Ok(Arc::new(StdinFeed)),
        Ok(other) => bail!("unknown WEBHOOK_FEED '{other}' (expected 'stdin')"),
        Err(_) => bail!(
            "no change feed bound; set WEBHOOK_FEED=stdin or link a store driver"
        ),
    }
}

struct StdinFeed;

#[async_trait]
impl ChangeFeed for StdinFeed {
    async fn open(
        &self,
        resume_after: Option<ResumeToken>,
    ) -> Result<Box<dyn ChangeStream>, FeedError> {
        if resume_after.is_some() {
            warn!("stdin feed cannot seek, resume token ignored");
        }
        Ok(Box::new(StdinStream {
            lines: BufReader::new(tokio::io::stdin()).lines(),
        }))
    }
}

struct StdinStream {
    lines: Lines<BufReader<Stdin>>,
}

#[async_trait]
impl ChangeStream for StdinStream {
    async fn next(&mut self) -> Result<Option<ChangeRecord>, FeedError> {
        loop {
            let line = self
                .lines
                .next_line()
                .await
                .map_err(|e| FeedError::ConnectionLost {
                    message: e.to_string(),
                })?;
            match line {
                None => return Ok(None),
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => match serde_json::from_str::<ChangeRecord>(&line) {
                    Ok(record) => return Ok(Some(record)),
                    Err(error) => {
                        warn!(%error, "skipping malformed change record");
                        continue;
                    }
                },
            }
        }
    }

    async fn close(&mut self) {}
}
