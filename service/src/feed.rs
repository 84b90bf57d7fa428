//! Change feed seam
//!
//! The upstream store exposes an ordered, resumable mutation feed; its
//! implementation (driver, wire protocol, aggregation pipeline) is an
//! external collaborator. The observer only relies on this contract: open a
//! stream, optionally after a resume token, and read records in feed order.

use async_trait::async_trait;

use webhook_core::{ChangeRecord, ResumeToken};

use crate::error::FeedError;

/// Factory for feed streams. Opening after a token replays everything the
/// store saw after that position.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn open(
        &self,
        resume_after: Option<ResumeToken>,
    ) -> Result<Box<dyn ChangeStream>, FeedError>;
}

/// One live tail over the feed. Totally ordered, single consumer.
#[async_trait]
pub trait ChangeStream: Send {
    /// Next record in feed order. `Ok(None)` means the feed ended cleanly
    /// (the observer treats that as a disconnect and reopens).
    async fn next(&mut self) -> Result<Option<ChangeRecord>, FeedError>;

    /// Release the stream's resources. Called before every reopen.
    async fn close(&mut self);
}

#[cfg(test)]
pub mod testing {
    //! Channel-backed feed used across the service tests.

    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;

    /// Scripted feed: each `open` serves the next batch of records or error.
    pub struct ScriptedFeed {
        batches: Mutex<VecDeque<Vec<Result<ChangeRecord, String>>>>,
        pub opens: AtomicUsize,
        pub last_resume: Mutex<Option<ResumeToken>>,
    }

    impl ScriptedFeed {
        pub fn new(batches: Vec<Vec<Result<ChangeRecord, String>>>) -> Arc<Self> {
            Arc::new(Self {
                batches: Mutex::new(batches.into()),
                opens: AtomicUsize::new(0),
                last_resume: Mutex::new(None),
            })
        }
    }

    #[async_trait]
    impl ChangeFeed for ScriptedFeed {
        async fn open(
            &self,
            resume_after: Option<ResumeToken>,
        ) -> Result<Box<dyn ChangeStream>, FeedError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            *self.last_resume.lock().unwrap() = resume_after;
            let batch = self.batches.lock().unwrap().pop_front().unwrap_or_default();
            Ok(Box::new(ScriptedStream {
                records: batch.into(),
            }))
        }
    }

    struct ScriptedStream {
        records: VecDeque<Result<ChangeRecord, String>>,
    }

    #[async_trait]
    impl ChangeStream for ScriptedStream {
        async fn next(&mut self) -> Result<Option<ChangeRecord>, FeedError> {
            match self.records.pop_front() {
                Some(Ok(record)) => Ok(Some(record)),
                Some(Err(message)) => Err(FeedError::ConnectionLost { message }),
                None => Ok(None),
            }
        }

        async fn close(&mut self) {}
    }
}
