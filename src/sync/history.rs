use std::sync::Arc;

use tracing::debug;

use super::Pacer;
use crate::snowflake::Snowflake;
use crate::upstream::{MessageDto, UpstreamSource};
use crate::utils::SyncError;

/// Walks one channel's history backwards, newest first, in batches.
///
/// Stops on an empty page, on reaching the resume boundary (messages at or
/// below it are trimmed away), or once `max_messages` have been yielded.
pub struct HistoryPager {
    upstream: Arc<dyn UpstreamSource>,
    pacer: Arc<Pacer>,
    channel_id: Snowflake,
    boundary: Option<Snowflake>,
    batch_size: u32,
    max_messages: usize,
    before: Option<Snowflake>,
    fetched: usize,
    newest: Option<Snowflake>,
    done: bool,
}

impl HistoryPager {
    pub fn new(
        upstream: Arc<dyn UpstreamSource>,
        pacer: Arc<Pacer>,
        channel_id: Snowflake,
        boundary: Option<Snowflake>,
        batch_size: u32,
        max_messages: usize,
    ) -> Self {
        Self {
            upstream,
            pacer,
            channel_id,
            boundary,
            batch_size: batch_size.max(1),
            max_messages,
            before: None,
            fetched: 0,
            newest: None,
            done: false,
        }
    }

    /// The next batch, or `None` once the walk is over. Never restarts.
    pub async fn next_batch(&mut self) -> Result<Option<Vec<MessageDto>>, SyncError> {
        if self.done {
            return Ok(None);
        }
        let remaining = self.max_messages.saturating_sub(self.fetched);
        if remaining == 0 {
            self.done = true;
            return Ok(None);
        }
        let limit = (self.batch_size as usize).min(remaining) as u32;

        self.pacer.wait().await;
        let mut batch = self
            .upstream
            .fetch_messages(self.channel_id, self.before, limit)
            .await?;
        if batch.is_empty() {
            self.done = true;
            return Ok(None);
        }
        batch.sort_by(|a, b| b.id.cmp(&a.id));
        batch.truncate(limit as usize);
        self.before = batch.last().map(|message| message.id);

        if let Some(boundary) = self.boundary {
            if batch.iter().any(|message| message.id <= boundary) {
                batch.retain(|message| message.id > boundary);
                self.done = true;
                debug!(
                    "channel {} reached resume boundary {}",
                    self.channel_id, boundary
                );
            } else if self.before.map(Snowflake::get) == boundary.get().checked_add(1) {
                // The page ended right above the boundary: nothing newer is left.
                self.done = true;
            }
        }

        self.fetched += batch.len();
        if self.fetched >= self.max_messages {
            self.done = true;
        }
        if batch.is_empty() {
            return Ok(None);
        }
        if self.newest.is_none() {
            self.newest = batch.first().map(|message| message.id);
        }
        Ok(Some(batch))
    }

    /// Newest message id yielded so far; the cursor to confirm on completion.
    pub fn newest(&self) -> Option<Snowflake> {
        self.newest
    }

    pub fn fetched(&self) -> usize {
        self.fetched
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::test_support::{FakeUpstream, message_dto, sf};

    fn upstream_with(count: u64) -> Arc<FakeUpstream> {
        let upstream = Arc::new(FakeUpstream::default());
        upstream.add_messages(10, (1..=count).map(|id| message_dto(id, 10, 5)));
        upstream
    }

    fn pager(
        upstream: &Arc<FakeUpstream>,
        boundary: Option<u64>,
        batch: u32,
        cap: usize,
    ) -> HistoryPager {
        HistoryPager::new(
            upstream.clone(),
            Arc::new(Pacer::new(Duration::ZERO)),
            sf(10),
            boundary.map(sf),
            batch,
            cap,
        )
    }

    async fn drain(pager: &mut HistoryPager) -> Vec<usize> {
        let mut sizes = Vec::new();
        while let Some(batch) = pager.next_batch().await.unwrap() {
            sizes.push(batch.len());
        }
        sizes
    }

    #[tokio::test]
    async fn pages_newest_first_until_exhausted() {
        let upstream = upstream_with(120);
        let mut pager = pager(&upstream, None, 50, 10_000);

        let first = pager.next_batch().await.unwrap().unwrap();
        assert_eq!(first.first().map(|m| m.id), Some(sf(120)));
        assert_eq!(first.last().map(|m| m.id), Some(sf(71)));

        let mut sizes = vec![first.len()];
        sizes.extend(drain(&mut pager).await);
        assert_eq!(sizes, vec![50, 50, 20]);
        assert_eq!(pager.newest(), Some(sf(120)));
        assert_eq!(pager.fetched(), 120);
        assert!(pager.next_batch().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn resume_boundary_trims_and_stops() {
        let upstream = upstream_with(600);
        let mut pager = pager(&upstream, Some(100), 100, 10_000);

        let mut ids = Vec::new();
        while let Some(batch) = pager.next_batch().await.unwrap() {
            ids.extend(batch.into_iter().map(|m| m.id.get()));
        }
        assert_eq!(ids.len(), 500);
        assert!(ids.iter().all(|id| *id > 100));
        // Nothing older than the page holding the boundary was requested.
        let befores: Vec<Option<Snowflake>> = upstream
            .message_calls_for(10)
            .into_iter()
            .map(|(before, _)| before)
            .collect();
        assert_eq!(befores.last().copied().flatten(), Some(sf(201)));
    }

    #[tokio::test]
    async fn boundary_at_newest_message_yields_nothing() {
        let upstream = upstream_with(30);
        let mut pager = pager(&upstream, Some(30), 50, 10_000);
        assert!(pager.next_batch().await.unwrap().is_none());
        assert_eq!(pager.newest(), None);
    }

    #[tokio::test]
    async fn cap_limits_total_and_last_request() {
        let upstream = upstream_with(120);
        let mut pager = pager(&upstream, None, 50, 70);
        assert_eq!(drain(&mut pager).await, vec![50, 20]);
        let limits: Vec<u32> = upstream
            .message_calls_for(10)
            .into_iter()
            .map(|(_, limit)| limit)
            .collect();
        assert_eq!(limits, vec![50, 20]);
    }
}
