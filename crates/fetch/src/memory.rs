//! Scriptable in-process [`MessageSource`].

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use chatsync_core::Record;

use crate::error::SourceError;
use crate::source::{FetchDirection, MessageSource};

#[derive(Debug, Clone)]
enum Step {
    Pass,
    Fail(SourceError),
    Delay(Duration),
}

#[derive(Debug, Default)]
struct State {
    channels: HashMap<String, Vec<Record>>,
    scripts: HashMap<String, VecDeque<Step>>,
    calls: Vec<(String, FetchDirection)>,
}

/// Channels held in memory, paged newest-first by message id.
///
/// Each identity has a queue of scripted steps consumed one per call, so
/// tests can inject failures, rate limits and slow responses in order.
/// Unknown identities answer [`SourceError::NotFound`].
#[derive(Debug, Default)]
pub struct InMemorySource {
    state: Mutex<State>,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut guard = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }

    /// Replace a channel's messages.
    pub fn set_messages(&self, identity: &str, messages: Vec<Record>) {
        self.with_state(|s| {
            s.channels.insert(identity.to_string(), messages);
        });
    }

    /// Add messages to a channel, creating it if needed.
    pub fn push_messages(&self, identity: &str, messages: impl IntoIterator<Item = Record>) {
        self.with_state(|s| s.channels.entry(identity.to_string()).or_default().extend(messages));
    }

    /// The next unscripted call to `identity` fails with `error`.
    pub fn fail_next(&self, identity: &str, error: SourceError) {
        self.script(identity, Step::Fail(error));
    }

    /// Let `successes` calls through, then fail with `error`.
    pub fn fail_after(&self, identity: &str, successes: usize, error: SourceError) {
        for _ in 0..successes {
            self.script(identity, Step::Pass);
        }
        self.script(identity, Step::Fail(error));
    }

    /// The next call to `identity` stalls for `delay` before answering.
    pub fn delay_next(&self, identity: &str, delay: Duration) {
        self.script(identity, Step::Delay(delay));
    }

    fn script(&self, identity: &str, step: Step) {
        self.with_state(|s| s.scripts.entry(identity.to_string()).or_default().push_back(step));
    }

    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<(String, FetchDirection)> {
        self.with_state(|s| s.calls.clone())
    }

    pub fn calls_for(&self, identity: &str) -> usize {
        self.with_state(|s| s.calls.iter().filter(|(i, _)| i == identity).count())
    }

    fn page(&self, identity: &str, direction: FetchDirection, limit: u32) -> Result<Vec<Record>, SourceError> {
        self.with_state(|s| {
            let messages = s
                .channels
                .get(identity)
                .ok_or_else(|| SourceError::NotFound(identity.to_string()))?;

            let mut page: Vec<Record> = messages
                .iter()
                .filter(|r| match direction {
                    FetchDirection::Newest => true,
                    FetchDirection::OlderThan(cursor) => r.external_message_id < cursor,
                })
                .cloned()
                .collect();
            page.sort_by(|a, b| b.external_message_id.cmp(&a.external_message_id));
            page.truncate(limit as usize);
            Ok(page)
        })
    }
}

#[async_trait]
impl MessageSource for InMemorySource {
    async fn fetch(
        &self,
        identity: &str,
        direction: FetchDirection,
        limit: u32,
    ) -> Result<Vec<Record>, SourceError> {
        let step = self.with_state(|s| {
            s.calls.push((identity.to_string(), direction));
            s.scripts.get_mut(identity).and_then(VecDeque::pop_front)
        });

        match step {
            Some(Step::Fail(error)) => return Err(error),
            Some(Step::Delay(delay)) => tokio::time::sleep(delay).await,
            Some(Step::Pass) | None => {}
        }
        self.page(identity, direction, limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatsync_core::MessageId;
    use chrono::{TimeZone, Utc};

    fn msg(id: i64) -> Record {
        Record::new(id, Utc.timestamp_opt(1_700_000_000 + id, 0).unwrap().fixed_offset(), "m")
    }

    #[tokio::test]
    async fn pages_newest_first_and_strictly_older_than_cursor() {
        let source = InMemorySource::new();
        source.set_messages("c", (1..=7).map(msg).collect());

        let newest = source.fetch("c", FetchDirection::Newest, 3).await.unwrap();
        let ids: Vec<i64> = newest.iter().map(|r| r.external_message_id.0).collect();
        assert_eq!(ids, vec![7, 6, 5]);

        let older = source.fetch("c", FetchDirection::OlderThan(MessageId(5)), 3).await.unwrap();
        let ids: Vec<i64> = older.iter().map(|r| r.external_message_id.0).collect();
        assert_eq!(ids, vec![4, 3, 2]);
    }

    #[tokio::test]
    async fn scripted_steps_run_in_order() {
        let source = InMemorySource::new();
        source.set_messages("c", vec![msg(1)]);
        source.fail_after("c", 1, SourceError::Transient("boom".into()));

        assert!(source.fetch("c", FetchDirection::Newest, 10).await.is_ok());
        assert_eq!(
            source.fetch("c", FetchDirection::Newest, 10).await,
            Err(SourceError::Transient("boom".into()))
        );
        assert!(source.fetch("c", FetchDirection::Newest, 10).await.is_ok());
        assert_eq!(source.calls_for("c"), 3);
    }

    #[tokio::test]
    async fn unknown_channel_is_not_found() {
        let source = InMemorySource::new();
        let err = source.fetch("nope", FetchDirection::Newest, 10).await.unwrap_err();
        assert_eq!(err, SourceError::NotFound("nope".into()));
    }
}
