//! Upload Queue
//!
//! Durable, ordered queue of completed sessions awaiting delivery. Items are delivered strictly
//! one at a time in enqueue order. Every mutation is persisted through the [`QueueStore`] before
//! it returns, so a restart never loses or duplicates a session. When the store fails the
//! in-memory queue stays authoritative and the next write stores the full list again.
use std::fmt::Debug;
use std::sync::{Arc, Mutex};

use crate::{
    api::{
        controller::{IngestionApi, QueueApi, QueueStore, SessionSink},
        model::QueueModelApi,
    },
    map_err,
    model::{
        queue::{QueueItem, UploadResponse, UploadStatus},
        session::Session,
    },
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::{error, info, warn};
use uuid::Uuid;

/// Queue shared between the recording controller and the core event loop.
pub type SharedQueue = Arc<Mutex<UploadQueue>>;

pub struct UploadQueue {
    items: Vec<QueueItem>,
    store: Box<dyn QueueStore>,
    /// Set while the store holds an older list than `items`.
    unsaved: bool,
}

impl Debug for UploadQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadQueue")
            .field("items", &self.items.len())
            .field("unsaved", &self.unsaved)
            .finish()
    }
}

impl UploadQueue {
    /// Loads the persisted queue. Items interrupted mid-upload are demoted to pending.
    pub fn open(store: Box<dyn QueueStore>) -> Result<Self> {
        let mut items = store.load()?;
        let mut demoted = 0;
        for item in items.iter_mut() {
            if item.recover_after_restart() {
                demoted += 1;
            }
        }
        let mut queue = Self {
            items,
            store,
            unsaved: false,
        };
        if demoted > 0 {
            warn!("{} interrupted uploads returned to pending", demoted);
            queue.persist()?;
        }
        info!("upload queue opened with {} items", queue.items.len());
        Ok(queue)
    }

    pub fn shared(self) -> SharedQueue {
        Arc::new(Mutex::new(self))
    }

    fn persist(&mut self) -> Result<()> {
        let result = self.store.save(&self.items);
        self.unsaved = result.is_err();
        result
    }

    /// True while the latest changes only exist in memory.
    pub fn is_unsaved(&self) -> bool {
        self.unsaved
    }

    /// Writes the queue again if an earlier write failed. Returns whether a write happened.
    pub fn sync(&mut self) -> Result<bool> {
        if !self.unsaved {
            return Ok(false);
        }
        self.persist()?;
        info!("upload queue saved after an earlier failure");
        Ok(true)
    }

    fn item_mut(&mut self, id: &Uuid) -> Option<&mut QueueItem> {
        self.items.iter_mut().find(|i| &i.id() == id)
    }

    fn remove_where(&mut self, pred: impl Fn(&QueueItem) -> bool) -> Result<usize> {
        let before = self.items.len();
        self.items.retain(|i| !pred(i));
        let removed = before - self.items.len();
        if removed > 0 {
            self.persist()?;
        }
        Ok(removed)
    }
}

#[async_trait]
impl QueueApi for UploadQueue {
    fn enqueue(&mut self, session: Session) -> Result<bool> {
        if self.get(&session.id).is_some() {
            warn!("session {} is already queued", session.id);
            self.sync()?;
            return Ok(false);
        }
        let id = session.id;
        self.items.push(QueueItem::new(session));
        info!("queued session {}", id);
        self.persist()
            .map_err(|e| anyhow!("session {} queued but not saved: {}", id, e))?;
        Ok(true)
    }

    fn begin_next(&mut self) -> Result<Option<Session>> {
        if self.is_uploading() {
            return Ok(None);
        }
        let Some(item) = self
            .items
            .iter_mut()
            .find(|i| i.status() == UploadStatus::Pending)
        else {
            return Ok(None);
        };
        item.mark_uploading()?;
        let session = item.session().clone();
        if let Err(e) = self.persist() {
            error!("failed to persist upload start of {}: {}", session.id, e);
        }
        Ok(Some(session))
    }

    fn finish(
        &mut self,
        id: Uuid,
        outcome: std::result::Result<UploadResponse, String>,
    ) -> Result<()> {
        let Some(item) = self.item_mut(&id) else {
            warn!("upload finished for unknown item {}", id);
            return Ok(());
        };
        match outcome {
            Ok(response) => {
                let valid = response.validation.is_valid;
                item.mark_completed(response)?;
                info!("session {} delivered (valid: {})", id, valid);
            }
            Err(message) => {
                warn!("delivery of session {} failed: {}", id, message);
                item.mark_failed(message)?;
            }
        }
        self.persist()
    }

    async fn process_next(&mut self, api: &dyn IngestionApi) -> Result<Option<QueueItem>> {
        let Some(session) = self.begin_next()? else {
            return Ok(None);
        };
        let outcome = map_err!(api.upload(&session).await);
        self.finish(session.id, outcome)?;
        Ok(self.get(&session.id).cloned())
    }

    fn retry_failed(&mut self) -> Result<usize> {
        let mut count = 0;
        for item in self
            .items
            .iter_mut()
            .filter(|i| i.status() == UploadStatus::Failed)
        {
            item.reset_for_retry()?;
            count += 1;
        }
        if count > 0 {
            self.persist()?;
            info!("{} failed uploads queued for retry", count);
        }
        Ok(count)
    }

    fn clear_completed(&mut self) -> Result<usize> {
        self.remove_where(|i| i.status() == UploadStatus::Completed)
    }

    fn clear_all(&mut self) -> Result<usize> {
        self.remove_where(|_| true)
    }
}

impl QueueModelApi for UploadQueue {
    fn items(&self) -> &[QueueItem] {
        &self.items
    }
}

impl SessionSink for SharedQueue {
    fn submit(&mut self, session: Session) -> Result<()> {
        let mut queue = match self.lock() {
            Ok(queue) => queue,
            Err(poisoned) => poisoned.into_inner(),
        };
        queue.enqueue(session)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::controller::{MockIngestionApi, MockQueueStore};
    use crate::components::storage::JsonFileStore;
    use crate::model::queue::ValidationResult;
    use crate::model::session::ActiveSession;
    use crate::model::tag::SessionTag;
    use tempdir::TempDir;

    fn session(subtag: &str) -> Session {
        let mut active = ActiveSession::new("u", SessionTag::WakeCheck, subtag.into(), 0, 5);
        active.append_rr(&[1000.0, 990.0]);
        active.freeze()
    }

    fn memory_queue() -> UploadQueue {
        let mut store = MockQueueStore::new();
        store.expect_load().returning(|| Ok(Vec::new()));
        store.expect_save().returning(|_| Ok(()));
        UploadQueue::open(Box::new(store)).unwrap()
    }

    fn accepted() -> UploadResponse {
        UploadResponse {
            validation: ValidationResult {
                is_valid: true,
                errors: vec![],
                warnings: vec!["short".into()],
            },
            session_summary: None,
            db_status: Some("stored".into()),
        }
    }

    #[test]
    fn test_enqueue_is_idempotent() {
        let mut queue = memory_queue();
        let s = session("a");
        assert!(queue.enqueue(s.clone()).unwrap());
        assert!(!queue.enqueue(s).unwrap());
        assert_eq!(queue.items().len(), 1);
        assert_eq!(queue.count(UploadStatus::Pending), 1);
    }

    /// Store whose first `failures` writes fail.
    fn flaky_store(failures: usize) -> MockQueueStore {
        let mut store = MockQueueStore::new();
        store.expect_load().returning(|| Ok(Vec::new()));
        let mut writes = 0;
        store.expect_save().returning(move |_| {
            writes += 1;
            if writes <= failures {
                Err(anyhow!("read-only filesystem"))
            } else {
                Ok(())
            }
        });
        store
    }

    #[test]
    fn test_failed_persist_keeps_session_queued() {
        let mut queue = UploadQueue::open(Box::new(flaky_store(2))).unwrap();
        let s = session("a");
        let err = queue.enqueue(s.clone()).unwrap_err().to_string();
        assert!(err.contains("queued but not saved"));
        assert_eq!(queue.get(&s.id).unwrap().status(), UploadStatus::Pending);
        assert!(queue.is_unsaved());

        // resubmitting retries the write without duplicating the item
        assert!(queue.enqueue(s.clone()).is_err());
        assert!(!queue.enqueue(s).unwrap());
        assert_eq!(queue.items().len(), 1);
        assert!(!queue.is_unsaved());
        assert!(!queue.sync().unwrap());
    }

    #[test]
    fn test_later_write_stores_unsaved_items() {
        let dir = TempDir::new("queue").unwrap();
        let path = dir.path().join("queue.json");
        let mut queue = UploadQueue::open(Box::new(flaky_store(1))).unwrap();
        let (a, b) = (session("a"), session("b"));
        assert!(queue.enqueue(a.clone()).is_err());
        assert!(queue.enqueue(b.clone()).unwrap());
        assert!(!queue.is_unsaved());

        // the store now works, so the next write contains both sessions
        queue.store = Box::new(JsonFileStore::new(&path));
        queue.begin_next().unwrap();
        let saved = JsonFileStore::new(&path).load().unwrap();
        let ids: Vec<_> = saved.iter().map(|i| i.id()).collect();
        assert_eq!(ids, vec![a.id, b.id]);
    }

    #[test]
    fn test_delivery_is_serial_and_ordered() {
        let mut queue = memory_queue();
        let (a, b) = (session("a"), session("b"));
        queue.enqueue(a.clone()).unwrap();
        queue.enqueue(b.clone()).unwrap();

        let first = queue.begin_next().unwrap().unwrap();
        assert_eq!(first.id, a.id);
        assert!(queue.begin_next().unwrap().is_none());
        assert_eq!(queue.count(UploadStatus::Uploading), 1);

        queue.finish(a.id, Ok(accepted())).unwrap();
        let second = queue.begin_next().unwrap().unwrap();
        assert_eq!(second.id, b.id);
        queue.finish(b.id, Err("timeout".into())).unwrap();
        assert!(queue.begin_next().unwrap().is_none());

        let done = queue.get(&a.id).unwrap();
        assert_eq!(done.status(), UploadStatus::Completed);
        assert_eq!(done.db_status(), Some("stored"));
        assert!(done.validation_report().unwrap().validation_result.is_valid);
        assert_eq!(queue.get(&b.id).unwrap().error_message(), Some("timeout"));
    }

    #[test]
    fn test_finish_unknown_item_is_ignored() {
        let mut queue = memory_queue();
        assert!(queue.finish(Uuid::new_v4(), Ok(accepted())).is_ok());
    }

    #[tokio::test]
    async fn test_process_next_failure_then_retry() {
        let mut queue = memory_queue();
        let s = session("a");
        queue.enqueue(s.clone()).unwrap();

        let mut api = MockIngestionApi::new();
        let mut calls = 0;
        api.expect_upload().times(2).returning(move |_| {
            calls += 1;
            if calls == 1 {
                Err(anyhow!("server returned HTTP 500"))
            } else {
                Ok(accepted())
            }
        });

        let item = queue.process_next(&api).await.unwrap().unwrap();
        assert_eq!(item.status(), UploadStatus::Failed);
        assert_eq!(item.error_message(), Some("server returned HTTP 500"));
        assert!(queue.process_next(&api).await.unwrap().is_none());

        assert_eq!(queue.retry_failed().unwrap(), 1);
        let item = queue.process_next(&api).await.unwrap().unwrap();
        assert_eq!(item.status(), UploadStatus::Completed);
        assert!(item.error_message().is_none());
        assert_eq!(item.attempts(), 2);
        let report = item.validation_report().unwrap();
        assert!(report.validation_result.is_valid);
        assert_eq!(report.validation_result.warnings, vec!["short".to_string()]);
        assert_eq!(item.db_status(), Some("stored"));
    }

    #[test]
    fn test_clear_operations() {
        let mut queue = memory_queue();
        let (a, b, c) = (session("a"), session("b"), session("c"));
        for s in [&a, &b, &c] {
            queue.enqueue(s.clone()).unwrap();
        }
        queue.begin_next().unwrap();
        queue.finish(a.id, Ok(accepted())).unwrap();
        queue.begin_next().unwrap();
        queue.finish(b.id, Err("HTTP 502".into())).unwrap();

        assert_eq!(queue.clear_completed().unwrap(), 1);
        assert_eq!(queue.items().len(), 2);
        assert_eq!(queue.clear_completed().unwrap(), 0);
        assert_eq!(queue.clear_all().unwrap(), 2);
        assert!(queue.items().is_empty());
    }

    #[test]
    fn test_restart_restores_queue() {
        let dir = TempDir::new("queue").unwrap();
        let path = dir.path().join("queue.json");
        let (a, b, c) = (session("a"), session("b"), session("c"));
        {
            let mut queue = UploadQueue::open(Box::new(JsonFileStore::new(&path))).unwrap();
            for s in [&a, &b, &c] {
                queue.enqueue(s.clone()).unwrap();
            }
            queue.begin_next().unwrap();
            queue.finish(a.id, Ok(accepted())).unwrap();
            // b is in flight when the process dies
            queue.begin_next().unwrap();
        }

        let mut queue = UploadQueue::open(Box::new(JsonFileStore::new(&path))).unwrap();
        let statuses: Vec<_> = queue.items().iter().map(|i| i.status()).collect();
        assert_eq!(
            statuses,
            vec![
                UploadStatus::Completed,
                UploadStatus::Pending,
                UploadStatus::Pending
            ]
        );
        assert_eq!(queue.begin_next().unwrap().unwrap().id, b.id);

        let reloaded = JsonFileStore::new(&path).load().unwrap();
        assert_eq!(reloaded[1].status(), UploadStatus::Uploading);
    }

    #[test]
    fn test_shared_queue_as_session_sink() {
        let mut shared = memory_queue().shared();
        let s = session("a");
        shared.submit(s.clone()).unwrap();
        shared.submit(s).unwrap();
        assert_eq!(shared.lock().unwrap().items().len(), 1);
    }
}
