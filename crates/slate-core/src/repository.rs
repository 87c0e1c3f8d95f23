//! Mode-independent content operations.
//!
//! HTTP handlers talk to a [`ContentRepository`] and never branch on the
//! deployment mode. [`SharedRepository`] serves every caller from one
//! [`ContentStore`]; [`SessionRepository`] serves each browser session from
//! its own projected copy of the seed. Both enforce the same item ceiling.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};

use crate::content::{
    CONTENT_BUCKET, Content, ContentSet, PARTITIONS, apply_update, apply_update_to, generate_id,
    prepare_new,
};
use crate::envelope::ExportEnvelope;
use crate::error::ContentError;
use crate::projector::SessionContentProjector;
use crate::session::Session;
use crate::store::ContentStore;

/// Which backing a repository uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// One content set shared by every caller.
    Shared,
    /// A private content set per browser session.
    Session,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Shared => f.write_str("shared"),
            Self::Session => f.write_str("session"),
        }
    }
}

/// Content CRUD plus bulk export/import, scoped to the caller's session.
///
/// Shared-mode implementations ignore the session.
#[async_trait::async_trait]
pub trait ContentRepository: Send + Sync + 'static {
    /// The backing this repository uses.
    fn mode(&self) -> Mode;

    /// Look up one item. Unknown ids are `Ok(None)`.
    async fn get(&self, session: &mut Session, id: &str) -> Result<Option<Content>, ContentError>;

    /// Every item, in unspecified order.
    async fn list(&self, session: &mut Session) -> Result<Vec<Content>, ContentError>;

    /// Create an item under a fresh id.
    async fn create(
        &self,
        session: &mut Session,
        body: Map<String, Value>,
    ) -> Result<Content, ContentError>;

    /// Merge `body` into an existing item.
    async fn update(
        &self,
        session: &mut Session,
        id: &str,
        body: Map<String, Value>,
    ) -> Result<Content, ContentError>;

    /// Remove an item. Unknown ids succeed.
    async fn delete(&self, session: &mut Session, id: &str) -> Result<(), ContentError>;

    /// Everything visible to the caller as an export envelope.
    async fn export(&self, session: &mut Session) -> Result<ExportEnvelope, ContentError>;

    /// Merge an envelope's content into the caller's view. Returns the
    /// number of content items imported.
    async fn import(
        &self,
        session: &mut Session,
        envelope: ExportEnvelope,
    ) -> Result<usize, ContentError>;
}

/// Reject an import whose content partition alone is over the ceiling, and
/// decode every item in it. Nothing is written by this check.
fn checked_import(envelope: &ExportEnvelope, limit: usize) -> Result<ContentSet, ContentError> {
    let partition = envelope.require_content()?;
    if partition.len() > limit {
        return Err(ContentError::Capacity {
            limit,
            requested: partition.len(),
        });
    }
    partition
        .iter()
        .map(|(key, raw)| {
            Content::decode(key, raw.get().as_bytes())
                .map(|item| (key.clone(), item))
                .map_err(|e| ContentError::Validation {
                    reason: format!("invalid import item: {e}"),
                })
        })
        .collect()
}

/// Shared-mode repository over a [`ContentStore`].
#[derive(Debug)]
pub struct SharedRepository {
    store: Arc<ContentStore>,
    limit: usize,
}

impl SharedRepository {
    #[must_use]
    pub fn new(store: Arc<ContentStore>, limit: usize) -> Self {
        Self { store, limit }
    }
}

#[async_trait::async_trait]
impl ContentRepository for SharedRepository {
    fn mode(&self) -> Mode {
        Mode::Shared
    }

    async fn get(&self, _session: &mut Session, id: &str) -> Result<Option<Content>, ContentError> {
        self.store
            .get(id)
            .await?
            .map(|bytes| Content::decode(id, &bytes))
            .transpose()
    }

    async fn list(&self, _session: &mut Session) -> Result<Vec<Content>, ContentError> {
        self.store.list().await
    }

    async fn create(
        &self,
        _session: &mut Session,
        body: Map<String, Value>,
    ) -> Result<Content, ContentError> {
        let id = generate_id()?;
        let prepared = prepare_new(body, &id, Utc::now())?;
        self.store
            .insert_bounded(&id, &prepared.payload, self.limit)
            .await?;
        tracing::info!(id = %id, "content created");
        Ok(prepared.item)
    }

    async fn update(
        &self,
        _session: &mut Session,
        id: &str,
        body: Map<String, Value>,
    ) -> Result<Content, ContentError> {
        let existing = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| ContentError::NotFound { id: id.to_owned() })?;
        let prepared = apply_update(&existing, id, body, Utc::now())?;
        self.store.update(id, &prepared.payload).await?;
        tracing::info!(id = %id, "content updated");
        Ok(prepared.item)
    }

    async fn delete(&self, _session: &mut Session, id: &str) -> Result<(), ContentError> {
        self.store.delete(id).await?;
        tracing::info!(id = %id, "content deleted");
        Ok(())
    }

    async fn export(&self, _session: &mut Session) -> Result<ExportEnvelope, ContentError> {
        self.store.export().await
    }

    async fn import(
        &self,
        _session: &mut Session,
        envelope: ExportEnvelope,
    ) -> Result<usize, ContentError> {
        let imported = checked_import(&envelope, self.limit)?.len();
        self.store.import_bounded(envelope, self.limit).await?;
        tracing::info!(items = imported, "content imported");
        Ok(imported)
    }
}

/// Session-mode repository over a [`SessionContentProjector`].
#[derive(Debug)]
pub struct SessionRepository {
    projector: Arc<SessionContentProjector>,
}

impl SessionRepository {
    #[must_use]
    pub fn new(projector: Arc<SessionContentProjector>) -> Self {
        Self { projector }
    }
}

#[async_trait::async_trait]
impl ContentRepository for SessionRepository {
    fn mode(&self) -> Mode {
        Mode::Session
    }

    async fn get(&self, session: &mut Session, id: &str) -> Result<Option<Content>, ContentError> {
        let mut set = self.projector.read(session).await?;
        Ok(set.remove(id))
    }

    async fn list(&self, session: &mut Session) -> Result<Vec<Content>, ContentError> {
        Ok(self.projector.read(session).await?.into_values().collect())
    }

    async fn create(
        &self,
        session: &mut Session,
        body: Map<String, Value>,
    ) -> Result<Content, ContentError> {
        let mut set = self.projector.read(session).await?;
        let limit = self.projector.limit();
        if set.len() >= limit {
            return Err(ContentError::Capacity {
                limit,
                requested: set.len().saturating_add(1),
            });
        }
        let id = generate_id()?;
        let prepared = prepare_new(body, &id, Utc::now())?;
        set.insert(id, prepared.item.clone());
        self.projector.write(session, &set).await?;
        Ok(prepared.item)
    }

    async fn update(
        &self,
        session: &mut Session,
        id: &str,
        body: Map<String, Value>,
    ) -> Result<Content, ContentError> {
        let mut set = self.projector.read(session).await?;
        let existing = set
            .get(id)
            .ok_or_else(|| ContentError::NotFound { id: id.to_owned() })?;
        let prepared = apply_update_to(existing, body, Utc::now())?;
        set.insert(id.to_owned(), prepared.item.clone());
        self.projector.write(session, &set).await?;
        Ok(prepared.item)
    }

    async fn delete(&self, session: &mut Session, id: &str) -> Result<(), ContentError> {
        let mut set = self.projector.read(session).await?;
        if set.remove(id).is_some() {
            self.projector.write(session, &set).await?;
        }
        Ok(())
    }

    async fn export(&self, session: &mut Session) -> Result<ExportEnvelope, ContentError> {
        let set = self.projector.read(session).await?;
        let mut envelope = ExportEnvelope::default();
        for name in PARTITIONS {
            envelope.ensure_partition(name);
        }
        for (id, item) in &set {
            envelope.insert(CONTENT_BUCKET, id, item.encode()?)?;
        }
        Ok(envelope)
    }

    async fn import(
        &self,
        session: &mut Session,
        envelope: ExportEnvelope,
    ) -> Result<usize, ContentError> {
        let incoming = checked_import(&envelope, self.projector.limit())?;
        let imported = incoming.len();
        let ignored: Vec<&str> = envelope
            .partition_names()
            .filter(|name| *name != CONTENT_BUCKET)
            .collect();
        if !ignored.is_empty() {
            tracing::debug!(partitions = ?ignored, "ignoring non-content partitions in session import");
        }

        let mut set = self.projector.read(session).await?;
        set.extend(incoming);
        self.projector.write(session, &set).await?;
        Ok(imported)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::content::MAX_ITEMS;
    use crate::session::{MemorySessionStore, SessionStore};
    use serde_json::json;
    use slate_storage::MemoryBackend;

    fn body(title: &str) -> Map<String, Value> {
        json!({ "title": title, "slug": title.to_lowercase() })
            .as_object()
            .cloned()
            .unwrap()
    }

    fn shared() -> SharedRepository {
        let store = ContentStore::new(Arc::new(MemoryBackend::new()));
        SharedRepository::new(Arc::new(store), MAX_ITEMS)
    }

    fn per_session(seed: ContentSet) -> (SessionRepository, Arc<MemorySessionStore>) {
        let sessions = Arc::new(MemorySessionStore::default());
        let projector = SessionContentProjector::new(seed, sessions.clone());
        (SessionRepository::new(Arc::new(projector)), sessions)
    }

    fn envelope_of(n: usize) -> ExportEnvelope {
        let mut envelope = ExportEnvelope::default();
        for i in 0..n {
            let id = format!("{i:016x}");
            let payload = prepare_new(body("Imported"), &id, Utc::now()).unwrap().payload;
            envelope.insert(CONTENT_BUCKET, &id, payload).unwrap();
        }
        envelope
    }

    async fn exercise_crud(repo: &dyn ContentRepository, session: &mut Session) {
        let created = repo.create(session, body("Hello")).await.unwrap();
        assert_eq!(created.id.len(), 16);
        assert_eq!(created.status, "draft");

        let fetched = repo.get(session, &created.id).await.unwrap().unwrap();
        assert_eq!(fetched, created);

        let updated = repo
            .update(session, &created.id, body("Changed"))
            .await
            .unwrap();
        assert_eq!(updated.title, "Changed");
        assert_eq!(updated.created_at, created.created_at);
        assert!(updated.updated_at >= created.updated_at);

        repo.delete(session, &created.id).await.unwrap();
        repo.delete(session, &created.id).await.unwrap();
        assert!(repo.get(session, &created.id).await.unwrap().is_none());

        let missing = repo.update(session, &created.id, body("x")).await;
        assert!(matches!(missing, Err(ContentError::NotFound { .. })));
    }

    #[tokio::test]
    async fn shared_crud() {
        let repo = shared();
        let mut session = Session::issue().unwrap();
        exercise_crud(&repo, &mut session).await;
    }

    #[tokio::test]
    async fn session_crud() {
        let (repo, sessions) = per_session(ContentSet::new());
        let mut session = sessions.load(None).await.unwrap();
        exercise_crud(&repo, &mut session).await;
    }

    #[tokio::test]
    async fn sessions_do_not_see_each_other() {
        let (repo, sessions) = per_session(ContentSet::new());
        let mut a = sessions.load(None).await.unwrap();
        let mut b = sessions.load(None).await.unwrap();

        let created = repo.create(&mut a, body("Mine")).await.unwrap();
        assert!(repo.get(&mut b, &created.id).await.unwrap().is_none());
        assert!(repo.list(&mut b).await.unwrap().is_empty());

        repo.delete(&mut b, &created.id).await.unwrap();
        assert!(repo.get(&mut a, &created.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn fifty_first_create_is_rejected_in_both_modes() {
        let (session_repo, sessions) = per_session(ContentSet::new());
        let shared_repo = shared();
        let repos: [&dyn ContentRepository; 2] = [&shared_repo, &session_repo];

        for repo in repos {
            let mut session = sessions.load(None).await.unwrap();
            for n in 0..MAX_ITEMS {
                repo.create(&mut session, body(&format!("Item {n}"))).await.unwrap();
            }
            let result = repo.create(&mut session, body("One too many")).await;
            assert!(
                matches!(result, Err(ContentError::Capacity { limit: MAX_ITEMS, .. })),
                "{} mode accepted item 51",
                repo.mode()
            );
            assert_eq!(repo.list(&mut session).await.unwrap().len(), MAX_ITEMS);
        }
    }

    #[tokio::test]
    async fn oversized_import_is_rejected_before_any_write() {
        let (session_repo, sessions) = per_session(ContentSet::new());
        let shared_repo = shared();
        let repos: [&dyn ContentRepository; 2] = [&shared_repo, &session_repo];

        for repo in repos {
            let mut session = sessions.load(None).await.unwrap();
            let result = repo.import(&mut session, envelope_of(MAX_ITEMS + 1)).await;
            assert!(matches!(result, Err(ContentError::Capacity { .. })));
            assert!(repo.list(&mut session).await.unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn import_merge_past_the_ceiling_is_rejected() {
        let (repo, sessions) = per_session(ContentSet::new());
        let mut session = sessions.load(None).await.unwrap();
        repo.create(&mut session, body("Existing")).await.unwrap();

        let result = repo.import(&mut session, envelope_of(MAX_ITEMS)).await;
        assert!(matches!(result, Err(ContentError::Capacity { .. })));
        assert_eq!(repo.list(&mut session).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn import_requires_content_partition() {
        let repo = shared();
        let mut session = Session::issue().unwrap();
        let envelope = ExportEnvelope::parse(br#"{"settings":{}}"#).unwrap();
        let result = repo.import(&mut session, envelope).await;
        assert!(matches!(result, Err(ContentError::Validation { .. })));
    }

    #[tokio::test]
    async fn import_rejects_undecodable_items() {
        let (repo, sessions) = per_session(ContentSet::new());
        let mut session = sessions.load(None).await.unwrap();
        let envelope = ExportEnvelope::parse(br#"{"content":{"x":[1,2]}}"#).unwrap();
        let result = repo.import(&mut session, envelope).await;
        assert!(matches!(result, Err(ContentError::Validation { .. })));
    }

    #[tokio::test]
    async fn session_export_has_every_partition_and_reimports() {
        let (repo, sessions) = per_session(ContentSet::new());
        let mut session = sessions.load(None).await.unwrap();
        let created = repo.create(&mut session, body("Exported")).await.unwrap();

        let envelope = repo.export(&mut session).await.unwrap();
        let names: Vec<&str> = envelope.partition_names().collect();
        assert_eq!(names, vec!["content", "settings", "users"]);

        let mut other = sessions.load(None).await.unwrap();
        assert_eq!(repo.import(&mut other, envelope).await.unwrap(), 1);
        assert_eq!(repo.get(&mut other, &created.id).await.unwrap(), Some(created));
    }

    fn hello_seed() -> ContentSet {
        let item = prepare_new(body("Hello"), "00000000000000a1", Utc::now()).unwrap().item;
        ContentSet::from([(item.id.clone(), item)])
    }

    #[tokio::test]
    async fn editing_a_seed_item_stays_in_its_session() {
        let (repo, sessions) = per_session(hello_seed());
        let mut a = sessions.load(None).await.unwrap();
        let mut b = sessions.load(None).await.unwrap();

        let edited = repo.update(&mut a, "00000000000000a1", body("Hi")).await.unwrap();
        assert_eq!(edited.title, "Hi");

        let theirs = repo.get(&mut b, "00000000000000a1").await.unwrap().unwrap();
        assert_eq!(theirs.title, "Hello");
        let mine = repo.get(&mut a, "00000000000000a1").await.unwrap().unwrap();
        assert_eq!(mine.title, "Hi");
    }

    #[tokio::test]
    async fn export_then_import_in_the_same_session_is_stable() {
        let (repo, sessions) = per_session(hello_seed());
        let mut session = sessions.load(None).await.unwrap();
        repo.create(&mut session, body("Second")).await.unwrap();
        let mut before = repo.list(&mut session).await.unwrap();

        let envelope = repo.export(&mut session).await.unwrap();
        let reparsed = ExportEnvelope::parse(&envelope.to_vec().unwrap()).unwrap();
        assert_eq!(repo.import(&mut session, reparsed).await.unwrap(), 2);

        let mut after = repo.list(&mut session).await.unwrap();
        before.sort_by(|x, y| x.id.cmp(&y.id));
        after.sort_by(|x, y| x.id.cmp(&y.id));
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn import_accepts_items_without_timestamps() {
        let (session_repo, sessions) = per_session(ContentSet::new());
        let shared_repo = shared();
        let repos: [&dyn ContentRepository; 2] = [&shared_repo, &session_repo];

        for repo in repos {
            let mut session = sessions.load(None).await.unwrap();
            let envelope = ExportEnvelope::parse(br#"{"content":{"k":{"id":"k","title":"x"}}}"#).unwrap();
            assert_eq!(repo.import(&mut session, envelope).await.unwrap(), 1, "{} mode", repo.mode());

            let item = repo.get(&mut session, "k").await.unwrap().unwrap();
            assert_eq!(item.title, "x");
            assert_eq!(item.status, "draft");
        }
    }

    #[tokio::test]
    async fn imported_items_are_reachable_by_their_key() {
        let (session_repo, sessions) = per_session(ContentSet::new());
        let shared_repo = shared();
        let repos: [&dyn ContentRepository; 2] = [&shared_repo, &session_repo];

        for repo in repos {
            let mut session = sessions.load(None).await.unwrap();
            let envelope =
                ExportEnvelope::parse(br#"{"content":{"keyA":{"id":"idB","title":"Moved"}}}"#).unwrap();
            repo.import(&mut session, envelope).await.unwrap();

            let listed: Vec<String> = repo
                .list(&mut session)
                .await
                .unwrap()
                .into_iter()
                .map(|c| c.id)
                .collect();
            assert_eq!(listed, vec!["keyA".to_owned()], "{} mode", repo.mode());

            let updated = repo.update(&mut session, "keyA", body("Renamed")).await.unwrap();
            assert_eq!(updated.id, "keyA");
            repo.delete(&mut session, "keyA").await.unwrap();
            assert!(repo.list(&mut session).await.unwrap().is_empty());
        }
    }
}
