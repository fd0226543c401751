use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::local_state::{
    KEY_FACTS, KEY_LAST_SYNC, KEY_PERSONAL_HISTORY, KEY_SHARED_HISTORY, LocalStateStore,
    StateStoreError,
};
use crate::models::{
    InlineImage, MessageRole, PersonalMessage, SharedEntryKind, SharedMemoryEntry, UserProfile,
};
use crate::users::{authorize, partner_of};

mod facts;

pub const SHARED_HISTORY_MAX_ENTRIES: usize = 100;
pub const PERSONAL_HISTORY_MAX_ENTRIES: usize = 200;
pub const PERSONAL_FACT_SCOPE: &str = "personal";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactBook {
    scopes: BTreeMap<String, BTreeMap<String, String>>,
}

impl FactBook {
    pub fn get(&self, scope: &str, key: &str) -> Option<&str> {
        self.scopes
            .get(scope)
            .and_then(|facts| facts.get(key))
            .map(String::as_str)
    }

    pub fn scope(&self, scope: &str) -> Option<&BTreeMap<String, String>> {
        self.scopes.get(scope)
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.values().all(BTreeMap::is_empty)
    }

    /// Returns `true` when the stored value changed.
    pub fn upsert(&mut self, scope: &str, key: &str, value: &str) -> bool {
        let facts = self.scopes.entry(scope.to_string()).or_default();
        match facts.get(key) {
            Some(existing) if existing == value => false,
            _ => {
                facts.insert(key.to_string(), value.to_string());
                true
            }
        }
    }

    fn iter(&self) -> impl Iterator<Item = (&String, &BTreeMap<String, String>)> {
        self.scopes.iter().filter(|(_, facts)| !facts.is_empty())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub merged: usize,
    pub skipped: usize,
    pub facts_updated: usize,
}

/// The state blobs a `MemoryStore` keeps in the local state store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Blob {
    Personal,
    Shared,
    Facts,
    LastSync,
}

impl Blob {
    fn key(self) -> &'static str {
        match self {
            Self::Personal => KEY_PERSONAL_HISTORY,
            Self::Shared => KEY_SHARED_HISTORY,
            Self::Facts => KEY_FACTS,
            Self::LastSync => KEY_LAST_SYNC,
        }
    }
}

/// An encoded blob not yet handed to the state store. `raw: None` removes
/// the key.
#[derive(Debug)]
struct UnsavedBlob {
    blob: Blob,
    raw: Option<String>,
    generation: u64,
}

/// Personal history, shared history and extracted facts for the running
/// session. Every mutation is written through to the local state store;
/// behind a `SharedMemory` the write happens after the lock is released.
pub struct MemoryStore {
    state: Arc<dyn LocalStateStore>,
    current_user: Option<UserProfile>,
    personal: VecDeque<PersonalMessage>,
    shared: VecDeque<SharedMemoryEntry>,
    facts: FactBook,
    last_sync: Option<DateTime<Utc>>,
    write_behind: bool,
    unsaved: Vec<UnsavedBlob>,
    generation: u64,
}

impl MemoryStore {
    pub fn load(state: Arc<dyn LocalStateStore>) -> Result<Self, StateStoreError> {
        let personal = state
            .load_json::<VecDeque<PersonalMessage>>(KEY_PERSONAL_HISTORY)?
            .unwrap_or_default();
        let shared = state
            .load_json::<VecDeque<SharedMemoryEntry>>(KEY_SHARED_HISTORY)?
            .unwrap_or_default();
        let facts = state.load_json::<FactBook>(KEY_FACTS)?.unwrap_or_default();
        let last_sync = state.load_json::<DateTime<Utc>>(KEY_LAST_SYNC)?;

        Ok(Self {
            state,
            current_user: None,
            personal,
            shared,
            facts,
            last_sync,
            write_behind: false,
            unsaved: Vec::new(),
            generation: 0,
        })
    }

    pub fn set_current_user(&mut self, user: Option<UserProfile>) {
        self.current_user = user;
    }

    pub fn current_user(&self) -> Option<&UserProfile> {
        self.current_user.as_ref()
    }

    pub fn personal_history(&self) -> &VecDeque<PersonalMessage> {
        &self.personal
    }

    pub fn shared_history(&self) -> &VecDeque<SharedMemoryEntry> {
        &self.shared
    }

    pub fn facts(&self) -> &FactBook {
        &self.facts
    }

    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        self.last_sync
    }

    pub fn set_last_sync(&mut self, at: DateTime<Utc>) {
        self.last_sync = Some(at);
        self.persist(Blob::LastSync);
    }

    pub fn append_user_message(&mut self, text: &str) -> Option<SharedMemoryEntry> {
        self.append_message(MessageRole::User, SharedEntryKind::UserMessage, text)
    }

    pub fn append_ai_response(&mut self, text: &str) -> Option<SharedMemoryEntry> {
        self.append_message(MessageRole::Ai, SharedEntryKind::AiResponse, text)
    }

    /// Stores an image-memory record for the current user. Returns `None`
    /// when nobody is logged in.
    pub fn record_shared_image(&mut self, image: InlineImage) -> Option<SharedMemoryEntry> {
        let user = self.current_user.as_ref()?;
        let entry = SharedMemoryEntry::new(
            user.id.clone(),
            SharedEntryKind::SharedImage,
            format!("{} shared a picture", user.display_name),
            Utc::now(),
        )
        .with_image(image);

        self.insert_shared(entry.clone());
        self.persist(Blob::Shared);
        Some(entry)
    }

    /// Applies the fact rules to `text`. Changed facts are returned as records
    /// to push when a user is logged in.
    pub fn extract_facts(&mut self, text: &str) -> Vec<SharedMemoryEntry> {
        let scope = self.fact_scope();
        let now = Utc::now();
        let mut changed = false;
        let mut updates = Vec::new();

        for (key, value) in facts::extract(text) {
            if !self.facts.upsert(&scope, &key, &value) {
                continue;
            }
            changed = true;
            debug!(scope = %scope, fact_key = %key, "fact updated");

            if let Some(user) = &self.current_user {
                updates.push(SharedMemoryEntry::fact(user.id.clone(), key, value, now));
            }
        }

        if changed {
            self.persist(Blob::Facts);
        }
        updates
    }

    pub fn prior_turns(&self, limit: usize) -> Vec<PersonalMessage> {
        let skip = self.personal.len().saturating_sub(limit);
        self.personal.iter().skip(skip).cloned().collect()
    }

    /// Renders identity, history and facts into a prompt-ready blob. Pure
    /// function of the in-memory state.
    pub fn build_context(&self) -> String {
        let mut sections = Vec::new();

        match &self.current_user {
            Some(user) => {
                let mut identity = format!(
                    "Current user: {} ({})",
                    user.display_name, user.relationship
                );
                if let Some(partner) = partner_of(&user.id) {
                    identity.push_str(&format!(
                        "\nPartner: {} ({})",
                        partner.display_name, partner.relationship
                    ));
                }
                sections.push(identity);

                let history = self
                    .shared
                    .iter()
                    .map(render_shared_entry)
                    .collect::<Vec<_>>();
                sections.push(format!(
                    "Shared conversation history:\n{}",
                    if history.is_empty() {
                        "(none yet)".to_string()
                    } else {
                        history.join("\n")
                    }
                ));
            }
            None => {
                sections.push("Current user: unknown (not logged in)".to_string());
                let history = self
                    .personal
                    .iter()
                    .map(|entry| format!("{}: {}", entry.role.as_str(), entry.text))
                    .collect::<Vec<_>>();
                sections.push(format!(
                    "Past conversation history:\n{}",
                    if history.is_empty() {
                        "(none yet)".to_string()
                    } else {
                        history.join("\n")
                    }
                ));
            }
        }

        if !self.facts.is_empty() {
            let rendered = self
                .facts
                .iter()
                .map(|(scope, facts)| {
                    let owner = authorize(scope)
                        .map(|user| user.display_name)
                        .unwrap_or_else(|| "User".to_string());
                    let values = facts
                        .iter()
                        .map(|(key, value)| format!("{key}: {value}"))
                        .collect::<Vec<_>>()
                        .join(", ");
                    format!("- {owner}: {values}")
                })
                .collect::<Vec<_>>();
            sections.push(format!("Known facts:\n{}", rendered.join("\n")));
        }

        sections.join("\n\n")
    }

    /// Merges remote records. History records already present (same
    /// timestamp and text) are skipped; fact records upsert.
    pub fn merge_remote(&mut self, entries: Vec<SharedMemoryEntry>) -> MergeReport {
        let mut report = MergeReport::default();

        for entry in entries {
            if entry.kind.is_history() {
                if self
                    .shared
                    .iter()
                    .any(|existing| existing.is_duplicate_of(&entry))
                {
                    report.skipped += 1;
                    continue;
                }
                self.insert_shared(entry);
                report.merged += 1;
                continue;
            }

            let Some(key) = entry.fact_key.as_deref() else {
                warn!(record_id = %entry.id, "remote fact record without a key");
                report.skipped += 1;
                continue;
            };
            if self
                .facts
                .upsert(entry.speaker_id.as_str(), key, &entry.text)
            {
                report.facts_updated += 1;
            } else {
                report.skipped += 1;
            }
        }

        if report.merged > 0 {
            self.persist(Blob::Shared);
        }
        if report.facts_updated > 0 {
            self.persist(Blob::Facts);
        }
        report
    }

    pub fn clear(&mut self) {
        self.personal.clear();
        self.shared.clear();
        self.facts = FactBook::default();
        self.last_sync = None;

        self.persist(Blob::Personal);
        self.persist(Blob::Shared);
        self.persist(Blob::Facts);
        self.persist(Blob::LastSync);
    }

    fn append_message(
        &mut self,
        role: MessageRole,
        kind: SharedEntryKind,
        text: &str,
    ) -> Option<SharedMemoryEntry> {
        self.personal.push_back(PersonalMessage {
            role,
            text: text.to_string(),
        });
        while self.personal.len() > PERSONAL_HISTORY_MAX_ENTRIES {
            self.personal.pop_front();
        }
        self.persist(Blob::Personal);

        let user = self.current_user.as_ref()?;
        let entry = SharedMemoryEntry::new(user.id.clone(), kind, text, Utc::now());
        self.insert_shared(entry.clone());
        self.persist(Blob::Shared);
        Some(entry)
    }

    fn insert_shared(&mut self, entry: SharedMemoryEntry) {
        let position = self
            .shared
            .partition_point(|existing| existing.timestamp <= entry.timestamp);
        self.shared.insert(position, entry);

        while self.shared.len() > SHARED_HISTORY_MAX_ENTRIES {
            self.shared.pop_front();
        }
    }

    fn fact_scope(&self) -> String {
        self.current_user
            .as_ref()
            .map(|user| user.id.to_string())
            .unwrap_or_else(|| PERSONAL_FACT_SCOPE.to_string())
    }

    fn persist(&mut self, blob: Blob) {
        let encoded = match blob {
            Blob::Personal => serde_json::to_string(&self.personal).map(Some),
            Blob::Shared => serde_json::to_string(&self.shared).map(Some),
            Blob::Facts => serde_json::to_string(&self.facts).map(Some),
            Blob::LastSync => self.last_sync.as_ref().map(serde_json::to_string).transpose(),
        };
        let raw = match encoded {
            Ok(raw) => raw,
            Err(err) => {
                warn!(error = %err, key = blob.key(), "failed to encode memory state");
                return;
            }
        };

        if !self.write_behind {
            write_blob(self.state.as_ref(), blob, raw.as_deref());
            return;
        }

        // Only the newest encoding of a blob is worth writing.
        self.generation += 1;
        self.unsaved.retain(|unsaved| unsaved.blob != blob);
        self.unsaved.push(UnsavedBlob {
            blob,
            raw,
            generation: self.generation,
        });
    }
}

fn write_blob(state: &dyn LocalStateStore, blob: Blob, raw: Option<&str>) {
    let result = match raw {
        Some(raw) => state.store_raw(blob.key(), raw),
        None => state.remove(blob.key()),
    };
    if let Err(err) = result {
        warn!(error = %err, key = blob.key(), "failed to persist memory state");
    }
}

fn render_shared_entry(entry: &SharedMemoryEntry) -> String {
    let speaker = authorize(entry.speaker_id.as_str())
        .map(|user| user.display_name)
        .unwrap_or_else(|| entry.speaker_id.to_string());

    match entry.kind {
        SharedEntryKind::UserMessage => format!("{speaker}: {}", entry.text),
        SharedEntryKind::AiResponse => format!("NOVA (to {speaker}): {}", entry.text),
        SharedEntryKind::SharedImage => format!("[{}]", entry.text),
        SharedEntryKind::Fact => format!("{speaker} fact: {}", entry.text),
    }
}

/// Cloneable handle so the session and the sync service can share one store.
/// Changes go through `update`, which writes the touched blobs to the state
/// store only after the store lock is released.
#[derive(Clone)]
pub struct SharedMemory {
    inner: Arc<Mutex<MemoryStore>>,
    writer: Arc<Mutex<BlobWriter>>,
}

impl SharedMemory {
    pub fn new(mut store: MemoryStore) -> Self {
        store.write_behind = true;
        let writer = BlobWriter {
            state: store.state.clone(),
            written: HashMap::new(),
        };
        Self {
            inner: Arc::new(Mutex::new(store)),
            writer: Arc::new(Mutex::new(writer)),
        }
    }

    /// Read access to the store.
    pub fn lock(&self) -> MemoryView<'_> {
        MemoryView(self.lock_store())
    }

    pub fn update<R>(&self, change: impl FnOnce(&mut MemoryStore) -> R) -> R {
        let (result, unsaved) = {
            let mut store = self.lock_store();
            let result = change(&mut *store);
            (result, std::mem::take(&mut store.unsaved))
        };

        if !unsaved.is_empty() {
            let mut writer = match self.writer.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            writer.write(unsaved);
        }
        result
    }

    fn lock_store(&self) -> MutexGuard<'_, MemoryStore> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// A locked, read-only `MemoryStore`.
pub struct MemoryView<'a>(MutexGuard<'a, MemoryStore>);

impl Deref for MemoryView<'_> {
    type Target = MemoryStore;

    fn deref(&self) -> &MemoryStore {
        &self.0
    }
}

/// Writes unsaved blobs in generation order. Two updates may race for the
/// writer; a blob older than the one already on disk is skipped.
struct BlobWriter {
    state: Arc<dyn LocalStateStore>,
    written: HashMap<Blob, u64>,
}

impl BlobWriter {
    fn write(&mut self, unsaved: Vec<UnsavedBlob>) {
        for blob in unsaved {
            let newest = self.written.get(&blob.blob).copied().unwrap_or(0);
            if blob.generation <= newest {
                debug!(key = blob.blob.key(), "skipping superseded memory write");
                continue;
            }
            write_blob(self.state.as_ref(), blob.blob, blob.raw.as_deref());
            self.written.insert(blob.blob, blob.generation);
        }
    }
}
