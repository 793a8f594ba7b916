//! Sync client for Schedule offline-first synchronization.
//!
//! This module provides the device side of the sync protocol, allowing
//! this device to:
//! - Push dirty rows with the version it last saw from the server
//! - Apply the server's acknowledgements and conflict reports
//! - Pull other devices' changes since its cursor
//! - Resolve surfaced conflicts and take note locks
//!
//! The network is behind the `SyncTransport` trait: `HttpTransport` talks to
//! a sync server over HTTP, `InProcessTransport` calls a `SyncService`
//! directly.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::CacheManager;
use crate::change_tracker::{ChangeTracker, OutboundChange};
use crate::config::Config;
use crate::conflicts::{merge_payloads, ConflictManager, ConflictPolicy, ConflictResolver};
use crate::database::Database;
use crate::error::{ScheduleError, ScheduleResult};
use crate::models::{
    drawing_key, now_ms, BatchDrawingWrite, BatchNoteWrite, BatchSaveRequest, BatchSaveResponse,
    ConflictReport, DeviceSession, FetchRequest, FetchResponse, LockAcquireResponse, LockRequest,
    LockStatusResponse, Note, PullRequest, PullResponse, PushRequest, PushResponse,
    ResolveConflictRequest, Resolution, ResolvedRecord, ScheduleDrawing, SyncChange,
    SyncOperation, SyncTable, ViewMode,
};
use crate::normalize::{normalize_change, normalize_data};
use crate::resolver::NoteResolver;
use crate::sync_service::SyncService;

/// Push rounds per sync: the first push plus one re-push of rows whose
/// conflicts were settled locally.
const MAX_PUSH_ROUNDS: usize = 2;

/// Result of a sync operation
#[derive(Debug, Clone, Default)]
pub struct SyncResult {
    pub success: bool,
    pub pulled: i64,
    pub pushed: i64,
    pub conflicts: i64,
    pub errors: Vec<String>,
}

impl SyncResult {
    pub fn success() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            errors: vec![error.into()],
            ..Default::default()
        }
    }

    fn absorb(&mut self, other: SyncResult) {
        self.success &= other.success;
        self.pulled += other.pulled;
        self.pushed += other.pushed;
        self.conflicts += other.conflicts;
        self.errors.extend(other.errors);
    }
}

/// Error body returned by the sync server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// How a client reaches the sync service
#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn push(&self, request: &PushRequest) -> ScheduleResult<PushResponse>;
    async fn pull(&self, request: &PullRequest) -> ScheduleResult<PullResponse>;
    async fn batch_save(&self, request: &BatchSaveRequest) -> ScheduleResult<BatchSaveResponse>;
    async fn resolve(&self, request: &ResolveConflictRequest) -> ScheduleResult<ResolvedRecord>;
    async fn fetch(&self, request: &FetchRequest) -> ScheduleResult<Option<SyncChange>>;
    async fn acquire_lock(&self, request: &LockRequest) -> ScheduleResult<bool>;
    async fn release_lock(&self, request: &LockRequest) -> ScheduleResult<()>;
    async fn lock_status(&self, request: &LockRequest) -> ScheduleResult<bool>;
}

// ============================================================================
// HTTP transport
// ============================================================================

/// JSON over HTTP to a sync server
pub struct HttpTransport {
    client: Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: &str, timeout: Duration) -> ScheduleResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ScheduleError::Network(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn send<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> ScheduleResult<reqwest::Response> {
        self.client
            .post(format!("{}{}", self.base_url, path))
            .json(body)
            .send()
            .await
            .map_err(|e| transport_error(path, e))
    }

    async fn post<B, R>(&self, path: &str, body: &B) -> ScheduleResult<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let response = self.send(path, body).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(status_error(path, status, response).await);
        }
        response
            .json::<R>()
            .await
            .map_err(|e| ScheduleError::Sync(format!("Failed to parse {} response: {}", path, e)))
    }
}

fn transport_error(path: &str, e: reqwest::Error) -> ScheduleError {
    if e.is_timeout() {
        ScheduleError::Timeout(path.to_string())
    } else {
        ScheduleError::Network(e.to_string())
    }
}

async fn status_error(path: &str, status: StatusCode, response: reqwest::Response) -> ScheduleError {
    let message = match response.json::<ErrorResponse>().await {
        Ok(body) => body.error,
        Err(_) => format!("{} failed with status {}", path, status),
    };
    match status {
        StatusCode::BAD_REQUEST => ScheduleError::validation("request", message),
        StatusCode::UNAUTHORIZED => ScheduleError::Unauthorized(message),
        StatusCode::NOT_FOUND => ScheduleError::NotFound(message),
        StatusCode::CONFLICT => ScheduleError::Transaction(message),
        _ => ScheduleError::Sync(message),
    }
}

#[async_trait]
impl SyncTransport for HttpTransport {
    async fn push(&self, request: &PushRequest) -> ScheduleResult<PushResponse> {
        self.post("/sync/push", request).await
    }

    async fn pull(&self, request: &PullRequest) -> ScheduleResult<PullResponse> {
        self.post("/sync/pull", request).await
    }

    async fn batch_save(&self, request: &BatchSaveRequest) -> ScheduleResult<BatchSaveResponse> {
        let response = self.send("/sync/batch", request).await?;
        let status = response.status();
        // A rolled-back batch answers 409 with the batch body
        if status.is_success() || status == StatusCode::CONFLICT {
            return response
                .json::<BatchSaveResponse>()
                .await
                .map_err(|e| ScheduleError::Sync(format!("Failed to parse batch response: {}", e)));
        }
        Err(status_error("/sync/batch", status, response).await)
    }

    async fn resolve(&self, request: &ResolveConflictRequest) -> ScheduleResult<ResolvedRecord> {
        self.post("/sync/resolve", request).await
    }

    async fn fetch(&self, request: &FetchRequest) -> ScheduleResult<Option<SyncChange>> {
        let response: FetchResponse = self.post("/sync/fetch", request).await?;
        Ok(response.change)
    }

    async fn acquire_lock(&self, request: &LockRequest) -> ScheduleResult<bool> {
        let response: LockAcquireResponse = self.post("/locks/acquire", request).await?;
        Ok(response.acquired)
    }

    async fn release_lock(&self, request: &LockRequest) -> ScheduleResult<()> {
        let _: Value = self.post("/locks/release", request).await?;
        Ok(())
    }

    async fn lock_status(&self, request: &LockRequest) -> ScheduleResult<bool> {
        let response: LockStatusResponse = self.post("/locks/status", request).await?;
        Ok(response.locked_by_other)
    }
}

// ============================================================================
// In-process transport
// ============================================================================

/// Direct calls into a service in the same process
#[derive(Clone)]
pub struct InProcessTransport {
    service: Arc<SyncService>,
}

impl InProcessTransport {
    pub fn new(service: Arc<SyncService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl SyncTransport for InProcessTransport {
    async fn push(&self, request: &PushRequest) -> ScheduleResult<PushResponse> {
        self.service.push(request)
    }

    async fn pull(&self, request: &PullRequest) -> ScheduleResult<PullResponse> {
        self.service.pull(request)
    }

    async fn batch_save(&self, request: &BatchSaveRequest) -> ScheduleResult<BatchSaveResponse> {
        self.service.batch_save(request)
    }

    async fn resolve(&self, request: &ResolveConflictRequest) -> ScheduleResult<ResolvedRecord> {
        self.service.resolve_conflict(request)
    }

    async fn fetch(&self, request: &FetchRequest) -> ScheduleResult<Option<SyncChange>> {
        Ok(self.service.fetch(request)?.change)
    }

    async fn acquire_lock(&self, request: &LockRequest) -> ScheduleResult<bool> {
        self.service.acquire_lock(request)
    }

    async fn release_lock(&self, request: &LockRequest) -> ScheduleResult<()> {
        self.service.release_lock(request).map(|_| ())
    }

    async fn lock_status(&self, request: &LockRequest) -> ScheduleResult<bool> {
        self.service.lock_status(request)
    }
}

// ============================================================================
// Client
// ============================================================================

/// Sync client
pub struct SyncClient<T: SyncTransport> {
    db: Arc<Mutex<Database>>,
    session: DeviceSession,
    resolver: Box<dyn ConflictResolver>,
    transport: T,
}

impl SyncClient<HttpTransport> {
    /// Client over HTTP using the configured server, credentials and policy
    pub fn from_config(db: Arc<Mutex<Database>>, config: &Config) -> ScheduleResult<Self> {
        let server_url = config
            .server_url()
            .ok_or_else(|| ScheduleError::Config("server_url is not set".to_string()))?;
        let transport = HttpTransport::new(server_url, config.request_timeout())?;
        {
            let guard = db
                .lock()
                .map_err(|_| ScheduleError::Other("database lock poisoned".into()))?;
            guard.set_server_url(Some(server_url))?;
        }
        Ok(Self::new(db, config.session()?, transport).with_resolver(config.conflict_policy()?))
    }
}

impl<T: SyncTransport> SyncClient<T> {
    /// Client that surfaces every conflict to the user
    pub fn new(db: Arc<Mutex<Database>>, session: DeviceSession, transport: T) -> Self {
        Self {
            db,
            session,
            resolver: Box::new(ConflictPolicy::Surface),
            transport,
        }
    }

    pub fn with_resolver(mut self, resolver: impl ConflictResolver + 'static) -> Self {
        self.resolver = Box::new(resolver);
        self
    }

    pub fn session(&self) -> &DeviceSession {
        &self.session
    }

    fn lock_db(&self) -> ScheduleResult<MutexGuard<'_, Database>> {
        self.db
            .lock()
            .map_err(|_| ScheduleError::Other("database lock poisoned".into()))
    }

    /// Push, then pull, then run cache maintenance if due
    pub async fn sync_all(&self) -> SyncResult {
        let mut result = self.push().await;
        let pull_result = self.pull().await;
        result.absorb(pull_result);

        let maintenance = self
            .lock_db()
            .and_then(|db| CacheManager::new(&db).run_if_due(now_ms()));
        match maintenance {
            Ok(Some(report)) => tracing::debug!(?report, "Cache maintenance ran after sync"),
            Ok(None) => {}
            Err(e) => result.errors.push(format!("Cache maintenance failed: {}", e)),
        }

        tracing::info!(
            pushed = result.pushed,
            pulled = result.pulled,
            conflicts = result.conflicts,
            errors = result.errors.len(),
            "Sync finished"
        );
        result
    }

    /// Push every dirty row. Failures are collected, never raised.
    pub async fn push(&self) -> SyncResult {
        let mut result = SyncResult::success();
        if let Err(e) = self.push_changes(&mut result).await {
            tracing::warn!("Push failed: {}", e);
            result.success = false;
            result.errors.push(format!("Push failed: {}", e));
        }
        result
    }

    /// Pull other devices' changes. Failures are collected, never raised.
    pub async fn pull(&self) -> SyncResult {
        let mut result = SyncResult::success();
        if let Err(e) = self.pull_changes(&mut result).await {
            tracing::warn!("Pull failed: {}", e);
            result.success = false;
            result.errors.push(format!("Pull failed: {}", e));
        }
        result
    }

    async fn push_changes(&self, result: &mut SyncResult) -> ScheduleResult<()> {
        for round in 0..MAX_PUSH_ROUNDS {
            let outbound = self.lock_db()?.outbound_changes()?;
            if outbound.is_empty() {
                break;
            }

            let request = PushRequest {
                device_id: self.session.device_id.clone(),
                device_token: self.session.device_token.clone(),
                changes: outbound.iter().map(|o| o.change.clone()).collect(),
            };
            tracing::debug!(round, changes = request.changes.len(), "Pushing");

            // Nothing is acknowledged unless the response arrives
            let response = self.transport.push(&request).await?;

            let repush = {
                let db = self.lock_db()?;
                let repush = db.transaction(|db| self.apply_push_response(db, &outbound, &response, result))?;
                db.set_last_push_at(now_ms())?;
                repush
            };
            if !repush {
                break;
            }
        }
        Ok(())
    }

    /// Settle one push response locally. Returns whether a re-push is needed.
    fn apply_push_response(
        &self,
        db: &Database,
        outbound: &[OutboundChange],
        response: &PushResponse,
        result: &mut SyncResult,
    ) -> ScheduleResult<bool> {
        let revisions: HashMap<(&str, &str), i64> = outbound
            .iter()
            .map(|o| ((o.change.table.as_str(), o.change.record_id.as_str()), o.local_rev))
            .collect();

        for applied in &response.applied {
            let Some(table) = SyncTable::parse(&applied.table) else {
                continue;
            };
            let Some(&rev) = revisions.get(&(applied.table.as_str(), applied.record_id.as_str())) else {
                continue;
            };
            let clean = db.acknowledge_push(table, &applied.record_id, applied.version, rev)?;
            if !clean {
                tracing::debug!(table = %table, record_id = %applied.record_id, "Edited during push; stays dirty");
            }
            result.pushed += 1;
        }

        let mut repush = false;
        for conflict in &response.conflicts {
            result.conflicts += 1;
            repush |= self.handle_conflict(db, conflict)?;
        }

        result.errors.extend(response.errors.iter().cloned());
        Ok(repush)
    }

    fn handle_conflict(&self, db: &Database, conflict: &ConflictReport) -> ScheduleResult<bool> {
        let Some(table) = SyncTable::parse(&conflict.table) else {
            return Err(ScheduleError::sync(format!("conflict on unknown table {}", conflict.table)));
        };
        let policy = self.resolver.policy_for(conflict);
        tracing::info!(%conflict, policy = policy.as_str(), "Handling conflict");

        match policy {
            ConflictPolicy::KeepServer => {
                let columns = normalize_data(table, &conflict.record_id, &conflict.server_data)?;
                db.adopt_server_row(
                    table,
                    &conflict.record_id,
                    &columns,
                    conflict.server_version,
                    false,
                    conflict.server_timestamp,
                    false,
                )?;
                Ok(false)
            }
            ConflictPolicy::KeepLocal => {
                db.set_base_version(table, &conflict.record_id, conflict.server_version)?;
                Ok(true)
            }
            ConflictPolicy::Merge => {
                let merged = merge_payloads(&conflict.local_data, &conflict.server_data);
                let columns = normalize_data(table, &conflict.record_id, &merged)?;
                db.adopt_server_row(
                    table,
                    &conflict.record_id,
                    &columns,
                    conflict.server_version,
                    false,
                    now_ms(),
                    false,
                )?;
                db.mark_dirty(table, &conflict.record_id)?;
                Ok(true)
            }
            ConflictPolicy::Surface => {
                ConflictManager::new(db).record_conflict(conflict)?;
                db.set_base_version(table, &conflict.record_id, conflict.server_version)?;
                Ok(false)
            }
        }
    }

    async fn pull_changes(&self, result: &mut SyncResult) -> ScheduleResult<()> {
        let since = self.lock_db()?.get_sync_state()?.last_sync_at;
        let request = PullRequest {
            device_id: self.session.device_id.clone(),
            device_token: self.session.device_token.clone(),
            last_sync_at: since,
        };
        let response = self.transport.pull(&request).await?;
        tracing::debug!(since = ?since, changes = response.changes.len(), "Pulled");

        let db = self.lock_db()?;
        db.transaction(|db| {
            for change in &response.changes {
                let normalized = match normalize_change(change) {
                    Ok(n) => n,
                    Err(e) => {
                        tracing::warn!(table = %change.table, record_id = %change.record_id, "Skipping pulled change: {}", e);
                        result.errors.push(format!("Skipped {} {}: {}", change.table, change.record_id, e));
                        continue;
                    }
                };
                // Local edits win until they are pushed
                let written = db.adopt_server_row(
                    normalized.table,
                    &normalized.record_id,
                    &normalized.columns,
                    change.version,
                    normalized.operation == SyncOperation::Delete,
                    normalized.timestamp,
                    true,
                )?;
                if written {
                    result.pulled += 1;
                }
            }
            db.set_last_sync_at(response.server_time)
        })
    }

    /// Send a decision on a surfaced conflict and apply the server's answer
    pub async fn resolve_conflict(
        &self,
        conflict_id: &str,
        resolution: Resolution,
        merged_data: Option<Value>,
    ) -> ScheduleResult<ResolvedRecord> {
        let (conflict, local_data) = {
            let db = self.lock_db()?;
            let conflict = ConflictManager::new(&db).get_conflict(conflict_id)?;
            let local = SyncTable::parse(&conflict.table)
                .map(|table| db.read_entity(table, &conflict.record_id))
                .transpose()?
                .flatten()
                .map(|row| row.data)
                .unwrap_or_else(|| conflict.local_data.clone());
            (conflict, local)
        };

        let request = ResolveConflictRequest {
            device_id: self.session.device_id.clone(),
            device_token: self.session.device_token.clone(),
            table: conflict.table.clone(),
            record_id: conflict.record_id.clone(),
            resolution,
            merged_data,
            local_data: Some(local_data),
        };
        let resolved = self.transport.resolve(&request).await?;

        let db = self.lock_db()?;
        db.transaction(|db| {
            let table = SyncTable::parse(&resolved.table)
                .ok_or_else(|| ScheduleError::sync(format!("unknown table {}", resolved.table)))?;
            let columns = if resolved.deleted {
                Vec::new()
            } else {
                normalize_data(table, &resolved.record_id, &resolved.data)?
            };
            db.adopt_server_row(
                table,
                &resolved.record_id,
                &columns,
                resolved.version,
                resolved.deleted,
                now_ms(),
                false,
            )?;
            ConflictManager::new(db).mark_resolved(&conflict.id, resolution.as_str())
        })?;
        tracing::info!(conflict_id = %conflict.id, resolution = resolution.as_str(), version = resolved.version, "Conflict resolved");
        Ok(resolved)
    }

    // ========================================================================
    // Cache refill
    // ========================================================================

    /// Fetch one row from the server and store it, unless the local copy
    /// has unsynced edits. Clears the row's eviction marker either way.
    /// Returns whether a row was written.
    pub async fn fetch_entity(&self, table: SyncTable, key: &str) -> ScheduleResult<bool> {
        let request = FetchRequest {
            device_id: self.session.device_id.clone(),
            device_token: self.session.device_token.clone(),
            table: table.as_str().to_string(),
            record_id: key.to_string(),
        };
        let change = self.transport.fetch(&request).await?;

        let db = self.lock_db()?;
        db.transaction(|db| {
            let written = match &change {
                Some(change) => {
                    let normalized = normalize_change(change)?;
                    db.adopt_server_row(
                        normalized.table,
                        &normalized.record_id,
                        &normalized.columns,
                        change.version,
                        normalized.operation == SyncOperation::Delete,
                        normalized.timestamp,
                        true,
                    )?
                }
                None => false,
            };
            CacheManager::new(db).forget_eviction(table, key)?;
            tracing::debug!(table = %table, key = %key, written, "Refilled cache entry");
            Ok(written)
        })
    }

    /// True when the row is missing locally because the cache evicted it
    fn needs_refill(&self, table: SyncTable, key: &str) -> ScheduleResult<bool> {
        let db = self.lock_db()?;
        if db.get_entity(table, key)?.is_some() {
            return Ok(false);
        }
        CacheManager::new(&db).was_evicted(table, key)
    }

    /// The note of an event's record, fetched back from the server first
    /// when the cache evicted it
    pub async fn note_for_event(&self, event_id: &str) -> ScheduleResult<Note> {
        let record_id = self
            .lock_db()?
            .get_event(event_id)?
            .ok_or_else(|| ScheduleError::not_found(format!("event {}", event_id)))?
            .record_id;
        if self.needs_refill(SyncTable::Notes, &record_id)? {
            self.fetch_entity(SyncTable::Notes, &record_id).await?;
        }
        let db = self.lock_db()?;
        NoteResolver::new(&db).note_for_event(event_id)
    }

    /// A schedule drawing, fetched back from the server first when the
    /// cache evicted it. Counts as a cache hit when present.
    pub async fn load_drawing(
        &self,
        book_id: &str,
        date: &str,
        view_mode: ViewMode,
    ) -> ScheduleResult<Option<ScheduleDrawing>> {
        let key = drawing_key(book_id, date, view_mode);
        if self.needs_refill(SyncTable::ScheduleDrawings, &key)? {
            self.fetch_entity(SyncTable::ScheduleDrawings, &key).await?;
        }
        let db = self.lock_db()?;
        let drawing = db.get_drawing(book_id, date, view_mode)?;
        if drawing.is_some() {
            CacheManager::new(&db).increment_hit(SyncTable::ScheduleDrawings, &key)?;
        }
        Ok(drawing)
    }

    /// Save notes and drawings on the server in one transaction
    pub async fn save_batch(
        &self,
        notes: Vec<BatchNoteWrite>,
        drawings: Vec<BatchDrawingWrite>,
    ) -> ScheduleResult<BatchSaveResponse> {
        let request = BatchSaveRequest {
            device_id: self.session.device_id.clone(),
            device_token: self.session.device_token.clone(),
            notes,
            drawings,
        };
        self.transport.batch_save(&request).await
    }

    fn lock_request(&self, record_id: &str) -> LockRequest {
        LockRequest {
            device_id: self.session.device_id.clone(),
            device_token: self.session.device_token.clone(),
            record_id: record_id.to_string(),
        }
    }

    pub async fn acquire_note_lock(&self, record_id: &str) -> ScheduleResult<bool> {
        self.transport.acquire_lock(&self.lock_request(record_id)).await
    }

    pub async fn release_note_lock(&self, record_id: &str) -> ScheduleResult<()> {
        self.transport.release_lock(&self.lock_request(record_id)).await
    }

    pub async fn is_note_locked_by_other(&self, record_id: &str) -> ScheduleResult<bool> {
        self.transport.lock_status(&self.lock_request(record_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{new_id, Event, Record};
    use serde_json::json;

    const TOKEN: &str = "token";

    struct Harness {
        service: Arc<SyncService>,
    }

    impl Harness {
        fn new() -> Self {
            let db = Arc::new(Mutex::new(Database::new_in_memory().unwrap()));
            Self {
                service: Arc::new(SyncService::new(db).unwrap()),
            }
        }

        fn device(&self) -> (Arc<Mutex<Database>>, DeviceSession) {
            let id = new_id();
            self.service.register_device(&id, None, TOKEN).unwrap();
            (
                Arc::new(Mutex::new(Database::new_in_memory().unwrap())),
                DeviceSession::new(id, TOKEN),
            )
        }

        fn client(&self) -> SyncClient<InProcessTransport> {
            let (db, session) = self.device();
            SyncClient::new(db, session, InProcessTransport::new(Arc::clone(&self.service)))
        }
    }

    /// Pushes through to the service, then loses the response
    struct DroppedResponse(InProcessTransport);

    #[async_trait]
    impl SyncTransport for DroppedResponse {
        async fn push(&self, request: &PushRequest) -> ScheduleResult<PushResponse> {
            self.0.push(request).await?;
            Err(ScheduleError::Network("connection reset".into()))
        }
        async fn pull(&self, request: &PullRequest) -> ScheduleResult<PullResponse> {
            self.0.pull(request).await
        }
        async fn batch_save(&self, request: &BatchSaveRequest) -> ScheduleResult<BatchSaveResponse> {
            self.0.batch_save(request).await
        }
        async fn resolve(&self, request: &ResolveConflictRequest) -> ScheduleResult<ResolvedRecord> {
            self.0.resolve(request).await
        }
        async fn fetch(&self, request: &FetchRequest) -> ScheduleResult<Option<SyncChange>> {
            self.0.fetch(request).await
        }
        async fn acquire_lock(&self, request: &LockRequest) -> ScheduleResult<bool> {
            self.0.acquire_lock(request).await
        }
        async fn release_lock(&self, request: &LockRequest) -> ScheduleResult<()> {
            self.0.release_lock(request).await
        }
        async fn lock_status(&self, request: &LockRequest) -> ScheduleResult<bool> {
            self.0.lock_status(request).await
        }
    }

    /// Edits a note locally while the push is on the wire
    struct EditInFlight {
        inner: InProcessTransport,
        db: Arc<Mutex<Database>>,
        record_id: String,
    }

    #[async_trait]
    impl SyncTransport for EditInFlight {
        async fn push(&self, request: &PushRequest) -> ScheduleResult<PushResponse> {
            let response = self.inner.push(request).await?;
            self.db
                .lock()
                .unwrap()
                .save_note(&self.record_id, &json!([["edited in flight"]]))?;
            Ok(response)
        }
        async fn pull(&self, request: &PullRequest) -> ScheduleResult<PullResponse> {
            self.inner.pull(request).await
        }
        async fn batch_save(&self, request: &BatchSaveRequest) -> ScheduleResult<BatchSaveResponse> {
            self.inner.batch_save(request).await
        }
        async fn resolve(&self, request: &ResolveConflictRequest) -> ScheduleResult<ResolvedRecord> {
            self.inner.resolve(request).await
        }
        async fn fetch(&self, request: &FetchRequest) -> ScheduleResult<Option<SyncChange>> {
            self.inner.fetch(request).await
        }
        async fn acquire_lock(&self, request: &LockRequest) -> ScheduleResult<bool> {
            self.inner.acquire_lock(request).await
        }
        async fn release_lock(&self, request: &LockRequest) -> ScheduleResult<()> {
            self.inner.release_lock(request).await
        }
        async fn lock_status(&self, request: &LockRequest) -> ScheduleResult<bool> {
            self.inner.lock_status(request).await
        }
    }

    fn local_record(client: &SyncClient<impl SyncTransport>, pages: Value) -> Record {
        let db = client.db.lock().unwrap();
        let record = db.ensure_record("R-100", Some("Dana"), None).unwrap();
        db.save_note(&record.id, &pages).unwrap();
        record
    }

    /// Two devices that both hold the shared note at version 1
    async fn shared_note(harness: &Harness) -> (SyncClient<InProcessTransport>, SyncClient<InProcessTransport>, String) {
        let a = harness.client();
        let b = harness.client();
        let record = local_record(&a, json!([["base"]]));
        assert!(a.push().await.success);
        assert_eq!(b.pull().await.pulled, 2);
        (a, b, record.id)
    }

    fn note_state(client: &SyncClient<impl SyncTransport>, record_id: &str) -> (Value, i64, bool) {
        let note = client.db.lock().unwrap().get_note(record_id).unwrap().unwrap();
        (note.pages, note.version, note.is_dirty)
    }

    #[tokio::test]
    async fn test_push_acknowledges_and_cleans() {
        let harness = Harness::new();
        let a = harness.client();
        let record = local_record(&a, json!([["a"]]));

        let result = a.push().await;
        assert!(result.success, "{:?}", result.errors);
        assert_eq!(result.pushed, 2);
        assert_eq!(note_state(&a, &record.id), (json!([["a"]]), 1, false));

        let db = a.db.lock().unwrap();
        assert!(db.outbound_changes().unwrap().is_empty());
        assert!(db.get_sync_state().unwrap().last_push_at.is_some());
    }

    #[tokio::test]
    async fn test_pull_excludes_own_changes() {
        let harness = Harness::new();
        let a = harness.client();
        local_record(&a, json!([["a"]]));
        a.push().await;

        let result = a.pull().await;
        assert!(result.success);
        assert_eq!(result.pulled, 0);
    }

    #[tokio::test]
    async fn test_concurrent_edits_surface_conflict() {
        let harness = Harness::new();
        let (a, b, record_id) = shared_note(&harness).await;

        a.db.lock().unwrap().save_note(&record_id, &json!([["from a"]])).unwrap();
        b.db.lock().unwrap().save_note(&record_id, &json!([["from b"]])).unwrap();

        assert_eq!(a.push().await.pushed, 1);
        let result = b.push().await;
        assert_eq!(result.conflicts, 1);
        assert_eq!(result.pushed, 0);

        // B keeps its edit, rebased on the server version, held back from push
        assert_eq!(note_state(&b, &record_id), (json!([["from b"]]), 2, true));
        let db = b.db.lock().unwrap();
        assert!(db.outbound_changes().unwrap().is_empty());
        let open = ConflictManager::new(&db).get_conflicts(false).unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].server_data, json!({"pages": [["from a"]]}));
    }

    #[tokio::test]
    async fn test_resolve_surfaced_conflict_with_local() {
        let harness = Harness::new();
        let (a, b, record_id) = shared_note(&harness).await;
        a.db.lock().unwrap().save_note(&record_id, &json!([["from a"]])).unwrap();
        b.db.lock().unwrap().save_note(&record_id, &json!([["from b"]])).unwrap();
        a.push().await;
        b.push().await;

        let conflict_id = {
            let db = b.db.lock().unwrap();
            let open = ConflictManager::new(&db).get_conflicts(false).unwrap();
            open[0].id.clone()
        };
        let resolved = b.resolve_conflict(&conflict_id, Resolution::UseLocal, None).await.unwrap();
        assert_eq!(resolved.version, 3);
        assert_eq!(note_state(&b, &record_id), (json!([["from b"]]), 3, false));
        {
            let db = b.db.lock().unwrap();
            assert!(ConflictManager::new(&db).get_conflicts(false).unwrap().is_empty());
        }

        assert_eq!(a.pull().await.pulled, 1);
        assert_eq!(note_state(&a, &record_id), (json!([["from b"]]), 3, false));
    }

    #[tokio::test]
    async fn test_keep_server_policy_discards_local_edit() {
        let harness = Harness::new();
        let (a, b, record_id) = shared_note(&harness).await;
        let b = b.with_resolver(ConflictPolicy::KeepServer);
        a.db.lock().unwrap().save_note(&record_id, &json!([["from a"]])).unwrap();
        b.db.lock().unwrap().save_note(&record_id, &json!([["from b"]])).unwrap();
        a.push().await;

        let result = b.push().await;
        assert_eq!(result.conflicts, 1);
        assert_eq!(note_state(&b, &record_id), (json!([["from a"]]), 2, false));
    }

    #[tokio::test]
    async fn test_keep_local_policy_repushes() {
        let harness = Harness::new();
        let (a, b, record_id) = shared_note(&harness).await;
        let b = b.with_resolver(ConflictPolicy::KeepLocal);
        a.db.lock().unwrap().save_note(&record_id, &json!([["from a"]])).unwrap();
        b.db.lock().unwrap().save_note(&record_id, &json!([["from b"]])).unwrap();
        a.push().await;

        let result = b.push().await;
        assert_eq!(result.conflicts, 1);
        assert_eq!(result.pushed, 1);
        assert_eq!(note_state(&b, &record_id), (json!([["from b"]]), 3, false));

        a.pull().await;
        assert_eq!(note_state(&a, &record_id).0, json!([["from b"]]));
    }

    #[tokio::test]
    async fn test_merge_policy_keeps_both_pages() {
        let harness = Harness::new();
        let (a, b, record_id) = shared_note(&harness).await;
        let b = b.with_resolver(ConflictPolicy::Merge);
        a.db.lock().unwrap().save_note(&record_id, &json!([["a"]])).unwrap();
        b.db.lock().unwrap().save_note(&record_id, &json!([["b"]])).unwrap();
        a.push().await;

        let result = b.push().await;
        assert_eq!(result.pushed, 1);
        assert_eq!(note_state(&b, &record_id), (json!([["a"], ["b"]]), 3, false));
    }

    #[tokio::test]
    async fn test_lost_push_response_keeps_rows_dirty() {
        let harness = Harness::new();
        let (db, session) = harness.device();
        let transport = InProcessTransport::new(Arc::clone(&harness.service));

        let flaky = SyncClient::new(Arc::clone(&db), session.clone(), DroppedResponse(transport.clone()));
        let record = local_record(&flaky, json!([["a"]]));
        let result = flaky.push().await;
        assert!(!result.success);
        assert_eq!(note_state(&flaky, &record.id), (json!([["a"]]), 0, true));

        // The retry carries a stale base and conflicts; the server copy is the same edit
        let steady = SyncClient::new(db, session, transport).with_resolver(ConflictPolicy::KeepServer);
        let retry = steady.push().await;
        assert!(retry.success, "{:?}", retry.errors);
        assert_eq!(retry.pushed, 0);
        assert_eq!(retry.conflicts, 2);
        assert_eq!(note_state(&steady, &record.id), (json!([["a"]]), 1, false));
    }

    #[tokio::test]
    async fn test_keep_server_with_malformed_server_data_stays_dirty() {
        let harness = Harness::new();
        let a = harness.client().with_resolver(ConflictPolicy::KeepServer);
        let record = local_record(&a, json!([["local"]]));
        let report = ConflictReport {
            table: "notes".to_string(),
            record_id: record.id.clone(),
            local_data: json!({"pages": [["local"]]}),
            server_data: json!({"pages": [["server"]], "cache_hit_count": 3}),
            local_version: 0,
            server_version: 4,
            local_timestamp: 0,
            server_timestamp: 0,
        };

        {
            let db = a.db.lock().unwrap();
            assert!(a.handle_conflict(&db, &report).is_err());
        }
        assert_eq!(note_state(&a, &record.id), (json!([["local"]]), 0, true));
    }

    #[tokio::test]
    async fn test_edit_during_push_stays_dirty() {
        let harness = Harness::new();
        let (db, session) = harness.device();
        let record = {
            let guard = db.lock().unwrap();
            let record = guard.ensure_record("R-7", None, None).unwrap();
            guard.save_note(&record.id, &json!([["first"]])).unwrap();
            record
        };
        let client = SyncClient::new(
            Arc::clone(&db),
            session,
            EditInFlight {
                inner: InProcessTransport::new(Arc::clone(&harness.service)),
                db: Arc::clone(&db),
                record_id: record.id.clone(),
            },
        );

        // Single round: the in-flight edit is pushed on the next sync
        let result = client.push().await;
        assert!(result.success);
        let (pages, version, dirty) = note_state(&client, &record.id);
        assert_eq!(pages, json!([["edited in flight"]]));
        assert!(version >= 1);
        assert!(dirty);
    }

    #[tokio::test]
    async fn test_sync_all_runs_cache_maintenance() {
        let harness = Harness::new();
        let a = harness.client();
        local_record(&a, json!([["a"]]));

        let result = a.sync_all().await;
        assert!(result.success, "{:?}", result.errors);
        let db = a.db.lock().unwrap();
        assert!(CacheManager::new(&db).get_policy().unwrap().last_cleanup_at.is_some());
        assert!(db.get_sync_state().unwrap().last_sync_at.is_some());
    }

    #[tokio::test]
    async fn test_evicted_note_is_fetched_back() {
        let harness = Harness::new();
        let a = harness.client();
        let b = harness.client();
        let event = {
            let db = a.db.lock().unwrap();
            let book = db.create_book("Clinic").unwrap();
            let record = db.ensure_record("R-5", Some("Dana"), None).unwrap();
            db.save_note(&record.id, &json!([["important"]])).unwrap();
            db.create_event(Event::new(book.id, record.id, 1_000, None)).unwrap()
        };
        assert!(a.sync_all().await.success);
        assert!(b.sync_all().await.success);

        {
            let db = b.db.lock().unwrap();
            assert_eq!(CacheManager::new(&db).evict_lowest(1).unwrap(), 1);
            assert!(db.get_note(&event.record_id).unwrap().is_none());
        }
        // The cursor is past the note, so a plain sync does not bring it back
        let again = b.sync_all().await;
        assert_eq!(again.pulled, 0);

        let note = b.note_for_event(&event.id).await.unwrap();
        assert_eq!(note.pages, json!([["important"]]));
        assert_eq!(note.version, 1);
        assert!(!note.is_dirty);
        let db = b.db.lock().unwrap();
        assert!(!CacheManager::new(&db).was_evicted(SyncTable::Notes, &event.record_id).unwrap());
    }

    #[tokio::test]
    async fn test_evicted_drawing_is_fetched_back() {
        let harness = Harness::new();
        let a = harness.client();
        let b = harness.client();
        let book = {
            let db = a.db.lock().unwrap();
            let book = db.create_book("Clinic").unwrap();
            db.save_drawing(&book.id, "2025-03-01", ViewMode::Week, &json!([{"points": [[1, 2]]}]))
                .unwrap();
            book
        };
        assert!(a.sync_all().await.success);
        assert!(b.sync_all().await.success);

        {
            let db = b.db.lock().unwrap();
            assert_eq!(CacheManager::new(&db).evict_lowest(1).unwrap(), 1);
        }
        let drawing = b.load_drawing(&book.id, "2025-03-01", ViewMode::Week).await.unwrap().unwrap();
        assert_eq!(drawing.strokes, json!([{"points": [[1, 2]]}]));
        assert!(!drawing.is_dirty);

        // Never drawn anywhere: nothing to fetch
        assert!(b.load_drawing(&book.id, "2025-03-02", ViewMode::Week).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_note_locks_through_client() {
        let harness = Harness::new();
        let (a, b, record_id) = shared_note(&harness).await;

        assert!(a.acquire_note_lock(&record_id).await.unwrap());
        assert!(!b.acquire_note_lock(&record_id).await.unwrap());
        assert!(b.is_note_locked_by_other(&record_id).await.unwrap());
        a.release_note_lock(&record_id).await.unwrap();
        assert!(!b.is_note_locked_by_other(&record_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_bad_token_is_collected_not_raised() {
        let harness = Harness::new();
        let (db, session) = harness.device();
        let client = SyncClient::new(
            db,
            DeviceSession::new(session.device_id, "wrong"),
            InProcessTransport::new(Arc::clone(&harness.service)),
        );
        {
            let guard = client.db.lock().unwrap();
            guard.create_book("Clinic").unwrap();
        }
        let result = client.sync_all().await;
        assert!(!result.success);
        assert_eq!(result.errors.len(), 2);
    }
}
