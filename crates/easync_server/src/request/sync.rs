//! SYNC.
//!
//! A request runs through parsing, policy check, cache loading, per
//! collection option/command processing and state initialization, partial
//! request reconciliation, an optional looping wait and finally the export
//! of server changes. Every path ends in a response.

use super::{next_child, read_flag, read_u8, unexpected, write_elements};
use crate::error::ServerResult;
use crate::handler::HandlerContext;
use easync_engine::{
    Collections, EncoderExporter, EngineError, EngineResult, HeartbeatConfig, Importer, PollMode,
    PollOutcome, Synchronizer,
};
use easync_protocol::{
    clamp_window_size, BodyPreference, ClientCommand, CollectionClass, CollectionSettings,
    ConflictPolicy, Decoder, Element, Encoder, EventWriter, ProtocolError, ProtocolResult,
    StartTag, SyncCollection, SyncKey, SyncStatus, Tag,
};
use easync_state::{SaveOutcome, StateScope, StateStore, SyncStateRecord};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, error, info, warn};

const MAX_WAIT_MINUTES: u32 = 59;

/// A parsed SYNC body.
#[derive(Debug, Default)]
struct SyncRequest {
    collections: Vec<SyncCollection>,
    partial: bool,
    wait: Option<i64>,
    heartbeat: Option<i64>,
    window_size: Option<u32>,
}

/// Handles a SYNC request.
pub(crate) fn handle(
    ctx: &mut HandlerContext,
    decoder: &mut dyn Decoder,
    encoder: &mut dyn Encoder,
) -> ServerResult<bool> {
    info!(device = %ctx.device_id(), version = %ctx.version, "handling SYNC");

    let request = match parse_request(decoder) {
        Ok(request) => request,
        Err(e) => {
            warn!(device = %ctx.device_id(), error = %e, "malformed SYNC request");
            write_status(encoder, SyncStatus::ProtocolError);
            return Ok(true);
        }
    };

    if ctx.wipe_pending() {
        info!(device = %ctx.device_id(), "remote wipe pending");
        write_status(encoder, SyncStatus::FolderSyncRequired);
        return Ok(true);
    }

    let cache = ctx.load_cache()?;
    let collections = ctx.collections(cache);
    let mut handler = SyncHandler {
        ctx,
        collections,
        statuses: BTreeMap::new(),
        replies: BTreeMap::new(),
        imported: BTreeSet::new(),
        states: BTreeMap::new(),
        folder_gone: false,
        looped: false,
    };

    let response = handler.run(request)?;
    handler.finish(response, encoder)
}

/// What a SYNC answers with.
#[derive(Debug)]
enum Response {
    /// Request-level status.
    Global(SyncStatus),
    /// `Wait` or `HeartbeatInterval` out of range, with the bound.
    Limit(u32),
    /// No body: the looping wait ended without changes.
    Empty,
    /// Another request changed the cache; nothing is written or saved.
    Stale,
    /// Per-collection results.
    Collections(Vec<Element>),
}

/// Outcome of one device command that must be reported back.
#[derive(Debug)]
enum Reply {
    Add {
        client_id: String,
        server_id: Option<String>,
        status: SyncStatus,
    },
    Change {
        server_id: String,
        status: SyncStatus,
    },
    Delete {
        server_id: String,
        status: SyncStatus,
    },
}

struct SyncHandler<'a> {
    ctx: &'a mut HandlerContext,
    collections: Collections,
    /// Collections that failed before export, with their status.
    statuses: BTreeMap<String, SyncStatus>,
    replies: BTreeMap<String, Vec<Reply>>,
    imported: BTreeSet<String>,
    /// States loaded for imports, reused by the export.
    states: BTreeMap<String, SyncStateRecord>,
    folder_gone: bool,
    looped: bool,
}

impl SyncHandler<'_> {
    fn run(&mut self, request: Option<SyncRequest>) -> ServerResult<Response> {
        let now = self.ctx.now();
        let short_sync = self.ctx.version.supports_short_sync();

        let heartbeat = match request {
            None => {
                if !short_sync {
                    debug!(device = %self.ctx.device_id(), "empty SYNC not allowed for version");
                    return Ok(Response::Global(SyncStatus::RequestIncomplete));
                }
                if self.collections.load_from_cache(false) == 0 {
                    debug!(device = %self.ctx.device_id(), "empty SYNC without cached collections");
                    return Ok(Response::Global(SyncStatus::RequestIncomplete));
                }
                let keys: Vec<SyncKey> = self.collections.iter().map(|c| c.synckey).collect();
                for key in &keys {
                    self.collections.cache_mut().remove_confirmed_key(key);
                }
                let ids = self.collections.ids();
                self.complete_from_cache(&ids, None);
                self.cached_heartbeat()
            }
            Some(request) => {
                let heartbeat = match self.heartbeat(&request)? {
                    Ok(heartbeat) => heartbeat,
                    Err(limit) => return Ok(Response::Limit(limit)),
                };
                if let Some(response) = self.process_collections(request, now)? {
                    return Ok(response);
                }
                heartbeat
            }
        };

        if self.collections.is_empty() {
            return Ok(Response::Global(SyncStatus::RequestIncomplete));
        }

        self.import_changes()?;
        if self.folder_gone {
            return Ok(Response::Global(SyncStatus::FolderSyncRequired));
        }

        if let Some(heartbeat) = heartbeat.filter(|_| short_sync && self.can_loop()) {
            let interval = self.ctx.heartbeat_config().wait_interval;
            let outcome = self
                .collections
                .poll_for_changes(heartbeat, interval, PollMode::Sync)?;
            if outcome != PollOutcome::Stale {
                self.looped = true;
            }
            match outcome {
                PollOutcome::DataAvailable(_) => {}
                PollOutcome::NoChanges => return Ok(Response::Empty),
                PollOutcome::Stale => return Ok(Response::Stale),
                PollOutcome::FolderSyncRequired => {
                    return Ok(Response::Global(SyncStatus::FolderSyncRequired))
                }
                PollOutcome::SyncRequired => {
                    return Ok(Response::Global(SyncStatus::RequestIncomplete))
                }
                PollOutcome::ServerError => return Ok(Response::Global(SyncStatus::ServerError)),
            }
        }

        self.export_all(self.ctx.now())
    }

    /// Validates `Wait` / `HeartbeatInterval` and records them in the cache.
    ///
    /// The inner error carries the `Limit` to report.
    fn heartbeat(&mut self, request: &SyncRequest) -> ServerResult<Result<Option<u64>, u32>> {
        let config = self.ctx.heartbeat_config();
        let cache = self.collections.cache_mut();
        if let Some(wait) = request.wait {
            let minutes = match check_wait(wait, &config) {
                Ok(minutes) => minutes,
                Err(limit) => {
                    debug!(wait, limit, "wait out of range");
                    return Ok(Err(limit));
                }
            };
            cache.set_wait(Some(minutes));
            cache.set_hbinterval(None);
            return Ok(Ok(Some(u64::from(minutes) * 60)));
        }
        if let Some(seconds) = request.heartbeat {
            let seconds = match check_heartbeat(seconds, &config) {
                Ok(seconds) => seconds,
                Err(limit) => {
                    debug!(seconds, limit, "heartbeat out of range");
                    return Ok(Err(limit));
                }
            };
            cache.set_hbinterval(Some(seconds));
            cache.set_wait(None);
            return Ok(Ok(Some(u64::from(seconds))));
        }
        if request.partial {
            return Ok(Ok(self.cached_heartbeat()));
        }
        cache.set_wait(None);
        cache.set_hbinterval(None);
        Ok(Ok(None))
    }

    fn cached_heartbeat(&self) -> Option<u64> {
        let cache = self.collections.cache();
        cache
            .hbinterval()
            .map(u64::from)
            .or_else(|| cache.wait().map(|minutes| u64::from(minutes) * 60))
    }

    /// Applies the request's collections to the cache and merges cached
    /// collections into partial requests. Returns a response if the request
    /// cannot proceed.
    fn process_collections(
        &mut self,
        request: SyncRequest,
        now: u64,
    ) -> ServerResult<Option<Response>> {
        let cache = self.collections.cache_mut();
        if request.partial {
            if !cache.validate_timestamps(now) {
                debug!(device = %self.ctx.device_id(), "looping sync unfinished, full sync required");
                return Ok(Some(Response::Global(SyncStatus::RequestIncomplete)));
            }
        } else {
            cache.clear_confirmed_keys();
            cache.clear_collection_keys();
        }

        let mut supported = Vec::new();
        for mut collection in request.collections {
            let id = collection.id.clone();
            let cache = self.collections.cache_mut();

            if let Some(fields) = collection.supported.take() {
                if !collection.synckey.is_initial() {
                    debug!(collection = %id, "Supported outside initial sync");
                    return Ok(Some(Response::Global(SyncStatus::ProtocolError)));
                }
                let class = collection
                    .class
                    .or_else(|| cache.folder(&id).map(|f| f.class()))
                    .unwrap_or(CollectionClass::Email);
                supported.push((class.as_str().to_string(), fields));
            }

            let cached = cache.collection(&id);
            let filter_changed = !collection.synckey.is_initial()
                && matches!(
                    (cached.and_then(|c| c.settings.filter_type), collection.settings.filter_type),
                    (Some(old), Some(new)) if old != new
                );
            if collection.settings.window_size.is_none() {
                collection.settings.window_size = request.window_size.or_else(|| {
                    cached
                        .and_then(|c| c.settings.window_size)
                        .is_none()
                        .then_some(self.ctx.config.default_window_size)
                });
            }
            cache.fill_from_cache(&mut collection);

            if request.partial && cache.remove_confirmed_key(&collection.synckey) {
                debug!(collection = %id, synckey = %collection.synckey, "synckey confirmed");
            }

            if filter_changed {
                info!(collection = %id, "filter type changed, resetting collection");
                self.reset_collection(&id)?;
                self.statuses.insert(id.clone(), SyncStatus::KeyMismatch);
            } else if !collection.synckey.is_initial()
                && cache.loop_count(&id, &collection.synckey)
                    >= self.ctx.config.max_synckey_repeats
            {
                warn!(
                    collection = %id,
                    synckey = %collection.synckey,
                    "exchanges keep failing on one synckey, resetting collection"
                );
                self.reset_collection(&id)?;
                self.statuses.insert(id.clone(), SyncStatus::KeyMismatch);
            } else if collection.synckey.is_initial() && !collection.commands.is_empty() {
                debug!(collection = %id, "commands sent with initial synckey");
                self.statuses.insert(id.clone(), SyncStatus::ProtocolError);
            }
            self.collections.add(collection);
        }

        if !supported.is_empty() {
            self.ctx.update_device(|device| {
                for (class, fields) in &supported {
                    device.supported.insert(class.clone(), fields.clone());
                }
            })?;
        }

        if request.partial {
            let before: BTreeSet<String> = self.collections.ids().into_iter().collect();
            self.collections.load_from_cache(false);
            let merged: Vec<String> = self
                .collections
                .ids()
                .into_iter()
                .filter(|id| !before.contains(id))
                .collect();
            debug!(device = %self.ctx.device_id(), merged = merged.len(), "partial SYNC");
            self.complete_from_cache(&merged, request.window_size);

            if self.collections.cache().has_unconfirmed_keys() {
                let outstanding: Vec<&str> = self.collections.cache().confirmed_keys().collect();
                info!(device = %self.ctx.device_id(), ?outstanding, "unconfirmed synckeys");
                return Ok(Some(Response::Global(SyncStatus::RequestIncomplete)));
            }
        }
        Ok(None)
    }

    /// Completes collections taken from the cache, optionally overriding
    /// their window size.
    fn complete_from_cache(&mut self, ids: &[String], window_size: Option<u32>) {
        for id in ids {
            let Some(mut collection) = self.collections.remove(id) else {
                continue;
            };
            if window_size.is_some() {
                collection.settings.window_size = window_size;
            }
            self.collections.cache_mut().fill_from_cache(&mut collection);
            self.collections.add(collection);
        }
    }

    fn reset_collection(&mut self, id: &str) -> ServerResult<()> {
        self.ctx.states().reset(
            self.ctx.device_id(),
            self.ctx.user(),
            StateScope::collection(id),
        )?;
        self.collections.cache_mut().remove_collection(id);
        Ok(())
    }

    /// Loads a collection's state. Failures are recorded as the collection's
    /// status, or as a missing folder.
    fn load_state(&mut self, collection: &SyncCollection) -> ServerResult<Option<SyncStateRecord>> {
        let scope = StateScope::collection(collection.id.clone());
        let loaded = self.ctx.states().load_state(
            self.ctx.device_id(),
            self.ctx.user(),
            &scope,
            &collection.synckey,
        );
        match loaded {
            Ok(state) => Ok(Some(state)),
            Err(e) if e.is_folder_gone() => {
                info!(collection = %collection.id, "folder gone");
                self.folder_gone = true;
                Ok(None)
            }
            Err(e) if e.requires_resync() => {
                info!(
                    collection = %collection.id,
                    synckey = %collection.synckey,
                    error = %e,
                    "synckey rejected, resetting collection"
                );
                self.reset_collection(&collection.id)?;
                self.statuses
                    .insert(collection.id.clone(), SyncStatus::KeyMismatch);
                Ok(None)
            }
            Err(e) if e.is_backend_failure() => {
                error!(collection = %collection.id, error = %e, "cannot load state");
                self.statuses
                    .insert(collection.id.clone(), SyncStatus::ServerError);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Applies the device's commands of every collection.
    fn import_changes(&mut self) -> ServerResult<()> {
        for id in self.collections.ids() {
            if self.statuses.contains_key(&id) {
                continue;
            }
            let Some(collection) = self.collections.get(&id).cloned() else {
                continue;
            };
            if !collection.has_imports() {
                continue;
            }
            let Some(mut state) = self.load_state(&collection)? else {
                if self.folder_gone {
                    return Ok(());
                }
                continue;
            };

            let replies = self.import(&collection, &mut state);
            debug!(
                collection = %id,
                commands = collection.commands.len(),
                failed = replies.iter().filter(|r| !matches!(r, Reply::Add { status: SyncStatus::Success, .. })).count(),
                "imported device changes"
            );
            self.replies.insert(id.clone(), replies);
            self.imported.insert(id.clone());
            self.states.insert(id, state);
            self.collections.set_imported_changes();
        }
        Ok(())
    }

    fn import(&self, collection: &SyncCollection, state: &mut SyncStateRecord) -> Vec<Reply> {
        let driver = self.ctx.driver();
        let waste_basket = if collection.settings.deletes_as_moves() {
            driver.waste_basket(collection.class.unwrap_or(CollectionClass::Email))
        } else {
            None
        };
        let mut importer = Importer::new(
            driver,
            state,
            collection.id.clone(),
            collection.settings.conflict_policy(),
        )
        .with_deletes_as_moves(waste_basket);

        let mut replies = Vec::new();
        for command in &collection.commands {
            match command {
                ClientCommand::Add { client_id, data } => match importer.import_add(data) {
                    Ok(server_id) => replies.push(Reply::Add {
                        client_id: client_id.clone(),
                        server_id: Some(server_id),
                        status: SyncStatus::Success,
                    }),
                    Err(e) => {
                        warn!(collection = %collection.id, %client_id, error = %e, "add failed");
                        replies.push(Reply::Add {
                            client_id: client_id.clone(),
                            server_id: None,
                            status: command_status(&e),
                        });
                    }
                },
                ClientCommand::Modify { server_id, data } => {
                    if let Err(e) = importer.import_change(server_id, data) {
                        warn!(collection = %collection.id, %server_id, error = %e, "change failed");
                        replies.push(Reply::Change {
                            server_id: server_id.clone(),
                            status: command_status(&e),
                        });
                    }
                }
                ClientCommand::ReadFlag { server_id, read } => {
                    if let Err(e) = importer.import_read_flag(server_id, *read) {
                        warn!(collection = %collection.id, %server_id, error = %e, "read flag failed");
                        replies.push(Reply::Change {
                            server_id: server_id.clone(),
                            status: command_status(&e),
                        });
                    }
                }
                ClientCommand::Remove { server_id } => {
                    if let Err(e) = importer.import_delete(server_id) {
                        warn!(collection = %collection.id, %server_id, error = %e, "delete failed");
                        replies.push(Reply::Delete {
                            server_id: server_id.clone(),
                            status: command_status(&e),
                        });
                    }
                }
                ClientCommand::Fetch { .. } => {}
            }
        }
        replies
    }

    /// Looping is only worth it when the response would otherwise be empty.
    fn can_loop(&self) -> bool {
        self.statuses.is_empty()
            && !self.collections.imported_changes()
            && self.collections.iter().all(|c| {
                !c.synckey.is_initial()
                    && !c
                        .commands
                        .iter()
                        .any(|cmd| matches!(cmd, ClientCommand::Fetch { .. }))
            })
    }

    fn export_all(&mut self, now: u64) -> ServerResult<Response> {
        let mut out = EventWriter::new();
        for id in self.collections.ids() {
            let Some(collection) = self.collections.get(&id).cloned() else {
                continue;
            };

            let state = match self.statuses.contains_key(&id) {
                true => None,
                false => match self.states.remove(&id) {
                    Some(state) => Some(state),
                    None => self.load_state(&collection)?,
                },
            };
            if self.folder_gone {
                return Ok(Response::Global(SyncStatus::FolderSyncRequired));
            }
            let Some(state) = state else {
                let status = self
                    .statuses
                    .get(&id)
                    .copied()
                    .unwrap_or(SyncStatus::ServerError);
                if status == SyncStatus::ServerError {
                    self.count_failure(&collection);
                }
                write_failed_collection(&mut out, &collection, status);
                continue;
            };

            let replies = self.replies.remove(&id).unwrap_or_default();
            match self.export(&collection, state, &replies, now) {
                Ok((elements, new_key)) => {
                    write_elements(&mut out, elements);
                    let cache = self.collections.cache_mut();
                    if let Some(key) = &new_key {
                        cache.add_confirmed_key(key);
                    }
                    cache.update_collection(&collection, new_key);
                    cache.set_pingable(&id, true);
                    cache.clear_loop_counter(&id);
                }
                Err(e) if e.is_folder_gone() => {
                    return Ok(Response::Global(SyncStatus::FolderSyncRequired));
                }
                Err(e) if e.requires_resync() => {
                    info!(collection = %id, error = %e, "state advanced concurrently");
                    write_failed_collection(&mut out, &collection, SyncStatus::KeyMismatch);
                }
                Err(e) => {
                    error!(collection = %id, error = %e, "export failed");
                    self.count_failure(&collection);
                    write_failed_collection(&mut out, &collection, SyncStatus::ServerError);
                }
            }
        }
        Ok(Response::Collections(out.into_elements()))
    }

    /// Counts a failed exchange against the key the device presented.
    fn count_failure(&mut self, collection: &SyncCollection) {
        if collection.synckey.is_initial() {
            return;
        }
        let count = self
            .collections
            .cache_mut()
            .increment_loop_counter(&collection.id, &collection.synckey);
        debug!(
            collection = %collection.id,
            synckey = %collection.synckey,
            count,
            "exchange failed"
        );
    }

    /// Writes one collection's response and persists its state.
    ///
    /// Returns the collection block and the newly issued key, if any.
    fn export(
        &self,
        collection: &SyncCollection,
        mut state: SyncStateRecord,
        replies: &[Reply],
        now: u64,
    ) -> EngineResult<(Vec<Element>, Option<SyncKey>)> {
        let driver = self.ctx.driver();
        let initial = collection.synckey.is_initial();
        let window = collection.settings.window_size() as usize;

        let mut commands = EventWriter::new();
        let mut change_count = 0;
        let mut exported = 0;
        if !initial && collection.wants_changes() {
            let mut sync = Synchronizer::init(&mut state, driver, &collection.settings, false)?;
            change_count = sync.change_count();
            let mut exporter = EncoderExporter::new(&mut commands);
            while exported < window {
                match sync.synchronize(&mut exporter)? {
                    Some(_) => exported += 1,
                    None => break,
                }
            }
        }

        let new_key = (self.imported.contains(&collection.id) || change_count > 0 || initial)
            .then(|| StateStore::new_sync_key(&collection.synckey));
        if let Some(key) = new_key {
            state.synckey = key;
            self.ctx
                .states()
                .save(&mut state, &collection.synckey, now)?;
        }
        debug!(
            collection = %collection.id,
            synckey = %new_key.unwrap_or(collection.synckey),
            changes = change_count,
            exported,
            "collection exported"
        );

        let mut out = EventWriter::new();
        out.start_tag(Tag::Folder);
        if let Some(class) = collection.class {
            out.element(Tag::FolderType, class.as_str());
        }
        out.element(
            Tag::SyncKey,
            &new_key.unwrap_or(collection.synckey).to_string(),
        );
        out.element(Tag::FolderId, &collection.id);
        out.element(Tag::Status, &SyncStatus::Success.code().to_string());

        let fetches: Vec<&String> = collection
            .commands
            .iter()
            .filter_map(|c| match c {
                ClientCommand::Fetch { server_id } => Some(server_id),
                _ => None,
            })
            .collect();
        if !replies.is_empty() || !fetches.is_empty() {
            out.start_tag(Tag::Replies);
            for reply in replies {
                write_reply(&mut out, reply);
            }
            for server_id in fetches {
                out.start_tag(Tag::Fetch);
                out.element(Tag::ServerEntryId, server_id);
                match driver.fetch_item(&collection.id, server_id, &collection.settings) {
                    Ok(Some(data)) => {
                        out.element(Tag::Status, &SyncStatus::Success.code().to_string());
                        out.start_tag(Tag::Data);
                        out.opaque(&data);
                        out.end_tag();
                    }
                    Ok(None) => {
                        out.element(Tag::Status, &SyncStatus::ObjectNotFound.code().to_string());
                    }
                    Err(e) => {
                        warn!(collection = %collection.id, %server_id, error = %e, "fetch failed");
                        out.element(Tag::Status, &command_status(&e).code().to_string());
                    }
                }
                out.end_tag();
            }
            out.end_tag();
        }

        if change_count > window {
            out.empty_tag(Tag::MoreAvailable);
        }
        if !commands.is_empty() {
            out.start_tag(Tag::Commands);
            write_elements(&mut out, commands.into_elements());
            out.end_tag();
        }
        out.end_tag();

        Ok((out.into_elements(), new_key))
    }

    /// Persists the cache where appropriate and writes the response.
    fn finish(mut self, response: Response, encoder: &mut dyn Encoder) -> ServerResult<bool> {
        let now = self.ctx.now();
        let save = !matches!(
            response,
            Response::Stale | Response::Global(SyncStatus::ProtocolError)
        );
        if save {
            let cache = self.collections.cache_mut();
            if self.looped {
                cache.set_last_sync_end_normal(Some(now));
                cache.set_last_until(None);
            }
            if cache.save(now)? == SaveOutcome::Superseded {
                debug!(device = %self.ctx.device_id(), "cache changed by a newer request");
            }
        }

        match response {
            Response::Global(status) => {
                info!(device = %self.ctx.device_id(), status = status.code(), "SYNC failed");
                write_status(encoder, status);
            }
            Response::Limit(limit) => {
                encoder.start_tag(Tag::Synchronize);
                encoder.element(
                    Tag::Status,
                    &SyncStatus::InvalidWaitOrHeartbeat.code().to_string(),
                );
                encoder.element(Tag::Limit, &limit.to_string());
                encoder.end_tag();
            }
            Response::Empty => {
                info!(device = %self.ctx.device_id(), "no changes, empty response");
            }
            Response::Stale => {
                info!(device = %self.ctx.device_id(), "superseded by a newer request");
            }
            Response::Collections(elements) => {
                encoder.start_tag(Tag::Synchronize);
                encoder.start_tag(Tag::Folders);
                write_elements(encoder, elements);
                encoder.end_tag();
                encoder.end_tag();
                info!(
                    device = %self.ctx.device_id(),
                    collections = self.collections.len(),
                    "SYNC complete"
                );
            }
        }
        Ok(true)
    }
}

fn command_status(e: &EngineError) -> SyncStatus {
    match e {
        EngineError::NotFound { .. } => SyncStatus::ObjectNotFound,
        _ => SyncStatus::ServerError,
    }
}

fn write_status(encoder: &mut dyn Encoder, status: SyncStatus) {
    encoder.start_tag(Tag::Synchronize);
    encoder.element(Tag::Status, &status.code().to_string());
    encoder.end_tag();
}

fn write_failed_collection(out: &mut EventWriter, collection: &SyncCollection, status: SyncStatus) {
    let key = match status {
        SyncStatus::KeyMismatch => SyncKey::Initial,
        _ => collection.synckey,
    };
    out.start_tag(Tag::Folder);
    if let Some(class) = collection.class {
        out.element(Tag::FolderType, class.as_str());
    }
    out.element(Tag::SyncKey, &key.to_string());
    out.element(Tag::FolderId, &collection.id);
    out.element(Tag::Status, &status.code().to_string());
    out.end_tag();
}

fn write_reply(out: &mut EventWriter, reply: &Reply) {
    match reply {
        Reply::Add {
            client_id,
            server_id,
            status,
        } => {
            out.start_tag(Tag::Add);
            out.element(Tag::ClientEntryId, client_id);
            if let Some(server_id) = server_id {
                out.element(Tag::ServerEntryId, server_id);
            }
            out.element(Tag::Status, &status.code().to_string());
            out.end_tag();
        }
        Reply::Change { server_id, status } => {
            out.start_tag(Tag::Modify);
            out.element(Tag::ServerEntryId, server_id);
            out.element(Tag::Status, &status.code().to_string());
            out.end_tag();
        }
        Reply::Delete { server_id, status } => {
            out.start_tag(Tag::Remove);
            out.element(Tag::ServerEntryId, server_id);
            out.element(Tag::Status, &status.code().to_string());
            out.end_tag();
        }
    }
}

/// Checks `Wait` against 1..=59 minutes and the heartbeat bounds. The error
/// is the violated bound, in minutes.
fn check_wait(minutes: i64, config: &HeartbeatConfig) -> Result<u32, u32> {
    let min = config.heartbeat_min.div_ceil(60).max(1);
    let max = (config.clamp(config.heartbeat_max) / 60).clamp(min, MAX_WAIT_MINUTES);
    if minutes < i64::from(min) {
        Err(min)
    } else if minutes > i64::from(max) {
        Err(max)
    } else {
        Ok(minutes as u32)
    }
}

/// Checks `HeartbeatInterval` against the heartbeat bounds. The error is the
/// violated bound, in seconds.
fn check_heartbeat(seconds: i64, config: &HeartbeatConfig) -> Result<u32, u32> {
    let min = config.heartbeat_min;
    let max = config.clamp(config.heartbeat_max);
    if seconds < i64::from(min) {
        Err(min)
    } else if seconds > i64::from(max) {
        Err(max)
    } else {
        Ok(seconds as u32)
    }
}

// Parsing

/// Parses a SYNC body. `None` is the empty request.
fn parse_request(decoder: &mut dyn Decoder) -> ProtocolResult<Option<SyncRequest>> {
    let Some(start) = decoder.get_element_start_tag(Tag::Synchronize) else {
        return match decoder.peek() {
            None => Ok(None),
            Some(_) => Err(ProtocolError::MissingElement(Tag::Synchronize)),
        };
    };
    if start.empty {
        return Ok(None);
    }

    let mut request = SyncRequest::default();
    while let Some(child) = next_child(decoder, Tag::Synchronize)? {
        match child.tag {
            Tag::Folders => {
                if !child.empty {
                    while let Some(item) = next_child(decoder, Tag::Folders)? {
                        match item.tag {
                            Tag::Folder => request.collections.push(parse_collection(decoder, item)?),
                            other => return Err(unexpected(Tag::Folders, other)),
                        }
                    }
                }
            }
            Tag::Wait => {
                if request.heartbeat.is_some() {
                    return Err(ProtocolError::Conflicting {
                        first: Tag::HeartbeatInterval,
                        second: Tag::Wait,
                    });
                }
                // Zero counts as not specified.
                request.wait = Some(decoder.read_number(child)?).filter(|minutes| *minutes != 0);
            }
            Tag::HeartbeatInterval => {
                if request.wait.is_some() {
                    return Err(ProtocolError::Conflicting {
                        first: Tag::Wait,
                        second: Tag::HeartbeatInterval,
                    });
                }
                request.heartbeat =
                    Some(decoder.read_number(child)?).filter(|seconds| *seconds != 0);
            }
            Tag::WindowSize => request.window_size = Some(read_window_size(decoder, child)?),
            Tag::Partial => request.partial = read_flag(decoder, child)?,
            other => return Err(unexpected(Tag::Synchronize, other)),
        }
    }
    Ok(Some(request))
}

fn read_window_size(decoder: &mut dyn Decoder, start: StartTag) -> ProtocolResult<u32> {
    let requested = decoder.read_number(start)?;
    let size = clamp_window_size(requested);
    if i64::from(size) != requested {
        debug!(requested, size, "window size out of range");
    }
    Ok(size)
}

fn parse_collection(decoder: &mut dyn Decoder, start: StartTag) -> ProtocolResult<SyncCollection> {
    let mut id = None;
    let mut synckey = None;
    let mut class = None;
    let mut settings = CollectionSettings::default();
    let mut get_changes = None;
    let mut commands = Vec::new();
    let mut supported = None;

    if !start.empty {
        while let Some(child) = next_child(decoder, Tag::Folder)? {
            match child.tag {
                Tag::FolderType => {
                    let text = decoder.read_text(child)?;
                    class = Some(
                        text.parse::<CollectionClass>()
                            .map_err(|v| ProtocolError::invalid_value(Tag::FolderType, v))?,
                    );
                }
                Tag::SyncKey => synckey = Some(SyncKey::parse(&decoder.read_text(child)?)?),
                Tag::FolderId => id = Some(decoder.read_text(child)?),
                Tag::Supported => supported = Some(parse_supported(decoder, child)?),
                Tag::DeletesAsMoves => settings.deletes_as_moves = Some(read_flag(decoder, child)?),
                Tag::GetChanges => get_changes = Some(read_flag(decoder, child)?),
                Tag::WindowSize => settings.window_size = Some(read_window_size(decoder, child)?),
                Tag::Options => parse_options(decoder, child, &mut settings)?,
                Tag::Commands => commands = parse_commands(decoder, child)?,
                other => return Err(unexpected(Tag::Folder, other)),
            }
        }
    }

    let id = id
        .filter(|id| !id.is_empty())
        .ok_or(ProtocolError::MissingElement(Tag::FolderId))?;
    let synckey = synckey.ok_or(ProtocolError::MissingElement(Tag::SyncKey))?;
    let mut collection = SyncCollection::new(id, synckey).with_settings(settings);
    collection.class = class;
    collection.get_changes = get_changes;
    collection.commands = commands;
    collection.supported = supported;
    Ok(collection)
}

fn parse_supported(decoder: &mut dyn Decoder, start: StartTag) -> ProtocolResult<Vec<String>> {
    let mut fields = Vec::new();
    if start.empty {
        return Ok(fields);
    }
    while let Some(child) = next_child(decoder, Tag::Supported)? {
        fields.push(child.tag.name().to_string());
        decoder.skip_element(child)?;
    }
    Ok(fields)
}

fn parse_options(
    decoder: &mut dyn Decoder,
    start: StartTag,
    settings: &mut CollectionSettings,
) -> ProtocolResult<()> {
    if start.empty {
        return Ok(());
    }
    while let Some(child) = next_child(decoder, Tag::Options)? {
        match child.tag {
            Tag::FilterType => settings.filter_type = Some(read_u8(decoder, child)?),
            Tag::Truncation => settings.truncation = Some(read_u8(decoder, child)?),
            Tag::RtfTruncation => settings.rtf_truncation = Some(read_u8(decoder, child)?),
            Tag::MimeSupport => settings.mime_support = Some(read_u8(decoder, child)?),
            Tag::MimeTruncation => settings.mime_truncation = Some(read_u8(decoder, child)?),
            Tag::Conflict => {
                let code = decoder.read_number(child)?;
                settings.conflict = Some(
                    ConflictPolicy::from_code(code)
                        .ok_or_else(|| ProtocolError::invalid_value(Tag::Conflict, code.to_string()))?,
                );
            }
            Tag::BodyPreference => settings.body_prefs.push(parse_body_preference(decoder, child)?),
            other => return Err(unexpected(Tag::Options, other)),
        }
    }
    Ok(())
}

fn parse_body_preference(
    decoder: &mut dyn Decoder,
    start: StartTag,
) -> ProtocolResult<BodyPreference> {
    let mut body_type = None;
    let mut truncation_size = None;
    let mut all_or_none = false;
    if !start.empty {
        while let Some(child) = next_child(decoder, Tag::BodyPreference)? {
            match child.tag {
                Tag::BodyPreferenceType => body_type = Some(read_u8(decoder, child)?),
                Tag::TruncationSize => {
                    let size = decoder.read_number(child)?;
                    truncation_size = Some(u32::try_from(size).map_err(|_| {
                        ProtocolError::invalid_value(Tag::TruncationSize, size.to_string())
                    })?);
                }
                Tag::AllOrNone => all_or_none = read_flag(decoder, child)?,
                other => return Err(unexpected(Tag::BodyPreference, other)),
            }
        }
    }
    Ok(BodyPreference {
        body_type: body_type.ok_or(ProtocolError::MissingElement(Tag::BodyPreferenceType))?,
        truncation_size,
        all_or_none,
    })
}

fn parse_commands(decoder: &mut dyn Decoder, start: StartTag) -> ProtocolResult<Vec<ClientCommand>> {
    let mut commands = Vec::new();
    if start.empty {
        return Ok(commands);
    }
    while let Some(child) = next_child(decoder, Tag::Commands)? {
        let mut client_id = None;
        let mut server_id = None;
        let mut payload = None;
        let mut read = None;
        if !child.empty {
            while let Some(field) = next_child(decoder, child.tag)? {
                match field.tag {
                    Tag::ClientEntryId => client_id = Some(decoder.read_text(field)?),
                    Tag::ServerEntryId => server_id = Some(decoder.read_text(field)?),
                    Tag::Data => {
                        let (data, flag) = parse_application_data(decoder, field)?;
                        payload = data;
                        read = flag;
                    }
                    other => return Err(unexpected(child.tag, other)),
                }
            }
        }

        let command = match child.tag {
            Tag::Add => ClientCommand::Add {
                client_id: client_id.ok_or(ProtocolError::MissingElement(Tag::ClientEntryId))?,
                data: payload.unwrap_or_default(),
            },
            Tag::Modify => {
                let server_id = server_id.ok_or(ProtocolError::MissingElement(Tag::ServerEntryId))?;
                match (payload, read) {
                    (None, Some(read)) => ClientCommand::ReadFlag { server_id, read },
                    (data, _) => ClientCommand::Modify {
                        server_id,
                        data: data.unwrap_or_default(),
                    },
                }
            }
            Tag::Remove => ClientCommand::Remove {
                server_id: server_id.ok_or(ProtocolError::MissingElement(Tag::ServerEntryId))?,
            },
            Tag::Fetch => ClientCommand::Fetch {
                server_id: server_id.ok_or(ProtocolError::MissingElement(Tag::ServerEntryId))?,
            },
            other => return Err(unexpected(Tag::Commands, other)),
        };
        commands.push(command);
    }
    Ok(commands)
}

/// Reads `ApplicationData`: an opaque payload, or a bare read flag.
fn parse_application_data(
    decoder: &mut dyn Decoder,
    start: StartTag,
) -> ProtocolResult<(Option<Vec<u8>>, Option<bool>)> {
    if start.empty {
        return Ok((Some(Vec::new()), None));
    }
    let mut payload = None;
    let mut read = None;
    loop {
        if decoder.get_element_end_tag() {
            break;
        }
        if let Some(data) = decoder.get_element_opaque() {
            payload = Some(data);
        } else if let Some(text) = decoder.get_element_content() {
            payload = Some(text.into_bytes());
        } else if let Some(child) = decoder.next_start_tag() {
            match child.tag {
                Tag::Read => read = Some(read_flag(decoder, child)?),
                _ => decoder.skip_element(child)?,
            }
        } else {
            return Err(ProtocolError::UnexpectedEnd);
        }
    }
    Ok((payload, read))
}
