//! FOLDERSYNC.

use super::{next_child, read_u8, unexpected, write_elements};
use crate::error::ServerResult;
use crate::handler::HandlerContext;
use easync_engine::{Driver, EncoderExporter, EngineResult, HierarchySynchronizer};
use easync_protocol::{
    Decoder, Encoder, EventWriter, Folder, FolderChange, FolderSyncStatus, FolderType,
    ProtocolError, ProtocolResult, StartTag, SyncKey, Tag,
};
use easync_state::{SaveOutcome, StateFilter, StateScope, SyncCache};
use tracing::{debug, error, info, warn};

/// Placeholder device id used while a device is being paired.
const PAIRING_DEVICE: &str = "validate";

#[derive(Debug)]
struct FolderSyncRequest {
    synckey: SyncKey,
    changes: Vec<DeviceChange>,
}

/// A folder change made on the device.
#[derive(Debug, PartialEq)]
enum DeviceChange {
    Add {
        parent_id: String,
        display_name: String,
        folder_type: FolderType,
    },
    Update {
        server_id: String,
        parent_id: String,
        display_name: String,
    },
    Delete {
        server_id: String,
    },
}

/// Handles a FOLDERSYNC request.
pub(crate) fn handle(
    ctx: &mut HandlerContext,
    decoder: &mut dyn Decoder,
    encoder: &mut dyn Encoder,
) -> ServerResult<bool> {
    info!(device = %ctx.device_id(), "handling FOLDERSYNC");

    let request = match parse_request(decoder) {
        Ok(request) => request,
        Err(e) => {
            warn!(device = %ctx.device_id(), error = %e, "malformed FOLDERSYNC request");
            write_status(encoder, FolderSyncStatus::FormatError);
            return Ok(true);
        }
    };
    let now = ctx.now();
    let previous = request.synckey;

    let loaded = ctx
        .states()
        .load_state(ctx.device_id(), ctx.user(), &StateScope::Hierarchy, &previous);
    let mut state = match loaded {
        Ok(state) => state,
        Err(e) if e.requires_resync() => {
            info!(device = %ctx.device_id(), synckey = %previous, error = %e, "hierarchy synckey rejected");
            write_status(encoder, FolderSyncStatus::KeyMismatch);
            return Ok(true);
        }
        Err(e) => {
            error!(device = %ctx.device_id(), error = %e, "cannot load hierarchy state");
            write_status(encoder, FolderSyncStatus::ServerError);
            return Ok(true);
        }
    };

    let mut cache = ctx.load_cache()?;
    if previous.is_initial() {
        debug!(device = %ctx.device_id(), "initial FOLDERSYNC, clearing cached folders");
        cache.clear_folders();
        cache.clear_collections();
    }

    for change in &request.changes {
        if let Err(e) = apply_change(ctx.driver(), &mut cache, change) {
            error!(device = %ctx.device_id(), ?change, error = %e, "folder change failed");
            write_status(encoder, FolderSyncStatus::ServerError);
            return Ok(true);
        }
    }

    let mut sync = match HierarchySynchronizer::init(ctx.driver(), &state.folders) {
        Ok(sync) => sync,
        Err(e) => {
            error!(device = %ctx.device_id(), error = %e, "cannot list folders");
            write_status(encoder, FolderSyncStatus::ServerError);
            return Ok(true);
        }
    };
    sync.retain(|change| match change {
        FolderChange::Add(folder) | FolderChange::Update(folder) => !cache.folder_matches(folder),
        FolderChange::Remove(id) => cache.folder(id).is_some(),
    });
    let count = sync.change_count();

    let mut body = EventWriter::new();
    let mut exported = Vec::with_capacity(count);
    {
        let mut exporter = EncoderExporter::new(&mut body);
        while let Some(change) = sync.synchronize(&mut exporter)? {
            exported.push(change);
        }
    }

    let synckey = if count > 0 || !request.changes.is_empty() || previous.is_initial() {
        let key = previous.next();
        state.synckey = key;
        state.set_folder_data(sync.current_folders().to_vec());
        match ctx.states().save(&mut state, &previous, now) {
            Ok(()) => {}
            Err(e) if e.requires_resync() => {
                info!(device = %ctx.device_id(), error = %e, "hierarchy state advanced concurrently");
                write_status(encoder, FolderSyncStatus::KeyMismatch);
                return Ok(true);
            }
            Err(e) => return Err(e.into()),
        }

        cache.set_hierarchy(Some(key));
        for change in exported {
            match change {
                FolderChange::Add(folder) | FolderChange::Update(folder) => {
                    cache.update_folder(folder)
                }
                FolderChange::Remove(id) => cache.delete_folder(&id),
            }
        }
        if cache.save(now)? == SaveOutcome::Superseded {
            debug!(device = %ctx.device_id(), "cache changed by a newer request");
        }
        key
    } else {
        previous
    };

    if ctx.device_id() != PAIRING_DEVICE {
        let removed = ctx
            .states()
            .store()
            .remove_state(&StateFilter::device(PAIRING_DEVICE).with_user(ctx.user()))?;
        if removed > 0 {
            debug!(user = %ctx.user(), removed, "removed pairing state");
        }
    }

    info!(device = %ctx.device_id(), %synckey, changes = count, "FOLDERSYNC complete");
    encoder.start_tag(Tag::FolderSync);
    encoder.element(
        Tag::HierarchyStatus,
        &FolderSyncStatus::Success.code().to_string(),
    );
    encoder.element(Tag::HierarchySyncKey, &synckey.to_string());
    encoder.start_tag(Tag::HierarchyChanges);
    encoder.element(Tag::HierarchyCount, &count.to_string());
    write_elements(encoder, body.into_elements());
    encoder.end_tag();
    encoder.end_tag();
    Ok(true)
}

/// Applies a device change through the driver and mirrors it in the cache.
fn apply_change(driver: &dyn Driver, cache: &mut SyncCache, change: &DeviceChange) -> EngineResult<()> {
    match change {
        DeviceChange::Add {
            parent_id,
            display_name,
            folder_type,
        } => {
            let folder = driver.create_folder(parent_id, display_name, *folder_type)?;
            debug!(folder = %folder.server_id, "folder created by device");
            cache.update_folder(folder);
        }
        DeviceChange::Update {
            server_id,
            parent_id,
            display_name,
        } => {
            let folder = driver.rename_folder(server_id, parent_id, display_name)?;
            cache.update_folder(folder);
        }
        DeviceChange::Delete { server_id } => {
            driver.delete_folder(server_id)?;
            cache.delete_folder(server_id);
        }
    }
    Ok(())
}

fn write_status(encoder: &mut dyn Encoder, status: FolderSyncStatus) {
    encoder.start_tag(Tag::FolderSync);
    encoder.element(Tag::HierarchyStatus, &status.code().to_string());
    encoder.end_tag();
}

fn parse_request(decoder: &mut dyn Decoder) -> ProtocolResult<FolderSyncRequest> {
    let start = decoder
        .get_element_start_tag(Tag::FolderSync)
        .ok_or(ProtocolError::MissingElement(Tag::FolderSync))?;
    let mut synckey = None;
    let mut changes = Vec::new();
    if !start.empty {
        while let Some(child) = next_child(decoder, Tag::FolderSync)? {
            match child.tag {
                Tag::HierarchySyncKey => {
                    synckey = Some(SyncKey::parse(&decoder.read_text(child)?)?)
                }
                Tag::HierarchyChanges => changes = parse_changes(decoder, child)?,
                other => return Err(unexpected(Tag::FolderSync, other)),
            }
        }
    }
    Ok(FolderSyncRequest {
        synckey: synckey.ok_or(ProtocolError::MissingElement(Tag::HierarchySyncKey))?,
        changes,
    })
}

fn parse_changes(decoder: &mut dyn Decoder, start: StartTag) -> ProtocolResult<Vec<DeviceChange>> {
    let mut changes = Vec::new();
    if start.empty {
        return Ok(changes);
    }
    while let Some(child) = next_child(decoder, Tag::HierarchyChanges)? {
        if child.tag == Tag::HierarchyCount {
            decoder.skip_element(child)?;
            continue;
        }
        let mut server_id = None;
        let mut parent_id = None;
        let mut display_name = None;
        let mut folder_type = None;
        if !child.empty {
            while let Some(field) = next_child(decoder, child.tag)? {
                match field.tag {
                    Tag::HierarchyServerId => server_id = Some(decoder.read_text(field)?),
                    Tag::HierarchyParentId => parent_id = Some(decoder.read_text(field)?),
                    Tag::HierarchyDisplayName => display_name = Some(decoder.read_text(field)?),
                    Tag::HierarchyType => folder_type = Some(FolderType(read_u8(decoder, field)?)),
                    other => return Err(unexpected(child.tag, other)),
                }
            }
        }
        let missing = ProtocolError::MissingElement;
        changes.push(match child.tag {
            Tag::HierarchyAdd => DeviceChange::Add {
                parent_id: parent_id.unwrap_or_else(|| "0".to_string()),
                display_name: display_name.ok_or(missing(Tag::HierarchyDisplayName))?,
                folder_type: folder_type.ok_or(missing(Tag::HierarchyType))?,
            },
            Tag::HierarchyUpdate => DeviceChange::Update {
                server_id: server_id.ok_or(missing(Tag::HierarchyServerId))?,
                parent_id: parent_id.unwrap_or_else(|| "0".to_string()),
                display_name: display_name.ok_or(missing(Tag::HierarchyDisplayName))?,
            },
            Tag::HierarchyDelete => DeviceChange::Delete {
                server_id: server_id.ok_or(missing(Tag::HierarchyServerId))?,
            },
            other => return Err(unexpected(Tag::HierarchyChanges, other)),
        });
    }
    Ok(changes)
}
