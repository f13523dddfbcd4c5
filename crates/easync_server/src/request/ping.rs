//! PING.
//!
//! Registers the folders to monitor, settles the heartbeat and waits for
//! changes in any of them. A request without folders or heartbeat reuses
//! what the previous PING of the device left in the sync cache.

use super::{next_child, unexpected};
use crate::error::ServerResult;
use crate::handler::HandlerContext;
use easync_engine::{PollMode, PollOutcome};
use easync_protocol::{
    CollectionClass, Decoder, Encoder, PingStatus, ProtocolError, ProtocolResult, StartTag, Tag,
};
use easync_state::SaveOutcome;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct PingRequest {
    heartbeat: Option<i64>,
    folders: Option<Vec<PingFolder>>,
}

#[derive(Debug, PartialEq)]
struct PingFolder {
    id: String,
    class: Option<CollectionClass>,
}

#[derive(Debug, Default)]
struct PingResponse {
    folders: Vec<String>,
    heartbeat: Option<u32>,
    max_folders: Option<usize>,
}

/// Handles a PING request.
pub(crate) fn handle(
    ctx: &mut HandlerContext,
    decoder: &mut dyn Decoder,
    encoder: &mut dyn Encoder,
) -> ServerResult<bool> {
    info!(device = %ctx.device_id(), "handling PING");

    if ctx.wipe_pending() {
        info!(device = %ctx.device_id(), "remote wipe pending");
        write_response(encoder, PingStatus::FolderSyncRequired, PingResponse::default());
        return Ok(true);
    }

    let request = match parse_request(decoder) {
        Ok(request) => request,
        Err(e) => {
            warn!(device = %ctx.device_id(), error = %e, "malformed PING request");
            write_response(encoder, PingStatus::ProtocolError, PingResponse::default());
            return Ok(true);
        }
    };

    let max_folders = ctx.config.max_ping_folders;
    if let Some(folders) = request.folders.as_ref().filter(|f| f.len() > max_folders) {
        info!(device = %ctx.device_id(), folders = folders.len(), max_folders, "too many folders");
        let response = PingResponse {
            max_folders: Some(max_folders),
            ..PingResponse::default()
        };
        write_response(encoder, PingStatus::TooManyFolders, response);
        return Ok(true);
    }

    let config = ctx.heartbeat_config();
    let now = ctx.now();
    let mut collections = ctx.collections(ctx.load_cache()?);

    let requested = request
        .heartbeat
        .filter(|seconds| *seconds > 0)
        .map(|seconds| u32::try_from(seconds).unwrap_or(u32::MAX));
    let heartbeat = match (config.forced_heartbeat, requested) {
        (Some(forced), _) => forced,
        (None, Some(seconds)) if !config.in_bounds(seconds) => {
            let bounded = config.clamp(seconds);
            info!(device = %ctx.device_id(), requested = seconds, bounded, "heartbeat out of bounds");
            let cache = collections.cache_mut();
            cache.set_ping_heartbeat(Some(bounded));
            cache.save(now)?;
            let response = PingResponse {
                heartbeat: Some(bounded),
                ..PingResponse::default()
            };
            write_response(encoder, PingStatus::HeartbeatOutOfBounds, response);
            return Ok(true);
        }
        (None, Some(seconds)) => {
            collections.cache_mut().set_ping_heartbeat(Some(seconds));
            seconds
        }
        (None, None) => collections
            .cache()
            .ping_heartbeat()
            .unwrap_or(config.heartbeat_default),
    };

    match request.folders {
        Some(folders) => {
            let cache = collections.cache_mut();
            cache.clear_pingable();
            let mut registered = Vec::with_capacity(folders.len());
            for folder in folders {
                let Some(cached) = cache.collection(&folder.id) else {
                    debug!(collection = %folder.id, "not synchronized yet, not monitored");
                    continue;
                };
                if cached.issued_key().is_none() {
                    debug!(collection = %folder.id, "no synckey issued, not monitored");
                    continue;
                }
                let mut collection = cached.to_request();
                collection.class = collection.class.or(folder.class);
                cache.set_pingable(&folder.id, true);
                registered.push(collection);
            }
            for collection in registered {
                collections.add(collection);
            }
        }
        None => {
            collections.load_from_cache(true);
        }
    }

    if collections.is_empty() {
        info!(device = %ctx.device_id(), "no folders to monitor");
        collections.cache_mut().save(now)?;
        write_response(encoder, PingStatus::MissingParameters, PingResponse::default());
        return Ok(true);
    }

    if collections.cache_mut().save(now)? == SaveOutcome::Superseded {
        debug!(device = %ctx.device_id(), "superseded before polling");
        write_response(encoder, PingStatus::NoChanges, PingResponse::default());
        return Ok(true);
    }

    let outcome = collections.poll_for_changes(
        u64::from(heartbeat),
        config.wait_interval,
        PollMode::Ping,
    )?;
    let (status, changed) = match outcome {
        PollOutcome::DataAvailable(ids) => (PingStatus::ChangesAvailable, ids),
        PollOutcome::NoChanges | PollOutcome::Stale => (PingStatus::NoChanges, Vec::new()),
        PollOutcome::FolderSyncRequired => (PingStatus::FolderSyncRequired, Vec::new()),
        PollOutcome::SyncRequired => (PingStatus::MissingParameters, Vec::new()),
        PollOutcome::ServerError => (PingStatus::ServerError, Vec::new()),
    };
    info!(
        device = %ctx.device_id(),
        heartbeat,
        status = status.code(),
        changed = changed.len(),
        "PING complete"
    );
    let response = PingResponse {
        folders: changed,
        ..PingResponse::default()
    };
    write_response(encoder, status, response);
    Ok(true)
}

fn write_response(encoder: &mut dyn Encoder, status: PingStatus, response: PingResponse) {
    encoder.start_tag(Tag::Ping);
    encoder.element(Tag::PingStatus, &status.code().to_string());
    if !response.folders.is_empty() {
        encoder.start_tag(Tag::PingFolders);
        for id in &response.folders {
            encoder.element(Tag::PingFolder, id);
        }
        encoder.end_tag();
    }
    if let Some(heartbeat) = response.heartbeat {
        encoder.element(Tag::PingHeartbeatInterval, &heartbeat.to_string());
    }
    if let Some(max) = response.max_folders {
        encoder.element(Tag::PingMaxFolders, &max.to_string());
    }
    encoder.end_tag();
}

fn parse_request(decoder: &mut dyn Decoder) -> ProtocolResult<PingRequest> {
    let mut request = PingRequest::default();
    let Some(start) = decoder.get_element_start_tag(Tag::Ping) else {
        return match decoder.peek() {
            None => Ok(request),
            Some(_) => Err(ProtocolError::MissingElement(Tag::Ping)),
        };
    };
    if start.empty {
        return Ok(request);
    }

    while let Some(child) = next_child(decoder, Tag::Ping)? {
        match child.tag {
            Tag::PingHeartbeatInterval => request.heartbeat = Some(decoder.read_number(child)?),
            Tag::PingFolders => {
                let mut folders = Vec::new();
                if !child.empty {
                    while let Some(item) = next_child(decoder, Tag::PingFolders)? {
                        match item.tag {
                            Tag::PingFolder => folders.push(parse_folder(decoder, item)?),
                            other => return Err(unexpected(Tag::PingFolders, other)),
                        }
                    }
                }
                request.folders = Some(folders).filter(|f| !f.is_empty());
            }
            other => return Err(unexpected(Tag::Ping, other)),
        }
    }
    Ok(request)
}

fn parse_folder(decoder: &mut dyn Decoder, start: StartTag) -> ProtocolResult<PingFolder> {
    let mut id = None;
    let mut class = None;
    if !start.empty {
        while let Some(child) = next_child(decoder, Tag::PingFolder)? {
            match child.tag {
                Tag::PingId => id = Some(decoder.read_text(child)?),
                Tag::PingClass => {
                    let text = decoder.read_text(child)?;
                    class = Some(
                        text.parse::<CollectionClass>()
                            .map_err(|v| ProtocolError::invalid_value(Tag::PingClass, v))?,
                    );
                }
                other => return Err(unexpected(Tag::PingFolder, other)),
            }
        }
    }
    Ok(PingFolder {
        id: id
            .filter(|id| !id.is_empty())
            .ok_or(ProtocolError::MissingElement(Tag::PingId))?,
        class,
    })
}
