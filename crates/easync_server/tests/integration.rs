//! End-to-end tests of the SYNC, PING and FOLDERSYNC handlers over the
//! in-memory backend and driver.

use easync_engine::{Clock, Driver, HeartbeatConfig, ManualClock, MemoryDriver};
use easync_protocol::{
    clamp_window_size, Element, Encoder, EventWriter, Folder, FolderType, Node, ProtocolVersion,
    SyncKey, Tag,
};
use easync_server::{ActiveSyncServer, Command, CommandRequest, CommandResponse, ServerConfig};
use easync_state::{
    CacheWrite, DeviceRecord, FileBackend, MemoryBackend, RemoteWipeStatus, StateBackend,
    StateFilter, StateResult, StateScope, StateStore, SyncCache, SyncCacheRecord,
    SyncStateRecord,
};
use proptest::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const DEVICE: &str = "dev1";
const USER: &str = "alice";
const START: u64 = 1_700_000_000;

struct Fixture {
    server: ActiveSyncServer,
    driver: Arc<MemoryDriver>,
    backend: Arc<MemoryBackend>,
    clock: Arc<ManualClock>,
}

impl Fixture {
    fn new() -> Self {
        Self::with(HeartbeatConfig::default(), ServerConfig::default())
    }

    fn with(heartbeat: HeartbeatConfig, config: ServerConfig) -> Self {
        let backend = Arc::new(MemoryBackend::new());
        let driver = Arc::new(MemoryDriver::with_config(heartbeat));
        driver.add_folder(Folder::new("INBOX", "Inbox", FolderType::INBOX));
        driver.add_folder(Folder::new("CAL", "Calendar", FolderType::CALENDAR));
        let clock = Arc::new(ManualClock::new(START));
        let server = ActiveSyncServer::new(config, backend.clone(), driver.clone())
            .with_clock(clock.clone());
        Self {
            server,
            driver,
            backend,
            clock,
        }
    }

    fn send_as(
        &self,
        version: ProtocolVersion,
        command: Command,
        body: Vec<Element>,
    ) -> CommandResponse {
        let request = CommandRequest::new(DEVICE, USER, command)
            .with_version(version)
            .with_body(body);
        self.server.handle(request).unwrap()
    }

    fn send(&self, command: Command, body: Vec<Element>) -> CommandResponse {
        self.send_as(ProtocolVersion::V14_1, command, body)
    }

    /// Sends a request that must be answered with a body.
    fn call(&self, command: Command, body: Vec<Element>) -> Node {
        let response = self.send(command, body);
        assert!(response.handled);
        Node::parse(&response.body).unwrap().remove(0)
    }

    fn cache(&self) -> SyncCache {
        SyncCache::load(self.backend.clone(), DEVICE, USER).unwrap()
    }

    /// Runs an initial SYNC for `ids` and returns the issued keys.
    fn initial_sync(&self, ids: &[&str]) -> Vec<SyncKey> {
        let keys: Vec<(&str, SyncKey)> = ids.iter().map(|id| (*id, SyncKey::Initial)).collect();
        let root = self.call(Command::Sync, sync_body(|w| collections(w, &keys)));
        ids.iter()
            .map(|id| {
                let node = collection_node(&root, id);
                assert_eq!(node.child_text(Tag::Status), Some("1"));
                synckey_of(node)
            })
            .collect()
    }
}

// Request builders

fn sync_body(build: impl FnOnce(&mut EventWriter)) -> Vec<Element> {
    let mut w = EventWriter::new();
    w.start_tag(Tag::Synchronize);
    build(&mut w);
    w.end_tag();
    w.into_elements()
}

fn collections(w: &mut EventWriter, keys: &[(&str, SyncKey)]) {
    w.start_tag(Tag::Folders);
    for (id, key) in keys {
        collection(w, id, *key, |_| {});
    }
    w.end_tag();
}

fn collection(w: &mut EventWriter, id: &str, key: SyncKey, extra: impl FnOnce(&mut EventWriter)) {
    w.start_tag(Tag::Folder);
    w.element(Tag::SyncKey, &key.to_string());
    w.element(Tag::FolderId, id);
    extra(w);
    w.end_tag();
}

fn single(id: &str, key: SyncKey, extra: impl FnOnce(&mut EventWriter)) -> Vec<Element> {
    sync_body(|w| {
        w.start_tag(Tag::Folders);
        collection(w, id, key, extra);
        w.end_tag();
    })
}

fn foldersync_body(key: SyncKey, build: impl FnOnce(&mut EventWriter)) -> Vec<Element> {
    let mut w = EventWriter::new();
    w.start_tag(Tag::FolderSync);
    w.element(Tag::HierarchySyncKey, &key.to_string());
    build(&mut w);
    w.end_tag();
    w.into_elements()
}

fn ping_body(heartbeat: Option<u32>, folders: &[&str]) -> Vec<Element> {
    let mut w = EventWriter::new();
    w.start_tag(Tag::Ping);
    if let Some(heartbeat) = heartbeat {
        w.element(Tag::PingHeartbeatInterval, &heartbeat.to_string());
    }
    if !folders.is_empty() {
        w.start_tag(Tag::PingFolders);
        for id in folders {
            w.start_tag(Tag::PingFolder);
            w.element(Tag::PingId, id);
            w.element(Tag::PingClass, "Email");
            w.end_tag();
        }
        w.end_tag();
    }
    w.end_tag();
    w.into_elements()
}

// Response accessors

fn collection_node<'a>(root: &'a Node, id: &str) -> &'a Node {
    root.child(Tag::Folders)
        .and_then(|folders| {
            folders
                .children(Tag::Folder)
                .find(|c| c.child_text(Tag::FolderId) == Some(id))
        })
        .unwrap_or_else(|| panic!("no collection {id} in response"))
}

fn synckey_of(node: &Node) -> SyncKey {
    SyncKey::parse(node.child_text(Tag::SyncKey).unwrap()).unwrap()
}

fn commands_of(node: &Node) -> usize {
    node.child(Tag::Commands)
        .map_or(0, |commands| commands.children.len())
}

// SYNC

#[test]
fn synckeys_advance_within_a_series() {
    let f = Fixture::new();
    let first = f.initial_sync(&["INBOX"])[0];
    assert_eq!(first.counter(), 1);

    f.driver.put_item("INBOX", "m1", b"hello").unwrap();
    let root = f.call(Command::Sync, single("INBOX", first, |_| {}));
    let inbox = collection_node(&root, "INBOX");
    let second = synckey_of(inbox);
    assert_eq!(second.series(), first.series());
    assert_eq!(second.counter(), first.counter() + 1);

    let add = inbox.path(&[Tag::Commands, Tag::Add]).unwrap();
    assert_eq!(add.child_text(Tag::ServerEntryId), Some("m1"));
    assert_eq!(
        add.child(Tag::Data).and_then(|d| d.opaque.as_deref()),
        Some(&b"hello"[..])
    );

    // Nothing new: the key is kept.
    let root = f.call(Command::Sync, single("INBOX", second, |_| {}));
    assert_eq!(synckey_of(collection_node(&root, "INBOX")), second);
}

#[test]
fn replayed_synckey_resets_collection() {
    let f = Fixture::new();
    let first = f.initial_sync(&["INBOX"])[0];
    f.driver.put_item("INBOX", "m1", b"hello").unwrap();
    let root = f.call(Command::Sync, single("INBOX", first, |_| {}));
    let second = synckey_of(collection_node(&root, "INBOX"));
    assert_ne!(first, second);

    let root = f.call(Command::Sync, single("INBOX", first, |_| {}));
    let inbox = collection_node(&root, "INBOX");
    assert_eq!(inbox.child_text(Tag::Status), Some("3"));
    assert_eq!(inbox.child_text(Tag::SyncKey), Some("0"));
    assert!(f.cache().collection("INBOX").is_none());

    // The device starts over with a fresh series.
    let fresh = f.initial_sync(&["INBOX"])[0];
    assert_ne!(fresh.series(), first.series());
    assert_eq!(fresh.counter(), 1);
}

#[test]
fn commands_are_imported_and_answered() {
    let f = Fixture::new();
    let first = f.initial_sync(&["INBOX"])[0];

    let body = single("INBOX", first, |w| {
        w.start_tag(Tag::Commands);
        w.start_tag(Tag::Add);
        w.element(Tag::ClientEntryId, "c1");
        w.start_tag(Tag::Data);
        w.opaque(b"draft");
        w.end_tag();
        w.end_tag();
        w.start_tag(Tag::Modify);
        w.element(Tag::ServerEntryId, "missing");
        w.start_tag(Tag::Data);
        w.opaque(b"x");
        w.end_tag();
        w.end_tag();
        w.end_tag();
    });
    let root = f.call(Command::Sync, body);
    let inbox = collection_node(&root, "INBOX");
    assert_eq!(synckey_of(inbox).counter(), 2);

    let add = inbox.path(&[Tag::Replies, Tag::Add]).unwrap();
    assert_eq!(add.child_text(Tag::ClientEntryId), Some("c1"));
    assert_eq!(add.child_text(Tag::Status), Some("1"));
    let server_id = add.child_text(Tag::ServerEntryId).unwrap();
    assert_eq!(f.driver.item("INBOX", server_id), Some(b"draft".to_vec()));

    let change = inbox.path(&[Tag::Replies, Tag::Modify]).unwrap();
    assert_eq!(change.child_text(Tag::Status), Some("8"));

    // The device's own add is not echoed back.
    assert_eq!(commands_of(inbox), 0);
}

#[test]
fn fetch_returns_item_payload() {
    let f = Fixture::new();
    let first = f.initial_sync(&["INBOX"])[0];
    f.driver.put_item("INBOX", "m1", b"hello").unwrap();

    let body = single("INBOX", first, |w| {
        w.element(Tag::GetChanges, "0");
        w.start_tag(Tag::Commands);
        for id in ["m1", "m9"] {
            w.start_tag(Tag::Fetch);
            w.element(Tag::ServerEntryId, id);
            w.end_tag();
        }
        w.end_tag();
    });
    let root = f.call(Command::Sync, body);
    let inbox = collection_node(&root, "INBOX");
    assert_eq!(synckey_of(inbox), first);
    assert_eq!(commands_of(inbox), 0);

    let fetches: Vec<&Node> = inbox
        .child(Tag::Replies)
        .unwrap()
        .children(Tag::Fetch)
        .collect();
    assert_eq!(fetches[0].child_text(Tag::Status), Some("1"));
    assert_eq!(
        fetches[0].child(Tag::Data).and_then(|d| d.opaque.clone()),
        Some(b"hello".to_vec())
    );
    assert_eq!(fetches[1].child_text(Tag::Status), Some("8"));
}

#[test]
fn window_size_bounds_export() {
    let f = Fixture::new();
    let first = f.initial_sync(&["INBOX"])[0];
    for id in ["m1", "m2", "m3"] {
        f.driver.put_item("INBOX", id, b"x").unwrap();
    }

    let root = f.call(
        Command::Sync,
        single("INBOX", first, |w| w.element(Tag::WindowSize, "2")),
    );
    let inbox = collection_node(&root, "INBOX");
    assert_eq!(commands_of(inbox), 2);
    assert!(inbox.has(Tag::MoreAvailable));

    // The cached window applies to the next request.
    let root = f.call(Command::Sync, single("INBOX", synckey_of(inbox), |_| {}));
    let inbox = collection_node(&root, "INBOX");
    assert_eq!(commands_of(inbox), 1);
    assert!(!inbox.has(Tag::MoreAvailable));
}

#[test]
fn out_of_range_window_falls_back_to_default() {
    let f = Fixture::new();
    let first = f.initial_sync(&["INBOX"])[0];
    for id in ["m1", "m2", "m3"] {
        f.driver.put_item("INBOX", id, b"x").unwrap();
    }
    let root = f.call(
        Command::Sync,
        single("INBOX", first, |w| w.element(Tag::WindowSize, "0")),
    );
    let inbox = collection_node(&root, "INBOX");
    assert_eq!(commands_of(inbox), 3);
    assert!(!inbox.has(Tag::MoreAvailable));
    assert_eq!(
        f.cache().collection("INBOX").unwrap().settings.window_size,
        Some(100)
    );
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn exported_changes_never_exceed_window(requested in -10i64..1_000) {
        let f = Fixture::new();
        let first = f.initial_sync(&["INBOX"])[0];
        for id in ["m1", "m2", "m3"] {
            f.driver.put_item("INBOX", id, b"x").unwrap();
        }
        let root = f.call(
            Command::Sync,
            single("INBOX", first, |w| w.element(Tag::WindowSize, &requested.to_string())),
        );
        let inbox = collection_node(&root, "INBOX");
        let window = clamp_window_size(requested) as usize;
        prop_assert_eq!(commands_of(inbox), window.min(3));
        prop_assert_eq!(inbox.has(Tag::MoreAvailable), window < 3);
    }
}

#[test]
fn filter_change_resets_collection() {
    let f = Fixture::new();
    let with_filter = |key: SyncKey, filter: &'static str| {
        single("INBOX", key, move |w| {
            w.start_tag(Tag::Options);
            w.element(Tag::FilterType, filter);
            w.end_tag();
        })
    };
    let root = f.call(Command::Sync, with_filter(SyncKey::Initial, "3"));
    let first = synckey_of(collection_node(&root, "INBOX"));

    let root = f.call(Command::Sync, with_filter(first, "5"));
    let inbox = collection_node(&root, "INBOX");
    assert_eq!(inbox.child_text(Tag::Status), Some("3"));
    assert_eq!(inbox.child_text(Tag::SyncKey), Some("0"));
}

#[test]
fn exchanges_failing_on_one_key_reset_the_collection() {
    let config = ServerConfig::default().with_max_synckey_repeats(2);
    let f = Fixture::with(HeartbeatConfig::default(), config);
    let first = f.initial_sync(&["INBOX"])[0];
    f.driver.put_item("INBOX", "m1", b"one").unwrap();

    f.driver.set_failing(true);
    for _ in 0..2 {
        let root = f.call(Command::Sync, single("INBOX", first, |_| {}));
        let inbox = collection_node(&root, "INBOX");
        assert_eq!(inbox.child_text(Tag::Status), Some("5"));
        assert_eq!(synckey_of(inbox), first);
    }

    let root = f.call(Command::Sync, single("INBOX", first, |_| {}));
    let inbox = collection_node(&root, "INBOX");
    assert_eq!(inbox.child_text(Tag::Status), Some("3"));
    assert_eq!(inbox.child_text(Tag::SyncKey), Some("0"));
    assert_eq!(f.cache().loop_count("INBOX", &first), 0);

    f.driver.set_failing(false);
    let restarted = f.initial_sync(&["INBOX"])[0];
    let root = f.call(Command::Sync, single("INBOX", restarted, |_| {}));
    assert_eq!(commands_of(collection_node(&root, "INBOX")), 1);
}

#[test]
fn successful_exchange_clears_the_failure_count() {
    let config = ServerConfig::default().with_max_synckey_repeats(2);
    let f = Fixture::with(HeartbeatConfig::default(), config);
    let first = f.initial_sync(&["INBOX"])[0];

    f.driver.set_failing(true);
    f.call(Command::Sync, single("INBOX", first, |_| {}));
    assert_eq!(f.cache().loop_count("INBOX", &first), 1);

    f.driver.set_failing(false);
    let root = f.call(Command::Sync, single("INBOX", first, |_| {}));
    assert_eq!(collection_node(&root, "INBOX").child_text(Tag::Status), Some("1"));
    assert_eq!(f.cache().loop_count("INBOX", &first), 0);
}

#[test]
fn commands_with_initial_key_are_rejected() {
    let f = Fixture::new();
    let body = single("INBOX", SyncKey::Initial, |w| {
        w.start_tag(Tag::Commands);
        w.start_tag(Tag::Remove);
        w.element(Tag::ServerEntryId, "m1");
        w.end_tag();
        w.end_tag();
    });
    let root = f.call(Command::Sync, body);
    assert_eq!(
        collection_node(&root, "INBOX").child_text(Tag::Status),
        Some("4")
    );
}

#[test]
fn partial_sync_includes_cached_collections() {
    let f = Fixture::new();
    let keys = f.initial_sync(&["INBOX", "CAL"]);

    // A full request presenting both keys confirms them.
    let both = [("INBOX", keys[0]), ("CAL", keys[1])];
    let root = f.call(Command::Sync, sync_body(|w| collections(w, &both)));
    assert_eq!(synckey_of(collection_node(&root, "CAL")), keys[1]);

    f.driver.put_item("CAL", "e1", b"meeting").unwrap();
    let body = sync_body(|w| {
        collections(w, &[("INBOX", keys[0])]);
        w.empty_tag(Tag::Partial);
    });
    let root = f.call(Command::Sync, body);

    let inbox = collection_node(&root, "INBOX");
    assert_eq!(synckey_of(inbox), keys[0]);
    let cal = collection_node(&root, "CAL");
    assert_eq!(cal.child_text(Tag::Status), Some("1"));
    assert_eq!(synckey_of(cal).counter(), keys[1].counter() + 1);
    assert_eq!(commands_of(cal), 1);
}

#[test]
fn partial_sync_with_unconfirmed_key_needs_full_request() {
    let f = Fixture::new();
    let keys = f.initial_sync(&["INBOX", "CAL"]);

    let body = sync_body(|w| {
        collections(w, &[("INBOX", keys[0])]);
        w.empty_tag(Tag::Partial);
    });
    let root = f.call(Command::Sync, body);
    assert_eq!(root.child_text(Tag::Status), Some("13"));
    assert!(!root.has(Tag::Folders));
}

#[test]
fn empty_sync_resumes_from_cache() {
    let f = Fixture::new();
    let first = f.initial_sync(&["INBOX"])[0];
    f.driver.put_item("INBOX", "m1", b"hello").unwrap();

    let root = f.call(Command::Sync, Vec::new());
    let inbox = collection_node(&root, "INBOX");
    assert_eq!(synckey_of(inbox).counter(), first.counter() + 1);
    assert_eq!(commands_of(inbox), 1);
}

#[test]
fn empty_sync_requires_short_sync_support() {
    let f = Fixture::new();
    f.initial_sync(&["INBOX"]);
    let response = f.send_as(ProtocolVersion::V12_0, Command::Sync, Vec::new());
    let root = Node::parse(&response.body).unwrap().remove(0);
    assert_eq!(root.child_text(Tag::Status), Some("13"));
}

#[test]
fn wait_out_of_range_reports_limit() {
    let f = Fixture::new();
    let root = f.call(Command::Sync, sync_body(|w| w.element(Tag::Wait, "0")));
    assert_eq!(root.child_text(Tag::Status), Some("14"));
    assert_eq!(root.child_text(Tag::Limit), Some("1"));

    let root = f.call(
        Command::Sync,
        sync_body(|w| w.element(Tag::HeartbeatInterval, "4000")),
    );
    assert_eq!(root.child_text(Tag::Status), Some("14"));
    assert_eq!(root.child_text(Tag::Limit), Some("2700"));
}

#[test]
fn wait_and_heartbeat_together_is_a_protocol_error() {
    let f = Fixture::new();
    let body = sync_body(|w| {
        w.element(Tag::Wait, "5");
        w.element(Tag::HeartbeatInterval, "300");
    });
    let root = f.call(Command::Sync, body);
    assert_eq!(root.child_text(Tag::Status), Some("4"));
}

#[test]
fn removed_folder_requires_folder_sync() {
    let f = Fixture::new();
    let first = f.initial_sync(&["INBOX"])[0];
    f.driver.remove_folder("INBOX");
    let root = f.call(Command::Sync, single("INBOX", first, |_| {}));
    assert_eq!(root.child_text(Tag::Status), Some("12"));
}

#[test]
fn remote_wipe_blocks_sync_and_ping() {
    let f = Fixture::new();
    let first = f.initial_sync(&["INBOX"])[0];
    StateStore::new(f.backend.clone())
        .set_device_rw_status(DEVICE, USER, RemoteWipeStatus::Pending)
        .unwrap();

    let root = f.call(Command::Sync, single("INBOX", first, |_| {}));
    assert_eq!(root.child_text(Tag::Status), Some("12"));
    let root = f.call(Command::Ping, Vec::new());
    assert_eq!(root.child_text(Tag::PingStatus), Some("7"));
}

/// Flags a remote wipe the first time a request reads the sync cache, the
/// way an administrator acting mid-request would.
struct WipeDuringRequest {
    inner: Arc<MemoryBackend>,
    armed: AtomicBool,
}

impl StateBackend for WipeDuringRequest {
    fn latest_sync_state(
        &self,
        device_id: &str,
        user: &str,
        scope: &StateScope,
    ) -> StateResult<Option<SyncStateRecord>> {
        self.inner.latest_sync_state(device_id, user, scope)
    }

    fn save_sync_state(&self, record: &SyncStateRecord, previous: &SyncKey) -> StateResult<()> {
        self.inner.save_sync_state(record, previous)
    }

    fn remove_sync_states(&self, filter: &StateFilter) -> StateResult<usize> {
        self.inner.remove_sync_states(filter)
    }

    fn list_sync_states(&self, device_id: &str) -> StateResult<Vec<SyncStateRecord>> {
        self.inner.list_sync_states(device_id)
    }

    fn load_sync_cache(&self, device_id: &str, user: &str) -> StateResult<Option<SyncCacheRecord>> {
        if self.armed.swap(false, Ordering::SeqCst) {
            StateStore::new(self.inner.clone()).set_device_rw_status(
                device_id,
                user,
                RemoteWipeStatus::Pending,
            )?;
        }
        self.inner.load_sync_cache(device_id, user)
    }

    fn save_sync_cache(&self, record: &SyncCacheRecord, expected: u64) -> StateResult<CacheWrite> {
        self.inner.save_sync_cache(record, expected)
    }

    fn delete_sync_cache(&self, device_id: &str, user: &str) -> StateResult<()> {
        self.inner.delete_sync_cache(device_id, user)
    }

    fn load_device(&self, device_id: &str, user: &str) -> StateResult<Option<DeviceRecord>> {
        self.inner.load_device(device_id, user)
    }

    fn save_device(&self, record: &DeviceRecord) -> StateResult<()> {
        self.inner.save_device(record)
    }

    fn update_device(
        &self,
        device_id: &str,
        user: &str,
        update: &mut dyn FnMut(Option<DeviceRecord>) -> Option<DeviceRecord>,
    ) -> StateResult<Option<DeviceRecord>> {
        self.inner.update_device(device_id, user, update)
    }

    fn list_devices(&self) -> StateResult<Vec<DeviceRecord>> {
        self.inner.list_devices()
    }

    fn remove_device(&self, device_id: &str, user: &str) -> StateResult<bool> {
        self.inner.remove_device(device_id, user)
    }
}

#[test]
fn wipe_flagged_mid_request_survives_device_updates() {
    let inner = Arc::new(MemoryBackend::new());
    let backend = Arc::new(WipeDuringRequest {
        inner: inner.clone(),
        armed: AtomicBool::new(false),
    });
    let driver = Arc::new(MemoryDriver::new());
    driver.add_folder(Folder::new("CONTACTS", "Contacts", FolderType::CONTACTS));
    let server = ActiveSyncServer::new(ServerConfig::default(), backend.clone(), driver)
        .with_clock(Arc::new(ManualClock::new(START)));
    let send = |body: Vec<Element>| {
        let request = CommandRequest::new(DEVICE, USER, Command::Sync)
            .with_version(ProtocolVersion::V14_1)
            .with_body(body);
        server.handle(request).unwrap()
    };

    send(Vec::new());
    backend.armed.store(true, Ordering::SeqCst);
    send(single("CONTACTS", SyncKey::Initial, |w| {
        w.start_tag(Tag::Supported);
        w.element(Tag::Read, "");
        w.end_tag();
    }));

    let device = inner.load_device(DEVICE, USER).unwrap().unwrap();
    assert_eq!(device.rw_status, RemoteWipeStatus::Pending);
    assert!(!device.supported.is_empty());

    // Later requests only refresh the bookkeeping fields.
    send(Vec::new());
    let device = inner.load_device(DEVICE, USER).unwrap().unwrap();
    assert_eq!(device.rw_status, RemoteWipeStatus::Pending);
}

// Looping SYNC

#[test]
fn looping_sync_returns_when_changes_arrive() {
    let heartbeat = HeartbeatConfig::default().with_wait_interval(Duration::from_secs(5));
    let f = Fixture::with(heartbeat, ServerConfig::default());
    let first = f.initial_sync(&["INBOX"])[0];

    let started = f.clock.now();
    let driver = f.driver.clone();
    f.clock.on_wait(move |now| {
        if now == started + 10 {
            driver.put_item("INBOX", "m1", b"late").unwrap();
        }
    });

    let body = sync_body(|w| {
        collections(w, &[("INBOX", first)]);
        w.element(Tag::HeartbeatInterval, "60");
    });
    let root = f.call(Command::Sync, body);
    let elapsed = f.clock.now() - started;
    assert!((10..15).contains(&elapsed), "elapsed {elapsed}");
    assert_eq!(f.clock.waits(), 2);

    let inbox = collection_node(&root, "INBOX");
    assert_eq!(commands_of(inbox), 1);
    assert_eq!(synckey_of(inbox).counter(), 2);

    let cache = f.cache();
    assert_eq!(cache.hbinterval(), Some(60));
    assert!(cache.last_until().is_none());
    assert!(cache.validate_timestamps(f.clock.now()));
}

#[test]
fn looping_sync_without_changes_ends_at_deadline() {
    let f = Fixture::new();
    let first = f.initial_sync(&["INBOX"])[0];
    let started = f.clock.now();

    let body = sync_body(|w| {
        collections(w, &[("INBOX", first)]);
        w.element(Tag::Wait, "1");
    });
    let response = f.send(Command::Sync, body);
    assert!(response.handled);
    assert!(response.body.is_empty());
    assert_eq!(f.clock.now() - started, 60);
}

#[test]
fn stale_looping_sync_steps_aside() {
    let f = Fixture::new();
    let first = f.initial_sync(&["INBOX"])[0];

    // Another request of the same device saves the cache mid-wait.
    let backend: Arc<dyn StateBackend> = f.backend.clone();
    let done = AtomicBool::new(false);
    f.clock.on_wait(move |now| {
        if !done.swap(true, Ordering::SeqCst) {
            let mut other = SyncCache::load(backend.clone(), DEVICE, USER).unwrap();
            other.set_ping_heartbeat(Some(900));
            other.save(now).unwrap();
        }
    });

    let body = sync_body(|w| {
        collections(w, &[("INBOX", first)]);
        w.element(Tag::HeartbeatInterval, "120");
    });
    let response = f.send(Command::Sync, body);
    assert!(response.handled);
    assert!(response.body.is_empty());

    // The newer writer's cache survives.
    assert_eq!(f.cache().ping_heartbeat(), Some(900));
}

// PING

#[test]
fn empty_ping_is_idempotent() {
    let f = Fixture::new();
    f.initial_sync(&["INBOX"]);

    let first = f.send(Command::Ping, Vec::new());
    let second = f.send(Command::Ping, Vec::new());
    assert_eq!(first, second);

    let root = Node::parse(&first.body).unwrap().remove(0);
    assert_eq!(root.child_text(Tag::PingStatus), Some("1"));
    assert_eq!(f.cache().pingable_collections(), vec!["INBOX".to_string()]);
}

#[test]
fn ping_without_monitored_folders_is_missing_parameters() {
    let f = Fixture::new();
    let root = f.call(Command::Ping, Vec::new());
    assert_eq!(root.child_text(Tag::PingStatus), Some("3"));
}

#[test]
fn ping_reports_changed_folders() {
    let f = Fixture::new();
    f.initial_sync(&["INBOX", "CAL"]);

    let started = f.clock.now();
    let driver = f.driver.clone();
    f.clock.on_wait(move |now| {
        if now == started + 30 {
            driver.put_item("CAL", "e1", b"meeting").unwrap();
        }
    });

    let root = f.call(Command::Ping, ping_body(Some(300), &["INBOX", "CAL"]));
    assert_eq!(root.child_text(Tag::PingStatus), Some("2"));
    let changed: Vec<&str> = root
        .child(Tag::PingFolders)
        .unwrap()
        .children(Tag::PingFolder)
        .filter_map(|n| n.text.as_deref())
        .collect();
    assert_eq!(changed, vec!["CAL"]);
    assert_eq!(f.clock.now() - started, 30);
    assert_eq!(f.cache().ping_heartbeat(), Some(300));
}

#[test]
fn ping_skips_folders_never_synchronized() {
    let f = Fixture::new();
    f.initial_sync(&["INBOX"]);
    f.call(Command::Ping, ping_body(Some(60), &["INBOX", "CAL"]));
    assert_eq!(f.cache().pingable_collections(), vec!["INBOX".to_string()]);
}

#[test]
fn ping_heartbeat_out_of_bounds_is_clamped() {
    let f = Fixture::new();
    f.initial_sync(&["INBOX"]);
    let root = f.call(Command::Ping, ping_body(Some(10), &["INBOX"]));
    assert_eq!(root.child_text(Tag::PingStatus), Some("5"));
    assert_eq!(root.child_text(Tag::PingHeartbeatInterval), Some("60"));
    assert_eq!(f.clock.waits(), 0);
    assert_eq!(f.cache().ping_heartbeat(), Some(60));
}

#[test]
fn ping_with_too_many_folders() {
    let f = Fixture::with(
        HeartbeatConfig::default(),
        ServerConfig::default().with_max_ping_folders(1),
    );
    let root = f.call(Command::Ping, ping_body(None, &["INBOX", "CAL"]));
    assert_eq!(root.child_text(Tag::PingStatus), Some("6"));
    assert_eq!(root.child_text(Tag::PingMaxFolders), Some("1"));
}

// FOLDERSYNC

fn folder_count(root: &Node) -> Option<&str> {
    root.child(Tag::HierarchyChanges)
        .and_then(|changes| changes.child_text(Tag::HierarchyCount))
}

fn hierarchy_key(root: &Node) -> SyncKey {
    SyncKey::parse(root.child_text(Tag::HierarchySyncKey).unwrap()).unwrap()
}

#[test]
fn initial_foldersync_lists_every_folder() {
    let f = Fixture::new();
    let root = f.call(Command::FolderSync, foldersync_body(SyncKey::Initial, |_| {}));
    assert_eq!(root.child_text(Tag::HierarchyStatus), Some("1"));
    let key = hierarchy_key(&root);
    assert_eq!(key.counter(), 1);
    assert_eq!(folder_count(&root), Some("2"));
    let adds = root
        .child(Tag::HierarchyChanges)
        .unwrap()
        .children(Tag::HierarchyAdd)
        .count();
    assert_eq!(adds, 2);

    let cache = f.cache();
    assert_eq!(cache.hierarchy(), Some(key));
    assert_eq!(cache.folders().len(), 2);

    // Nothing changed: same key, empty change list.
    let root = f.call(Command::FolderSync, foldersync_body(key, |_| {}));
    assert_eq!(root.child_text(Tag::HierarchyStatus), Some("1"));
    assert_eq!(hierarchy_key(&root), key);
    assert_eq!(folder_count(&root), Some("0"));
}

#[test]
fn foldersync_reports_server_changes_and_rejects_replays() {
    let f = Fixture::new();
    let root = f.call(Command::FolderSync, foldersync_body(SyncKey::Initial, |_| {}));
    let first = hierarchy_key(&root);

    f.driver
        .add_folder(Folder::new("NOTES", "Notes", FolderType::NOTES));
    f.driver.remove_folder("CAL");
    let root = f.call(Command::FolderSync, foldersync_body(first, |_| {}));
    let second = hierarchy_key(&root);
    assert_eq!(second.counter(), 2);
    assert_eq!(folder_count(&root), Some("2"));
    let changes = root.child(Tag::HierarchyChanges).unwrap();
    assert_eq!(
        changes
            .path(&[Tag::HierarchyAdd])
            .and_then(|n| n.child_text(Tag::HierarchyServerId)),
        Some("NOTES")
    );
    assert_eq!(
        changes
            .path(&[Tag::HierarchyDelete])
            .and_then(|n| n.child_text(Tag::HierarchyServerId)),
        Some("CAL")
    );
    assert!(f.cache().folder("CAL").is_none());

    let root = f.call(Command::FolderSync, foldersync_body(first, |_| {}));
    assert_eq!(root.child_text(Tag::HierarchyStatus), Some("9"));
    assert!(!root.has(Tag::HierarchySyncKey));
}

#[test]
fn device_created_folder_is_not_echoed() {
    let f = Fixture::new();
    let root = f.call(Command::FolderSync, foldersync_body(SyncKey::Initial, |_| {}));
    let first = hierarchy_key(&root);

    let body = foldersync_body(first, |w| {
        w.start_tag(Tag::HierarchyChanges);
        w.start_tag(Tag::HierarchyAdd);
        w.element(Tag::HierarchyParentId, "0");
        w.element(Tag::HierarchyDisplayName, "Archive");
        w.element(Tag::HierarchyType, "12");
        w.end_tag();
        w.end_tag();
    });
    let root = f.call(Command::FolderSync, body);
    let second = hierarchy_key(&root);
    assert_eq!(second.counter(), 2);
    assert_eq!(folder_count(&root), Some("0"));

    let folders = f.driver.folder_list().unwrap();
    assert!(folders.iter().any(|folder| folder.display_name == "Archive"));

    let root = f.call(Command::FolderSync, foldersync_body(second, |_| {}));
    assert_eq!(hierarchy_key(&root), second);
    assert_eq!(folder_count(&root), Some("0"));
}

#[test]
fn malformed_hierarchy_key_is_a_format_error() {
    let f = Fixture::new();
    let mut w = EventWriter::new();
    w.start_tag(Tag::FolderSync);
    w.element(Tag::HierarchySyncKey, "not-a-key");
    w.end_tag();
    let root = f.call(Command::FolderSync, w.into_elements());
    assert_eq!(root.child_text(Tag::HierarchyStatus), Some("10"));
}

#[test]
fn foldersync_removes_pairing_state() {
    let f = Fixture::new();
    let pairing = CommandRequest::new("validate", USER, Command::FolderSync)
        .with_body(foldersync_body(SyncKey::Initial, |_| {}));
    assert!(f.server.handle(pairing).unwrap().handled);
    let store = StateStore::new(f.backend.clone());
    assert!(!store.known_folders("validate", USER).unwrap().is_empty());

    f.call(Command::FolderSync, foldersync_body(SyncKey::Initial, |_| {}));
    assert!(store.known_folders("validate", USER).unwrap().is_empty());
}

#[test]
fn state_on_disk_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let driver = Arc::new(MemoryDriver::new());
    driver.add_folder(Folder::new("INBOX", "Inbox", FolderType::INBOX));
    driver.put_item("INBOX", "m1", b"one").unwrap();
    let start = |driver: Arc<MemoryDriver>| {
        let backend = Arc::new(FileBackend::open(dir.path()).unwrap());
        ActiveSyncServer::new(ServerConfig::default(), backend, driver)
            .with_clock(Arc::new(ManualClock::new(START)))
    };
    let call = |server: &ActiveSyncServer, command: Command, body: Vec<Element>| {
        let request = CommandRequest::new(DEVICE, USER, command)
            .with_version(ProtocolVersion::V14_1)
            .with_body(body);
        let response = server.handle(request).unwrap();
        Node::parse(&response.body).unwrap().remove(0)
    };

    let (hierarchy, first) = {
        let server = start(driver.clone());
        let root = call(&server, Command::FolderSync, foldersync_body(SyncKey::Initial, |_| {}));
        let hierarchy = hierarchy_key(&root);
        let root = call(&server, Command::Sync, single("INBOX", SyncKey::Initial, |_| {}));
        (hierarchy, synckey_of(collection_node(&root, "INBOX")))
    };

    let server = start(driver);
    let root = call(&server, Command::FolderSync, foldersync_body(hierarchy, |_| {}));
    assert_eq!(hierarchy_key(&root), hierarchy);
    assert_eq!(folder_count(&root), Some("0"));

    let root = call(&server, Command::Sync, single("INBOX", first, |_| {}));
    let inbox = collection_node(&root, "INBOX");
    assert_eq!(synckey_of(inbox), first.next());
    assert_eq!(commands_of(inbox), 1);
}
