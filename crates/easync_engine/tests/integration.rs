//! Integration tests for the engine over real state backends.

use easync_engine::{
    ChangeSet, Clock, Collections, ExportedChange, Importer, ManualClock, MemoryDriver,
    PollMode, PollOutcome, StateManager, Synchronizer,
};
use easync_protocol::{CollectionSettings, ConflictPolicy, Folder, FolderType, SyncCollection, SyncKey};
use easync_state::{
    FileBackend, MemoryBackend, StateBackend, StateScope, StateStore, SyncCache,
};
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

const DEVICE: &str = "dev1";
const USER: &str = "alice";

fn driver() -> Arc<MemoryDriver> {
    let driver = Arc::new(MemoryDriver::new());
    driver.add_folder(Folder::new("INBOX", "Inbox", FolderType::INBOX));
    driver
}

fn manager(backend: Arc<dyn StateBackend>, driver: Arc<MemoryDriver>) -> StateManager {
    StateManager::new(StateStore::new(backend), driver)
}

/// Runs one export round from `key` and returns the new key with the
/// exported changes.
fn export_round(
    states: &StateManager,
    driver: &MemoryDriver,
    key: SyncKey,
    window: usize,
    now: u64,
) -> (SyncKey, Vec<ExportedChange>) {
    let scope = StateScope::collection("INBOX");
    let mut state = states.load_state(DEVICE, USER, &scope, &key).unwrap();
    let mut sink = ChangeSet::new();
    {
        let mut sync =
            Synchronizer::init(&mut state, driver, &CollectionSettings::default(), false).unwrap();
        for _ in 0..window {
            if sync.synchronize(&mut sink).unwrap().is_none() {
                break;
            }
        }
    }
    if sink.is_empty() && !key.is_initial() {
        return (key, Vec::new());
    }
    state.synckey = key.next();
    states.save(&mut state, &key, now).unwrap();
    (state.synckey, sink.changes().to_vec())
}

#[test]
fn exchange_survives_reopening_the_state_dir() {
    let dir = tempfile::tempdir().unwrap();
    let driver = driver();
    driver.put_item("INBOX", "m1", b"one").unwrap();
    driver.put_item("INBOX", "m2", b"two").unwrap();

    let key = {
        let backend: Arc<dyn StateBackend> = Arc::new(FileBackend::open(dir.path()).unwrap());
        let states = manager(backend, driver.clone());
        let (key, changes) = export_round(&states, &driver, SyncKey::Initial, 1, 10);
        assert_eq!(changes.len(), 1);
        key
    };

    // The unsent change is still pending after a restart.
    let backend: Arc<dyn StateBackend> = Arc::new(FileBackend::open(dir.path()).unwrap());
    let states = manager(backend, driver.clone());
    let (next, changes) = export_round(&states, &driver, key, 10, 20);
    assert_eq!(next.counter(), 2);
    assert_eq!(
        changes,
        vec![ExportedChange::Item {
            id: "m2".into(),
            data: b"two".to_vec(),
            is_new: true,
        }]
    );

    // The superseded key is rejected.
    let err = states
        .load_state(DEVICE, USER, &StateScope::collection("INBOX"), &key)
        .unwrap_err();
    assert!(err.requires_resync());
}

#[test]
fn imported_changes_are_not_sent_back() {
    let backend: Arc<dyn StateBackend> = Arc::new(MemoryBackend::new());
    let driver = driver();
    let states = manager(backend, driver.clone());
    let (key, _) = export_round(&states, &driver, SyncKey::Initial, 10, 0);

    let scope = StateScope::collection("INBOX");
    let mut state = states.load_state(DEVICE, USER, &scope, &key).unwrap();
    let id = {
        let mut importer =
            Importer::new(driver.as_ref(), &mut state, "INBOX", ConflictPolicy::ServerWins);
        importer.import_add(b"from device").unwrap()
    };
    driver.put_item("INBOX", "server", b"from server").unwrap();

    let mut sink = ChangeSet::new();
    {
        let mut sync =
            Synchronizer::init(&mut state, driver.as_ref(), &CollectionSettings::default(), false)
                .unwrap();
        while sync.synchronize(&mut sink).unwrap().is_some() {}
    }
    let ids: Vec<_> = sink
        .changes()
        .iter()
        .filter_map(|c| match c {
            ExportedChange::Item { id, .. } => Some(id.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(ids, ["server"]);
    assert!(driver.item("INBOX", &id).is_some());
}

#[test]
fn ping_poll_wakes_on_server_change() {
    let backend: Arc<dyn StateBackend> = Arc::new(MemoryBackend::new());
    let driver = driver();
    let states = manager(backend.clone(), driver.clone());
    let (key, _) = export_round(&states, &driver, SyncKey::Initial, 10, 0);

    let mut cache = SyncCache::load(backend.clone(), DEVICE, USER).unwrap();
    let collection = SyncCollection::new("INBOX", key);
    cache.add_collection(&collection);
    cache.set_pingable("INBOX", true);
    cache.save(0).unwrap();

    let clock = Arc::new(ManualClock::new(1_000));
    let hook_driver = driver.clone();
    clock.on_wait(move |now| {
        if now == 1_030 {
            hook_driver.put_item("INBOX", "late", b"late").unwrap();
        }
    });

    let mut collections = Collections::new(
        SyncCache::load(backend, DEVICE, USER).unwrap(),
        states,
        clock.clone(),
    );
    assert_eq!(collections.load_from_cache(true), 1);
    let outcome = collections
        .poll_for_changes(300, Duration::from_secs(10), PollMode::Ping)
        .unwrap();
    assert_eq!(outcome, PollOutcome::DataAvailable(vec!["INBOX".into()]));
    assert_eq!(clock.now(), 1_030);
    assert_eq!(collections.get("INBOX").unwrap().get_changes, Some(true));
}

fn apply(changes: Vec<ExportedChange>, mirror: &mut BTreeMap<String, Vec<u8>>) {
    for change in changes {
        match change {
            ExportedChange::Item { id, data, .. } => {
                mirror.insert(id, data);
            }
            ExportedChange::ItemDeleted(id) => {
                mirror.remove(&id);
            }
            _ => {}
        }
    }
}

#[derive(Debug, Clone)]
enum Mutation {
    Put(u8, u8),
    Remove(u8),
    Read(u8, bool),
}

fn mutation() -> impl Strategy<Value = Mutation> {
    prop_oneof![
        (0u8..6, any::<u8>()).prop_map(|(id, v)| Mutation::Put(id, v)),
        (0u8..6).prop_map(Mutation::Remove),
        (0u8..6, any::<bool>()).prop_map(|(id, read)| Mutation::Read(id, read)),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn device_view_converges(
        batches in prop::collection::vec(prop::collection::vec(mutation(), 0..8), 1..6),
        window in 1usize..4,
    ) {
        let backend: Arc<dyn StateBackend> = Arc::new(MemoryBackend::new());
        let driver = driver();
        let states = manager(backend, driver.clone());
        let mut mirror: BTreeMap<String, Vec<u8>> = BTreeMap::new();
        let mut key = SyncKey::Initial;
        let mut now = 0;

        for batch in batches {
            for m in batch {
                match m {
                    Mutation::Put(id, v) => {
                        driver.put_item("INBOX", &id.to_string(), &[v]).unwrap();
                    }
                    Mutation::Remove(id) => {
                        if driver.item("INBOX", &id.to_string()).is_some() {
                            driver.remove_item("INBOX", &id.to_string()).unwrap();
                        }
                    }
                    Mutation::Read(id, read) => {
                        if driver.item("INBOX", &id.to_string()).is_some() {
                            driver.set_read("INBOX", &id.to_string(), read).unwrap();
                        }
                    }
                }
            }
            now += 1;
            let (next, changes) = export_round(&states, &driver, key, window, now);
            prop_assert!(changes.len() <= window);
            key = next;
            apply(changes, &mut mirror);
        }

        // Drain whatever the window held back.
        loop {
            now += 1;
            let (next, changes) = export_round(&states, &driver, key, window, now);
            if changes.is_empty() {
                break;
            }
            key = next;
            apply(changes, &mut mirror);
        }

        for id in 0u8..6 {
            let id = id.to_string();
            prop_assert_eq!(mirror.get(&id).cloned(), driver.item("INBOX", &id));
        }
    }
}
