//! File-based state backend for persistent storage.
//!
//! Layout:
//!
//! ```text
//! <root>/
//! └─ <device>/              # hex-encoded device id
//!    ├─ LOCK                # advisory lock held during every operation
//!    ├─ device-<user>.cbor  # DeviceRecord
//!    ├─ states-<user>.cbor  # Vec<SyncStateRecord>
//!    └─ cache-<user>.cbor   # SyncCacheRecord
//! ```
//!
//! User names are hex-encoded in file names. Records are CBOR. Writes go to a
//! temporary file that is renamed over the target, so readers never observe
//! a partial record.

use crate::backend::{check_previous, CacheWrite, StateBackend};
use crate::error::{StateError, StateResult};
use crate::records::{DeviceRecord, StateFilter, StateScope, SyncCacheRecord, SyncStateRecord};
use easync_protocol::SyncKey;
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";
const DEVICE_PREFIX: &str = "device-";
const STATES_PREFIX: &str = "states-";
const CACHE_PREFIX: &str = "cache-";
const EXTENSION: &str = ".cbor";

/// A file-based state backend.
///
/// Every operation on a device takes an exclusive advisory lock on that
/// device's `LOCK` file, so the compare-and-swap checks hold across
/// processes sharing the directory.
///
/// # Example
///
/// ```no_run
/// use easync_state::{FileBackend, StateBackend};
/// use std::path::Path;
///
/// let backend = FileBackend::open(Path::new("/var/lib/easync")).unwrap();
/// for device in backend.list_devices().unwrap() {
///     println!("{} ({})", device.id, device.user);
/// }
/// ```
#[derive(Debug)]
pub struct FileBackend {
    root: PathBuf,
}

/// Exclusive lock on one device directory, released on drop.
struct DeviceLock {
    file: File,
}

impl Drop for DeviceLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

impl FileBackend {
    /// Opens a backend rooted at `root`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or is not a
    /// directory.
    pub fn open(root: &Path) -> StateResult<Self> {
        fs::create_dir_all(root)?;
        if !root.is_dir() {
            return Err(StateError::Corrupted(format!(
                "state root is not a directory: {}",
                root.display()
            )));
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// Returns the root directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.root
    }

    fn device_dir(&self, device_id: &str) -> PathBuf {
        self.root.join(encode_component(device_id))
    }

    fn lock_device(&self, device_id: &str) -> StateResult<DeviceLock> {
        let dir = self.device_dir(device_id);
        fs::create_dir_all(&dir)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join(LOCK_FILE))?;
        file.lock_exclusive()?;
        Ok(DeviceLock { file })
    }

    /// Locks a device directory for reading or removal. Returns `None`
    /// without touching the disk if the device has no directory.
    fn lock_existing(&self, device_id: &str) -> StateResult<Option<DeviceLock>> {
        if !self.device_dir(device_id).is_dir() {
            return Ok(None);
        }
        self.lock_device(device_id).map(Some)
    }

    fn file_path(&self, device_id: &str, prefix: &str, user: &str) -> PathBuf {
        self.device_dir(device_id)
            .join(format!("{prefix}{}{EXTENSION}", encode_component(user)))
    }

    fn read_states(&self, device_id: &str, user: &str) -> StateResult<Vec<SyncStateRecord>> {
        Ok(read_record(&self.file_path(device_id, STATES_PREFIX, user))?.unwrap_or_default())
    }

    fn write_states(
        &self,
        device_id: &str,
        user: &str,
        states: &[SyncStateRecord],
    ) -> StateResult<()> {
        write_record(&self.file_path(device_id, STATES_PREFIX, user), states)
    }

    /// Returns the decoded ids of every device directory.
    fn device_ids(&self) -> StateResult<Vec<String>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(id) = entry.file_name().to_str().and_then(decode_component) {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Returns the decoded user names that have a file with `prefix` in a
    /// device directory.
    fn users_with(&self, device_id: &str, prefix: &str) -> StateResult<Vec<String>> {
        let dir = self.device_dir(device_id);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut users = Vec::new();
        for entry in entries {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(encoded) = name
                .strip_prefix(prefix)
                .and_then(|rest| rest.strip_suffix(EXTENSION))
            else {
                continue;
            };
            if let Some(user) = decode_component(encoded) {
                users.push(user);
            }
        }
        users.sort();
        Ok(users)
    }
}

impl StateBackend for FileBackend {
    fn latest_sync_state(
        &self,
        device_id: &str,
        user: &str,
        scope: &StateScope,
    ) -> StateResult<Option<SyncStateRecord>> {
        let Some(_lock) = self.lock_existing(device_id)? else {
            return Ok(None);
        };
        Ok(self
            .read_states(device_id, user)?
            .into_iter()
            .find(|r| r.scope == *scope))
    }

    fn save_sync_state(&self, record: &SyncStateRecord, previous: &SyncKey) -> StateResult<()> {
        let _lock = self.lock_device(&record.device_id)?;
        let mut states = self.read_states(&record.device_id, &record.user)?;
        let position = states.iter().position(|r| r.scope == record.scope);
        check_previous(position.map(|i| &states[i]), record, previous)?;
        match position {
            Some(i) => states[i] = record.clone(),
            None => states.push(record.clone()),
        }
        self.write_states(&record.device_id, &record.user, &states)
    }

    fn remove_sync_states(&self, filter: &StateFilter) -> StateResult<usize> {
        let devices = match &filter.device_id {
            Some(device_id) => vec![device_id.clone()],
            None => self.device_ids()?,
        };

        let mut removed = 0;
        for device_id in devices {
            let Some(_lock) = self.lock_existing(&device_id)? else {
                continue;
            };
            let users = match &filter.user {
                Some(user) => vec![user.clone()],
                None => self.users_with(&device_id, STATES_PREFIX)?,
            };
            for user in users {
                let mut states = self.read_states(&device_id, &user)?;
                let before = states.len();
                states.retain(|r| !filter.matches(r));
                if states.len() != before {
                    removed += before - states.len();
                    self.write_states(&device_id, &user, &states)?;
                }
            }
        }
        Ok(removed)
    }

    fn list_sync_states(&self, device_id: &str) -> StateResult<Vec<SyncStateRecord>> {
        let Some(_lock) = self.lock_existing(device_id)? else {
            return Ok(Vec::new());
        };
        let mut states = Vec::new();
        for user in self.users_with(device_id, STATES_PREFIX)? {
            states.extend(self.read_states(device_id, &user)?);
        }
        Ok(states)
    }

    fn load_sync_cache(&self, device_id: &str, user: &str) -> StateResult<Option<SyncCacheRecord>> {
        let Some(_lock) = self.lock_existing(device_id)? else {
            return Ok(None);
        };
        read_record(&self.file_path(device_id, CACHE_PREFIX, user))
    }

    fn save_sync_cache(
        &self,
        record: &SyncCacheRecord,
        expected_generation: u64,
    ) -> StateResult<CacheWrite> {
        let _lock = self.lock_device(&record.device_id)?;
        let path = self.file_path(&record.device_id, CACHE_PREFIX, &record.user);
        let current = read_record::<SyncCacheRecord>(&path)?.map_or(0, |r| r.generation);
        if current != expected_generation {
            return Ok(CacheWrite::Superseded(current));
        }
        let mut stored = record.clone();
        stored.generation = expected_generation + 1;
        write_record(&path, &stored)?;
        Ok(CacheWrite::Saved(stored.generation))
    }

    fn delete_sync_cache(&self, device_id: &str, user: &str) -> StateResult<()> {
        let Some(_lock) = self.lock_existing(device_id)? else {
            return Ok(());
        };
        remove_if_exists(&self.file_path(device_id, CACHE_PREFIX, user))
    }

    fn load_device(&self, device_id: &str, user: &str) -> StateResult<Option<DeviceRecord>> {
        let Some(_lock) = self.lock_existing(device_id)? else {
            return Ok(None);
        };
        read_record(&self.file_path(device_id, DEVICE_PREFIX, user))
    }

    fn save_device(&self, record: &DeviceRecord) -> StateResult<()> {
        let _lock = self.lock_device(&record.id)?;
        write_record(&self.file_path(&record.id, DEVICE_PREFIX, &record.user), record)
    }

    fn update_device(
        &self,
        device_id: &str,
        user: &str,
        update: &mut dyn FnMut(Option<DeviceRecord>) -> Option<DeviceRecord>,
    ) -> StateResult<Option<DeviceRecord>> {
        let _lock = self.lock_device(device_id)?;
        let path = self.file_path(device_id, DEVICE_PREFIX, user);
        let updated = update(read_record(&path)?);
        if let Some(record) = &updated {
            write_record(&path, record)?;
        }
        Ok(updated)
    }

    fn list_devices(&self) -> StateResult<Vec<DeviceRecord>> {
        let mut devices = Vec::new();
        for device_id in self.device_ids()? {
            let _lock = self.lock_device(&device_id)?;
            for user in self.users_with(&device_id, DEVICE_PREFIX)? {
                if let Some(record) =
                    read_record(&self.file_path(&device_id, DEVICE_PREFIX, &user))?
                {
                    devices.push(record);
                }
            }
        }
        devices.sort_by(|a: &DeviceRecord, b| (&a.id, &a.user).cmp(&(&b.id, &b.user)));
        Ok(devices)
    }

    fn remove_device(&self, device_id: &str, user: &str) -> StateResult<bool> {
        let Some(_lock) = self.lock_existing(device_id)? else {
            return Ok(false);
        };
        let device_path = self.file_path(device_id, DEVICE_PREFIX, user);
        let existed = device_path.exists();
        remove_if_exists(&device_path)?;
        remove_if_exists(&self.file_path(device_id, STATES_PREFIX, user))?;
        remove_if_exists(&self.file_path(device_id, CACHE_PREFIX, user))?;
        Ok(existed)
    }
}

fn read_record<T: DeserializeOwned>(path: &Path) -> StateResult<Option<T>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    ciborium::from_reader(BufReader::new(file))
        .map(Some)
        .map_err(|e| StateError::Codec(format!("{}: {e}", path.display())))
}

fn write_record<T: Serialize + ?Sized>(path: &Path, value: &T) -> StateResult<()> {
    let temp = path.with_extension("tmp");
    {
        let file = File::create(&temp)?;
        let mut writer = BufWriter::new(file);
        ciborium::into_writer(value, &mut writer)
            .map_err(|e| StateError::Codec(format!("{}: {e}", path.display())))?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }
    fs::rename(&temp, path)?;
    Ok(())
}

fn remove_if_exists(path: &Path) -> StateResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn encode_component(value: &str) -> String {
    value.bytes().map(|b| format!("{b:02x}")).collect()
}

fn decode_component(encoded: &str) -> Option<String> {
    if encoded.len() % 2 != 0 {
        return None;
    }
    let bytes = (0..encoded.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(encoded.get(i..i + 2)?, 16).ok())
        .collect::<Option<Vec<u8>>>()?;
    String::from_utf8(bytes).ok()
}
