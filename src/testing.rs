//! In-memory stand-ins for the daemon and the host mount table

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::daemon::{ControlApi, DaemonStats, MountOptions};
use crate::error::{DriverError, Result};
use crate::mount::MountTable;

type MountSet = Arc<Mutex<HashSet<PathBuf>>>;

/// Records every call and keeps just enough state to answer consistently
#[derive(Default)]
pub struct FakeControlApi {
    calls: Mutex<Vec<(String, String)>>,
    failures: Mutex<HashMap<String, DriverError>>,
    stats: Mutex<VecDeque<DaemonStats>>,
    default_stats: Mutex<DaemonStats>,
    pub configs: Mutex<HashMap<String, (String, BTreeMap<String, String>)>>,
    pub mount_options: Mutex<HashMap<String, MountOptions>>,
    mounted: MountSet,
}

impl FakeControlApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// A mount table that sees the mounts made through this fake
    pub fn mount_table(&self) -> FakeMountTable {
        FakeMountTable {
            mounted: self.mounted.clone(),
        }
    }

    /// Queue stats readings returned before the default
    pub fn push_stats(&self, readings: impl IntoIterator<Item = DaemonStats>) {
        self.stats.lock().extend(readings);
    }

    pub fn set_default_stats(&self, stats: DaemonStats) {
        *self.default_stats.lock() = stats;
    }

    /// Make the next call to `op` fail with `err`
    pub fn fail_next(&self, op: &str, err: DriverError) {
        self.failures.lock().insert(op.to_string(), err);
    }

    pub fn calls(&self, op: &str) -> usize {
        self.calls.lock().iter().filter(|(o, _)| o == op).count()
    }

    pub fn call_args(&self, op: &str) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter(|(o, _)| o == op)
            .map(|(_, arg)| arg.clone())
            .collect()
    }

    /// Every recorded operation, in call order
    pub fn ops(&self) -> Vec<String> {
        self.calls.lock().iter().map(|(op, _)| op.clone()).collect()
    }

    fn record(&self, op: &str, arg: impl Into<String>) -> Result<()> {
        self.calls.lock().push((op.to_string(), arg.into()));
        match self.failures.lock().remove(op) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ControlApi for FakeControlApi {
    async fn create_config(
        &self,
        name: &str,
        backend_type: &str,
        parameters: &BTreeMap<String, String>,
    ) -> Result<()> {
        self.record("create_config", name)?;
        self.configs.lock().insert(
            name.to_string(),
            (backend_type.to_string(), parameters.clone()),
        );
        Ok(())
    }

    async fn delete_config(&self, name: &str) -> Result<()> {
        self.record("delete_config", name)?;
        self.configs.lock().remove(name);
        Ok(())
    }

    async fn mount(&self, fs: &str, mount_point: &str, options: &MountOptions) -> Result<()> {
        self.record("mount", format!("{} {}", fs, mount_point))?;
        self.mounted.lock().insert(PathBuf::from(mount_point));
        self.mount_options
            .lock()
            .insert(mount_point.to_string(), options.clone());
        Ok(())
    }

    async fn unmount(&self, mount_point: &str) -> Result<()> {
        self.record("unmount", mount_point)?;
        self.mounted.lock().remove(Path::new(mount_point));
        Ok(())
    }

    async fn stats(&self, fs: Option<&str>) -> Result<DaemonStats> {
        self.record("stats", fs.unwrap_or_default())?;
        let queued = self.stats.lock().pop_front();
        Ok(queued.unwrap_or(*self.default_stats.lock()))
    }

    async fn mkdir(&self, fs: &str, path: &str) -> Result<()> {
        self.record("mkdir", format!("{}{}", fs, path))
    }

    async fn purge(&self, fs: &str, path: &str) -> Result<()> {
        self.record("purge", format!("{}{}", fs, path))
    }
}

/// Mount table sharing state with a [`FakeControlApi`]
#[derive(Clone, Default)]
pub struct FakeMountTable {
    mounted: MountSet,
}

impl FakeMountTable {
    pub fn insert(&self, path: &Path) {
        self.mounted.lock().insert(path.to_path_buf());
    }
}

impl MountTable for FakeMountTable {
    fn is_mount_point(&self, path: &Path) -> Result<bool> {
        Ok(self.mounted.lock().contains(path))
    }

    fn unmount(&self, path: &Path) -> Result<()> {
        self.mounted.lock().remove(path);
        Ok(())
    }
}
