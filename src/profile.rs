//! Profile persistence.
//!
//! The device manager never touches storage; the caller loads profiles
//! through a [`ProfileStore`] and hands the chosen one to
//! [`crate::handle::DeviceHandle::set_profile`].

use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::error::StoreError;
use crate::types::{CalibrationParameterSet, UserProfile};

/// Whole-collection load/save of [`UserProfile`]s.
pub trait ProfileStore {
    fn load(&self) -> Result<Vec<UserProfile>, StoreError>;
    fn save(&mut self, profiles: &[UserProfile]) -> Result<(), StoreError>;
}

/// One past the highest id in `profiles`.
pub fn next_profile_id(profiles: &[UserProfile]) -> u32 {
    profiles.iter().map(|p| p.id + 1).max().unwrap_or(1)
}

/// Append a new profile with a fresh id and persist the collection.
pub fn create_profile<S: ProfileStore + ?Sized>(
    store: &mut S,
    name: &str,
    parameters: CalibrationParameterSet,
) -> Result<UserProfile, StoreError> {
    let mut profiles = store.load()?;
    let profile = UserProfile::new(next_profile_id(&profiles), name, parameters);
    profiles.push(profile.clone());
    store.save(&profiles)?;
    info!("created profile {} ({})", profile.id, profile.name);
    Ok(profile)
}

/// Remove the profile with `id` and persist the rest.
///
/// Returns `false`, without saving, when no such profile exists.
pub fn delete_profile<S: ProfileStore + ?Sized>(
    store: &mut S,
    id: u32,
) -> Result<bool, StoreError> {
    let mut profiles = store.load()?;
    let before = profiles.len();
    profiles.retain(|p| p.id != id);
    if profiles.len() == before {
        debug!("no profile {id} to delete");
        return Ok(false);
    }
    store.save(&profiles)?;
    info!("deleted profile {id}");
    Ok(true)
}

// ── MemoryProfileStore ────────────────────────────────────────────────────────

/// Non-persistent store, used with the simulator and in tests.
#[derive(Debug, Default, Clone)]
pub struct MemoryProfileStore {
    profiles: Vec<UserProfile>,
}

impl MemoryProfileStore {
    pub fn new(profiles: Vec<UserProfile>) -> Self {
        Self { profiles }
    }
}

impl ProfileStore for MemoryProfileStore {
    fn load(&self) -> Result<Vec<UserProfile>, StoreError> {
        Ok(self.profiles.clone())
    }

    fn save(&mut self, profiles: &[UserProfile]) -> Result<(), StoreError> {
        self.profiles = profiles.to_vec();
        Ok(())
    }
}

// ── JsonProfileStore ──────────────────────────────────────────────────────────

/// Profiles kept as a pretty-printed JSON array in a single file.
///
/// A missing file reads as an empty collection; parent directories are
/// created on the first save.
#[derive(Debug, Clone)]
pub struct JsonProfileStore {
    path: PathBuf,
}

impl JsonProfileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<config dir>/eyedrops/profiles.json`, e.g.
    /// `~/.config/eyedrops/profiles.json` on Linux.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("eyedrops").join("profiles.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ProfileStore for JsonProfileStore {
    fn load(&self) -> Result<Vec<UserProfile>, StoreError> {
        if !self.path.exists() {
            debug!("no profile file at {}", self.path.display());
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&self.path)?;
        let profiles: Vec<UserProfile> = serde_json::from_str(&content)?;
        debug!("loaded {} profile(s) from {}", profiles.len(), self.path.display());
        Ok(profiles)
    }

    fn save(&mut self, profiles: &[UserProfile]) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(profiles)?;
        std::fs::write(&self.path, content)?;
        debug!("saved {} profile(s) to {}", profiles.len(), self.path.display());
        Ok(())
    }
}
