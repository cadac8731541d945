// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Loading and saving the configuration document.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::ConfigError;

use super::AppConfig;

/// Durable storage for the configuration document.
///
/// Implementations are called synchronously by the registry, once per
/// mutation, with the registry lock held.
pub trait DocumentStore: Send + Sync {
    /// Reads the document.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the document cannot be read or parsed.
    fn load(&self) -> Result<AppConfig, ConfigError>;

    /// Writes the document.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the document cannot be encoded or written.
    fn save(&self, config: &AppConfig) -> Result<(), ConfigError>;
}

/// Stores the document as pretty-printed JSON in a single file.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    /// Creates a store backed by the given file.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl DocumentStore for JsonFileStore {
    fn load(&self) -> Result<AppConfig, ConfigError> {
        let contents = fs::read_to_string(&self.path).map_err(|source| ConfigError::Read {
            path: self.path.clone(),
            source,
        })?;

        let config = serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: self.path.clone(),
            source,
        })?;

        tracing::info!(path = %self.path.display(), "Loaded configuration");
        Ok(config)
    }

    fn save(&self, config: &AppConfig) -> Result<(), ConfigError> {
        let contents = serde_json::to_string_pretty(config).map_err(ConfigError::Encode)?;

        // Write beside the document, then rename over it, so a crash leaves
        // either the old or the new document on disk.
        let temp_path = self.temp_path();
        let written = fs::File::create(&temp_path).and_then(|mut file| {
            file.write_all(contents.as_bytes())?;
            file.sync_all()
        });
        if let Err(source) = written {
            let _ = fs::remove_file(&temp_path);
            return Err(ConfigError::Write {
                path: temp_path,
                source,
            });
        }

        fs::rename(&temp_path, &self.path).map_err(|source| ConfigError::Write {
            path: self.path.clone(),
            source,
        })?;

        tracing::debug!(path = %self.path.display(), sensors = config.sensors.len(), "Saved configuration");
        Ok(())
    }
}

/// Keeps the document in memory and counts saves.
///
/// Used by tests and by embedders that do not want a file on disk.
#[derive(Debug, Default)]
pub struct MemoryStore {
    document: Mutex<Option<AppConfig>>,
    saves: AtomicUsize,
    fail_saves: AtomicBool,
}

impl MemoryStore {
    /// Creates a store whose `load` returns the given document.
    #[must_use]
    pub fn with_document(config: AppConfig) -> Self {
        Self {
            document: Mutex::new(Some(config)),
            ..Self::default()
        }
    }

    /// Returns how many times `save` has been called.
    #[must_use]
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Returns the last saved (or initial) document.
    #[must_use]
    pub fn document(&self) -> Option<AppConfig> {
        self.document.lock().clone()
    }

    /// Makes every following `save` fail, without storing anything.
    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }
}

impl DocumentStore for MemoryStore {
    fn load(&self) -> Result<AppConfig, ConfigError> {
        Ok(self.document.lock().clone().unwrap_or_default())
    }

    fn save(&self, config: &AppConfig) -> Result<(), ConfigError> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(ConfigError::Write {
                path: PathBuf::from("<memory>"),
                source: io::Error::other("save disabled"),
            });
        }
        *self.document.lock() = Some(config.clone());
        Ok(())
    }
}

impl<S: DocumentStore + ?Sized> DocumentStore for Arc<S> {
    fn load(&self) -> Result<AppConfig, ConfigError> {
        (**self).load()
    }

    fn save(&self, config: &AppConfig) -> Result<(), ConfigError> {
        (**self).save(config)
    }
}
