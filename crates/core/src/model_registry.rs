//! Caller-owned cache of open model handles, keyed by model id.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use tracing::{debug, info};

use crate::dispatch::InferenceEngine;
use crate::error::{Result, UpscaleError};

/// Opens a model handle from a location string (catalog name, URL or path).
pub trait ModelLoader {
    type Handle: InferenceEngine;

    fn load(&self, model_id: &str, location: &str) -> anyhow::Result<Self::Handle>;
}

pub struct ModelRegistry<L: ModelLoader> {
    loader: L,
    open: HashMap<String, L::Handle>,
}

impl<L: ModelLoader> ModelRegistry<L> {
    pub fn new(loader: L) -> Self {
        Self {
            loader,
            open: HashMap::new(),
        }
    }

    pub fn loader(&self) -> &L {
        &self.loader
    }

    /// Return the handle for `model_id`, loading it from `location` the first time.
    ///
    /// Once open, `location` is ignored until the model is closed.
    pub fn open(&mut self, model_id: &str, location: &str) -> Result<&mut L::Handle> {
        match self.open.entry(model_id.to_string()) {
            Entry::Occupied(entry) => {
                debug!(model = model_id, "Reusing open model");
                Ok(entry.into_mut())
            }
            Entry::Vacant(entry) => {
                info!(model = model_id, location, "Opening model");
                let handle =
                    self.loader
                        .load(model_id, location)
                        .map_err(|source| UpscaleError::ModelLoad {
                            model: model_id.to_string(),
                            source,
                        })?;
                Ok(entry.insert(handle))
            }
        }
    }

    pub fn get_mut(&mut self, model_id: &str) -> Option<&mut L::Handle> {
        self.open.get_mut(model_id)
    }

    pub fn is_open(&self, model_id: &str) -> bool {
        self.open.contains_key(model_id)
    }

    /// Drop the handle for `model_id`. Returns whether it was open.
    pub fn close(&mut self, model_id: &str) -> bool {
        let closed = self.open.remove(model_id).is_some();
        if closed {
            debug!(model = model_id, "Closed model");
        }
        closed
    }

    /// Ids of open models, sorted.
    pub fn open_models(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.open.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn close_all(&mut self) {
        self.open.clear();
    }
}
