//! In-memory storage target that records every call, for tests.

use super::{StorageBackend, UploadedRef};
use crate::utils::{Result, ServiceError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Upload(String),
    Delete(String),
    Copy(String, String),
    Exists(String),
}

#[derive(Default)]
struct State {
    objects: HashMap<String, Vec<u8>>,
    ops: Vec<Op>,
    fail_uploads: bool,
}

#[derive(Clone)]
pub struct MemoryBackend {
    name: String,
    state: Arc<Mutex<State>>,
}

impl MemoryBackend {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    /// Backend whose uploads always fail.
    pub fn failing(name: &str) -> Self {
        let backend = Self::new(name);
        backend.state.lock().unwrap().fail_uploads = true;
        backend
    }

    pub fn seed(&self, slot: &str, content: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .objects
            .insert(slot.to_string(), content.to_vec());
    }

    pub fn get(&self, slot: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().objects.get(slot).cloned()
    }

    pub fn ops(&self) -> Vec<Op> {
        self.state.lock().unwrap().ops.clone()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn describe(&self) -> String {
        format!("memory:{}", self.name)
    }

    async fn upload(&self, source: &Path, slot: &str) -> Result<UploadedRef> {
        let fail = {
            let mut state = self.state.lock().unwrap();
            state.ops.push(Op::Upload(slot.to_string()));
            state.fail_uploads
        };
        if fail {
            return Err(ServiceError::storage(self.describe(), "upload rejected"));
        }
        let content = tokio::fs::read(source).await?;
        let size = content.len() as u64;
        self.state
            .lock()
            .unwrap()
            .objects
            .insert(slot.to_string(), content);
        Ok(UploadedRef {
            name: slot.to_string(),
            size,
        })
    }

    async fn delete_slot(&self, slot: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.ops.push(Op::Delete(slot.to_string()));
        state.objects.remove(slot);
        Ok(())
    }

    async fn copy_from_slot(&self, source_slot: &str, dest_slot: &str) -> Result<UploadedRef> {
        let mut state = self.state.lock().unwrap();
        state
            .ops
            .push(Op::Copy(source_slot.to_string(), dest_slot.to_string()));
        let content = state
            .objects
            .get(source_slot)
            .cloned()
            .ok_or_else(|| ServiceError::storage(self.describe(), "missing source slot"))?;
        let size = content.len() as u64;
        state.objects.insert(dest_slot.to_string(), content);
        Ok(UploadedRef {
            name: dest_slot.to_string(),
            size,
        })
    }

    async fn slot_exists(&self, slot: &str) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        state.ops.push(Op::Exists(slot.to_string()));
        Ok(state.objects.contains_key(slot))
    }
}
