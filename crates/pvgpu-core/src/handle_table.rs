use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use pvgpu_protocol::{D3dkmtHandle, Errno};

use crate::objects::{HandleKind, HandleObject};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandleTableError {
    #[error("handle {0} is already assigned")]
    Occupied(D3dkmtHandle),

    #[error("cannot assign the null handle")]
    NullHandle,

    #[error("handle table is full ({0} entries)")]
    Full(usize),
}

impl HandleTableError {
    pub fn errno(&self) -> Errno {
        match self {
            HandleTableError::Occupied(_) | HandleTableError::NullHandle => Errno::InvalidArgument,
            HandleTableError::Full(_) => Errno::OutOfMemory,
        }
    }
}

/// Per-process map from host-granted handles to guest objects.
pub trait HandleTable: Send + Sync {
    fn assign(&self, handle: D3dkmtHandle, object: HandleObject) -> Result<(), HandleTableError>;

    /// Look up `handle`, returning it only if it was registered as `kind`.
    fn get(&self, handle: D3dkmtHandle, kind: HandleKind) -> Option<HandleObject>;

    /// Remove `handle` if it was registered as `kind`.
    fn free(&self, handle: D3dkmtHandle, kind: HandleKind) -> Option<HandleObject>;
}

/// Handle table backed by a concurrent map, with an optional entry limit.
pub struct DashMapHandleTable {
    entries: DashMap<D3dkmtHandle, HandleObject>,
    limit: Option<usize>,
}

impl DashMapHandleTable {
    pub fn new() -> Self {
        Self { entries: DashMap::new(), limit: None }
    }

    /// A table that refuses assignments beyond `limit` live entries.
    pub fn with_limit(limit: usize) -> Self {
        Self { entries: DashMap::new(), limit: Some(limit) }
    }

    /// Return number of live handles.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for DashMapHandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleTable for DashMapHandleTable {
    fn assign(&self, handle: D3dkmtHandle, object: HandleObject) -> Result<(), HandleTableError> {
        if handle.is_null() {
            return Err(HandleTableError::NullHandle);
        }
        if let Some(limit) = self.limit {
            if self.entries.len() >= limit {
                return Err(HandleTableError::Full(limit));
            }
        }
        match self.entries.entry(handle) {
            Entry::Occupied(_) => Err(HandleTableError::Occupied(handle)),
            Entry::Vacant(slot) => {
                slot.insert(object);
                Ok(())
            }
        }
    }

    fn get(&self, handle: D3dkmtHandle, kind: HandleKind) -> Option<HandleObject> {
        self.entries
            .get(&handle)
            .filter(|entry| entry.kind() == kind)
            .map(|entry| entry.value().clone())
    }

    fn free(&self, handle: D3dkmtHandle, kind: HandleKind) -> Option<HandleObject> {
        self.entries
            .remove_if(&handle, |_, object| object.kind() == kind)
            .map(|(_, object)| object)
    }
}
