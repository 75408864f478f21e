use std::collections::HashMap;

use memtrack_protocol::handle::{Handle, ObjectKind};

use crate::error::TrackError;

/// Handle-keyed owning table for one object kind.
///
/// Trackers keep one registry per kind they own. Cross-references between
/// records are plain [`Handle`]s resolved through the owning registry, never
/// pointers, so a record's lifetime is decided by exactly one table.
#[derive(Debug)]
pub struct HandleRegistry<R> {
    kind: ObjectKind,
    records: HashMap<u64, R>,
}

impl<R> HandleRegistry<R> {
    pub fn new(kind: ObjectKind) -> Self {
        Self {
            kind,
            records: HashMap::new(),
        }
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    /// Register a record for a freshly created handle.
    /// Fails if the handle is of another kind, null, or already live.
    pub fn register(&mut self, handle: Handle, record: R) -> Result<(), TrackError> {
        self.check_kind(handle)?;
        if handle.is_null() {
            return Err(TrackError::invalid_object(handle, "null handle cannot be registered"));
        }
        if self.records.contains_key(&handle.raw) {
            return Err(TrackError::invalid_object(handle, "handle is already registered"));
        }
        self.records.insert(handle.raw, record);
        Ok(())
    }

    pub fn lookup(&self, handle: Handle) -> Result<&R, TrackError> {
        self.check_kind(handle)?;
        self.records
            .get(&handle.raw)
            .ok_or_else(|| TrackError::invalid_object(handle, "handle is not registered"))
    }

    pub fn lookup_mut(&mut self, handle: Handle) -> Result<&mut R, TrackError> {
        self.check_kind(handle)?;
        self.records
            .get_mut(&handle.raw)
            .ok_or_else(|| TrackError::invalid_object(handle, "handle is not registered"))
    }

    pub fn unregister(&mut self, handle: Handle) -> Result<R, TrackError> {
        self.check_kind(handle)?;
        self.records
            .remove(&handle.raw)
            .ok_or_else(|| TrackError::invalid_object(handle, "handle is not registered"))
    }

    pub fn contains(&self, handle: Handle) -> bool {
        handle.kind == self.kind && self.records.contains_key(&handle.raw)
    }

    /// All live handles, in ascending raw order.
    pub fn handles(&self) -> Vec<Handle> {
        let mut raws: Vec<u64> = self.records.keys().copied().collect();
        raws.sort_unstable();
        raws.into_iter().map(|raw| Handle::new(raw, self.kind)).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle, &R)> {
        let kind = self.kind;
        self.records.iter().map(move |(raw, r)| (Handle::new(*raw, kind), r))
    }

    /// Remove every record matching `pred`, returning them.
    pub fn drain_where(&mut self, mut pred: impl FnMut(&R) -> bool) -> Vec<(Handle, R)> {
        let raws: Vec<u64> = self
            .records
            .iter()
            .filter(|(_, r)| pred(r))
            .map(|(raw, _)| *raw)
            .collect();
        let mut drained = Vec::with_capacity(raws.len());
        for raw in raws {
            if let Some(r) = self.records.remove(&raw) {
                drained.push((Handle::new(raw, self.kind), r));
            }
        }
        drained.sort_by_key(|(h, _)| h.raw);
        drained
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn check_kind(&self, handle: Handle) -> Result<(), TrackError> {
        if handle.kind != self.kind {
            return Err(TrackError::invalid_object(
                handle,
                format!("expected a {} handle", self.kind),
            ));
        }
        Ok(())
    }
}
