// SPDX-FileCopyrightText: 2025 rupsp contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::BTreeMap;

use log::{error, warn};
use rupsp_common::chunk_file::ErrorLevel;
use rupsp_common::{error, Persist, PointerWrap, ResultCode, SceUid};

use crate::objects::{KernelObject, KernelObjectType};

/// Maximum number of live kernel objects.
const MAX_OBJECTS: usize = 4096;

/// First ID handed out. IDs below this are never valid, so 0 can mean
/// "current thread" in the guest API.
const HANDLE_OFFSET: SceUid = 0x100;

/// Kernel object pool: maps SceUid -> KernelObject with exclusive
/// ownership. Loading a state clears and repopulates it.
pub struct KernelObjectPool {
    objects: BTreeMap<SceUid, KernelObject>,
    next_id: SceUid,
}

impl KernelObjectPool {
    pub fn new() -> Self {
        Self {
            objects: BTreeMap::new(),
            next_id: HANDLE_OFFSET,
        }
    }

    /// Add an object and return its ID.
    pub fn create(&mut self, mut object: KernelObject) -> Result<SceUid, ResultCode> {
        if self.objects.len() >= MAX_OBJECTS {
            error!("Kernel object pool full, cannot create {}", object.type_name());
            return Err(error::NO_MEMORY);
        }

        let limit = HANDLE_OFFSET + MAX_OBJECTS as SceUid;
        let mut id = self.next_id;
        while self.objects.contains_key(&id) {
            id += 1;
            if id >= limit {
                id = HANDLE_OFFSET;
            }
        }
        self.next_id = if id + 1 >= limit { HANDLE_OFFSET } else { id + 1 };

        object.set_uid(id);
        self.objects.insert(id, object);
        Ok(id)
    }

    /// Look up an object of type `T`.
    pub fn get<T: KernelObjectType>(&self, id: SceUid) -> Result<&T, ResultCode> {
        self.objects
            .get(&id)
            .and_then(T::from_object)
            .ok_or(T::MISSING_ERROR)
    }

    /// Look up an object of type `T` (mutable).
    pub fn get_mut<T: KernelObjectType>(&mut self, id: SceUid) -> Result<&mut T, ResultCode> {
        self.objects
            .get_mut(&id)
            .and_then(T::from_object_mut)
            .ok_or(T::MISSING_ERROR)
    }

    /// Remove an object, checking its type first.
    pub fn destroy<T: KernelObjectType>(&mut self, id: SceUid) -> Result<KernelObject, ResultCode> {
        match self.objects.get(&id) {
            Some(obj) if obj.id_type() == T::ID_TYPE => {
                self.objects.remove(&id).ok_or(T::MISSING_ERROR)
            }
            _ => Err(T::MISSING_ERROR),
        }
    }

    /// Check if an ID exists.
    pub fn is_valid(&self, id: SceUid) -> bool {
        self.objects.contains_key(&id)
    }

    /// Type of the object behind `id`.
    pub fn id_type(&self, id: SceUid) -> Option<i32> {
        self.objects.get(&id).map(KernelObject::id_type)
    }

    /// All IDs of one type, in ascending order.
    pub fn list_ids(&self, id_type: i32) -> Vec<SceUid> {
        self.objects
            .iter()
            .filter(|(_, obj)| obj.id_type() == id_type)
            .map(|(&id, _)| id)
            .collect()
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether the pool is empty.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn clear(&mut self) {
        self.objects.clear();
        self.next_id = HANDLE_OFFSET;
    }
}

impl Default for KernelObjectPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Persist for KernelObjectPool {
    fn persist(&mut self, p: &mut PointerWrap) {
        p.section("KernelObjectPool", 1, 1, |p, _| {
            p.sync(&mut self.next_id);
            let mut count = self.objects.len() as u32;
            p.sync(&mut count);

            if !p.is_reading() {
                for (&id, obj) in self.objects.iter_mut() {
                    let mut id = id;
                    let mut id_type = obj.id_type();
                    p.sync(&mut id);
                    p.sync(&mut id_type);
                    obj.do_state(p);
                }
                return;
            }

            self.objects.clear();
            for _ in 0..count {
                let mut id: SceUid = 0;
                let mut id_type = 0i32;
                p.sync(&mut id);
                p.sync(&mut id_type);
                let Some(mut obj) = KernelObject::create_by_type(id_type) else {
                    warn!("Unknown kernel object type {} in state", id_type);
                    p.set_error(ErrorLevel::Failure, "unknown kernel object type");
                    return;
                };
                obj.do_state(p);
                obj.set_uid(id);
                self.objects.insert(id, obj);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::Callback;
    use crate::thread::Thread;

    fn callback(name: &str) -> KernelObject {
        KernelObject::Callback(Callback::new(name, 0, 0x0880_0000, 0))
    }

    #[test]
    fn test_create_and_get() {
        let mut pool = KernelObjectPool::new();
        let id = pool.create(callback("cb")).unwrap();
        assert!(id >= HANDLE_OFFSET);
        assert_eq!(pool.get::<Callback>(id).unwrap().uid, id);
        assert_eq!(pool.get::<Thread>(id).unwrap_err(), error::UNKNOWN_THID);
    }

    #[test]
    fn test_destroy_checks_type() {
        let mut pool = KernelObjectPool::new();
        let id = pool.create(callback("cb")).unwrap();
        assert!(pool.destroy::<Thread>(id).is_err());
        assert!(pool.destroy::<Callback>(id).is_ok());
        assert_eq!(pool.get::<Callback>(id).unwrap_err(), error::UNKNOWN_CBID);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_invalid_id() {
        let pool = KernelObjectPool::new();
        assert!(pool.get::<Callback>(42).is_err());
        assert!(!pool.is_valid(0));
    }

    #[test]
    fn test_list_ids() {
        let mut pool = KernelObjectPool::new();
        let a = pool.create(callback("a")).unwrap();
        let b = pool.create(callback("b")).unwrap();
        assert_eq!(pool.list_ids(crate::objects::tmid::CALLBACK), vec![a, b]);
        assert!(pool.list_ids(crate::objects::tmid::THREAD).is_empty());
    }

    #[test]
    fn test_persist_repopulates() {
        let mut pool = KernelObjectPool::new();
        let id = pool.create(callback("saved")).unwrap();
        let mut p = PointerWrap::writer();
        p.sync(&mut pool);
        let bytes = p.into_bytes();

        let mut loaded = KernelObjectPool::new();
        loaded.create(callback("stale")).unwrap();
        loaded.create(callback("stale2")).unwrap();
        let mut p = PointerWrap::reader(&bytes);
        p.sync(&mut loaded);
        assert!(p.check().is_ok());
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.get::<Callback>(id).unwrap().name(), "saved");
    }
}
