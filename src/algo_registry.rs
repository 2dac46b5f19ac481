// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, RwLock};

use canonical_error::{CanonicalError, already_exists_error, invalid_argument_error,
                      not_found_error};
use log::info;

use crate::algo_type::{AlgoId, AlgoType, REFERENCE_ALGO_ID};
use crate::algorithm::{AlgoDescriptor, AlgoTraits};
use crate::calib::CalibDb;
use crate::handle::{AlgoHandle, DynAlgoHandle};

/// Summary of one registered implementation.
#[derive(Clone, Debug, PartialEq)]
pub struct AlgoInfo {
    pub algo_type: AlgoType,
    pub id: AlgoId,
    pub name: String,
    pub enabled: bool,
    /// True if this is the implementation the orchestrator runs.
    pub current: bool,
}

/// Registered algorithm handles keyed by (type, id). Within a type, handles
/// keep their registration order, and the current handle is the first enabled
/// one.
pub struct AlgoRegistry {
    handles: RwLock<BTreeMap<AlgoType, Vec<Arc<dyn DynAlgoHandle>>>>,
    running: Arc<AtomicBool>,
}

impl AlgoRegistry {
    /// `running` is shared with every handle created here; it selects between
    /// inline and staged attribute updates.
    pub fn new(running: Arc<AtomicBool>) -> Self {
        AlgoRegistry {
            handles: RwLock::new(BTreeMap::new()),
            running,
        }
    }

    /// Creates the algorithm context and registers its handle. The new handle
    /// is enabled but unprepared; the orchestrator prepares it before its
    /// first frame.
    pub fn add_algo<T: AlgoTraits>(&self, desc: AlgoDescriptor<T>, calib: Arc<CalibDb>)
                                   -> Result<Arc<AlgoHandle<T>>, CanonicalError> {
        let (algo_type, id) = (desc.algo_type, desc.id);
        if algo_type.family() != T::FAMILY {
            return Err(invalid_argument_error(
                format!("{} belongs to family {:?}, descriptor is for {:?}",
                        algo_type, algo_type.family(), T::FAMILY).as_str()));
        }
        let handle = Arc::new(AlgoHandle::create(desc, calib, self.running.clone())?);
        // Check and insert under one guard so concurrent adds cannot both pass.
        let mut handles = self.handles.write().unwrap();
        let list = handles.entry(algo_type).or_default();
        if list.iter().any(|h| h.id() == id) {
            return Err(already_exists_error(
                format!("{} id {} already registered", algo_type, id).as_str()));
        }
        list.push(handle.clone());
        info!("Registered {} id {} ({})", algo_type, id, handle.name());
        Ok(handle)
    }

    /// Unregisters and destroys a plugin. The reference implementation cannot
    /// be removed, only disabled.
    pub fn rm_algo(&self, algo_type: AlgoType, id: AlgoId) -> Result<(), CanonicalError> {
        if id == REFERENCE_ALGO_ID {
            return Err(invalid_argument_error(
                format!("reference {} cannot be removed", algo_type).as_str()));
        }
        let mut handles = self.handles.write().unwrap();
        let Some(list) = handles.get_mut(&algo_type) else {
            return Err(not_found_error(format!("no {} registered", algo_type).as_str()));
        };
        let Some(pos) = list.iter().position(|h| h.id() == id) else {
            return Err(not_found_error(
                format!("{} id {} not registered", algo_type, id).as_str()));
        };
        list.remove(pos);
        info!("Removed {} id {}", algo_type, id);
        Ok(())
    }

    pub fn enable_algo(&self, algo_type: AlgoType, id: AlgoId, enable: bool)
                       -> Result<(), CanonicalError> {
        match self.find(algo_type, id) {
            Some(handle) => {
                handle.set_enabled(enable);
                info!("{} id {} {}", algo_type, id, if enable { "enabled" } else { "disabled" });
                Ok(())
            },
            None => Err(not_found_error(
                format!("{} id {} not registered", algo_type, id).as_str())),
        }
    }

    pub fn find(&self, algo_type: AlgoType, id: AlgoId) -> Option<Arc<dyn DynAlgoHandle>> {
        self.handles.read().unwrap()
            .get(&algo_type)
            .and_then(|list| list.iter().find(|h| h.id() == id).cloned())
    }

    /// The handle the orchestrator runs for `algo_type`, if any is enabled.
    pub fn current(&self, algo_type: AlgoType) -> Option<Arc<dyn DynAlgoHandle>> {
        self.handles.read().unwrap()
            .get(&algo_type)
            .and_then(|list| list.iter().find(|h| h.is_enabled()).cloned())
    }

    /// Typed access to the current handle, e.g. for attribute updates.
    pub fn current_typed<T: AlgoTraits>(&self, algo_type: AlgoType)
                                        -> Result<Arc<AlgoHandle<T>>, CanonicalError> {
        match self.current(algo_type) {
            Some(handle) => downcast::<T>(handle),
            None => Err(not_found_error(
                format!("no enabled {} implementation", algo_type).as_str())),
        }
    }

    /// Typed access to a specific implementation.
    pub fn typed<T: AlgoTraits>(&self, algo_type: AlgoType, id: AlgoId)
                                -> Result<Arc<AlgoHandle<T>>, CanonicalError> {
        match self.find(algo_type, id) {
            Some(handle) => downcast::<T>(handle),
            None => Err(not_found_error(
                format!("{} id {} not registered", algo_type, id).as_str())),
        }
    }

    /// Current handles in processing order.
    pub fn current_handles(&self) -> Vec<Arc<dyn DynAlgoHandle>> {
        crate::algo_type::PROCESSING_ORDER.iter()
            .filter_map(|t| self.current(*t))
            .collect()
    }

    pub fn all_handles(&self) -> Vec<Arc<dyn DynAlgoHandle>> {
        self.handles.read().unwrap().values().flatten().cloned().collect()
    }

    pub fn describe(&self) -> Vec<AlgoInfo> {
        let handles = self.handles.read().unwrap();
        let mut infos = Vec::new();
        for (algo_type, list) in handles.iter() {
            let current_id = list.iter().find(|h| h.is_enabled()).map(|h| h.id());
            for h in list {
                infos.push(AlgoInfo {
                    algo_type: *algo_type,
                    id: h.id(),
                    name: h.name().to_string(),
                    enabled: h.is_enabled(),
                    current: Some(h.id()) == current_id,
                });
            }
        }
        infos
    }
}

fn downcast<T: AlgoTraits>(handle: Arc<dyn DynAlgoHandle>)
                           -> Result<Arc<AlgoHandle<T>>, CanonicalError> {
    let (algo_type, id) = (handle.algo_type(), handle.id());
    handle.into_any().downcast::<AlgoHandle<T>>().map_err(|_| {
        invalid_argument_error(
            format!("{} id {} is not a {:?} handle", algo_type, id, T::FAMILY).as_str())
    })
}
