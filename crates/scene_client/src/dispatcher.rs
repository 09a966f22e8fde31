//! Routes scene traffic to the scene that owns the handle.

use std::fmt;
use std::sync::{PoisonError, RwLock};

use scene_net::message_ids::{self, MAX_SCENES, SCENES};
use tracing::{debug, trace};

use crate::dispatch::PacketProcessor;
use crate::error::ClientError;
use crate::packet::Packet;
use crate::scene::Scene;

/// Handle-indexed table of connected scenes.
pub struct SceneDispatcher {
    slots: RwLock<Vec<Option<Scene>>>,
}

impl SceneDispatcher {
    /// Create a dispatcher with every slot empty.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(vec![None; MAX_SCENES]),
        }
    }

    fn slot(handle: u8) -> Result<usize, ClientError> {
        if !message_ids::is_scene_handle(handle) {
            return Err(ClientError::Protocol(format!(
                "{handle} is below the first scene handle {SCENES}"
            )));
        }
        Ok(usize::from(handle - SCENES))
    }

    /// Register a connected scene under its handle. Registering the same
    /// scene twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::State`] if the scene has no handle, or
    /// [`ClientError::Protocol`] if the handle is not a scene handle or
    /// already belongs to another scene.
    pub fn add_scene(&self, scene: &Scene) -> Result<(), ClientError> {
        let handle = scene
            .handle()
            .ok_or_else(|| ClientError::State(format!("scene {} has no handle", scene.id())))?;
        let slot = Self::slot(handle)?;
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        match &slots[slot] {
            Some(current) if current.same_scene(scene) => return Ok(()),
            Some(current) => {
                return Err(ClientError::Protocol(format!(
                    "handle {handle} already belongs to scene {}",
                    current.id()
                )));
            }
            None => {}
        }
        slots[slot] = Some(scene.clone());
        debug!(scene = scene.id(), handle, "scene registered");
        Ok(())
    }

    /// Unregister whatever scene holds `handle`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Protocol`] if the handle is not a scene handle.
    pub fn remove_scene(&self, handle: u8) -> Result<Option<Scene>, ClientError> {
        let slot = Self::slot(handle)?;
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        let removed = slots[slot].take();
        if let Some(scene) = &removed {
            debug!(scene = scene.id(), handle, "scene unregistered");
        }
        Ok(removed)
    }

    /// Unregister `scene` from `handle` if it is still the occupant.
    pub(crate) fn release(&self, handle: u8, scene: &Scene) -> bool {
        let Ok(slot) = Self::slot(handle) else {
            return false;
        };
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        if !slots[slot].as_ref().is_some_and(|current| current.same_scene(scene)) {
            return false;
        }
        slots[slot] = None;
        debug!(scene = scene.id(), handle, "scene released");
        true
    }

    /// The scene registered under `handle`, if any.
    #[must_use]
    pub fn scene(&self, handle: u8) -> Option<Scene> {
        let slot = Self::slot(handle).ok()?;
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(slot)
            .cloned()
            .flatten()
    }

    /// Every registered scene.
    #[must_use]
    pub fn scenes(&self) -> Vec<Scene> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .flatten()
            .cloned()
            .collect()
    }

    /// Unregister every scene, returning them.
    pub fn clear(&self) -> Vec<Scene> {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        slots.iter_mut().filter_map(Option::take).collect()
    }
}

impl Default for SceneDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketProcessor for SceneDispatcher {
    fn name(&self) -> &'static str {
        "scene_dispatcher"
    }

    fn dispatch(&self, tag: u8, packet: &mut Packet) -> bool {
        let Some(scene) = self.scene(tag) else {
            if message_ids::is_scene_handle(tag) {
                trace!(handle = tag, "packet for unknown scene");
            }
            return false;
        };
        packet.metadata.scene = Some(scene.clone());
        scene.handle_message(packet);
        true
    }
}

impl fmt::Debug for SceneDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SceneDispatcher")
            .field("scenes", &self.scenes().len())
            .finish()
    }
}
