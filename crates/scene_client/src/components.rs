//! Per-scene component registry.
//!
//! Components are typed singletons attached to a scene. Each type is
//! registered with a factory; the instance is built on first lookup and
//! shared afterwards.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use crate::scene::Scene;

type Instance = Arc<dyn Any + Send + Sync>;
type Factory = Arc<dyn Fn(&Scene) -> Instance + Send + Sync>;

struct Slot {
    name: &'static str,
    factory: Factory,
    instance: Option<Instance>,
}

/// Type-keyed component table.
#[derive(Default)]
pub struct ComponentRegistry {
    slots: RwLock<HashMap<TypeId, Slot>>,
}

impl ComponentRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the factory for `T`. A previously built
    /// instance is discarded.
    pub fn register<T, F>(&self, factory: F)
    where
        T: Send + Sync + 'static,
        F: Fn(&Scene) -> T + Send + Sync + 'static,
    {
        let factory: Factory = Arc::new(move |scene: &Scene| Arc::new(factory(scene)) as Instance);
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        slots.insert(
            TypeId::of::<T>(),
            Slot {
                name: std::any::type_name::<T>(),
                factory,
                instance: None,
            },
        );
    }

    /// Returns `true` if a factory for `T` is registered.
    #[must_use]
    pub fn contains<T: 'static>(&self) -> bool {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&TypeId::of::<T>())
    }

    /// The instance of `T`, built on first call. `None` if `T` was never
    /// registered.
    pub fn get<T: Send + Sync + 'static>(&self, scene: &Scene) -> Option<Arc<T>> {
        let key = TypeId::of::<T>();
        let factory = {
            let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
            let slot = slots.get(&key)?;
            if let Some(instance) = &slot.instance {
                return Arc::clone(instance).downcast::<T>().ok();
            }
            Arc::clone(&slot.factory)
        };
        // Built outside the lock so factories may look up other components.
        let built = factory(scene);
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        let slot = slots.get_mut(&key)?;
        let instance = slot.instance.get_or_insert(built);
        Arc::clone(&*instance).downcast::<T>().ok()
    }
}

impl fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_list()
            .entries(slots.values().map(|slot| slot.name))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use scene_net::{MemoryConnection, Serializer};

    use super::*;

    #[derive(Debug)]
    struct Chat {
        scene: String,
    }

    fn scene() -> Scene {
        let (conn, _peer) = MemoryConnection::pair();
        Scene::connected_for_tests("lobby", 141, conn, Serializer::MsgPack)
    }

    #[test]
    fn test_unregistered_component_is_none() {
        let registry = ComponentRegistry::new();
        assert!(registry.get::<Chat>(&scene()).is_none());
        assert!(!registry.contains::<Chat>());
    }

    #[test]
    fn test_component_built_once_and_shared() {
        let registry = ComponentRegistry::new();
        let builds = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&builds);
        registry.register(move |scene: &Scene| {
            counter.fetch_add(1, Ordering::SeqCst);
            Chat {
                scene: scene.id().to_string(),
            }
        });
        let scene = scene();
        let a = registry.get::<Chat>(&scene).unwrap();
        let b = registry.get::<Chat>(&scene).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.scene, "lobby");
        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reregistering_replaces_instance() {
        let registry = ComponentRegistry::new();
        registry.register(|_: &Scene| 1u32);
        let scene = scene();
        assert_eq!(*registry.get::<u32>(&scene).unwrap(), 1);
        registry.register(|_: &Scene| 2u32);
        assert_eq!(*registry.get::<u32>(&scene).unwrap(), 2);
    }
}
