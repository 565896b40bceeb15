//! Engine context shared by a family of interceptors
//!
//! Interceptors created from the same engine cannot patch the same address
//! twice; interceptors from different engines know nothing about each
//! other. Every interceptor keeps the engine alive, so the collision sets
//! are torn down only after the last instrumentor is gone.

use crate::collision::{CollisionRegistry, OwnerId};
use crate::config::EngineConfig;
use crate::error::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug)]
struct EngineShared {
    config: EngineConfig,
    collisions: CollisionRegistry,
    next_owner: AtomicU64,
}

/// Cheaply clonable handle to one engine instance
#[derive(Debug, Clone)]
pub struct Engine {
    shared: Arc<EngineShared>,
}

impl Engine {
    /// Engine with the default configuration
    pub fn new() -> Self {
        Self::build(EngineConfig::default())
    }

    /// Engine with a validated configuration
    pub fn with_config(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: EngineConfig) -> Self {
        let collisions = CollisionRegistry::with_bits(config.collision_bits)
            .with_leak_reports(config.report_leaks);
        tracing::debug!(?config, "engine created");
        Self {
            shared: Arc::new(EngineShared {
                config,
                collisions,
                next_owner: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn collisions(&self) -> &CollisionRegistry {
        &self.shared.collisions
    }

    pub(crate) fn next_owner_id(&self) -> OwnerId {
        OwnerId(self.shared.next_owner.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InterceptError;

    #[test]
    fn test_owner_ids_are_unique() {
        let engine = Engine::new();
        let a = engine.next_owner_id();
        let b = engine.clone().next_owner_id();
        assert_ne!(a, b);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = EngineConfig {
            store_bits: 30,
            ..EngineConfig::default()
        };
        assert!(matches!(
            Engine::with_config(config),
            Err(InterceptError::Config(_))
        ));
    }

    #[test]
    fn test_collision_sets_use_configured_size() {
        let engine = Engine::with_config(EngineConfig {
            collision_bits: 2,
            ..EngineConfig::default()
        })
        .unwrap();
        assert_eq!(engine.config().collision_bits, 2);
        assert_eq!(
            engine
                .collisions()
                .claim_count(crate::collision::ClaimKind::Field),
            0
        );
    }
}
