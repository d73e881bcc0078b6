//! API shared state

use std::sync::Arc;

use crate::actors::SchedulerHandle;
use crate::storage::StorageBackend;
use crate::tiles::{TileDefinition, TileEngine};

/// Shared state passed to all API handlers
#[derive(Clone)]
pub struct ApiState {
    pub storage: Arc<dyn StorageBackend>,

    /// Handle to the poll scheduler, for per-target scheduling state
    pub scheduler: SchedulerHandle,

    pub tiles: Arc<TileEngine>,

    /// Tile definitions in display order
    pub tile_definitions: Arc<Vec<TileDefinition>>,
}

impl ApiState {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        scheduler: SchedulerHandle,
        tiles: Arc<TileEngine>,
        mut tile_definitions: Vec<TileDefinition>,
    ) -> Self {
        tile_definitions.sort_by_key(|definition| definition.display_order);
        Self {
            storage,
            scheduler,
            tiles,
            tile_definitions: Arc::new(tile_definitions),
        }
    }
}
