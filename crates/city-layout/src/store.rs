//! Building layout persistence over the user-document subtree.
//!
//! Two save modes over the same map: a batch write of the whole layout
//! (explicit "Save City" and reset) and a smooth single-building write
//! used by the debounced drag path.

use docstore::{ensure_document, DocumentStore, FieldValue, StoreError};
use progress_core::{user_doc_path, BuildingId, CityLayout, GridPos, UserId};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

/// Dotted field path of the layout map inside the user document.
const POSITIONS_FIELD: &str = "cityProgress.buildingPositions";

/// Per-user building layout store.
pub struct CityStore<S> {
    store: Arc<S>,
    user: UserId,
}

impl<S: DocumentStore> CityStore<S> {
    /// Layout store for one user.
    pub fn new(store: Arc<S>, user: UserId) -> Self {
        Self { store, user }
    }

    /// Owning user.
    pub fn user(&self) -> &UserId {
        &self.user
    }

    /// Read the full layout map (empty when nothing was ever saved).
    pub async fn load(&self) -> Result<CityLayout, StoreError> {
        let doc = self.store.get(&user_doc_path(&self.user)).await?;
        let positions = doc
            .as_ref()
            .and_then(|d| d.pointer("/cityProgress/buildingPositions"))
            .cloned()
            .unwrap_or_else(|| json!({}));
        serde_json::from_value(positions).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    /// Replace the whole layout map in one write (explicit "Save City").
    pub async fn save_all(&self, layout: &CityLayout) -> Result<(), StoreError> {
        let value =
            serde_json::to_value(layout).map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.write_positions(value).await?;
        debug!(user = %self.user, buildings = layout.len(), "city layout saved");
        Ok(())
    }

    /// Clear the layout (the "Reset" action writes an empty map).
    pub async fn reset(&self) -> Result<(), StoreError> {
        self.save_all(&CityLayout::new()).await
    }

    /// Smooth save of one building: read the current map, merge the entry,
    /// write the map back.
    ///
    /// The read-then-write is not atomic against another smooth save in the
    /// same narrow window; with a single active drag per client the last
    /// intentional writer wins per key. A multi-drag client would need a
    /// per-field update here instead.
    pub async fn save_one(&self, building: &BuildingId, pos: GridPos) -> Result<(), StoreError> {
        let mut layout = self.load().await?;
        layout.insert(building.clone(), pos);
        let value =
            serde_json::to_value(&layout).map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.write_positions(value).await?;
        debug!(user = %self.user, %building, x = pos.x, y = pos.y, "building position saved");
        Ok(())
    }

    async fn write_positions(&self, value: Value) -> Result<(), StoreError> {
        let path = user_doc_path(&self.user);
        ensure_document(self.store.as_ref(), &path, minimal_user_doc(&self.user)).await?;
        self.store
            .update(&path, vec![(POSITIONS_FIELD.to_string(), FieldValue::Value(value))])
            .await
    }
}

fn minimal_user_doc(user: &UserId) -> Value {
    json!({
        "userId": user.0,
        "simulationProgress": {},
        "cityProgress": {"buildingPositions": {}},
    })
}
