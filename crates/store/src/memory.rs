//! In-memory store backend.
//!
//! Implements both store contracts over a single `RwLock`ed state, which is
//! what makes the bulk-replace operation atomic from a reader's point of
//! view. Used as the injectable test double and for offline runs.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::{Dream, DreamPatch, DreamStore, Plan, ProfileStore, StoreError, UserProfile};

#[derive(Default)]
struct MemoryState {
    profiles: HashMap<String, UserProfile>,
    dreams: HashMap<String, Vec<Dream>>,
}

/// インメモリストア
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryStore {
    /// 空のストアを作成
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl ProfileStore for MemoryStore {
    async fn get_by_id(&self, id: &str) -> Result<Option<UserProfile>, StoreError> {
        let state = self.state.read().await;
        Ok(state.profiles.get(id).cloned())
    }

    async fn upsert(&self, profile: &UserProfile) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state.profiles.insert(profile.id.clone(), profile.clone());
        Ok(())
    }

    async fn set_plan(&self, id: &str, plan: Plan) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        match state.profiles.get_mut(id) {
            Some(profile) => {
                profile.plan = plan;
                Ok(())
            }
            None => Err(StoreError::NotFound),
        }
    }
}

#[async_trait::async_trait]
impl DreamStore for MemoryStore {
    async fn get_by_id(
        &self,
        user_id: &str,
        dream_id: &str,
    ) -> Result<Option<Dream>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .dreams
            .get(user_id)
            .and_then(|dreams| dreams.iter().find(|dream| dream.id == dream_id))
            .cloned())
    }

    async fn upsert(&self, dream: &Dream) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let dreams = state.dreams.entry(dream.user_id.clone()).or_default();
        match dreams.iter_mut().find(|existing| existing.id == dream.id) {
            Some(existing) => *existing = dream.clone(),
            None => dreams.push(dream.clone()),
        }
        Ok(())
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<Dream>, StoreError> {
        let state = self.state.read().await;
        let mut dreams = state.dreams.get(user_id).cloned().unwrap_or_default();
        dreams.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(dreams)
    }

    async fn update_partial(
        &self,
        user_id: &str,
        dream_id: &str,
        patch: DreamPatch,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let dream = state
            .dreams
            .get_mut(user_id)
            .and_then(|dreams| dreams.iter_mut().find(|dream| dream.id == dream_id))
            .ok_or(StoreError::NotFound)?;
        patch.apply(dream);
        Ok(())
    }

    async fn replace_all(&self, user_id: &str, dreams: &[Dream]) -> Result<(), StoreError> {
        // One write-lock swap: readers see the old set or the new set, never
        // a partially replaced one.
        let mut state = self.state.write().await;
        state.dreams.insert(user_id.to_string(), dreams.to_vec());
        Ok(())
    }
}
