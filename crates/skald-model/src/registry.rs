// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use skald_config::{read_json, write_json_atomic};
use skald_events::CancelHandle;

use crate::accumulate::collect_stream;
use crate::profile::{ModelPointer, ModelProfile};
use crate::provider::provider_for;
use crate::types::{AdapterRequest, Message};

/// On-disk shape: `{modelProfiles, modelPointers}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelStore {
    pub model_profiles: Vec<ModelProfile>,
    /// `"main"` / `"quick"` → profile name.
    pub model_pointers: BTreeMap<String, String>,
}

/// Registry of model profiles plus the two active pointers.
pub struct ModelManager {
    file: PathBuf,
    store: Mutex<ModelStore>,
}

impl ModelManager {
    pub fn load(file: PathBuf) -> Self {
        let store = match read_json::<ModelStore>(&file) {
            Ok(Some(s)) => s,
            Ok(None) => ModelStore::default(),
            Err(e) => {
                warn!(file = %file.display(), error = %e, "unreadable model store; starting empty");
                ModelStore::default()
            }
        };
        Self {
            file,
            store: Mutex::new(store),
        }
    }

    pub fn list_profiles(&self) -> Vec<ModelProfile> {
        self.lock().model_profiles.clone()
    }

    pub fn get(&self, name: &str) -> Option<ModelProfile> {
        self.lock()
            .model_profiles
            .iter()
            .find(|p| p.name == name)
            .cloned()
    }

    /// Resolve a pointer to its profile.
    pub fn profile_for(&self, pointer: ModelPointer) -> Option<ModelProfile> {
        let store = self.lock();
        let name = store.model_pointers.get(pointer.key())?;
        store
            .model_profiles
            .iter()
            .find(|p| &p.name == name)
            .cloned()
    }

    pub fn has_main(&self) -> bool {
        self.profile_for(ModelPointer::Main).is_some()
    }

    /// Register a profile.  Unless `skip_probe` is set, the endpoint is
    /// validated first with a minimal round trip; a profile that cannot
    /// produce the literal `YES` is rejected.
    pub async fn add_profile(
        &self,
        profile: ModelProfile,
        skip_probe: bool,
    ) -> anyhow::Result<()> {
        if !skip_probe {
            probe_profile(&profile).await?;
        }
        {
            let mut store = self.lock();
            store.model_profiles.retain(|p| p.name != profile.name);
            store.model_profiles.push(profile);
            self.persist(&store)?;
        }
        Ok(())
    }

    /// Remove a profile.  Fails while any pointer still references it.
    pub fn remove_profile(&self, name: &str) -> anyhow::Result<()> {
        let mut store = self.lock();
        if let Some((ptr, _)) = store.model_pointers.iter().find(|(_, v)| v.as_str() == name) {
            anyhow::bail!("model '{name}' is referenced by the '{ptr}' pointer");
        }
        let before = store.model_profiles.len();
        store.model_profiles.retain(|p| p.name != name);
        if store.model_profiles.len() == before {
            anyhow::bail!("no such model: {name}");
        }
        self.persist(&store)
    }

    /// Point `main` or `quick` at a profile.
    ///
    /// Switching `main` while `quick` is unset also sets `quick` to the same
    /// profile so auxiliary calls always have a model.
    pub fn set_pointer(&self, pointer: ModelPointer, name: &str) -> anyhow::Result<()> {
        let mut store = self.lock();
        if !store.model_profiles.iter().any(|p| p.name == name) {
            anyhow::bail!("no such model: {name}");
        }
        store
            .model_pointers
            .insert(pointer.key().to_string(), name.to_string());
        if pointer == ModelPointer::Main
            && !store.model_pointers.contains_key(ModelPointer::Quick.key())
        {
            store
                .model_pointers
                .insert(ModelPointer::Quick.key().to_string(), name.to_string());
        }
        self.persist(&store)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ModelStore> {
        self.store.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn persist(&self, store: &ModelStore) -> anyhow::Result<()> {
        write_json_atomic(&self.file, store)
    }
}

/// Round-trip probe: ask the endpoint to reply `YES` and check that it did.
async fn probe_profile(profile: &ModelProfile) -> anyhow::Result<()> {
    debug!(model = %profile.name, "probing model endpoint");
    let provider = provider_for(profile.clone());
    let req = AdapterRequest {
        messages: vec![Message::user_text(
            "Connectivity check. Respond with the single word YES.",
        )],
        ..AdapterRequest::default()
    };
    let cancel = CancelHandle::new();
    let reply = collect_stream(provider.as_ref(), &req, None, &cancel)
        .await
        .map_err(|e| anyhow::anyhow!("model probe failed: {e}"))?;
    if !reply.text().contains("YES") {
        anyhow::bail!(
            "model probe did not return YES (got: {})",
            reply.text().chars().take(80).collect::<String>()
        );
    }
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
