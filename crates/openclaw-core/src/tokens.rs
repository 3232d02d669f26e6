//! Token accounting. Estimates are fine: throttling works on chars/4 and
//! the upstream enforces the real ceiling.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Serialize;

use crate::model::ModelFamily;
use crate::store::DurableStore;

const MODELS_KEY: &str = "tokens:models";
const REQUESTS_KEY: &str = "tokens:requests";

/// `ceil(chars / 4)`, capped: over-estimating large code/JSON prompts would
/// starve the limiter for everyone else.
pub fn estimate_tokens(chars: usize) -> u64 {
    (chars.div_ceil(4) as u64).min(5_000)
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ModelUsage {
    pub input: u64,
    pub output: u64,
    pub requests: u64,
}

pub struct TokenLedger {
    models: Mutex<HashMap<ModelFamily, ModelUsage>>,
    store: Option<Arc<dyn DurableStore>>,
}

impl TokenLedger {
    pub fn new() -> Self {
        Self {
            models: Mutex::new(HashMap::new()),
            store: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Record final usage for a finished request.
    pub fn record(&self, request_id: &str, model: ModelFamily, input: u64, output: u64) {
        {
            let mut models = self.models.lock().unwrap();
            let usage = models.entry(model).or_default();
            usage.input += input;
            usage.output += output;
            usage.requests += 1;
        }

        if let Some(store) = &self.store {
            let store = Arc::clone(store);
            let request_id = request_id.to_string();
            let totals = self.usage(model);
            tokio::spawn(async move {
                store
                    .hash_set(
                        MODELS_KEY,
                        model.as_str(),
                        serde_json::json!({
                            "input": totals.input,
                            "output": totals.output,
                            "requests": totals.requests,
                        })
                        .to_string(),
                    )
                    .await;
                store
                    .hash_set(
                        REQUESTS_KEY,
                        &request_id,
                        serde_json::json!({
                            "input": input,
                            "output": output,
                            "model": model.as_str(),
                            "ts": Utc::now().timestamp(),
                        })
                        .to_string(),
                    )
                    .await;
            });
        }
    }

    pub fn usage(&self, model: ModelFamily) -> ModelUsage {
        self.models
            .lock()
            .unwrap()
            .get(&model)
            .copied()
            .unwrap_or_default()
    }

    pub fn stats(&self) -> TokenStats {
        let models = self.models.lock().unwrap();
        TokenStats {
            per_model: ModelFamily::all()
                .into_iter()
                .map(|m| {
                    (
                        m.as_str().to_string(),
                        models.get(&m).copied().unwrap_or_default(),
                    )
                })
                .collect(),
        }
    }
}

impl Default for TokenLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenStats {
    pub per_model: HashMap<String, ModelUsage>,
}
