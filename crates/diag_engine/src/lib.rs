use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use carrier_model::{AdaptiveReport, CarrierModel};
use core_types::{
    codes, AutoSave, Curve, DiagStatus, DiagnosisResult, EngineConfig, EngineError,
    LifecyclePhase, ScrewIssue, StoreError,
};
use dashmap::DashMap;
use model_store::ModelStore;
use parking_lot::Mutex;
use physics_gate::GateReport;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

#[cfg(test)]
mod tests;

/// Auto-save failed after the batch completed. The finished per-hole results
/// ride along so the caller loses nothing; the in-memory model is kept and
/// the next successful save restores durability.
#[derive(Debug, Error)]
#[error("model save failed for carrier {carrier_id}: {source}")]
pub struct DiagnoseError {
    pub carrier_id: String,
    pub results: BTreeMap<String, DiagnosisResult>,
    #[source]
    pub source: StoreError,
}

/// Introspection snapshot for one hole of a cached carrier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HoleStatusReport {
    pub phase: LifecyclePhase,
    pub observation_count: u64,
    pub drift_event_count: u64,
    pub golden_mean_torque: Option<f64>,
    pub golden_std_torque: Option<f64>,
}

/// The diagnostic orchestrator: owns the configuration, the carrier cache
/// and the persistence handle. No process-wide state.
pub struct DiagnosticEngine {
    cfg: EngineConfig,
    store: ModelStore,
    carriers: DashMap<String, Arc<Mutex<CarrierModel>>>,
}

impl DiagnosticEngine {
    pub fn new(cfg: EngineConfig, models_dir: impl AsRef<Path>) -> Result<Self, EngineError> {
        let cfg = cfg.validated()?;
        let store = ModelStore::new(models_dir.as_ref())?;
        Ok(Self {
            cfg,
            store,
            carriers: DashMap::new(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    /// Diagnoses every hole of one carrier batch. Per-hole failures never
    /// abort the batch; only a failed auto-save surfaces, and it carries the
    /// finished results.
    pub fn diagnose(
        &self,
        carrier_id: &str,
        holes: &BTreeMap<String, Curve>,
    ) -> Result<BTreeMap<String, DiagnosisResult>, DiagnoseError> {
        self.diagnose_at(carrier_id, holes, chrono::Utc::now().timestamp_millis())
    }

    /// Like [`diagnose`](Self::diagnose) with an explicit wall-clock stamp,
    /// which keeps replayed batches bit-identical.
    pub fn diagnose_at(
        &self,
        carrier_id: &str,
        holes: &BTreeMap<String, Curve>,
        now_ms: i64,
    ) -> Result<BTreeMap<String, DiagnosisResult>, DiagnoseError> {
        let model = self.resolve_model(carrier_id);
        // Exclusive for the whole batch: same-carrier work is serialized,
        // distinct carriers proceed in parallel.
        let mut model = model.lock();

        let mut results = BTreeMap::new();
        for (hole_id, curve) in holes {
            let result = self.diagnose_hole(&mut model, hole_id, curve, now_ms);
            results.insert(hole_id.clone(), result);
        }

        if self.cfg.auto_save == AutoSave::AfterEachDiagnosis {
            if let Err(source) = self.store.save(&model) {
                warn!(carrier_id, %source, "auto-save failed, in-memory model kept");
                return Err(DiagnoseError {
                    carrier_id: carrier_id.to_string(),
                    results,
                    source,
                });
            }
        }
        Ok(results)
    }

    fn diagnose_hole(
        &self,
        model: &mut CarrierModel,
        hole_id: &str,
        curve: &Curve,
        now_ms: i64,
    ) -> DiagnosisResult {
        let features = match curve_features::extract(curve, &self.cfg.physics) {
            Ok(features) => features,
            Err(err) => {
                warn!(hole_id, %err, "curve rejected at ingress");
                return self.bad_input_result();
            }
        };

        let gate = physics_gate::evaluate(&features, &self.cfg.physics, &self.cfg.codes);
        if gate.fatal {
            // The physical process itself failed; keep the contaminated
            // observation out of the accumulators.
            return DiagnosisResult {
                status: DiagStatus::Ng,
                features: Some(features),
                screw_issue: ScrewIssue {
                    status: DiagStatus::Ng,
                    e_codes: gate.e_codes,
                    r_codes: gate.r_codes,
                },
                health_score: Some(0.0),
                optimization_suggestion: None,
            };
        }

        let hole = model.hole_mut(hole_id, self.cfg.learning.window_size);
        let adaptive = hole.observe_and_classify(
            hole_id,
            &features,
            &self.cfg.tolerance,
            &self.cfg.learning,
            &self.cfg.codes,
            now_ms,
        );
        merge_layers(features, gate, adaptive)
    }

    fn bad_input_result(&self) -> DiagnosisResult {
        if !self.cfg.codes.e_code_enabled(codes::E_BAD_INPUT) {
            return DiagnosisResult {
                status: DiagStatus::Ok,
                features: None,
                screw_issue: ScrewIssue::ok(),
                health_score: None,
                optimization_suggestion: None,
            };
        }
        let r_code = codes::r_code_for(codes::E_BAD_INPUT);
        let r_codes = if self.cfg.codes.r_code_enabled(r_code) {
            vec![r_code.to_string()]
        } else {
            Vec::new()
        };
        DiagnosisResult {
            status: DiagStatus::Ng,
            features: None,
            screw_issue: ScrewIssue {
                status: DiagStatus::Ng,
                e_codes: vec![codes::E_BAD_INPUT.to_string()],
                r_codes,
            },
            health_score: None,
            optimization_suggestion: None,
        }
    }

    /// Cache hit, else load from disk, else fresh model. A corrupt file has
    /// already been quarantined by the store, so the carrier restarts cold.
    fn resolve_model(&self, carrier_id: &str) -> Arc<Mutex<CarrierModel>> {
        if let Some(model) = self.carriers.get(carrier_id) {
            return Arc::clone(model.value());
        }
        let entry = self
            .carriers
            .entry(carrier_id.to_string())
            .or_insert_with(|| {
                let model = match self.store.load(carrier_id) {
                    Ok(Some(mut model)) => {
                        model.restore_window_capacity(self.cfg.learning.window_size);
                        info!(carrier_id, holes = model.holes.len(), "carrier model loaded");
                        model
                    }
                    Ok(None) => {
                        info!(carrier_id, "starting new carrier model");
                        CarrierModel::new(carrier_id)
                    }
                    Err(err) => {
                        warn!(carrier_id, %err, "model load failed, starting cold");
                        CarrierModel::new(carrier_id)
                    }
                };
                Arc::new(Mutex::new(model))
            });
        Arc::clone(entry.value())
    }

    /// Persists one cached carrier now, regardless of the auto-save policy.
    pub fn save_carrier(&self, carrier_id: &str) -> Result<(), StoreError> {
        let Some(model) = self.carriers.get(carrier_id).map(|m| Arc::clone(m.value())) else {
            return Ok(());
        };
        let model = model.lock();
        self.store.save(&model)
    }

    /// Persists every cached carrier; keeps going after failures and
    /// reports the last one.
    pub fn save_all(&self) -> Result<(), StoreError> {
        let ids = self
            .carriers
            .iter()
            .map(|e| e.key().clone())
            .collect::<Vec<_>>();
        let mut last_err = None;
        for carrier_id in ids {
            if let Err(err) = self.save_carrier(&carrier_id) {
                warn!(carrier_id = %carrier_id, %err, "save_all: carrier save failed");
                last_err = Some(err);
            }
        }
        match last_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Drops a carrier from the in-memory cache; its file stays on disk.
    pub fn evict_carrier(&self, carrier_id: &str) {
        self.carriers.remove(carrier_id);
    }

    /// Administrative: forgets all learning state for one hole.
    pub fn reset_hole(&self, carrier_id: &str, hole_id: &str) -> bool {
        let Some(model) = self.carriers.get(carrier_id).map(|m| Arc::clone(m.value())) else {
            return false;
        };
        let mut model = model.lock();
        model.reset_hole(hole_id)
    }

    /// Administrative: drops a hole's golden base so it re-learns its
    /// reference distribution; accumulated counts are kept.
    pub fn reset_golden(&self, carrier_id: &str, hole_id: &str) -> bool {
        let Some(model) = self.carriers.get(carrier_id).map(|m| Arc::clone(m.value())) else {
            return false;
        };
        let mut model = model.lock();
        match model.holes.get_mut(hole_id) {
            Some(hole) => {
                hole.reset_golden(&self.cfg.learning);
                true
            }
            None => false,
        }
    }

    pub fn carrier_status(&self, carrier_id: &str) -> Option<BTreeMap<String, HoleStatusReport>> {
        let model = self.carriers.get(carrier_id).map(|m| Arc::clone(m.value()))?;
        let model = model.lock();
        let mut out = BTreeMap::new();
        for (hole_id, hole) in &model.holes {
            out.insert(
                hole_id.clone(),
                HoleStatusReport {
                    phase: hole.phase,
                    observation_count: hole.count(),
                    drift_event_count: hole.drift_event_count,
                    golden_mean_torque: hole.golden_base.map(|b| b.peak_torque.mean),
                    golden_std_torque: hole.golden_base.map(|b| b.peak_torque.std),
                },
            );
        }
        Some(out)
    }
}

/// NG when either layer says NG; physics codes first, duplicates dropped.
fn merge_layers(
    features: core_types::FeatureVector,
    gate: GateReport,
    adaptive: AdaptiveReport,
) -> DiagnosisResult {
    let status = if !gate.pass || adaptive.status.is_ng() {
        DiagStatus::Ng
    } else {
        DiagStatus::Ok
    };

    let mut e_codes = gate.e_codes;
    for code in adaptive.e_codes {
        if !e_codes.contains(&code) {
            e_codes.push(code);
        }
    }
    let mut r_codes = gate.r_codes;
    for code in adaptive.r_codes {
        if !r_codes.contains(&code) {
            r_codes.push(code);
        }
    }

    let health_score = if status.is_ng() {
        0.0
    } else {
        adaptive.health_score
    };

    DiagnosisResult {
        status,
        features: Some(features),
        screw_issue: ScrewIssue {
            status,
            e_codes,
            r_codes,
        },
        health_score: Some(health_score),
        optimization_suggestion: adaptive.suggestion,
    }
}
