//! In-process `PlanStorage` backend.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use payplan_eval::{Plan, PlanCell, Run};
use tokio::sync::RwLock;

use crate::error::StorageError;
use crate::traits::PlanStorage;

#[derive(Debug, Default)]
struct Inner {
    plans: BTreeMap<String, Arc<PlanCell>>,
    runs: HashMap<String, Arc<Run>>,
    run_order: Vec<String>,
}

/// Keeps every plan cell and run in memory for the life of the process.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    inner: RwLock<Inner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored runs.
    pub async fn run_count(&self) -> usize {
        self.inner.read().await.runs.len()
    }
}

#[async_trait]
impl PlanStorage for MemoryStorage {
    async fn create_plan(&self, mut plan: Plan) -> Result<Arc<PlanCell>, StorageError> {
        let mut inner = self.inner.write().await;
        if inner.plans.contains_key(plan.id()) {
            return Err(StorageError::AlreadyExists {
                plan_id: plan.id().to_string(),
            });
        }
        plan.normalize();
        let plan_id = plan.id().to_string();
        let cell = Arc::new(PlanCell::new(plan));
        inner.plans.insert(plan_id.clone(), Arc::clone(&cell));
        tracing::debug!(plan_id = %plan_id, "plan registered");
        Ok(cell)
    }

    async fn plan(&self, plan_id: &str) -> Result<Arc<PlanCell>, StorageError> {
        self.inner
            .read()
            .await
            .plans
            .get(plan_id)
            .cloned()
            .ok_or_else(|| StorageError::PlanNotFound {
                plan_id: plan_id.to_string(),
            })
    }

    async fn plan_for_step(&self, step_id: &str) -> Result<Arc<PlanCell>, StorageError> {
        let inner = self.inner.read().await;
        inner
            .plans
            .values()
            .find(|cell| cell.read(|p| p.step(step_id).is_some()))
            .cloned()
            .ok_or_else(|| StorageError::StepNotFound {
                step_id: step_id.to_string(),
            })
    }

    async fn save_plan(&self, plan_id: &str) -> Result<(), StorageError> {
        // Cells are the storage here; only the existence check remains.
        self.plan(plan_id).await.map(|_| ())
    }

    async fn list_plans(&self) -> Result<Vec<Plan>, StorageError> {
        let inner = self.inner.read().await;
        Ok(inner.plans.values().map(|cell| cell.plan()).collect())
    }

    async fn insert_run(&self, run: Run) -> Result<Arc<Run>, StorageError> {
        if !run.status().is_finished() || run.finished_at().is_none() {
            return Err(StorageError::Backend(format!(
                "run {} has not finished",
                run.run_id()
            )));
        }
        let mut inner = self.inner.write().await;
        if inner.runs.contains_key(run.run_id()) {
            tracing::debug!(run_id = %run.run_id(), "refused to overwrite stored run");
            return Err(StorageError::RunImmutable {
                run_id: run.run_id().to_string(),
            });
        }
        let run_id = run.run_id().to_string();
        let run = Arc::new(run);
        inner.runs.insert(run_id.clone(), Arc::clone(&run));
        inner.run_order.push(run_id);
        Ok(run)
    }

    async fn get_run(&self, run_id: &str) -> Result<Arc<Run>, StorageError> {
        self.inner
            .read()
            .await
            .runs
            .get(run_id)
            .cloned()
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.to_string(),
            })
    }

    async fn list_runs(
        &self,
        plan_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Arc<Run>>, StorageError> {
        let inner = self.inner.read().await;
        let mut runs: Vec<Arc<Run>> = inner
            .run_order
            .iter()
            .filter_map(|id| inner.runs.get(id))
            .filter(|run| plan_id.map_or(true, |p| run.plan_id() == p))
            .cloned()
            .collect();
        if limit > 0 && runs.len() > limit {
            runs.drain(..runs.len() - limit);
        }
        Ok(runs)
    }
}
