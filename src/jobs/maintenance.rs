use std::sync::Arc;

use chrono::Utc;

use super::coupon_reconciler::{reconcile_coupons, ReconcileStats};
use super::tree_grower::{grow_referral_trees, GrowthStats};
use super::JobContext;
use crate::config::MaintenanceSettings;
use crate::db::ForaStore;
use crate::error::{AppError, Result};
use crate::services::{fora::ForaApi, smshub::SmsProvider};
use crate::telemetry::LogShipper;

#[derive(Debug, Default)]
pub struct MaintenanceReport {
    pub reconcile: ReconcileStats,
    pub growth: GrowthStats,
}

impl MaintenanceReport {
    pub fn failures(&self) -> usize {
        self.reconcile.failures + self.growth.failures
    }
}

/// One maintenance pass: reconcile coupons, then grow referral trees
pub struct Maintenance {
    store: Arc<dyn ForaStore>,
    fora: Arc<dyn ForaApi>,
    sms: Arc<dyn SmsProvider>,
    settings: MaintenanceSettings,
    logs: LogShipper,
}

impl Maintenance {
    pub fn new(
        store: Arc<dyn ForaStore>,
        fora: Arc<dyn ForaApi>,
        sms: Arc<dyn SmsProvider>,
        settings: MaintenanceSettings,
        logs: LogShipper,
    ) -> Self {
        Self {
            store,
            fora,
            sms,
            settings,
            logs,
        }
    }

    /// Runs both jobs and ships the run's logs exactly once
    ///
    /// A coupon or subscription that fails does not stop the others; the run
    /// still returns `RunFailed` so the failure is not lost.
    pub async fn run(&self) -> Result<MaintenanceReport> {
        self.logs.scoped(self.run_jobs()).await
    }

    async fn run_jobs(&self) -> Result<MaintenanceReport> {
        let ctx = JobContext {
            store: self.store.as_ref(),
            fora: self.fora.as_ref(),
            sms: self.sms.as_ref(),
            settings: &self.settings,
        };

        tracing::info!("Starting maintenance run");

        let reconcile = reconcile_coupons(ctx, Utc::now()).await?;
        let growth = grow_referral_trees(ctx, Utc::now()).await?;
        let report = MaintenanceReport { reconcile, growth };

        let failed = report.failures();
        if failed > 0 {
            tracing::error!(failed, ?report, "Maintenance run finished with failures");
            return Err(AppError::RunFailed { failed });
        }

        tracing::info!(?report, "Maintenance run completed");
        Ok(report)
    }
}
