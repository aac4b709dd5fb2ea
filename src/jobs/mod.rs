// Background jobs - Scheduled maintenance of the coupon pool

pub mod coupon_policy;
pub mod coupon_reconciler;
pub mod maintenance;
pub mod referrer_tree;
pub mod tree_grower;

use crate::config::MaintenanceSettings;
use crate::db::ForaStore;
use crate::services::{fora::ForaApi, smshub::SmsProvider};

pub use maintenance::{Maintenance, MaintenanceReport};

/// Collaborators shared by the maintenance jobs
#[derive(Clone, Copy)]
pub struct JobContext<'a> {
    pub store: &'a dyn ForaStore,
    pub fora: &'a dyn ForaApi,
    pub sms: &'a dyn SmsProvider,
    pub settings: &'a MaintenanceSettings,
}
