// Services module - External APIs and account provisioning

pub mod fora;
pub mod provisioning;
pub mod receipts;
pub mod retry;
pub mod smshub;
