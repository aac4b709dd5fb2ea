// Models module - Database entity representations

pub mod account;
pub mod bonus;
pub mod coupon;
pub mod device;
pub mod receipt;
pub mod subscription;

pub use account::{Account, AccountCredentials, TokenPair, TreeNode};
pub use bonus::Bonus;
pub use coupon::{Coupon, CouponStatus, CouponTransition, CouponWithAccount};
pub use device::Device;
pub use receipt::{Receipt, ReceiptProduct};
pub use subscription::Subscription;
