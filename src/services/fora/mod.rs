// Fora mobile API: wire types and the operations the maintenance engine uses

pub mod client;
pub mod token;
pub mod user_info;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{AccountCredentials, Device, TokenPair};

pub use client::ForaClient;
pub use token::is_access_token_expired;
pub use user_info::user_info;

/// Platform identifier the Android app reports to `GetAppConfigurations_V4`
pub const ANDROID_PLATFORM: i32 = 1;

/// Headers that identify a device, plus the token sent as `Authorization`
#[derive(Debug, Clone)]
pub struct Session {
    pub user_info: String,
    pub token: Option<String>,
}

impl Session {
    /// A session for a device that has no tokens yet
    pub fn anonymous(device: &Device) -> Result<Self> {
        Ok(Self {
            user_info: user_info(device)?,
            token: None,
        })
    }

    /// A session authorised with the account's access token
    pub fn for_account(account: &AccountCredentials) -> Result<Self> {
        Ok(Self {
            user_info: user_info(&account.device)?,
            token: Some(account.tokens.access_token.clone()),
        })
    }

    pub fn with_token(&self, token: impl Into<String>) -> Self {
        Self {
            user_info: self.user_info.clone(),
            token: Some(token.into()),
        }
    }
}

// ==================== Responses ====================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiStatus {
    pub error_code: i64,
    pub error_string: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenValue {
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireTokens {
    pub access_token: TokenValue,
    pub refresh_token: TokenValue,
}

impl From<WireTokens> for TokenPair {
    fn from(tokens: WireTokens) -> Self {
        TokenPair {
            access_token: tokens.access_token.value,
            refresh_token: tokens.refresh_token.value,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BonusInfo {
    pub bonus_balance_amount: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersonalInfo {
    #[serde(rename = "Bonus")]
    pub bonus: BonusInfo,
}

/// Receipt header as listed by `GetLastChequeHeadersFast`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChequeHeader {
    pub fil_id: i32,
    pub cheque_id: i64,
    pub created: String,
    pub loyalty_fact_id: i64,
    pub sum_reg: f64,
    pub sum_balance: f64,
    pub identification_string: String,
    pub fiscal_number: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthBalance {
    pub year: i32,
    pub month: i32,
    pub sum_balance: f64,
    pub headers: Vec<ChequeHeader>,
}

/// Key of one receipt in `GetChequesInfos`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChequeIdentity {
    pub created: String,
    pub fil_id: i32,
    pub loyalty_fact_id: i64,
}

impl From<&ChequeHeader> for ChequeIdentity {
    fn from(header: &ChequeHeader) -> Self {
        Self {
            created: header.created.clone(),
            fil_id: header.fil_id,
            loyalty_fact_id: header.loyalty_fact_id,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChequeLine {
    pub lager_id: i64,
    #[serde(rename = "lagerNameUA")]
    pub lager_name_ua: String,
    pub lager_unit: String,
    pub kolvo: f64,
    pub price_out: f64,
    pub sum_line: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChequeInfo {
    pub fil_id: i32,
    pub cheque_id: i64,
    pub created: String,
    pub sum_discount: f64,
    pub cheque_lines: Vec<ChequeLine>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UserStatus {
    pub barcode: Option<String>,
    pub registered: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Registration {
    pub barcode: String,
    pub register: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfigurations {
    pub is_user_referral_use: bool,
}

/// Operations of the Fora mobile API
#[async_trait]
pub trait ForaApi: Send + Sync {
    /// `session.token` must carry the refresh token
    async fn refresh_token(&self, session: &Session) -> Result<TokenPair>;

    async fn get_personal_info(&self, session: &Session, force_update: bool)
        -> Result<PersonalInfo>;

    async fn get_last_cheque_headers_fast(&self, session: &Session) -> Result<Vec<MonthBalance>>;

    async fn get_cheques_infos(
        &self,
        session: &Session,
        identities: &[ChequeIdentity],
    ) -> Result<Vec<ChequeInfo>>;

    /// `false` when the API wants a CAPTCHA first
    async fn send_otp(&self, session: &Session, guid: Uuid, phone: &str) -> Result<bool>;

    async fn confirmation_otp(
        &self,
        session: &Session,
        guid: Uuid,
        phone: &str,
        otp_code: &str,
    ) -> Result<TokenPair>;

    async fn check_user(&self, session: &Session) -> Result<UserStatus>;

    async fn register_user(&self, session: &Session) -> Result<Registration>;

    async fn register_user_referral(
        &self,
        session: &Session,
        guid: Uuid,
        phone: &str,
        referrer_guid: Uuid,
    ) -> Result<Registration>;

    async fn set_bonus_to_apply(&self, session: &Session, guid: Uuid, phone: &str) -> Result<()>;

    async fn get_app_configurations(
        &self,
        session: &Session,
        platform: i32,
    ) -> Result<AppConfigurations>;
}
