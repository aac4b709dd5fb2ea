#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use fora_farm::config::MaintenanceSettings;
use fora_farm::db::MemoryStore;
use fora_farm::error::{AppError, Result};
use fora_farm::jobs::Maintenance;
use fora_farm::models::{
    account::CreateAccountData, Coupon, CouponStatus, Device, Subscription, TokenPair,
};
use fora_farm::services::fora::{
    AppConfigurations, BonusInfo, ChequeHeader, ChequeIdentity, ChequeInfo, ChequeLine, ForaApi,
    MonthBalance, PersonalInfo, Registration, Session, UserStatus,
};
use fora_farm::services::smshub::{PhoneNumber, SmsProvider, SmsStatus};
use fora_farm::telemetry::LogShipper;

pub fn jwt(exp: i64, subject: &str) -> String {
    format!(
        "{}.{}.signature",
        URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256","typ":"JWT"}"#),
        URL_SAFE_NO_PAD.encode(format!(r#"{{"sub":"{subject}","exp":{exp}}}"#))
    )
}

pub fn device() -> Device {
    Device {
        id: 1,
        title: "Pixel 5".to_string(),
        brand: "google".to_string(),
        model: "Pixel 5".to_string(),
        fingerprint: "google/redfin/redfin:13/TQ3A.230805.001/10316531:user/release-keys"
            .to_string(),
    }
}

pub fn subscription(family_id: Uuid, surplus: i32, height: i32) -> Subscription {
    Subscription {
        id: Uuid::new_v4(),
        family_id,
        surplus,
        height,
        root_id: None,
        expired_at: Utc::now() + chrono::Duration::days(30),
    }
}

pub fn held_coupon(
    account_id: &str,
    family_id: Uuid,
    discount: i64,
    is_referral: bool,
    created_at: DateTime<Utc>,
) -> Coupon {
    Coupon {
        id: Uuid::new_v4(),
        status: CouponStatus::AwaitingReceipt,
        family_id: Some(family_id),
        user_id: Some(Uuid::new_v4()),
        account_id: account_id.to_string(),
        discount: Decimal::new(discount, 0),
        required_spend: if is_referral {
            Decimal::new(100, 0)
        } else {
            Decimal::ZERO
        },
        is_referral,
        created_at,
        expired_at: Utc::now() + chrono::Duration::days(60),
        assigned_at: Some(created_at),
    }
}

pub fn settings() -> MaintenanceSettings {
    MaintenanceSettings {
        retry_interval: Duration::from_secs(1),
        ..MaintenanceSettings::default()
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub fora: Arc<FakeFora>,
    pub sms: Arc<FakeSms>,
    pub maintenance: Maintenance,
}

pub async fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    store.add_device(device()).await;
    let fora = Arc::new(FakeFora::default());
    let sms = Arc::new(FakeSms::default());
    let maintenance = Maintenance::new(
        store.clone(),
        fora.clone(),
        sms.clone(),
        settings(),
        LogShipper::disabled(),
    );
    Harness {
        store,
        fora,
        sms,
        maintenance,
    }
}

// ==================== Fora ====================

struct FakeCheque {
    header: ChequeHeader,
    info: ChequeInfo,
}

pub struct FakeForaState {
    pub otp_send: bool,
    pub referral_enabled: bool,
    /// Phones the API already knows
    pub preregistered: HashSet<String>,
    pub referrals: Vec<(String, Uuid)>,
    pub bonus_applied: Vec<String>,
    pub refreshes: usize,
    pub balances: HashMap<String, f64>,
    next_barcode: u64,
    next_cheque: i64,
    next_token: u64,
    token_phones: HashMap<String, String>,
    barcodes: HashMap<String, String>,
    cheques: HashMap<String, Vec<FakeCheque>>,
    orphans: HashMap<String, Vec<ChequeInfo>>,
}

impl Default for FakeForaState {
    fn default() -> Self {
        Self {
            otp_send: true,
            referral_enabled: true,
            preregistered: HashSet::new(),
            referrals: Vec::new(),
            bonus_applied: Vec::new(),
            refreshes: 0,
            balances: HashMap::new(),
            next_barcode: 0,
            next_cheque: 0,
            next_token: 0,
            token_phones: HashMap::new(),
            barcodes: HashMap::new(),
            cheques: HashMap::new(),
            orphans: HashMap::new(),
        }
    }
}

impl FakeForaState {
    fn issue_tokens(&mut self, phone: &str, exp: i64) -> TokenPair {
        self.next_token += 1;
        let tokens = TokenPair {
            access_token: jwt(exp, phone),
            refresh_token: format!("refresh-{phone}-{}", self.next_token),
        };
        self.token_phones
            .insert(tokens.access_token.clone(), phone.to_string());
        self.token_phones
            .insert(tokens.refresh_token.clone(), phone.to_string());
        tokens
    }

    fn phone(&self, session: &Session) -> Result<String> {
        session
            .token
            .as_ref()
            .and_then(|token| self.token_phones.get(token))
            .cloned()
            .ok_or_else(|| AppError::Validation("unknown token".to_string()))
    }

    fn barcode(&self, session: &Session) -> Result<String> {
        let phone = self.phone(session)?;
        self.barcodes
            .get(&phone)
            .cloned()
            .ok_or_else(|| AppError::Validation(format!("{phone} is not registered")))
    }

    fn register(&mut self, phone: &str) -> String {
        self.next_barcode += 1;
        let barcode = format!("{:013}", 4_820_000_000_000u64 + self.next_barcode);
        self.barcodes.insert(phone.to_string(), barcode.clone());
        barcode
    }
}

#[derive(Default)]
pub struct FakeFora {
    pub state: Mutex<FakeForaState>,
}

impl FakeFora {
    fn lock(&self) -> std::sync::MutexGuard<'_, FakeForaState> {
        self.state.lock().unwrap()
    }

    /// Registers an account directly, with tokens valid for an hour
    pub fn issue_account(&self, phone: &str) -> CreateAccountData {
        self.issue_account_expiring(phone, Utc::now().timestamp() + 3600)
    }

    pub fn issue_account_expiring(&self, phone: &str, exp: i64) -> CreateAccountData {
        let mut state = self.lock();
        let tokens = state.issue_tokens(phone, exp);
        let barcode = state.register(phone);
        CreateAccountData {
            id: barcode,
            session_id: Uuid::new_v4(),
            phone: phone.trim_start_matches('+').to_string(),
            device_id: 1,
            referrer_id: None,
            tokens,
        }
    }

    /// Adds a purchase with one product line
    pub fn add_cheque(&self, barcode: &str, created: DateTime<Utc>, total: f64, discount: f64) {
        let mut state = self.lock();
        state.next_cheque += 1;
        let cheque_id = 700_000 + state.next_cheque;
        let created = created.format("%Y-%m-%dT%H:%M:%S").to_string();

        let header = ChequeHeader {
            fil_id: 1203,
            cheque_id,
            created: created.clone(),
            loyalty_fact_id: cheque_id * 10,
            sum_reg: total,
            sum_balance: 0.0,
            identification_string: format!("FN {cheque_id}"),
            fiscal_number: None,
        };
        let info = ChequeInfo {
            fil_id: 1203,
            cheque_id,
            created,
            sum_discount: discount,
            cheque_lines: vec![ChequeLine {
                lager_id: 31_337,
                lager_name_ua: "Молоко 2.5%".to_string(),
                lager_unit: "шт".to_string(),
                kolvo: 1.0,
                price_out: total + discount,
                sum_line: total,
            }],
        };
        state
            .cheques
            .entry(barcode.to_string())
            .or_default()
            .push(FakeCheque { header, info });
    }

    /// A line item block that matches no header
    pub fn add_orphan_info(&self, barcode: &str, created: DateTime<Utc>) {
        let info = ChequeInfo {
            fil_id: 1,
            cheque_id: 1,
            created: created.format("%Y-%m-%dT%H:%M:%S").to_string(),
            sum_discount: 0.0,
            cheque_lines: vec![],
        };
        self.lock()
            .orphans
            .entry(barcode.to_string())
            .or_default()
            .push(info);
    }

    pub fn set_balance(&self, barcode: &str, balance: f64) {
        self.lock().balances.insert(barcode.to_string(), balance);
    }
}

#[async_trait]
impl ForaApi for FakeFora {
    async fn refresh_token(&self, session: &Session) -> Result<TokenPair> {
        let mut state = self.lock();
        let phone = state.phone(session)?;
        state.refreshes += 1;
        Ok(state.issue_tokens(&phone, Utc::now().timestamp() + 3600))
    }

    async fn get_personal_info(
        &self,
        session: &Session,
        _force_update: bool,
    ) -> Result<PersonalInfo> {
        let state = self.lock();
        let barcode = state.barcode(session)?;
        Ok(PersonalInfo {
            bonus: BonusInfo {
                bonus_balance_amount: state.balances.get(&barcode).copied().unwrap_or(0.0),
            },
        })
    }

    async fn get_last_cheque_headers_fast(&self, session: &Session) -> Result<Vec<MonthBalance>> {
        let state = self.lock();
        let barcode = state.barcode(session)?;
        let headers = state
            .cheques
            .get(&barcode)
            .map(|cheques| cheques.iter().map(|c| c.header.clone()).collect())
            .unwrap_or_default();
        Ok(vec![MonthBalance {
            year: 2024,
            month: 1,
            sum_balance: 0.0,
            headers,
        }])
    }

    async fn get_cheques_infos(
        &self,
        session: &Session,
        identities: &[ChequeIdentity],
    ) -> Result<Vec<ChequeInfo>> {
        let state = self.lock();
        let barcode = state.barcode(session)?;
        let mut infos: Vec<ChequeInfo> = state
            .cheques
            .get(&barcode)
            .into_iter()
            .flatten()
            .filter(|c| identities.iter().any(|id| id.created == c.info.created))
            .map(|c| c.info.clone())
            .collect();
        infos.extend(state.orphans.get(&barcode).cloned().unwrap_or_default());
        Ok(infos)
    }

    async fn send_otp(&self, _session: &Session, _guid: Uuid, _phone: &str) -> Result<bool> {
        Ok(self.lock().otp_send)
    }

    async fn confirmation_otp(
        &self,
        _session: &Session,
        _guid: Uuid,
        phone: &str,
        otp_code: &str,
    ) -> Result<TokenPair> {
        assert_eq!(otp_code, FakeSms::CODE);
        Ok(self
            .lock()
            .issue_tokens(phone, Utc::now().timestamp() + 3600))
    }

    async fn check_user(&self, session: &Session) -> Result<UserStatus> {
        let state = self.lock();
        let phone = state.phone(session)?;
        let barcode = state.barcodes.get(&phone).cloned();
        Ok(UserStatus {
            registered: barcode.is_some() || state.preregistered.contains(&phone),
            barcode,
        })
    }

    async fn register_user(&self, session: &Session) -> Result<Registration> {
        let mut state = self.lock();
        let phone = state.phone(session)?;
        Ok(Registration {
            barcode: state.register(&phone),
            register: true,
        })
    }

    async fn register_user_referral(
        &self,
        session: &Session,
        _guid: Uuid,
        _phone: &str,
        referrer_guid: Uuid,
    ) -> Result<Registration> {
        let mut state = self.lock();
        let phone = state.phone(session)?;
        let barcode = state.register(&phone);
        state.referrals.push((barcode.clone(), referrer_guid));
        Ok(Registration {
            barcode,
            register: true,
        })
    }

    async fn set_bonus_to_apply(&self, _session: &Session, _guid: Uuid, phone: &str) -> Result<()> {
        self.lock().bonus_applied.push(phone.to_string());
        Ok(())
    }

    async fn get_app_configurations(
        &self,
        _session: &Session,
        _platform: i32,
    ) -> Result<AppConfigurations> {
        Ok(AppConfigurations {
            is_user_referral_use: self.lock().referral_enabled,
        })
    }
}

// ==================== SMS ====================

/// Leases `+38050000000N` numbers whose code arrives immediately
#[derive(Default)]
pub struct FakeSms {
    leased: AtomicU64,
    pub cancelled: Mutex<Vec<String>>,
}

impl FakeSms {
    pub const CODE: &'static str = "1234";

    pub fn phone(n: u64) -> String {
        format!("+38050{n:07}")
    }

    pub fn leased(&self) -> u64 {
        self.leased.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SmsProvider for FakeSms {
    async fn get_phone_number(&self) -> Result<PhoneNumber> {
        let n = self.leased.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(PhoneNumber {
            id: n.to_string(),
            number: Self::phone(n).trim_start_matches('+').to_string(),
        })
    }

    async fn get_status(&self, _id: &str) -> Result<SmsStatus> {
        Ok(SmsStatus::Ok(Self::CODE.to_string()))
    }

    async fn cancel(&self, id: &str) -> Result<()> {
        self.cancelled.lock().unwrap().push(id.to_string());
        Ok(())
    }
}
