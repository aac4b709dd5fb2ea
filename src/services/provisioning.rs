use rand::seq::SliceRandom;
use uuid::Uuid;

use super::fora::{ForaApi, Session, ANDROID_PLATFORM};
use super::retry::{retry, RetryPolicy};
use super::smshub::{wait_for_code, SmsProvider};
use crate::config::MaintenanceSettings;
use crate::error::{AppError, Result};
use crate::models::{account::CreateAccountData, Device, TreeNode};

/// Registers a new Fora account on a freshly leased phone number
///
/// With a `referrer`, the account is registered through the referral program
/// so that the referrer earns the reward once the new account makes a purchase.
#[tracing::instrument(
    skip_all,
    fields(referrer_id = referrer.map(|r| r.id.as_str()).unwrap_or("-"))
)]
pub async fn register_account(
    fora: &dyn ForaApi,
    sms: &dyn SmsProvider,
    devices: &[Device],
    settings: &MaintenanceSettings,
    referrer: Option<&TreeNode>,
) -> Result<CreateAccountData> {
    let number = retry(RetryPolicy::from(settings), move || sms.get_phone_number()).await?;

    let device = devices
        .choose(&mut rand::thread_rng())
        .cloned()
        .ok_or_else(|| AppError::Integrity("no devices to register accounts with".to_string()))?;
    let guid = Uuid::new_v4();
    let phone = number.e164();

    tracing::debug!(device = %device.title, session_id = %guid, "Requesting OTP");

    let session = Session::anonymous(&device)?;
    if !fora.send_otp(&session, guid, &phone).await? {
        sms.cancel(&number.id).await?;
        return Err(AppError::CaptchaRequired);
    }

    let code = wait_for_code(sms, &number, settings.otp_timeout, settings.otp_interval).await?;
    let tokens = fora.confirmation_otp(&session, guid, &phone, &code).await?;
    let session = session.with_token(&tokens.access_token);

    if fora.check_user(&session).await?.registered {
        return Err(AppError::Retryable(format!("{phone} is already registered")));
    }

    let registration = match referrer {
        Some(referrer) => {
            let config = fora.get_app_configurations(&session, ANDROID_PLATFORM).await?;
            if !config.is_user_referral_use {
                return Err(AppError::ReferralDisabled);
            }
            fora.register_user_referral(&session, guid, &phone, referrer.session_id)
                .await?
        }
        None => fora.register_user(&session).await?,
    };

    if !registration.register {
        return Err(AppError::Retryable(format!("registration of {phone} was rejected")));
    }

    fora.set_bonus_to_apply(&session, guid, &phone).await?;

    tracing::info!(account_id = %registration.barcode, "Registered account");

    Ok(CreateAccountData {
        id: registration.barcode,
        session_id: guid,
        phone: number.database_string().to_string(),
        device_id: device.id,
        referrer_id: referrer.map(|r| r.id.clone()),
        tokens,
    })
}
