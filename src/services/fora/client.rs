use std::time::Duration;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};
use uuid::Uuid;

use super::{
    ApiStatus, AppConfigurations, ChequeIdentity, ChequeInfo, ForaApi, MonthBalance,
    PersonalInfo, Registration, Session, UserStatus, WireTokens,
};
use crate::error::{AppError, Result};
use crate::models::TokenPair;

/// Extra attempts after a transport failure
const TRANSPORT_RETRIES: u32 = 3;
const USER_AGENT: &str = "okhttp/4.10.0";
const COORDINATES: &str = r#"{"xCoord":0.0,"yCoord":0.0}"#;
const OTP_CODE_LENGTH: usize = 4;

/// Every response carries an `error` block next to its payload
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    error: ApiStatus,
    #[serde(flatten)]
    body: T,
}

#[derive(Debug, Deserialize)]
struct Empty {}

#[derive(Debug, Deserialize)]
struct TokensBody {
    tokens: WireTokens,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersonalInfoBody {
    personal_info: PersonalInfo,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChequeHeadersBody {
    sum_balance: Vec<MonthBalance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChequesInfosBody {
    cheques_infos: Vec<ChequeInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OtpBody {
    otp_send: bool,
}

/// reqwest implementation of [`ForaApi`]
#[derive(Debug, Clone)]
pub struct ForaClient {
    http: Client,
    api_url: String,
}

impl ForaClient {
    pub fn new(api_url: impl Into<String>) -> Result<Self> {
        let http = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            http,
            api_url: api_url.into(),
        })
    }

    /// Posts `{Method, Data}`, retrying transport failures
    async fn send(&self, session: &Session, method: &str, data: Value) -> Result<String> {
        let body = json!({ "Method": method, "Data": data });
        let mut retries_left = TRANSPORT_RETRIES;

        loop {
            match self.post(session, &body).await {
                Ok(text) => return Ok(text),
                Err(e) if retries_left > 0 => {
                    retries_left -= 1;
                    tracing::error!(
                        method = %method,
                        retries_left,
                        error = %e,
                        "Fora request failed, retrying"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn post(&self, session: &Session, body: &Value) -> std::result::Result<String, reqwest::Error> {
        let device_time = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);

        let mut request = self
            .http
            .post(&self.api_url)
            .header("user-info", &session.user_info)
            .header("deviceTime", device_time)
            .header("coordinates", COORDINATES)
            .header("content-type", "application/json")
            .header("user-agent", USER_AGENT)
            .json(body);

        if let Some(token) = &session.token {
            request = request.header("Authorization", format!("Token {token}"));
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        tracing::debug!(
            method = %body["Method"],
            status = %status,
            length = text.len(),
            "Fora response received"
        );

        Ok(text)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        session: &Session,
        method: &str,
        data: Value,
    ) -> Result<T> {
        let text = self.send(session, method, data).await?;
        parse_envelope(method, &text)
    }
}

fn parse_envelope<T: DeserializeOwned>(method: &str, text: &str) -> Result<T> {
    let envelope: Envelope<T> = serde_json::from_str(text)
        .map_err(|e| AppError::Schema(format!("{method}: {e}")))?;

    if envelope.error.error_code != 0 {
        tracing::warn!(
            method = %method,
            code = envelope.error.error_code,
            message = %envelope.error.error_string,
            "Fora API reported an error"
        );
    }

    Ok(envelope.body)
}

fn validate_phone(phone: &str) -> Result<()> {
    let valid = phone
        .strip_prefix("+380")
        .map(|rest| rest.len() == 9 && rest.bytes().all(|b| b.is_ascii_digit()))
        .unwrap_or(false);

    if valid {
        Ok(())
    } else {
        Err(AppError::Validation(format!("Invalid phone number: {phone}")))
    }
}

fn validate_otp_code(code: &str) -> Result<()> {
    if code.chars().count() == OTP_CODE_LENGTH {
        Ok(())
    } else {
        Err(AppError::Validation(format!(
            "OTP code must be {OTP_CODE_LENGTH} characters, got {code:?}"
        )))
    }
}

#[async_trait]
impl ForaApi for ForaClient {
    #[tracing::instrument(skip_all)]
    async fn refresh_token(&self, session: &Session) -> Result<TokenPair> {
        let body: TokensBody = self.call(session, "RefreshToken", json!({})).await?;
        Ok(body.tokens.into())
    }

    #[tracing::instrument(skip(self, session))]
    async fn get_personal_info(
        &self,
        session: &Session,
        force_update: bool,
    ) -> Result<PersonalInfo> {
        let body: PersonalInfoBody = self
            .call(
                session,
                "GetPersonalInfo_V6",
                json!({ "forceUpdate": force_update }),
            )
            .await?;
        Ok(body.personal_info)
    }

    #[tracing::instrument(skip_all)]
    async fn get_last_cheque_headers_fast(&self, session: &Session) -> Result<Vec<MonthBalance>> {
        let body: ChequeHeadersBody = self
            .call(session, "GetLastChequeHeadersFast", json!({}))
            .await?;
        Ok(body.sum_balance)
    }

    #[tracing::instrument(skip_all, fields(count = identities.len()))]
    async fn get_cheques_infos(
        &self,
        session: &Session,
        identities: &[ChequeIdentity],
    ) -> Result<Vec<ChequeInfo>> {
        let body: ChequesInfosBody = self
            .call(
                session,
                "GetChequesInfos",
                json!({ "identities": identities }),
            )
            .await?;
        Ok(body.cheques_infos)
    }

    #[tracing::instrument(skip(self, session))]
    async fn send_otp(&self, session: &Session, guid: Uuid, phone: &str) -> Result<bool> {
        validate_phone(phone)?;
        let body: OtpBody = self
            .call(session, "SendOTP", json!({ "guid": guid, "phone": phone }))
            .await?;
        Ok(body.otp_send)
    }

    #[tracing::instrument(skip(self, session, otp_code))]
    async fn confirmation_otp(
        &self,
        session: &Session,
        guid: Uuid,
        phone: &str,
        otp_code: &str,
    ) -> Result<TokenPair> {
        validate_phone(phone)?;
        validate_otp_code(otp_code)?;
        let body: TokensBody = self
            .call(
                session,
                "ConfirmationOtp_V2",
                json!({ "guid": guid, "phone": phone, "otpCode": otp_code }),
            )
            .await?;
        Ok(body.tokens.into())
    }

    #[tracing::instrument(skip_all)]
    async fn check_user(&self, session: &Session) -> Result<UserStatus> {
        self.call(session, "CheckUser", json!({})).await
    }

    #[tracing::instrument(skip_all)]
    async fn register_user(&self, session: &Session) -> Result<Registration> {
        self.call(session, "RegisterUser", json!({})).await
    }

    #[tracing::instrument(skip(self, session))]
    async fn register_user_referral(
        &self,
        session: &Session,
        guid: Uuid,
        phone: &str,
        referrer_guid: Uuid,
    ) -> Result<Registration> {
        const METHOD: &str = "RegisterUserReferral";

        validate_phone(phone)?;
        let text = self
            .send(
                session,
                METHOD,
                json!({ "guid": guid, "phone": phone, "referrerGuid": referrer_guid }),
            )
            .await?;

        // The endpoint sometimes answers with an empty body even though the
        // registration went through; ask CheckUser in that case.
        if let Err(e) = serde_json::from_str::<Value>(&text) {
            tracing::error!(error = %e, body = %text, "Malformed RegisterUserReferral response");
            let user = self.check_user(session).await?;
            let barcode = user.barcode.ok_or_else(|| {
                AppError::Schema(format!("{METHOD}: CheckUser returned no barcode"))
            })?;
            return Ok(Registration {
                barcode,
                register: user.registered,
            });
        }

        parse_envelope(METHOD, &text)
    }

    #[tracing::instrument(skip(self, session))]
    async fn set_bonus_to_apply(&self, session: &Session, guid: Uuid, phone: &str) -> Result<()> {
        validate_phone(phone)?;
        let _: Empty = self
            .call(
                session,
                "SetBonusToApply",
                json!({ "bonuseCancellationId": 2, "guid": guid, "phone": phone }),
            )
            .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self, session))]
    async fn get_app_configurations(
        &self,
        session: &Session,
        platform: i32,
    ) -> Result<AppConfigurations> {
        self.call(
            session,
            "GetAppConfigurations_V4",
            json!({ "platform": platform }),
        )
        .await
    }
}
