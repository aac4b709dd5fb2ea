use serde::Serialize;

use crate::error::{AppError, Result};
use crate::models::Device;

const APP_VERSION_CODE: &str = "200";
const APP_VERSION_NAME: &str = "1.40.2";

struct AndroidRelease {
    sdk_int: u32,
    release: &'static str,
    android: &'static str,
}

// Longer releases first: "12.1" must win over "12"
const RELEASES: [AndroidRelease; 10] = [
    AndroidRelease { sdk_int: 33, release: "13", android: "Android" },
    AndroidRelease { sdk_int: 32, release: "12.1", android: "Android" },
    AndroidRelease { sdk_int: 31, release: "12", android: "Android" },
    AndroidRelease { sdk_int: 30, release: "11", android: "Android" },
    AndroidRelease { sdk_int: 29, release: "10", android: "Q (Android 10.0)" },
    AndroidRelease { sdk_int: 28, release: "9", android: "Pie (Android 9.0)" },
    AndroidRelease { sdk_int: 27, release: "8.1", android: "Oreo (Android 8.1)" },
    AndroidRelease { sdk_int: 26, release: "8", android: "Oreo (Android 8.0)" },
    AndroidRelease { sdk_int: 25, release: "7.1", android: "Nougat (Android 7.1.1)" },
    AndroidRelease { sdk_int: 24, release: "7", android: "Nougat (Android 7.0)" },
];

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UserInfo<'a> {
    geolocation_tracking_code: u8,
    push_notification_tracking_code: &'static str,
    root: &'static str,
    app_version_code: &'static str,
    app_version_name: &'static str,
    android_version: &'static str,
    brand: &'a str,
    model: &'a str,
    sdk_release: &'static str,
    sdk_version: String,
}

/// Builds the `user-info` header the mobile app sends for a device
pub fn user_info(device: &Device) -> Result<String> {
    let release = fingerprint_release(&device.fingerprint).ok_or_else(|| {
        AppError::Validation(format!("Unexpected fingerprint: {}", device.fingerprint))
    })?;

    let version = RELEASES
        .iter()
        .find(|v| release.starts_with(v.release))
        .ok_or_else(|| AppError::Validation(format!("Unexpected release: {release}")))?;

    let info = UserInfo {
        geolocation_tracking_code: 0,
        push_notification_tracking_code: "0",
        root: "false",
        app_version_code: APP_VERSION_CODE,
        app_version_name: APP_VERSION_NAME,
        android_version: version.android,
        brand: &device.brand,
        model: &device.model,
        sdk_release: version.release,
        sdk_version: version.sdk_int.to_string(),
    };

    Ok(serde_json::to_string(&info)?)
}

/// `brand/product/device:13/TQ3A.230805.001/...` -> `13`
fn fingerprint_release(fingerprint: &str) -> Option<&str> {
    let (_, rest) = fingerprint.split_once(':')?;
    let (release, _) = rest.split_once('/')?;
    (!release.is_empty()).then_some(release)
}
