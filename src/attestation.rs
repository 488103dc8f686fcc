use std::sync::OnceLock;

static SITE_KEY: OnceLock<String> = OnceLock::new();

/// Activates app attestation for the lifetime of the process.
///
/// Only the first call has an effect. Returns whether attestation is active.
pub fn init(site_key: Option<&str>) -> bool {
    match site_key.map(str::trim).filter(|k| !k.is_empty()) {
        Some(key) => {
            if SITE_KEY.set(key.to_string()).is_err() {
                tracing::debug!("App attestation already initialized");
            } else {
                tracing::info!("App attestation initialized");
            }
            true
        }
        None => {
            tracing::warn!("attestation.site_key missing. App attestation not initialized.");
            SITE_KEY.get().is_some()
        }
    }
}

/// Value for the `X-App-Check` request header, once initialized.
pub fn header_value() -> Option<&'static str> {
    SITE_KEY.get().map(String::as_str)
}
