//! Credential resolution
//!
//! Turns the device identity in [`SessionConfig`] into the MQTT client id,
//! username and password presented in CONNECT. Pre-provisioned devices sign
//! locally with their device secret. Dynamic registration modes first fetch
//! the device secret from the registration service, then sign the same way.
//!
//! Resolution never touches session state, so a failure leaves the session
//! exactly as it was.

pub mod registration;
pub mod signing;

pub use registration::{
    HttpRegistrationClient, HttpRegistrationConfig, RegistrationClient, RegistrationRequest,
};
pub use signing::{sign, sign_content, SignInput};

use crate::auth_span;
use crate::config::{AuthMode, SessionConfig};
use crate::platform::HardwareId;
use rand::Rng;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, Instrument};

/// Credential derivation failures
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing signing input: {0}")]
    MissingField(&'static str),
    #[error("Signing failed: {0}")]
    Signing(String),
    #[error("Registration service unreachable: {0}")]
    Unreachable(String),
    #[error("Registration rejected ({code}): {message}")]
    Rejected { code: String, message: String },
    #[error("Malformed registration response: {0}")]
    MalformedResponse(String),
    #[error("Cannot decrypt device secret: {0}")]
    Decrypt(String),
}

/// Broker credentials presented in CONNECT
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub client_id: String,
    pub username: String,
    password: String,
}

impl Credentials {
    pub fn new(
        client_id: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Nonce carried in signatures; non-negative as a signed 32-bit value
pub fn random_num() -> u32 {
    rand::thread_rng().gen_range(0..=i32::MAX as u32)
}

/// Derives [`Credentials`] from a device configuration
pub struct CredentialResolver {
    config: SessionConfig,
    registration: Option<Arc<dyn RegistrationClient>>,
    hardware_id: Option<Arc<HardwareId>>,
    registered_secret: Mutex<Option<String>>,
}

impl CredentialResolver {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            registration: None,
            hardware_id: None,
            registered_secret: Mutex::new(None),
        }
    }

    /// Use this client for dynamic registration instead of HTTP
    pub fn with_registration_client(mut self, client: Arc<dyn RegistrationClient>) -> Self {
        self.registration = Some(client);
        self
    }

    /// Use this hardware id source instead of the process-wide one
    pub fn with_hardware_id(mut self, hardware_id: Arc<HardwareId>) -> Self {
        self.hardware_id = Some(hardware_id);
        self
    }

    /// Configured device name, or the hardware id when none is set
    pub fn device_name(&self) -> String {
        if !self.config.device.device_name.is_empty() {
            return self.config.device.device_name.clone();
        }
        match &self.hardware_id {
            Some(id) => id.get(),
            None => HardwareId::process().get(),
        }
    }

    /// Client id presented in CONNECT
    pub fn client_id(&self) -> String {
        match &self.config.broker.client_id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => format!("{}|{}", self.config.device.product_key, self.device_name()),
        }
    }

    /// Resolve with a fresh nonce and the current wall-clock time
    pub async fn resolve(&self) -> Result<Credentials, AuthError> {
        self.resolve_at(random_num(), chrono::Utc::now().timestamp_millis())
            .await
    }

    /// Resolve with an explicit nonce and timestamp
    pub async fn resolve_at(
        &self,
        random_num: u32,
        timestamp_ms: i64,
    ) -> Result<Credentials, AuthError> {
        let mode = self.config.device.auth_mode;
        let span = auth_span!(
            product_key = %self.config.device.product_key,
            auth_mode = mode.code()
        );

        async move {
            let device_name = self.device_name();
            let secret = self.device_secret(&device_name, random_num, timestamp_ms).await?;

            let product_key = self.config.device.product_key.as_str();
            let input = SignInput {
                auth_type: mode.code(),
                device_name: &device_name,
                random_num,
                product_key,
                timestamp_ms,
            };
            let password = sign(&secret, &input)?;
            let username = format!(
                "{product_key}|{device_name}|{random_num}|{timestamp_ms}|{}",
                mode.code()
            );

            debug!(target: "iotlink::auth", username = %username, "credentials derived");
            Ok(Credentials::new(self.client_id(), username, password))
        }
        .instrument(span)
        .await
    }

    /// Device secret for signing: configured, previously registered, or fetched now
    pub async fn device_secret(
        &self,
        device_name: &str,
        random_num: u32,
        timestamp_ms: i64,
    ) -> Result<String, AuthError> {
        let configured = self
            .config
            .device
            .device_secret
            .as_deref()
            .filter(|s| !s.is_empty());

        let mode = self.config.device.auth_mode;
        if !mode.is_dynamic() {
            return configured
                .map(str::to_string)
                .ok_or(AuthError::MissingField("device_secret"));
        }

        // Already registered devices keep their secret in configuration
        if let Some(secret) = configured {
            return Ok(secret.to_string());
        }

        let mut cached = self.registered_secret.lock().await;
        if let Some(secret) = cached.as_ref() {
            return Ok(secret.clone());
        }

        let secret = self
            .register(mode, device_name, random_num, timestamp_ms)
            .await?;
        *cached = Some(secret.clone());
        Ok(secret)
    }

    async fn register(
        &self,
        mode: AuthMode,
        device_name: &str,
        random_num: u32,
        timestamp_ms: i64,
    ) -> Result<String, AuthError> {
        let device = &self.config.device;
        let product_secret = device
            .product_secret
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or(AuthError::MissingField("product_secret"))?;

        let signature = sign(
            product_secret,
            &SignInput {
                auth_type: mode.code(),
                device_name,
                random_num,
                product_key: &device.product_key,
                timestamp_ms,
            },
        )?;

        let request = RegistrationRequest {
            instance_id: device.instance_id.clone().unwrap_or_default(),
            product_key: device.product_key.clone(),
            device_name: device_name.to_string(),
            random_num,
            timestamp: timestamp_ms,
            auth_type: mode.code(),
            signature,
        };

        let client = match &self.registration {
            Some(client) => Arc::clone(client),
            None => Arc::new(HttpRegistrationClient::new(HttpRegistrationConfig {
                http_host: device
                    .http_host
                    .clone()
                    .ok_or(AuthError::MissingField("http_host"))?,
                verify_ssl: device.verify_ssl,
                ca_path: device.ca_path.clone(),
                timeout: self.config.connect_timeout(),
            })?) as Arc<dyn RegistrationClient>,
        };

        let body = client.register(&request).await?;
        let result = registration::parse_registration_response(&body)?;
        let secret =
            signing::decrypt_registration_payload(product_secret, &result.payload, result.len)?;

        info!(
            target: "iotlink::auth",
            product_key = %device.product_key,
            device_name = %device_name,
            "dynamic registration succeeded"
        );
        Ok(secret)
    }
}
