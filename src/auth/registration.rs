//! Dynamic device registration over HTTP
//!
//! Exchanges signed identity claims for an encrypted device secret. The
//! [`RegistrationClient`] trait is the seam: [`HttpRegistrationClient`] talks
//! to the real service with reqwest, tests substitute a canned client.

use super::AuthError;
use crate::error::sanitize_error_message;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

pub const REGISTER_ACTION: &str = "DynamicRegister";
pub const REGISTER_VERSION: &str = "2021-12-14";

/// Signed registration claims
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistrationRequest {
    #[serde(rename = "InstanceID")]
    pub instance_id: String,
    pub product_key: String,
    pub device_name: String,
    pub random_num: u32,
    pub timestamp: i64,
    pub auth_type: u8,
    pub signature: String,
}

/// Raw transport for registration requests; returns the response body
#[async_trait]
pub trait RegistrationClient: Send + Sync {
    async fn register(&self, request: &RegistrationRequest) -> Result<String, AuthError>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistrationResponse {
    #[serde(rename = "ResponseMetadata")]
    pub metadata: ResponseMetadata,
    #[serde(rename = "Result")]
    pub result: Option<RegistrationResult>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResponseMetadata {
    #[serde(rename = "Action", default)]
    pub action: String,
    #[serde(rename = "Version", default)]
    pub version: String,
    #[serde(rename = "Error")]
    pub error: Option<ServiceError>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceError {
    #[serde(rename = "CodeN", default)]
    pub code_n: i64,
    #[serde(rename = "Code", default)]
    pub code: String,
    #[serde(rename = "Message", default)]
    pub message: String,
}

/// Encrypted device secret
#[derive(Debug, Clone, Deserialize)]
pub struct RegistrationResult {
    pub len: usize,
    pub payload: String,
}

/// Parse a registration body into its encrypted result
pub fn parse_registration_response(body: &str) -> Result<RegistrationResult, AuthError> {
    let response: RegistrationResponse = serde_json::from_str(body).map_err(|e| {
        AuthError::MalformedResponse(format!(
            "{e}: {}",
            sanitize_error_message(body)
        ))
    })?;

    if let Some(error) = response.metadata.error {
        return Err(AuthError::Rejected {
            code: if error.code.is_empty() {
                error.code_n.to_string()
            } else {
                error.code
            },
            message: sanitize_error_message(&error.message),
        });
    }

    if !response.metadata.action.is_empty() && response.metadata.action != REGISTER_ACTION {
        debug!(target: "iotlink::auth", action = %response.metadata.action, "unexpected registration action echoed");
    }

    response
        .result
        .filter(|r| !r.payload.is_empty())
        .ok_or_else(|| AuthError::MalformedResponse("missing Result.payload".to_string()))
}

/// Registration client settings
#[derive(Debug, Clone)]
pub struct HttpRegistrationConfig {
    pub http_host: String,
    pub verify_ssl: bool,
    pub ca_path: Option<PathBuf>,
    pub timeout: Duration,
}

/// reqwest-backed registration client
pub struct HttpRegistrationClient {
    endpoint: Url,
    client: Client,
}

impl HttpRegistrationClient {
    pub fn new(config: HttpRegistrationConfig) -> Result<Self, AuthError> {
        let endpoint = registration_url(&config.http_host)?;

        let mut builder = Client::builder()
            .timeout(config.timeout)
            .danger_accept_invalid_certs(!config.verify_ssl);

        if let Some(path) = &config.ca_path {
            let pem = std::fs::read(path).map_err(|e| {
                AuthError::Unreachable(format!("cannot read CA bundle {}: {e}", path.display()))
            })?;
            let certificate = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| AuthError::Unreachable(format!("invalid CA bundle: {e}")))?;
            builder = builder.add_root_certificate(certificate);
        }

        let client = builder
            .build()
            .map_err(|e| AuthError::Unreachable(e.to_string()))?;

        Ok(Self { endpoint, client })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

/// `{http_host}/?Action=DynamicRegister&Version=2021-12-14`
pub fn registration_url(http_host: &str) -> Result<Url, AuthError> {
    let base = if http_host.contains("://") {
        http_host.to_string()
    } else {
        format!("https://{http_host}")
    };
    let mut url = Url::parse(&base)
        .map_err(|e| AuthError::Unreachable(format!("invalid registration host '{http_host}': {e}")))?;
    url.set_path("/");
    url.query_pairs_mut()
        .clear()
        .append_pair("Action", REGISTER_ACTION)
        .append_pair("Version", REGISTER_VERSION);
    Ok(url)
}

#[async_trait]
impl RegistrationClient for HttpRegistrationClient {
    async fn register(&self, request: &RegistrationRequest) -> Result<String, AuthError> {
        debug!(
            target: "iotlink::auth",
            url = %self.endpoint,
            product_key = %request.product_key,
            device_name = %request.device_name,
            auth_type = request.auth_type,
            "sending dynamic registration"
        );

        let response = self
            .client
            .post(self.endpoint.clone())
            .header("X-Signature", &request.signature)
            .header("X-Auth-Type", request.auth_type.to_string())
            .header("X-Device-Name", &request.device_name)
            .header("X-Product-Key", &request.product_key)
            .header("X-Random-Num", request.random_num.to_string())
            .header("X-Timestamp", request.timestamp.to_string())
            .json(request)
            .send()
            .await
            .map_err(|e| AuthError::Unreachable(sanitize_error_message(&e.to_string())))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AuthError::Unreachable(e.to_string()))?;

        if !status.is_success() {
            warn!(target: "iotlink::auth", status = %status, "registration service returned an error status");
            // The service reports most failures in ResponseMetadata.Error
            if let Err(err @ AuthError::Rejected { .. }) = parse_registration_response(&body) {
                return Err(err);
            }
            return Err(AuthError::Rejected {
                code: status.as_u16().to_string(),
                message: sanitize_error_message(&body),
            });
        }

        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_BODY: &str = r#"{"ResponseMetadata":{"Action":"DynamicRegister","Version":"2021-12-14"},"Result":{"len":24,"payload":"Kg/hy+SdiBzWE80q3deSlx5PIaPv3OVo6z2rk/nvoiQ="}}"#;

    #[test]
    fn test_parse_success_body() {
        let result = parse_registration_response(SAMPLE_BODY).unwrap();
        assert_eq!(result.len, 24);
        assert_eq!(result.payload, "Kg/hy+SdiBzWE80q3deSlx5PIaPv3OVo6z2rk/nvoiQ=");
    }

    #[test]
    fn test_parse_service_error() {
        let body = r#"{"ResponseMetadata":{"Action":"DynamicRegister","Version":"2021-12-14","Error":{"CodeN":100013,"Code":"InvalidSignature","Message":"signature mismatch"}}}"#;
        match parse_registration_response(body) {
            Err(AuthError::Rejected { code, message }) => {
                assert_eq!(code, "InvalidSignature");
                assert_eq!(message, "signature mismatch");
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn test_parse_malformed_body() {
        assert!(matches!(
            parse_registration_response("<html>bad gateway</html>"),
            Err(AuthError::MalformedResponse(_))
        ));
        assert!(matches!(
            parse_registration_response(r#"{"ResponseMetadata":{}}"#),
            Err(AuthError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_registration_url() {
        let url = registration_url("https://iot-cn-shanghai.iot.volces.com").unwrap();
        assert_eq!(
            url.as_str(),
            "https://iot-cn-shanghai.iot.volces.com/?Action=DynamicRegister&Version=2021-12-14"
        );

        let url = registration_url("localhost:9996").unwrap();
        assert_eq!(url.scheme(), "https");
        assert_eq!(url.port(), Some(9996));

        let url = registration_url("http://127.0.0.1:8080").unwrap();
        assert_eq!(url.scheme(), "http");
    }

    #[test]
    fn test_request_body_fields() {
        let request = RegistrationRequest {
            instance_id: "6784dcf26c8dc8689881e67d".to_string(),
            product_key: "6788bd810f9bad3f8ef674fa".to_string(),
            device_name: "P1-9".to_string(),
            random_num: 42,
            timestamp: 1_736_000_000_000,
            auth_type: 2,
            signature: "sig".to_string(),
        };
        let body = serde_json::to_value(&request).unwrap();
        assert_eq!(body["InstanceID"], "6784dcf26c8dc8689881e67d");
        assert_eq!(body["random_num"], 42);
        assert_eq!(body["signature"], "sig");
        assert_eq!(body["auth_type"], 2);
    }
}
