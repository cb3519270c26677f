//! Registration and enrollment endpoints.
//!
//! These are plain request/response calls. They go through
//! [`SessionManager::send`] so every call is authorized and recovers from an
//! expired access token without any handling here.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{AccessError, PortalError};
use crate::manager::SessionManager;
use crate::session::Role;
use crate::transport::{ApiRequest, ApiResponse};

pub const REGISTRATION_PATH: &str = "api/all-registration/";

/// Public sign-up form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registration {
    pub full_name: String,
    pub aadhaar_no: String,
    pub associate_wings: String,
    pub phone: String,
    pub email: String,
    pub district: String,
    pub block: String,
    pub state: String,
    pub password: String,
    pub confirm_password: String,
}

/// A stored enrollment as the backend returns it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationRecord {
    pub id: Option<u64>,
    pub student_id: Option<String>,
    pub full_name: Option<String>,
    pub aadhaar_no: Option<String>,
    pub adharcard_file: Option<String>,
    pub associate_wings: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub district: Option<String>,
    pub block: Option<String>,
    pub state: Option<String>,
    pub status: Option<String>,
    pub created_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    success: bool,
    data: Option<T>,
    #[serde(default)]
    message: Option<String>,
}

/// Client for the portal's data endpoints.
#[derive(Clone)]
pub struct PortalApi {
    session: Arc<SessionManager>,
}

impl PortalApi {
    pub fn new(session: Arc<SessionManager>) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    pub async fn register(&self, form: &Registration) -> Result<(), PortalError> {
        let request = ApiRequest::post(REGISTRATION_PATH).json(form)?;
        let response = self.session.send(request).await?;
        if !response.status.is_success() {
            let body = response.json_value();
            let message = body
                .get("message")
                .or_else(|| body.get("error"))
                .and_then(|m| m.as_str())
                .map(String::from)
                .unwrap_or_else(|| "Registration failed!".to_string());
            return Err(PortalError::Api(message));
        }
        info!(phone = %form.phone, "Registration submitted");
        Ok(())
    }

    /// All enrollments. Admin only.
    pub async fn registrations(&self) -> Result<Vec<RegistrationRecord>, PortalError> {
        self.session.require_role(Role::Admin)?;
        let response = self.session.send(ApiRequest::get(REGISTRATION_PATH)).await?;
        let records: Vec<RegistrationRecord> = unwrap_envelope(response)?;
        debug!(count = records.len(), "Fetched registrations");
        Ok(records)
    }

    /// One student's enrollment record.
    pub async fn registration(&self, student_id: &str) -> Result<RegistrationRecord, PortalError> {
        let request = ApiRequest::get(REGISTRATION_PATH).query("student_id", student_id);
        let response = self.session.send(request).await?;
        unwrap_envelope(response)
    }

    /// The logged-in student's own record.
    pub async fn my_registration(&self) -> Result<RegistrationRecord, PortalError> {
        let session = self.session.require_role(Role::Student)?;
        let student_id = session.subject_id.ok_or(AccessError::NotAuthenticated)?;
        self.registration(&student_id).await
    }
}

fn unwrap_envelope<T: DeserializeOwned>(response: ApiResponse) -> Result<T, PortalError> {
    let response = response.error_for_status()?;
    let envelope: Envelope<T> = response.json()?;
    match envelope {
        Envelope {
            success: true,
            data: Some(data),
            ..
        } => Ok(data),
        Envelope { message, .. } => Err(PortalError::Api(
            message.unwrap_or_else(|| "request was not successful".to_string()),
        )),
    }
}
