use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::model::PublicUser;

/// One uploaded file part from the registration form.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub body: Bytes,
    pub content_type: String,
}

/// Input assembled from the multipart registration form.
#[derive(Debug, Default)]
pub struct RegisterForm {
    pub full_name: String,
    pub email: String,
    pub user_name: String,
    pub password: String,
    pub avatar: Option<UploadedFile>,
    pub cover_image: Option<UploadedFile>,
}

/// Login accepts the username, the email, or both.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub user_name: Option<String>,
    pub email: Option<String>,
    pub password: String,
}

/// Body fallback for refresh when the cookie is absent.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    pub refresh_token: Option<String>,
}

/// Payload returned by login.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginData {
    pub user: PublicUser,
    pub access_token: String,
    pub refresh_token: String,
}

/// Fresh pair returned by refresh; also what the boundary attaches as
/// the session cookies.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}
