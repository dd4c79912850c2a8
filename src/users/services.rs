use axum::extract::FromRef;
use lazy_static::lazy_static;
use regex::Regex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

use super::dto::{LoginData, LoginRequest, RegisterForm, TokenPair, UploadedFile};
use super::jwt::TokenKeys;
use super::model::{NewUser, PublicUser, User};
use super::password::{hash_password, verify_password};
use super::store::StoreError;

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

fn ext_from_mime(ct: &str) -> &'static str {
    match ct {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/png" => "png",
        "image/webp" => "webp",
        _ => "bin",
    }
}

fn store_internal(e: StoreError) -> ApiError {
    error!(error = %e, "store error");
    ApiError::internal(e.to_string())
}

async fn upload_media(st: &AppState, kind: &str, file: &UploadedFile) -> anyhow::Result<String> {
    let key = format!("{kind}/{}.{}", Uuid::new_v4(), ext_from_mime(&file.content_type));
    st.media
        .upload(&key, file.body.clone(), &file.content_type)
        .await
}

fn pair_failure(e: impl std::fmt::Display, user_id: Uuid) -> ApiError {
    error!(error = %e, %user_id, "token pair issuance failed");
    ApiError::internal("Something went wrong while generating refresh and access tokens")
}

/// Mints a fresh access/refresh pair and persists the refresh token,
/// overwriting whatever was stored. This is the single place a refresh
/// token becomes live, so "at most one per user" holds by construction.
async fn issue_token_pair(st: &AppState, user: &User) -> Result<TokenPair, ApiError> {
    let keys = TokenKeys::from_ref(st);
    let access_token = keys
        .issue_access(user)
        .map_err(|e| pair_failure(e, user.id))?;
    let refresh_token = keys
        .issue_refresh(user.id)
        .map_err(|e| pair_failure(e, user.id))?;
    st.users
        .update_refresh_token(user.id, Some(&refresh_token))
        .await
        .map_err(|e| pair_failure(e, user.id))?;
    Ok(TokenPair {
        access_token,
        refresh_token,
    })
}

pub async fn register_user(st: &AppState, form: RegisterForm) -> Result<PublicUser, ApiError> {
    if [&form.full_name, &form.email, &form.user_name, &form.password]
        .iter()
        .any(|f| f.trim().is_empty())
    {
        return Err(ApiError::validation("All fields are required"));
    }
    let full_name = form.full_name.trim().to_string();
    let email = form.email.trim().to_lowercase();
    let user_name = form.user_name.trim().to_lowercase();

    if !is_valid_email(&email) {
        warn!(%email, "registration with invalid email");
        return Err(ApiError::validation("Invalid email"));
    }

    if st
        .users
        .find_by_username_or_email(Some(&user_name), Some(&email))
        .await
        .map_err(store_internal)?
        .is_some()
    {
        return Err(ApiError::conflict(
            "User with email or username already exists",
        ));
    }

    let avatar = form
        .avatar
        .as_ref()
        .ok_or_else(|| ApiError::validation("Avatar file is required"))?;
    let avatar_url = match upload_media(st, "avatars", avatar).await {
        Ok(url) => url,
        Err(e) => {
            warn!(error = %e, "avatar upload failed");
            return Err(ApiError::validation("Avatar file is required"));
        }
    };
    // A missing or failed cover image is tolerated and stored as empty.
    let cover_image_url = match &form.cover_image {
        Some(file) => match upload_media(st, "covers", file).await {
            Ok(url) => url,
            Err(e) => {
                warn!(error = %e, "cover image upload failed, continuing without");
                String::new()
            }
        },
        None => String::new(),
    };

    let password_hash = hash_password(&form.password).map_err(|e| {
        error!(error = %e, "hash_password failed");
        ApiError::internal(e.to_string())
    })?;

    let created = st
        .users
        .create(NewUser {
            user_name,
            email,
            full_name,
            password_hash,
            avatar_url,
            cover_image_url,
        })
        .await
        .map_err(|e| match e {
            // The unique index is the safety net behind the pre-check above.
            StoreError::Duplicate => {
                ApiError::conflict("User with email or username already exists")
            }
            StoreError::Backend(e) => {
                error!(error = %e, "create user failed");
                ApiError::internal(e.to_string())
            }
        })?;

    // Re-read what was persisted; the public view must come from the store.
    let user = st
        .users
        .find_by_id(created.id)
        .await
        .map_err(store_internal)?
        .ok_or_else(|| {
            ApiError::internal("Something went wrong while registering the user")
        })?;

    info!(user_id = %user.id, user_name = %user.user_name, "user registered");
    Ok(user.public_view())
}

pub async fn login_user(st: &AppState, req: LoginRequest) -> Result<LoginData, ApiError> {
    let user_name = req
        .user_name
        .as_deref()
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty());
    let email = req
        .email
        .as_deref()
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty());
    if user_name.is_none() && email.is_none() {
        return Err(ApiError::validation("username or email is required"));
    }

    let user = st
        .users
        .find_by_username_or_email(user_name.as_deref(), email.as_deref())
        .await
        .map_err(store_internal)?
        .ok_or_else(|| ApiError::not_found("User does not exist"))?;

    let ok = verify_password(&req.password, &user.password_hash).map_err(|e| {
        error!(error = %e, user_id = %user.id, "verify_password failed");
        ApiError::internal(e.to_string())
    })?;
    if !ok {
        warn!(user_id = %user.id, "login with invalid credentials");
        return Err(ApiError::unauthorized("Invalid user credentials"));
    }

    let pair = issue_token_pair(st, &user).await?;
    let user = st
        .users
        .find_by_id(user.id)
        .await
        .map_err(store_internal)?
        .ok_or_else(|| ApiError::internal("Something went wrong while logging in"))?;

    info!(user_id = %user.id, "user logged in");
    Ok(LoginData {
        user: user.public_view(),
        access_token: pair.access_token,
        refresh_token: pair.refresh_token,
    })
}

/// Revokes the stored refresh token. The caller is already authenticated
/// by the access-token extractor; no token inspection happens here.
pub async fn logout_user(st: &AppState, user_id: Uuid) -> Result<(), ApiError> {
    st.users
        .update_refresh_token(user_id, None)
        .await
        .map_err(store_internal)?;
    info!(%user_id, "user logged out");
    Ok(())
}

pub async fn refresh_session(
    st: &AppState,
    incoming: Option<String>,
) -> Result<TokenPair, ApiError> {
    let incoming = incoming
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ApiError::unauthorized("Unauthorized request"))?;

    let keys = TokenKeys::from_ref(st);
    let claims = keys.verify_refresh(&incoming).map_err(|e| {
        warn!(error = %e, "refresh token rejected");
        ApiError::unauthorized("Invalid refresh token")
    })?;

    // Store failures on this path surface as 401, matching the contract
    // that refresh never reports anything but Unauthorized on failure.
    let user = st
        .users
        .find_by_id(claims.sub)
        .await
        .map_err(|e| ApiError::unauthorized(e.to_string()))?
        .ok_or_else(|| ApiError::unauthorized("Invalid refresh token"))?;

    // Reuse detection: only the most recently issued refresh token is live.
    // A token superseded by a later login or refresh never verifies again.
    if user.refresh_token.as_deref() != Some(incoming.as_str()) {
        warn!(user_id = %user.id, "superseded refresh token replayed");
        return Err(ApiError::unauthorized("Refresh token is expired or used"));
    }

    let pair = issue_token_pair(st, &user)
        .await
        .map_err(|e| ApiError::unauthorized(e.to_string()))?;
    info!(user_id = %user.id, "session refreshed");
    Ok(pair)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn avatar() -> UploadedFile {
        UploadedFile {
            body: Bytes::from_static(b"fake-image-bytes"),
            content_type: "image/png".into(),
        }
    }

    fn form(user_name: &str, email: &str) -> RegisterForm {
        RegisterForm {
            full_name: "Ada Lovelace".into(),
            email: email.into(),
            user_name: user_name.into(),
            password: "p@ssw0rd".into(),
            avatar: Some(avatar()),
            cover_image: None,
        }
    }

    fn login_req(user_name: Option<&str>, email: Option<&str>, password: &str) -> LoginRequest {
        LoginRequest {
            user_name: user_name.map(Into::into),
            email: email.map(Into::into),
            password: password.into(),
        }
    }

    #[tokio::test]
    async fn register_normalizes_and_hides_secrets() {
        let st = AppState::fake();
        let user = register_user(&st, form("Ada", " Ada@X.com "))
            .await
            .expect("register");
        assert_eq!(user.user_name, "ada");
        assert_eq!(user.email, "ada@x.com");
        assert!(user.avatar_url.contains("avatars/"));
        assert_eq!(user.cover_image_url, "");

        let json = serde_json::to_value(&user).unwrap();
        let obj = json.as_object().unwrap();
        assert!(!obj.contains_key("passwordHash"));
        assert!(!obj.contains_key("refreshToken"));

        // the stored hash is not the plaintext
        let stored = st
            .users
            .find_by_username_or_email(Some("ada"), None)
            .await
            .unwrap()
            .unwrap();
        assert_ne!(stored.password_hash, "p@ssw0rd");
    }

    #[tokio::test]
    async fn register_rejects_blank_fields() {
        let st = AppState::fake();
        let mut f = form("ada", "ada@x.com");
        f.full_name = "   ".into();
        let err = register_user(&st, f).await.unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
        assert_eq!(err.to_string(), "All fields are required");
    }

    #[tokio::test]
    async fn register_requires_avatar() {
        let st = AppState::fake();
        let mut f = form("ada", "ada@x.com");
        f.avatar = None;
        let err = register_user(&st, f).await.unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
        assert_eq!(err.to_string(), "Avatar file is required");
    }

    #[tokio::test]
    async fn register_conflicts_regardless_of_casing() {
        let st = AppState::fake();
        register_user(&st, form("bob", "bob@x.com")).await.unwrap();
        let err = register_user(&st, form("Bob", "other@x.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Conflict(_)));
        let err = register_user(&st, form("other", "BOB@x.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Conflict(_)));
    }

    #[tokio::test]
    async fn register_fails_when_avatar_upload_fails() {
        struct FailingMedia;
        #[axum::async_trait]
        impl crate::media::MediaClient for FailingMedia {
            async fn upload(
                &self,
                _key: &str,
                _body: Bytes,
                _ct: &str,
            ) -> anyhow::Result<String> {
                anyhow::bail!("remote storage is down")
            }
        }

        let mut st = AppState::fake();
        st.media = std::sync::Arc::new(FailingMedia);
        let err = register_user(&st, form("ada", "ada@x.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
    }

    #[tokio::test]
    async fn register_tolerates_cover_upload_failure() {
        // media client that accepts avatars but fails covers
        struct CoverlessMedia;
        #[axum::async_trait]
        impl crate::media::MediaClient for CoverlessMedia {
            async fn upload(&self, key: &str, _body: Bytes, _ct: &str) -> anyhow::Result<String> {
                if key.starts_with("covers/") {
                    anyhow::bail!("cover bucket unavailable")
                }
                Ok(format!("https://media.fake.local/{key}"))
            }
        }

        let mut st = AppState::fake();
        st.media = std::sync::Arc::new(CoverlessMedia);
        let mut f = form("ada", "ada@x.com");
        f.cover_image = Some(avatar());
        let user = register_user(&st, f).await.expect("register");
        assert_eq!(user.cover_image_url, "");
    }

    #[tokio::test]
    async fn login_requires_an_identifier() {
        let st = AppState::fake();
        let err = login_user(&st, login_req(None, None, "pw")).await.unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
    }

    #[tokio::test]
    async fn login_unknown_user_is_not_found() {
        let st = AppState::fake();
        let err = login_user(&st, login_req(Some("ghost"), None, "pw"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
    }

    #[tokio::test]
    async fn login_wrong_password_issues_nothing() {
        let st = AppState::fake();
        let created = register_user(&st, form("ada", "ada@x.com")).await.unwrap();
        let err = login_user(&st, login_req(Some("ada"), None, "wrong"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized(_)));

        let stored = st.users.find_by_id(created.id).await.unwrap().unwrap();
        assert!(stored.refresh_token.is_none());
    }

    #[tokio::test]
    async fn login_accepts_uppercase_identifier_and_stores_refresh_token() {
        let st = AppState::fake();
        let created = register_user(&st, form("ada", "ada@x.com")).await.unwrap();
        let data = login_user(&st, login_req(Some("Ada"), None, "p@ssw0rd"))
            .await
            .expect("login");
        assert_eq!(data.user.id, created.id);

        let stored = st.users.find_by_id(created.id).await.unwrap().unwrap();
        assert_eq!(stored.refresh_token.as_deref(), Some(data.refresh_token.as_str()));
    }

    #[tokio::test]
    async fn refresh_rotates_and_detects_reuse() {
        let st = AppState::fake();
        register_user(&st, form("ada", "ada@x.com")).await.unwrap();
        let login = login_user(&st, login_req(None, Some("ada@x.com"), "p@ssw0rd"))
            .await
            .unwrap();

        let pair = refresh_session(&st, Some(login.refresh_token.clone()))
            .await
            .expect("first refresh");
        assert_ne!(pair.refresh_token, login.refresh_token);

        // replaying the superseded token must fail
        let err = refresh_session(&st, Some(login.refresh_token))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized(_)));
        assert_eq!(err.to_string(), "Refresh token is expired or used");

        // the rotated token still works
        refresh_session(&st, Some(pair.refresh_token))
            .await
            .expect("second refresh");
    }

    #[tokio::test]
    async fn logout_revokes_the_refresh_token() {
        let st = AppState::fake();
        let created = register_user(&st, form("ada", "ada@x.com")).await.unwrap();
        let login = login_user(&st, login_req(Some("ada"), None, "p@ssw0rd"))
            .await
            .unwrap();

        logout_user(&st, created.id).await.expect("logout");
        let stored = st.users.find_by_id(created.id).await.unwrap().unwrap();
        assert!(stored.refresh_token.is_none());

        let err = refresh_session(&st, Some(login.refresh_token))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn refresh_without_token_is_unauthorized() {
        let st = AppState::fake();
        let err = refresh_session(&st, None).await.unwrap_err();
        assert_eq!(err.to_string(), "Unauthorized request");
        let err = refresh_session(&st, Some(String::new())).await.unwrap_err();
        assert_eq!(err.to_string(), "Unauthorized request");
    }

    #[tokio::test]
    async fn refresh_rejects_garbage_and_foreign_tokens() {
        let st = AppState::fake();
        let err = refresh_session(&st, Some("not-a-jwt".into())).await.unwrap_err();
        assert_eq!(err.to_string(), "Invalid refresh token");

        // an access token is signed with the wrong secret for this path
        register_user(&st, form("ada", "ada@x.com")).await.unwrap();
        let login = login_user(&st, login_req(Some("ada"), None, "p@ssw0rd"))
            .await
            .unwrap();
        let err = refresh_session(&st, Some(login.access_token)).await.unwrap_err();
        assert_eq!(err.to_string(), "Invalid refresh token");
    }
}
