use axum::{
    extract::{DefaultBodyLimit, Multipart, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    routing::post,
    Json, Router,
};
use tracing::instrument;

use crate::{error::ApiError, response::ApiResponse, state::AppState};

use super::{
    dto::{LoginData, LoginRequest, RefreshRequest, RegisterForm, TokenPair, UploadedFile},
    extractors::{cookie_value, AuthUser},
    model::PublicUser,
    services,
};

pub fn user_routes() -> Router<AppState> {
    Router::new()
        .route("/users/register", post(register))
        .route("/users/login", post(login))
        .route("/users/logout", post(logout))
        .route("/users/refresh-token", post(refresh_token))
        .layer(DefaultBodyLimit::max(8 * 1024 * 1024))
}

fn session_cookie(name: &str, value: &str) -> HeaderValue {
    format!("{name}={value}; HttpOnly; Secure; Path=/")
        .parse()
        .expect("cookie header value")
}

fn expired_cookie(name: &str) -> HeaderValue {
    format!("{name}=; HttpOnly; Secure; Path=/; Max-Age=0")
        .parse()
        .expect("cookie header value")
}

fn session_headers(pair: &TokenPair) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.append(
        header::SET_COOKIE,
        session_cookie("accessToken", &pair.access_token),
    );
    headers.append(
        header::SET_COOKIE,
        session_cookie("refreshToken", &pair.refresh_token),
    );
    headers
}

fn bad_part(e: axum::extract::multipart::MultipartError) -> ApiError {
    ApiError::validation(e.to_string())
}

#[instrument(skip(state, mp))]
pub async fn register(
    State(state): State<AppState>,
    mut mp: Multipart,
) -> Result<(StatusCode, Json<ApiResponse<PublicUser>>), ApiError> {
    let mut form = RegisterForm::default();
    while let Ok(Some(field)) = mp.next_field().await {
        let Some(name) = field.name().map(str::to_owned) else {
            continue;
        };
        match name.as_str() {
            "fullName" => form.full_name = field.text().await.map_err(bad_part)?,
            "email" => form.email = field.text().await.map_err(bad_part)?,
            "userName" => form.user_name = field.text().await.map_err(bad_part)?,
            "password" => form.password = field.text().await.map_err(bad_part)?,
            "avatar" | "coverImage" => {
                let content_type = field
                    .content_type()
                    .map(str::to_owned)
                    .unwrap_or_else(|| "application/octet-stream".into());
                let body = field.bytes().await.map_err(bad_part)?;
                let file = UploadedFile { body, content_type };
                if name == "avatar" {
                    form.avatar = Some(file);
                } else {
                    form.cover_image = Some(file);
                }
            }
            _ => {}
        }
    }

    let user = services::register_user(&state, form).await?;
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::new(
            StatusCode::CREATED,
            user,
            "User registered successfully",
        )),
    ))
}

#[instrument(skip(state, payload))]
pub async fn login(
    State(state): State<AppState>,
    Json(payload): Json<LoginRequest>,
) -> Result<(HeaderMap, Json<ApiResponse<LoginData>>), ApiError> {
    let data = services::login_user(&state, payload).await?;
    let headers = session_headers(&TokenPair {
        access_token: data.access_token.clone(),
        refresh_token: data.refresh_token.clone(),
    });
    Ok((
        headers,
        Json(ApiResponse::new(
            StatusCode::OK,
            data,
            "User logged in successfully",
        )),
    ))
}

#[instrument(skip(state))]
pub async fn logout(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<(HeaderMap, Json<ApiResponse<serde_json::Value>>), ApiError> {
    services::logout_user(&state, user_id).await?;
    let mut headers = HeaderMap::new();
    headers.append(header::SET_COOKIE, expired_cookie("accessToken"));
    headers.append(header::SET_COOKIE, expired_cookie("refreshToken"));
    Ok((
        headers,
        Json(ApiResponse::new(
            StatusCode::OK,
            serde_json::json!({}),
            "User logged out successfully",
        )),
    ))
}

#[instrument(skip(state, headers, body))]
pub async fn refresh_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Option<Json<RefreshRequest>>,
) -> Result<(HeaderMap, Json<ApiResponse<TokenPair>>), ApiError> {
    let incoming = cookie_value(&headers, "refreshToken")
        .or_else(|| body.and_then(|Json(b)| b.refresh_token));
    let pair = services::refresh_session(&state, incoming).await?;
    let out = session_headers(&pair);
    Ok((
        out,
        Json(ApiResponse::new(
            StatusCode::OK,
            pair,
            "Access token refreshed",
        )),
    ))
}
