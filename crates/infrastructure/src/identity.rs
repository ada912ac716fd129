//! 認証基盤のユーザー情報

use async_trait::async_trait;
use aws_sdk_cognitoidentityprovider::error::ProvideErrorMetadata;
use aws_sdk_cognitoidentityprovider::types::{AttributeType, AuthFlowType};
use aws_sdk_cognitoidentityprovider::Client as CognitoClient;
use domain::UserId;
use serde::{Deserialize, Serialize};
use shared::AppError;
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::{debug, warn};

/// 認証基盤に登録されたユーザー
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    pub username: String,
    pub email: Option<String>,
}

/// ユーザー情報と資格情報の参照先
///
/// パスワードの保存やハッシュ化は実装側の責務。
#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn get_user(&self, user_id: &UserId) -> Result<Option<UserProfile>, AppError>;

    async fn get_user_by_username(&self, username: &str) -> Result<Option<UserProfile>, AppError>;

    async fn verify_password(&self, user: &UserProfile, password: &str) -> Result<bool, AppError>;
}

#[derive(Debug, Clone)]
struct StoredUser {
    profile: UserProfile,
    password: String,
}

/// メモリ上のユーザー一覧（テスト・ローカル実行用）
#[derive(Debug, Default)]
pub struct InMemoryIdentityStore {
    users: RwLock<HashMap<UserId, StoredUser>>,
}

impl InMemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// ユーザーを登録
    pub fn register(&self, username: &str, email: Option<&str>, password: &str) -> UserProfile {
        let profile = UserProfile {
            id: UserId::new(),
            username: username.to_string(),
            email: email.map(str::to_string),
        };
        if let Ok(mut users) = self.users.write() {
            users.insert(
                profile.id.clone(),
                StoredUser {
                    profile: profile.clone(),
                    password: password.to_string(),
                },
            );
        }
        profile
    }

    pub fn remove(&self, user_id: &UserId) {
        if let Ok(mut users) = self.users.write() {
            users.remove(user_id);
        }
    }

    fn read<T>(&self, f: impl FnOnce(&HashMap<UserId, StoredUser>) -> T) -> Result<T, AppError> {
        self.users
            .read()
            .map(|users| f(&users))
            .map_err(|_| AppError::Internal("identity store lock poisoned".to_string()))
    }
}

#[async_trait]
impl IdentityStore for InMemoryIdentityStore {
    async fn get_user(&self, user_id: &UserId) -> Result<Option<UserProfile>, AppError> {
        self.read(|users| users.get(user_id).map(|u| u.profile.clone()))
    }

    async fn get_user_by_username(&self, username: &str) -> Result<Option<UserProfile>, AppError> {
        self.read(|users| {
            users
                .values()
                .find(|u| u.profile.username == username)
                .map(|u| u.profile.clone())
        })
    }

    async fn verify_password(&self, user: &UserProfile, password: &str) -> Result<bool, AppError> {
        self.read(|users| {
            users
                .get(&user.id)
                .is_some_and(|stored| stored.password == password)
        })
    }
}

/// Cognito ユーザープールを参照する実装
///
/// ユーザーIDには `sub` 属性を使う。
#[derive(Clone)]
pub struct CognitoIdentityStore {
    client: CognitoClient,
    user_pool_id: String,
    client_id: String,
}

impl CognitoIdentityStore {
    pub fn new(client: CognitoClient, user_pool_id: String, client_id: String) -> Self {
        Self {
            client,
            user_pool_id,
            client_id,
        }
    }

    fn profile_from(username: Option<&str>, attributes: &[AttributeType]) -> Option<UserProfile> {
        let attribute = |name: &str| {
            attributes
                .iter()
                .find(|a| a.name() == name)
                .and_then(|a| a.value())
                .map(str::to_string)
        };
        let id = UserId::from_string(attribute("sub")?).ok()?;
        Some(UserProfile {
            id,
            username: username?.to_string(),
            email: attribute("email"),
        })
    }
}

fn cognito_error(err: impl ProvideErrorMetadata + std::fmt::Display) -> AppError {
    AppError::ExternalService(format!(
        "Cognito {}: {err}",
        err.code().unwrap_or("Unknown")
    ))
}

#[async_trait]
impl IdentityStore for CognitoIdentityStore {
    async fn get_user(&self, user_id: &UserId) -> Result<Option<UserProfile>, AppError> {
        let response = self
            .client
            .list_users()
            .user_pool_id(&self.user_pool_id)
            .filter(format!("sub = \"{}\"", user_id.as_str()))
            .limit(1)
            .send()
            .await
            .map_err(cognito_error)?;

        Ok(response
            .users()
            .first()
            .and_then(|user| Self::profile_from(user.username(), user.attributes())))
    }

    async fn get_user_by_username(&self, username: &str) -> Result<Option<UserProfile>, AppError> {
        let result = self
            .client
            .admin_get_user()
            .user_pool_id(&self.user_pool_id)
            .username(username)
            .send()
            .await;

        match result {
            Ok(output) => Ok(Self::profile_from(
                Some(output.username()),
                output.user_attributes(),
            )),
            Err(err) if err.code() == Some("UserNotFoundException") => {
                debug!("Cognito ユーザーが見つかりません: {}", username);
                Ok(None)
            }
            Err(err) => Err(cognito_error(err)),
        }
    }

    async fn verify_password(&self, user: &UserProfile, password: &str) -> Result<bool, AppError> {
        let result = self
            .client
            .admin_initiate_auth()
            .user_pool_id(&self.user_pool_id)
            .client_id(&self.client_id)
            .auth_flow(AuthFlowType::AdminUserPasswordAuth)
            .auth_parameters("USERNAME", &user.username)
            .auth_parameters("PASSWORD", password)
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(err) if err.code() == Some("NotAuthorizedException") => {
                warn!("パスワード認証に失敗: user_id={}", user.id);
                Ok(false)
            }
            Err(err) => Err(cognito_error(err)),
        }
    }
}
