//! API Gateway プロキシ統合の入出力

use crate::errors::{AppError, ErrorResponse};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// API Gateway プロキシリクエスト
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiGatewayProxyRequest {
    pub http_method: String,
    pub path: String,
    #[serde(default)]
    pub path_parameters: Option<HashMap<String, String>>,
    #[serde(default)]
    pub query_string_parameters: Option<HashMap<String, String>>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub request_context: RequestContext,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestContext {
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub authorizer: Option<Authorizer>,
}

/// 前段の認証で付与されるコンテキスト
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Authorizer {
    #[serde(default)]
    pub user_id: Option<String>,
}

impl ApiGatewayProxyRequest {
    /// 認証済みユーザーIDを取得
    pub fn authenticated_user(&self) -> Result<String, AppError> {
        self.request_context
            .authorizer
            .as_ref()
            .and_then(|a| a.user_id.clone())
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| AppError::Authentication("ユーザーIDが見つかりません".to_string()))
    }

    /// クエリパラメータを取得
    pub fn query(&self, key: &str) -> Option<&str> {
        self.query_string_parameters
            .as_ref()
            .and_then(|params| params.get(key))
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }

    /// ボディを JSON としてデコード
    pub fn json_body<T: serde::de::DeserializeOwned>(&self) -> Result<T, AppError> {
        let body = self
            .body
            .as_deref()
            .ok_or_else(|| AppError::InvalidRequest("リクエストボディが必要です".to_string()))?;
        serde_json::from_str(body)
            .map_err(|e| AppError::InvalidRequest(format!("リクエストボディのパースエラー: {e}")))
    }

    /// パスを `/` で分割したセグメント
    pub fn path_segments(&self) -> Vec<&str> {
        self.path.split('/').filter(|s| !s.is_empty()).collect()
    }
}

/// API Gateway プロキシレスポンス
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiGatewayProxyResponse {
    pub status_code: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
}

fn default_headers() -> HashMap<String, String> {
    HashMap::from([
        ("Content-Type".to_string(), "application/json".to_string()),
        ("Access-Control-Allow-Origin".to_string(), "*".to_string()),
        (
            "Access-Control-Allow-Headers".to_string(),
            "Content-Type,Authorization".to_string(),
        ),
    ])
}

/// 成功レスポンスを作成
pub fn success_response(status_code: u16, body: Value) -> ApiGatewayProxyResponse {
    ApiGatewayProxyResponse {
        status_code,
        headers: default_headers(),
        body: body.to_string(),
    }
}

/// AppError からエラーレスポンスを作成
pub fn error_response(
    error: &AppError,
    request_id: String,
    include_details: bool,
) -> ApiGatewayProxyResponse {
    let error_response = ErrorResponse::from_app_error(error, request_id, include_details);
    let body = error_response.to_json().unwrap_or_else(|_| {
        r#"{"code":"SERIALIZATION_ERROR","message":"エラーレスポンスの生成に失敗しました"}"#
            .to_string()
    });

    let mut headers = default_headers();
    headers.insert("X-Request-ID".to_string(), error_response.request_id);

    ApiGatewayProxyResponse {
        status_code: error.http_status_code(),
        headers,
        body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::DomainError;
    use serde_json::json;

    fn request(value: Value) -> ApiGatewayProxyRequest {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_authenticated_user() {
        let req = request(json!({
            "httpMethod": "GET",
            "path": "/queries/board",
            "requestContext": { "authorizer": { "userId": "user-a" } }
        }));
        assert_eq!(req.authenticated_user().unwrap(), "user-a");

        let anonymous = request(json!({ "httpMethod": "GET", "path": "/queries/board" }));
        assert!(matches!(
            anonymous.authenticated_user(),
            Err(AppError::Authentication(_))
        ));
    }

    #[test]
    fn test_path_segments_and_query() {
        let req = request(json!({
            "httpMethod": "GET",
            "path": "/queries/tasks/01ABC/",
            "queryStringParameters": { "q": "買い物", "category": "" }
        }));
        assert_eq!(req.path_segments(), vec!["queries", "tasks", "01ABC"]);
        assert_eq!(req.query("q"), Some("買い物"));
        assert_eq!(req.query("category"), None);
    }

    #[test]
    fn test_error_response_status_and_body() {
        let response = error_response(
            &AppError::from(DomainError::AlreadyInvited),
            "req-1".to_string(),
            false,
        );
        assert_eq!(response.status_code, 409);
        assert_eq!(response.headers.get("X-Request-ID").map(String::as_str), Some("req-1"));

        let body: Value = serde_json::from_str(&response.body).unwrap();
        assert_eq!(body["code"], "ALREADY_INVITED");
    }
}
