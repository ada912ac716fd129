use anyhow::Context as _;
use domain::{SystemClock, TaskId, ThreadId, UserId};
use infrastructure::{BoardFilter, DynamoDbBoardStore, DynamoDbClient, QueryService};
use lambda_runtime::{run, service_fn, Error, LambdaEvent};
use serde::Serialize;
use serde_json::{json, Value};
use shared::{
    error_response, success_response, trace_http_response, trace_lambda_handler,
    tracing::init_tracing, ApiGatewayProxyRequest, ApiGatewayProxyResponse, AppError,
    BusinessMetrics, Config, MetricsClient, MetricsSink,
};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

/// クエリの種類を表す列挙型
#[derive(Debug)]
enum Query {
    Board { filter: BoardFilter },
    TaskDetail { task_id: TaskId },
    Threads { task_id: TaskId },
    Comments {
        task_id: TaskId,
        thread_id: Option<ThreadId>,
    },
    History { task_id: TaskId },
    Inbox,
}

impl Query {
    fn name(&self) -> &'static str {
        match self {
            Query::Board { .. } => "GetBoard",
            Query::TaskDetail { .. } => "GetTaskDetail",
            Query::Threads { .. } => "ListThreads",
            Query::Comments { .. } => "ListComments",
            Query::History { .. } => "GetTaskHistory",
            Query::Inbox => "GetInvitationInbox",
        }
    }
}

struct App {
    queries: QueryService,
    metrics: Arc<dyn MetricsSink>,
    include_error_details: bool,
}

impl App {
    async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let aws_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(config.aws_region.clone()))
            .load()
            .await;
        let store = Arc::new(DynamoDbBoardStore::new(DynamoDbClient::new(config).await));
        let metrics = Arc::new(MetricsClient::new(
            aws_sdk_cloudwatch::Client::new(&aws_config),
            "TaskBoard/QueryHandler".to_string(),
            config.environment.clone(),
        ));

        Ok(Self {
            queries: QueryService::new(store, Arc::new(SystemClock)),
            metrics,
            include_error_details: !config.is_production(),
        })
    }
}

/// クエリハンドラーのメイン関数
async fn function_handler(
    app: &App,
    event: LambdaEvent<ApiGatewayProxyRequest>,
) -> Result<ApiGatewayProxyResponse, Error> {
    let (payload, context) = event.into_parts();

    trace_lambda_handler!(
        "query-handler",
        payload,
        context,
        |payload: ApiGatewayProxyRequest, context: lambda_runtime::Context| async move {
            info!(
                "QueryHandler開始: method={}, path={}",
                payload.http_method, payload.path
            );
            let started = Instant::now();

            let response = match handle_request(app, &payload).await {
                Ok((operation, response)) => {
                    let elapsed = started.elapsed().as_secs_f64() * 1000.0;
                    app.metrics
                        .record(vec![BusinessMetrics::api_response_time(
                            operation,
                            response.status_code,
                            elapsed,
                        )])
                        .await;
                    response
                }
                Err(e) => {
                    if e.http_status_code() >= 500 {
                        error!("クエリ処理エラー: {}", e);
                    }
                    let request_id = payload
                        .request_context
                        .request_id
                        .clone()
                        .unwrap_or(context.request_id);
                    error_response(&e, request_id, app.include_error_details)
                }
            };

            trace_http_response(
                &payload.http_method,
                &payload.path,
                response.status_code,
                payload.authenticated_user().ok().as_deref(),
            );
            Ok::<_, Error>(response)
        }
    )
}

async fn handle_request(
    app: &App,
    request: &ApiGatewayProxyRequest,
) -> Result<(&'static str, ApiGatewayProxyResponse), AppError> {
    let viewer = UserId::from_string(request.authenticated_user()?)?;
    let query = parse_query(request)?;
    let operation = query.name();
    let response = execute_query(&app.queries, query, &viewer).await?;
    Ok((operation, response))
}

/// `GET /queries/...` をクエリに変換
fn parse_query(request: &ApiGatewayProxyRequest) -> Result<Query, AppError> {
    if request.http_method != "GET" {
        return Err(AppError::InvalidRequest(format!(
            "サポートされていないメソッド: {}",
            request.http_method
        )));
    }

    let segments = request.path_segments();
    let query = match segments.as_slice() {
        ["queries", "board"] => Query::Board {
            filter: BoardFilter {
                q: request.query("q").map(str::to_string),
                category: request.query("category").map(str::to_string),
            },
        },
        ["queries", "invitations"] => Query::Inbox,
        ["queries", "tasks", id] => Query::TaskDetail {
            task_id: task_id(id)?,
        },
        ["queries", "tasks", id, "threads"] => Query::Threads {
            task_id: task_id(id)?,
        },
        ["queries", "tasks", id, "comments"] => Query::Comments {
            task_id: task_id(id)?,
            thread_id: request
                .query("thread_id")
                .map(|t| ThreadId::from_string(t.to_string()))
                .transpose()?,
        },
        ["queries", "tasks", id, "history"] => Query::History {
            task_id: task_id(id)?,
        },
        _ => {
            return Err(AppError::InvalidRequest(format!(
                "サポートされていないパス: {}",
                request.path
            )))
        }
    };
    Ok(query)
}

fn task_id(segment: &str) -> Result<TaskId, AppError> {
    Ok(TaskId::from_string(segment.to_string())?)
}

fn json_response<T: Serialize>(body: &T) -> Result<ApiGatewayProxyResponse, AppError> {
    let value = serde_json::to_value(body).map_err(|e| AppError::Serialization(e.to_string()))?;
    Ok(success_response(200, value))
}

/// 件数付きの一覧レスポンス
fn list_response<T: Serialize>(key: &str, items: Vec<T>) -> Result<ApiGatewayProxyResponse, AppError> {
    let total_count = items.len();
    let items = serde_json::to_value(items).map_err(|e| AppError::Serialization(e.to_string()))?;
    let mut body = json!({ "total_count": total_count });
    body[key] = items;
    Ok(success_response(200, body))
}

async fn execute_query(
    queries: &QueryService,
    query: Query,
    viewer: &UserId,
) -> Result<ApiGatewayProxyResponse, AppError> {
    match query {
        Query::Board { filter } => json_response(&queries.board(viewer, &filter).await?),
        Query::TaskDetail { task_id } => json_response(&queries.task_detail(&task_id, viewer).await?),
        Query::Threads { task_id } => {
            list_response("threads", queries.list_threads(&task_id, viewer).await?)
        }
        Query::Comments { task_id, thread_id } => list_response(
            "comments",
            queries
                .list_comments(&task_id, viewer, thread_id.as_ref())
                .await?,
        ),
        Query::History { task_id } => {
            let events: Vec<Value> = queries
                .history(&task_id, viewer)
                .await?
                .into_iter()
                .map(|event| {
                    json!({
                        "event_id": event.event_id,
                        "event_type": event.event_type(),
                        "timestamp": event.timestamp,
                        "actor": event.actor,
                        "data": event.kind,
                    })
                })
                .collect();
            list_response("events", events)
        }
        Query::Inbox => list_response("invitations", queries.invitation_inbox(viewer).await?),
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    if let Err(e) = init_tracing() {
        eprintln!("トレーシング初期化エラー: {e}");
    }

    let config = Config::from_env().context("設定読み込みエラー")?;
    let app = Arc::new(
        App::from_config(&config)
            .await
            .context("クエリハンドラーの初期化に失敗")?,
    );

    run(service_fn(move |event| {
        let app = app.clone();
        async move { function_handler(&app, event).await }
    }))
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use domain::{ManualClock, NewTask, TaskStatus};
    use infrastructure::{BoardService, InMemoryBoardStore, InMemoryIdentityStore};

    fn request(path: &str, user: &UserId) -> ApiGatewayProxyRequest {
        let (path, query) = path.split_once('?').unwrap_or((path, ""));
        let params: serde_json::Map<String, Value> = query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
            .collect();
        serde_json::from_value(json!({
            "httpMethod": "GET",
            "path": path,
            "queryStringParameters": params,
            "requestContext": { "authorizer": { "userId": user.as_str() } }
        }))
        .unwrap()
    }

    fn body_of(response: &ApiGatewayProxyResponse) -> Value {
        serde_json::from_str(&response.body).unwrap()
    }

    #[test]
    fn test_parse_board_filter() {
        let user = UserId::new();
        match parse_query(&request("/queries/board?q=牛乳&category=家事", &user)).unwrap() {
            Query::Board { filter } => {
                assert_eq!(filter.q.as_deref(), Some("牛乳"));
                assert_eq!(filter.category.as_deref(), Some("家事"));
            }
            other => panic!("Expected Board query: {other:?}"),
        }
    }

    #[test]
    fn test_parse_task_routes() {
        let user = UserId::new();
        let task = TaskId::new();
        assert!(matches!(
            parse_query(&request(&format!("/queries/tasks/{task}"), &user)).unwrap(),
            Query::TaskDetail { .. }
        ));
        assert!(matches!(
            parse_query(&request(&format!("/queries/tasks/{task}/history"), &user)).unwrap(),
            Query::History { .. }
        ));
        match parse_query(&request(
            &format!("/queries/tasks/{task}/comments?thread_id=01THREAD"),
            &user,
        ))
        .unwrap()
        {
            Query::Comments { thread_id, .. } => {
                assert_eq!(thread_id.map(|t| t.to_string()).as_deref(), Some("01THREAD"));
            }
            other => panic!("Expected Comments query: {other:?}"),
        }
        assert!(matches!(
            parse_query(&request("/queries/unknown", &user)),
            Err(AppError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_board_and_history_queries() {
        let store = Arc::new(InMemoryBoardStore::new());
        let identity = Arc::new(InMemoryIdentityStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let board = BoardService::new(store.clone(), identity.clone(), clock.clone());
        let queries = QueryService::new(store, clock);

        let alice = identity.register("alice", None, "pw").id;
        let task = board
            .create_task(&alice, NewTask::titled("牛乳を買う").with_category("家事"))
            .await
            .unwrap();
        board
            .set_member_status(&task.id, &alice, &alice, TaskStatus::Doing)
            .await
            .unwrap();

        let query = parse_query(&request("/queries/board?category=家事", &alice)).unwrap();
        let body = body_of(&execute_query(&queries, query, &alice).await.unwrap());
        assert_eq!(body["doing"].as_array().map(Vec::len), Some(1));
        assert_eq!(body["doing"][0]["task"]["title"], "牛乳を買う");
        assert_eq!(body["doing"][0]["my_status"], "doing");

        let query = parse_query(&request(&format!("/queries/tasks/{}/history", task.id), &alice)).unwrap();
        let body = body_of(&execute_query(&queries, query, &alice).await.unwrap());
        assert_eq!(body["total_count"], 3);
        assert_eq!(body["events"][2]["event_type"], "member_status_changed_v1");

        let stranger = UserId::new();
        let query = parse_query(&request(&format!("/queries/tasks/{}", task.id), &stranger)).unwrap();
        let err = execute_query(&queries, query, &stranger).await.unwrap_err();
        assert_eq!(err.http_status_code(), 403);
    }
}
