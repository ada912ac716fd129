use domain::{
    InvitationId, InvitationResponse, NewComment, NewTask, ProgressMode, RecurrenceMode,
    ShareToken, SubtaskId, SystemClock, TaskId, TaskStatus, TaskUpdates, UserId,
};
use infrastructure::{
    BoardService, ChallengeService, CognitoIdentityStore, DynamoDbBoardStore, DynamoDbClient,
    SesMailer,
};
use lambda_runtime::{run, service_fn, Error, LambdaEvent};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use shared::{
    error_response, success_response, trace_http_response, trace_lambda_handler,
    tracing::init_tracing, ApiGatewayProxyRequest, ApiGatewayProxyResponse, AppError,
    BusinessMetrics, Config, MetricsClient, MetricsSink, OptimisticLockRetryExecutor,
};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

/// ログイン開始リクエスト
#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

/// 認証コード確認リクエスト
#[derive(Debug, Deserialize)]
struct VerifyRequest {
    ticket: String,
    code: String,
}

/// メンバーステータス変更リクエスト（user_id 省略時は自分）
#[derive(Debug, Deserialize)]
struct StatusRequest {
    status: TaskStatus,
    #[serde(default)]
    user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InviteRequest {
    username: String,
}

#[derive(Debug, Deserialize)]
struct RespondRequest {
    response: InvitationResponse,
}

#[derive(Debug, Deserialize)]
struct TitleRequest {
    title: String,
}

#[derive(Debug, Deserialize)]
struct ThreadRequest {
    name: String,
}

/// コマンドの種類を表す列挙型
#[derive(Debug)]
enum Command {
    BeginLogin {
        username: String,
        password: String,
    },
    VerifyLogin {
        ticket: String,
        code: String,
    },
    CreateTask(NewTask),
    UpdateTask {
        task_id: TaskId,
        updates: TaskUpdates,
    },
    DeleteTask {
        task_id: TaskId,
    },
    DeleteDoneTasks,
    SetMemberStatus {
        task_id: TaskId,
        target: Option<UserId>,
        status: TaskStatus,
    },
    LeaveTask {
        task_id: TaskId,
    },
    RearmRecurrence {
        task_id: TaskId,
    },
    InviteUser {
        task_id: TaskId,
        username: String,
    },
    RespondInvitation {
        invitation_id: InvitationId,
        response: InvitationResponse,
    },
    JoinByShareToken {
        token: ShareToken,
    },
    AddSubtask {
        task_id: TaskId,
        title: String,
    },
    ToggleSubtask {
        subtask_id: SubtaskId,
    },
    DeleteSubtask {
        subtask_id: SubtaskId,
    },
    CreateThread {
        task_id: TaskId,
        name: String,
    },
    PostComment {
        task_id: TaskId,
        comment: NewComment,
    },
    PurgeAccount,
}

impl Command {
    /// 認証前に受け付けるコマンド
    fn is_public(&self) -> bool {
        matches!(self, Command::BeginLogin { .. } | Command::VerifyLogin { .. })
    }

    fn name(&self) -> &'static str {
        match self {
            Command::BeginLogin { .. } => "BeginLogin",
            Command::VerifyLogin { .. } => "VerifyLogin",
            Command::CreateTask(_) => "CreateTask",
            Command::UpdateTask { .. } => "UpdateTask",
            Command::DeleteTask { .. } => "DeleteTask",
            Command::DeleteDoneTasks => "DeleteDoneTasks",
            Command::SetMemberStatus { .. } => "SetMemberStatus",
            Command::LeaveTask { .. } => "LeaveTask",
            Command::RearmRecurrence { .. } => "RearmRecurrence",
            Command::InviteUser { .. } => "InviteUser",
            Command::RespondInvitation { .. } => "RespondInvitation",
            Command::JoinByShareToken { .. } => "JoinByShareToken",
            Command::AddSubtask { .. } => "AddSubtask",
            Command::ToggleSubtask { .. } => "ToggleSubtask",
            Command::DeleteSubtask { .. } => "DeleteSubtask",
            Command::CreateThread { .. } => "CreateThread",
            Command::PostComment { .. } => "PostComment",
            Command::PurgeAccount => "PurgeAccount",
        }
    }
}

/// ハンドラーが使うサービス一式
struct App {
    board: BoardService,
    challenges: ChallengeService,
    metrics: Arc<dyn MetricsSink>,
    include_error_details: bool,
}

impl App {
    /// 環境変数の設定から AWS クライアントを組み立てる
    async fn from_config(config: &Config) -> Result<Self, AppError> {
        let (user_pool_id, client_id) = config
            .cognito_user_pool_id
            .clone()
            .zip(config.cognito_client_id.clone())
            .ok_or_else(|| {
                AppError::Configuration(
                    "COGNITO_USER_POOL_ID と COGNITO_CLIENT_ID が必要です".to_string(),
                )
            })?;

        let aws_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(config.aws_region.clone()))
            .load()
            .await;

        let store = Arc::new(DynamoDbBoardStore::new(DynamoDbClient::new(config).await));
        let identity = Arc::new(CognitoIdentityStore::new(
            aws_sdk_cognitoidentityprovider::Client::new(&aws_config),
            user_pool_id,
            client_id,
        ));
        let mailer = Arc::new(SesMailer::new(
            aws_sdk_ses::Client::new(&aws_config),
            config.mail_from.clone(),
        ));
        let metrics: Arc<dyn MetricsSink> = Arc::new(MetricsClient::new(
            aws_sdk_cloudwatch::Client::new(&aws_config),
            "TaskBoard/CommandHandler".to_string(),
            config.environment.clone(),
        ));
        let clock = Arc::new(SystemClock);

        let board = BoardService::new(store.clone(), identity.clone(), clock.clone())
            .with_metrics(metrics.clone())
            .with_retry(OptimisticLockRetryExecutor::from_config(config));
        let challenges = ChallengeService::new(store, identity, mailer, clock);

        Ok(Self {
            board,
            challenges,
            metrics,
            include_error_details: !config.is_production(),
        })
    }
}

/// コマンドハンドラーのメイン関数
async fn function_handler(
    app: &App,
    event: LambdaEvent<ApiGatewayProxyRequest>,
) -> Result<ApiGatewayProxyResponse, Error> {
    let (payload, context) = event.into_parts();

    trace_lambda_handler!(
        "command-handler",
        payload,
        context,
        |payload: ApiGatewayProxyRequest, context: lambda_runtime::Context| async move {
            info!(
                "CommandHandler開始: method={}, path={}",
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
                        error!("リクエスト処理エラー: {}", e);
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

/// リクエストを処理し、操作名とレスポンスを返す
async fn handle_request(
    app: &App,
    request: &ApiGatewayProxyRequest,
) -> Result<(&'static str, ApiGatewayProxyResponse), AppError> {
    let command = parse_command(request)?;
    let operation = command.name();

    let user = if command.is_public() {
        None
    } else {
        let user_id = UserId::from_string(request.authenticated_user()?)?;
        info!("ユーザー認証成功: user_id={}", user_id);
        Some(user_id)
    };

    let response = execute_command(app, command, user).await?;
    Ok((operation, response))
}

/// `/commands/...` のパスとメソッドからコマンドを組み立てる
fn parse_command(request: &ApiGatewayProxyRequest) -> Result<Command, AppError> {
    let method = request.http_method.as_str();
    let segments = request.path_segments();
    let route = match segments.split_first() {
        Some((&"commands", rest)) => rest,
        _ => &[][..],
    };

    let command = match (method, route) {
        ("POST", ["auth", "login"]) => {
            let body: LoginRequest = request.json_body()?;
            Command::BeginLogin {
                username: body.username,
                password: body.password,
            }
        }
        ("POST", ["auth", "verify"]) => {
            let body: VerifyRequest = request.json_body()?;
            Command::VerifyLogin {
                ticket: body.ticket,
                code: body.code,
            }
        }
        ("POST", ["tasks"]) => Command::CreateTask(request.json_body()?),
        ("DELETE", ["tasks", "done"]) => Command::DeleteDoneTasks,
        ("PUT", ["tasks", id]) => Command::UpdateTask {
            task_id: task_id(id)?,
            updates: parse_updates(&request.json_body()?)?,
        },
        ("DELETE", ["tasks", id]) => Command::DeleteTask {
            task_id: task_id(id)?,
        },
        ("PUT", ["tasks", id, "status"]) => {
            let body: StatusRequest = request.json_body()?;
            Command::SetMemberStatus {
                task_id: task_id(id)?,
                target: body.user_id.map(UserId::from_string).transpose()?,
                status: body.status,
            }
        }
        ("POST", ["tasks", id, "leave"]) => Command::LeaveTask {
            task_id: task_id(id)?,
        },
        ("POST", ["tasks", id, "recurrence", "rearm"]) => Command::RearmRecurrence {
            task_id: task_id(id)?,
        },
        ("POST", ["tasks", id, "invitations"]) => {
            let body: InviteRequest = request.json_body()?;
            Command::InviteUser {
                task_id: task_id(id)?,
                username: body.username,
            }
        }
        ("POST", ["tasks", id, "subtasks"]) => {
            let body: TitleRequest = request.json_body()?;
            Command::AddSubtask {
                task_id: task_id(id)?,
                title: body.title,
            }
        }
        ("POST", ["tasks", id, "threads"]) => {
            let body: ThreadRequest = request.json_body()?;
            Command::CreateThread {
                task_id: task_id(id)?,
                name: body.name,
            }
        }
        ("POST", ["tasks", id, "comments"]) => Command::PostComment {
            task_id: task_id(id)?,
            comment: request.json_body()?,
        },
        ("POST", ["invitations", id, "respond"]) => {
            let body: RespondRequest = request.json_body()?;
            Command::RespondInvitation {
                invitation_id: InvitationId::from_string(id.to_string())?,
                response: body.response,
            }
        }
        ("POST", ["join", token]) => Command::JoinByShareToken {
            token: ShareToken::from_string(token.to_string())?,
        },
        ("POST", ["subtasks", id, "toggle"]) => Command::ToggleSubtask {
            subtask_id: SubtaskId::from_string(id.to_string())?,
        },
        ("DELETE", ["subtasks", id]) => Command::DeleteSubtask {
            subtask_id: SubtaskId::from_string(id.to_string())?,
        },
        ("DELETE", ["account"]) => Command::PurgeAccount,
        _ => {
            return Err(AppError::InvalidRequest(format!(
                "サポートされていないメソッドまたはパス: {} {}",
                method, request.path
            )))
        }
    };
    Ok(command)
}

fn task_id(segment: &str) -> Result<TaskId, AppError> {
    Ok(TaskId::from_string(segment.to_string())?)
}

/// キーがあれば値を取り出す（null は `Some(None)`）
fn nullable<T: DeserializeOwned>(
    body: &Map<String, Value>,
    key: &str,
) -> Result<Option<Option<T>>, AppError> {
    match body.get(key) {
        None => Ok(None),
        Some(Value::Null) => Ok(Some(None)),
        Some(value) => serde_json::from_value(value.clone())
            .map(|v| Some(Some(v)))
            .map_err(|e| AppError::InvalidRequest(format!("{key} の形式が正しくありません: {e}"))),
    }
}

/// null を許さない項目
fn required<T: DeserializeOwned>(body: &Map<String, Value>, key: &str) -> Result<Option<T>, AppError> {
    match nullable(body, key)? {
        None => Ok(None),
        Some(Some(value)) => Ok(Some(value)),
        Some(None) => Err(AppError::InvalidRequest(format!("{key} に null は指定できません"))),
    }
}

/// タスク編集のボディを解釈する（省略した項目は変更しない）
fn parse_updates(body: &Map<String, Value>) -> Result<TaskUpdates, AppError> {
    let mut updates = TaskUpdates::new();
    if let Some(title) = required::<String>(body, "title")? {
        updates = updates.with_title(title);
    }
    if let Some(description) = nullable(body, "description")? {
        updates = updates.with_description(description);
    }
    if let Some(due_at) = nullable(body, "due_at")? {
        updates = updates.with_due_at(due_at);
    }
    if let Some(recurrence) = required::<RecurrenceMode>(body, "recurrence")? {
        updates = updates.with_recurrence(recurrence);
    }
    if let Some(progress_mode) = required::<ProgressMode>(body, "progress_mode")? {
        updates = updates.with_progress_mode(progress_mode);
    }
    if let Some(category) = nullable(body, "category")? {
        updates = updates.with_category(category);
    }
    Ok(updates)
}

fn json_response<T: Serialize>(status_code: u16, body: &T) -> Result<ApiGatewayProxyResponse, AppError> {
    let value = serde_json::to_value(body).map_err(|e| AppError::Serialization(e.to_string()))?;
    Ok(success_response(status_code, value))
}

/// コマンドを実行
async fn execute_command(
    app: &App,
    command: Command,
    user: Option<UserId>,
) -> Result<ApiGatewayProxyResponse, AppError> {
    if let Command::BeginLogin { username, password } = &command {
        let ticket = app.challenges.begin_login(username, password).await?;
        return json_response(200, &ticket);
    }
    if let Command::VerifyLogin { ticket, code } = &command {
        return match app.challenges.verify_ticket(ticket, code).await? {
            Some(user_id) => json_response(200, &json!({ "verified": true, "user_id": user_id })),
            None => Err(AppError::Authentication(
                "認証コードが正しくないか有効期限切れです".to_string(),
            )),
        };
    }

    let user = user.ok_or_else(|| AppError::Authentication("ユーザーIDが見つかりません".to_string()))?;
    let board = &app.board;

    match command {
        Command::BeginLogin { .. } | Command::VerifyLogin { .. } => {
            Err(AppError::Internal("認証コマンドは先に処理済みです".to_string()))
        }
        Command::CreateTask(params) => {
            let task = board.create_task(&user, params).await?;
            json_response(201, &task)
        }
        Command::UpdateTask { task_id, updates } => {
            let task = board.update_task(&task_id, &user, updates).await?;
            json_response(200, &task)
        }
        Command::DeleteTask { task_id } => {
            board.delete_task(&task_id, &user).await?;
            json_response(200, &json!({ "deleted": task_id }))
        }
        Command::DeleteDoneTasks => {
            let deleted = board.delete_done_tasks(&user).await?;
            json_response(200, &json!({ "deleted_count": deleted }))
        }
        Command::SetMemberStatus {
            task_id,
            target,
            status,
        } => {
            let target = target.unwrap_or_else(|| user.clone());
            let outcome = board
                .set_member_status(&task_id, &user, &target, status)
                .await?;
            json_response(200, &outcome)
        }
        Command::LeaveTask { task_id } => {
            board.leave_task(&task_id, &user).await?;
            json_response(200, &json!({ "left": task_id }))
        }
        Command::RearmRecurrence { task_id } => {
            let task = board.rearm_recurrence(&task_id, &user).await?;
            json_response(200, &task)
        }
        Command::InviteUser { task_id, username } => {
            let invitation = board.invite_user(&task_id, &user, &username).await?;
            json_response(201, &invitation)
        }
        Command::RespondInvitation {
            invitation_id,
            response,
        } => {
            let membership = board
                .respond_invitation(&invitation_id, &user, response)
                .await?;
            json_response(200, &json!({ "membership": membership }))
        }
        Command::JoinByShareToken { token } => {
            let membership = board.join_by_share_token(&token, &user).await?;
            json_response(200, &membership)
        }
        Command::AddSubtask { task_id, title } => {
            let outcome = board.add_subtask(&task_id, &user, &title).await?;
            json_response(201, &outcome)
        }
        Command::ToggleSubtask { subtask_id } => {
            let outcome = board.toggle_subtask(&subtask_id, &user).await?;
            json_response(200, &outcome)
        }
        Command::DeleteSubtask { subtask_id } => {
            let progress = board.delete_subtask(&subtask_id, &user).await?;
            json_response(200, &json!({ "progress_percent": progress }))
        }
        Command::CreateThread { task_id, name } => {
            let thread = board.create_thread(&task_id, &user, &name).await?;
            json_response(201, &thread)
        }
        Command::PostComment { task_id, comment } => {
            let comment = board.post_comment(&task_id, &user, comment).await?;
            json_response(201, &comment)
        }
        Command::PurgeAccount => {
            let summary = board.purge_user(&user).await?;
            json_response(200, &summary)
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    if let Err(e) = init_tracing() {
        eprintln!("トレーシング初期化エラー: {e}");
    }

    let config = Config::from_env().map_err(|e| {
        error!("設定読み込みエラー: {}", e);
        Error::from(format!("設定エラー: {e}"))
    })?;
    let app = Arc::new(App::from_config(&config).await.map_err(|e| {
        error!("初期化エラー: {}", e);
        Error::from(format!("初期化エラー: {e}"))
    })?);

    run(service_fn(move |event| {
        let app = app.clone();
        async move { function_handler(&app, event).await }
    }))
    .await
}
