//! DynamoDB Single Table Design によるボードストア

use crate::dynamodb::{DynamoDbClient, GSI1_NAME, GSI2_NAME};
use crate::models::{
    challenge_item, comment_item, event_item, invitation_item, membership_item,
    pending_invite_item, sk, subtask_item, task_item, thread_item, DynamoDbItem, DynamoDbKeys,
};
use crate::store::{BoardStore, WriteBatch, WriteOp, MAX_BATCH_ITEMS};
use async_trait::async_trait;
use aws_sdk_dynamodb::operation::transact_write_items::TransactWriteItemsError;
use aws_sdk_dynamodb::types::{
    AttributeValue, CancellationReason, ConditionCheck, Delete, Put, TransactWriteItem,
};
use domain::{
    BoardEvent, ChatThread, Comment, Invitation, InvitationId, Membership, ShareToken, Subtask,
    SubtaskId, Task, TaskId, ThreadId, TwoFactorChallenge, UserId,
};
use serde::de::DeserializeOwned;
use shared::{trace_store_operation, AppError};
use std::collections::HashMap;
use tracing::{debug, info, warn};

type AttributeMap = HashMap<String, AttributeValue>;

/// クエリ条件
struct KeyQuery<'a> {
    index: Option<&'a str>,
    partition_attr: &'a str,
    partition: String,
    sort_prefix: Option<(&'a str, String)>,
    forward: bool,
}

impl<'a> KeyQuery<'a> {
    fn table(partition: String, prefix: &str) -> Self {
        Self {
            index: None,
            partition_attr: "PK",
            partition,
            sort_prefix: Some(("SK", prefix.to_string())),
            forward: true,
        }
    }

    fn partition(partition: String) -> Self {
        Self {
            index: None,
            partition_attr: "PK",
            partition,
            sort_prefix: None,
            forward: true,
        }
    }

    fn gsi1(partition: String, prefix: &str) -> Self {
        Self {
            index: Some(GSI1_NAME),
            partition_attr: "GSI1PK",
            partition,
            sort_prefix: Some(("GSI1SK", prefix.to_string())),
            forward: true,
        }
    }

    fn gsi2(partition: String) -> Self {
        Self {
            index: Some(GSI2_NAME),
            partition_attr: "GSI2PK",
            partition,
            sort_prefix: None,
            forward: true,
        }
    }

    fn newest_first(mut self) -> Self {
        self.forward = false;
        self
    }
}

/// DynamoDB 実装のボードストア
#[derive(Clone)]
pub struct DynamoDbBoardStore {
    db: DynamoDbClient,
}

impl DynamoDbBoardStore {
    pub fn new(db: DynamoDbClient) -> Self {
        Self { db }
    }

    async fn get_item(&self, keys: &DynamoDbKeys) -> Result<Option<DynamoDbItem>, AppError> {
        let response = self
            .db
            .client()
            .get_item()
            .table_name(self.db.table_name())
            .key("PK", AttributeValue::S(keys.pk.clone()))
            .key("SK", AttributeValue::S(keys.sk.clone()))
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| self.db.convert_error(e))?;

        response
            .item
            .as_ref()
            .map(DynamoDbItem::from_attribute_map)
            .transpose()
    }

    /// ページングしながら全件取得
    async fn query(&self, query: KeyQuery<'_>) -> Result<Vec<DynamoDbItem>, AppError> {
        let key_condition = match &query.sort_prefix {
            Some((attr, _)) => format!("{} = :pk AND begins_with({attr}, :prefix)", query.partition_attr),
            None => format!("{} = :pk", query.partition_attr),
        };

        let mut items = Vec::new();
        let mut start_key: Option<AttributeMap> = None;
        loop {
            let mut request = self
                .db
                .client()
                .query()
                .table_name(self.db.table_name())
                .key_condition_expression(&key_condition)
                .expression_attribute_values(":pk", AttributeValue::S(query.partition.clone()))
                .scan_index_forward(query.forward)
                .set_exclusive_start_key(start_key.take());
            if let Some((_, prefix)) = &query.sort_prefix {
                request =
                    request.expression_attribute_values(":prefix", AttributeValue::S(prefix.clone()));
            }
            match query.index {
                Some(index) => request = request.index_name(index),
                None => request = request.consistent_read(true),
            }

            let response = request.send().await.map_err(|e| self.db.convert_error(e))?;
            for item in response.items() {
                items.push(DynamoDbItem::from_attribute_map(item)?);
            }

            match response.last_evaluated_key {
                Some(key) if !key.is_empty() => start_key = Some(key),
                _ => break,
            }
        }

        debug!("クエリ完了: partition={}, 件数={}", query.partition, items.len());
        Ok(items)
    }

    async fn query_entities<T: DeserializeOwned>(
        &self,
        query: KeyQuery<'_>,
    ) -> Result<Vec<T>, AppError> {
        self.query(query)
            .await?
            .iter()
            .map(DynamoDbItem::decode)
            .collect()
    }

    async fn find_one<T: DeserializeOwned>(&self, index_key: String) -> Result<Option<T>, AppError> {
        self.query(KeyQuery::gsi2(index_key))
            .await?
            .first()
            .map(DynamoDbItem::decode)
            .transpose()
    }

    fn put(&self, item: DynamoDbItem) -> PutRequest {
        PutRequest {
            table: self.db.table_name().to_string(),
            item: item.to_attribute_map(),
            condition: None,
            values: Vec::new(),
        }
    }

    fn key_of(keys: &DynamoDbKeys) -> AttributeMap {
        HashMap::from([
            ("PK".to_string(), AttributeValue::S(keys.pk.clone())),
            ("SK".to_string(), AttributeValue::S(keys.sk.clone())),
        ])
    }

    fn delete(&self, keys: &DynamoDbKeys, condition: Option<&str>) -> Result<TransactWriteItem, AppError> {
        let delete = Delete::builder()
            .table_name(self.db.table_name())
            .set_key(Some(Self::key_of(keys)))
            .set_condition_expression(condition.map(str::to_string))
            .build()
            .map_err(build_error)?;
        Ok(TransactWriteItem::builder().delete(delete).build())
    }

    /// 完了フラグを条件式で参照できるよう最上位属性にも持つ
    fn put_subtask(&self, subtask: &Subtask) -> Result<PutRequest, AppError> {
        let mut request = self.put(subtask_item(subtask)?);
        request
            .item
            .insert("Done".to_string(), AttributeValue::Bool(subtask.done));
        Ok(request)
    }

    fn version_value(version: u64) -> AttributeValue {
        AttributeValue::N(version.to_string())
    }

    /// 書き込み操作をトランザクション項目に変換
    ///
    /// 1つの操作が複数の項目になることがあるため、元の操作の位置も返す。
    fn transact_items(
        &self,
        ops: &[WriteOp],
    ) -> Result<(Vec<TransactWriteItem>, Vec<usize>), AppError> {
        let mut items = Vec::new();
        let mut owners = Vec::new();
        let mut push = |index: usize, item: TransactWriteItem| {
            items.push(item);
            owners.push(index);
        };

        for (index, op) in ops.iter().enumerate() {
            match op {
                WriteOp::CreateTask(task) => {
                    push(index, self.put(task_item(task)?).if_absent().build()?);
                }
                WriteOp::UpdateTask {
                    task,
                    expected_version,
                } => {
                    push(
                        index,
                        self.put(task_item(task)?)
                            .with_condition("Version = :expected")
                            .with_value(":expected", Self::version_value(*expected_version))
                            .build()?,
                    );
                }
                WriteOp::DeleteTask {
                    task_id,
                    expected_version,
                } => {
                    // 配下のアイテムはコミット後に削除する
                    let keys = task_meta_keys(task_id);
                    let delete = Delete::builder()
                        .table_name(self.db.table_name())
                        .set_key(Some(Self::key_of(&keys)))
                        .condition_expression("Version = :expected")
                        .expression_attribute_values(
                            ":expected",
                            Self::version_value(*expected_version),
                        )
                        .build()
                        .map_err(build_error)?;
                    push(index, TransactWriteItem::builder().delete(delete).build());
                }
                WriteOp::CheckTaskVersion {
                    task_id,
                    expected_version,
                } => {
                    let keys = task_meta_keys(task_id);
                    let check = ConditionCheck::builder()
                        .table_name(self.db.table_name())
                        .set_key(Some(Self::key_of(&keys)))
                        .condition_expression("Version = :expected")
                        .expression_attribute_values(
                            ":expected",
                            Self::version_value(*expected_version),
                        )
                        .build()
                        .map_err(build_error)?;
                    push(
                        index,
                        TransactWriteItem::builder().condition_check(check).build(),
                    );
                }
                WriteOp::AddMembership(membership) => {
                    push(
                        index,
                        self.put(membership_item(membership)?).if_absent().build()?,
                    );
                }
                WriteOp::UpdateMembership(membership) => {
                    push(
                        index,
                        self.put(membership_item(membership)?)
                            .with_condition("attribute_exists(PK)")
                            .build()?,
                    );
                }
                WriteOp::RemoveMembership { task_id, user_id } => {
                    push(
                        index,
                        self.delete(&DynamoDbKeys::for_membership(task_id, user_id), None)?,
                    );
                }
                WriteOp::CreateInvitation(invitation) => {
                    push(
                        index,
                        self.put(pending_invite_item(invitation)?).if_absent().build()?,
                    );
                    push(index, self.put(invitation_item(invitation)?).build()?);
                }
                WriteOp::CloseInvitation(invitation) => {
                    push(
                        index,
                        self.delete(
                            &DynamoDbKeys::for_pending_invite(
                                &invitation.task_id,
                                &invitation.recipient,
                            ),
                            Some("attribute_exists(PK)"),
                        )?,
                    );
                    push(index, self.put(invitation_item(invitation)?).build()?);
                }
                WriteOp::PutSubtask(subtask) => {
                    push(index, self.put_subtask(subtask)?.if_absent().build()?);
                }
                WriteOp::UpdateSubtask {
                    subtask,
                    expected_done,
                } => {
                    push(
                        index,
                        self.put_subtask(subtask)?
                            .with_condition("attribute_exists(PK) AND Done = :expected_done")
                            .with_value(":expected_done", AttributeValue::Bool(*expected_done))
                            .build()?,
                    );
                }
                WriteOp::DeleteSubtask {
                    task_id,
                    subtask_id,
                } => {
                    push(
                        index,
                        self.delete(
                            &DynamoDbKeys::for_subtask(task_id, subtask_id),
                            Some("attribute_exists(PK)"),
                        )?,
                    );
                }
                WriteOp::PutThread(thread) => {
                    push(index, self.put(thread_item(thread)?).build()?);
                }
                WriteOp::PutComment(comment) => {
                    push(index, self.put(comment_item(comment)?).build()?);
                }
                WriteOp::AppendEvent(event) => {
                    push(index, self.put(event_item(event)?).if_absent().build()?);
                }
                WriteOp::PutChallenge {
                    challenge,
                    expected_code,
                } => {
                    let mut request = self.put(challenge_item(challenge)?);
                    // 単一利用の判定に使うためコードを最上位属性にも持つ
                    request
                        .item
                        .insert("Code".to_string(), AttributeValue::S(challenge.code.clone()));
                    if let Some(code) = expected_code {
                        request = request
                            .with_condition("Code = :expected_code")
                            .with_value(":expected_code", AttributeValue::S(code.clone()));
                    }
                    push(index, request.build()?);
                }
                WriteOp::DeleteChallenge(user_id) => {
                    push(
                        index,
                        self.delete(&DynamoDbKeys::for_challenge(user_id), None)?,
                    );
                }
            }
        }

        Ok((items, owners))
    }

    /// タスク配下のアイテムをすべて削除
    async fn purge_task_items(&self, task_id: &TaskId) -> Result<(), AppError> {
        let items = self
            .query(KeyQuery::partition(DynamoDbKeys::task_pk(task_id)))
            .await?;
        info!("タスク配下のアイテムを削除中: task_id={}, 件数={}", task_id, items.len());

        for item in items {
            self.db
                .client()
                .delete_item()
                .table_name(self.db.table_name())
                .set_key(Some(Self::key_of(&item.keys)))
                .send()
                .await
                .map_err(|e| self.db.convert_error(e))?;
        }
        Ok(())
    }

    /// 取消理由から失敗した操作のエラーを組み立てる
    ///
    /// 取消理由はトランザクション項目と同じ順に並ぶ。
    fn cancellation_error(
        ops: &[WriteOp],
        owners: &[usize],
        reasons: &[CancellationReason],
    ) -> AppError {
        let failed = reasons
            .iter()
            .position(|reason| reason.code() == Some("ConditionalCheckFailed"))
            .and_then(|position| owners.get(position))
            .and_then(|index| ops.get(*index));

        match failed {
            Some(op) => {
                debug!("条件チェック失敗: op={}", op.name());
                op.condition_error()
            }
            None => {
                let codes: Vec<&str> = reasons
                    .iter()
                    .map(|reason| reason.code().unwrap_or("None"))
                    .collect();
                warn!("トランザクションが取り消されました: reasons={:?}", codes);
                AppError::ConcurrentModification
            }
        }
    }
}

/// 条件付き Put の組み立て
struct PutRequest {
    table: String,
    item: AttributeMap,
    condition: Option<String>,
    values: Vec<(String, AttributeValue)>,
}

impl PutRequest {
    fn if_absent(self) -> Self {
        self.with_condition("attribute_not_exists(PK)")
    }

    fn with_condition(mut self, condition: &str) -> Self {
        self.condition = Some(condition.to_string());
        self
    }

    fn with_value(mut self, name: &str, value: AttributeValue) -> Self {
        self.values.push((name.to_string(), value));
        self
    }

    fn build(self) -> Result<TransactWriteItem, AppError> {
        let mut builder = Put::builder()
            .table_name(self.table)
            .set_item(Some(self.item))
            .set_condition_expression(self.condition);
        for (name, value) in self.values {
            builder = builder.expression_attribute_values(name, value);
        }
        let put = builder.build().map_err(build_error)?;
        Ok(TransactWriteItem::builder().put(put).build())
    }
}

fn task_meta_keys(task_id: &TaskId) -> DynamoDbKeys {
    DynamoDbKeys {
        pk: DynamoDbKeys::task_pk(task_id),
        sk: sk::TASK_META.to_string(),
        gsi1_pk: None,
        gsi1_sk: None,
        gsi2_pk: None,
    }
}

fn build_error(err: aws_sdk_dynamodb::error::BuildError) -> AppError {
    AppError::Internal(format!("Failed to build DynamoDB request: {err}"))
}

#[async_trait]
impl BoardStore for DynamoDbBoardStore {
    async fn get_task(&self, task_id: &TaskId) -> Result<Option<Task>, AppError> {
        let keys = task_meta_keys(task_id);
        trace_store_operation(self.db.table_name(), "get_task", async {
            self.get_item(&keys)
                .await?
                .map(|item| item.decode())
                .transpose()
        })
        .await
    }

    async fn find_task_by_share_token(
        &self,
        token: &ShareToken,
    ) -> Result<Option<Task>, AppError> {
        trace_store_operation(
            self.db.table_name(),
            "find_task_by_share_token",
            self.find_one(DynamoDbKeys::share_token_index(token)),
        )
        .await
    }

    async fn list_tasks_for_user(&self, user_id: &UserId) -> Result<Vec<Task>, AppError> {
        trace_store_operation(self.db.table_name(), "list_tasks_for_user", async {
            let memberships: Vec<Membership> = self
                .query_entities(KeyQuery::gsi1(DynamoDbKeys::user_pk(user_id), "TASK#"))
                .await?;

            let mut tasks = Vec::with_capacity(memberships.len());
            for membership in memberships {
                // インデックスの反映遅れで削除済みのタスクが残ることがある
                if let Some(task) = self.get_task(&membership.task_id).await? {
                    tasks.push(task);
                }
            }
            Ok(tasks)
        })
        .await
    }

    async fn list_memberships(&self, task_id: &TaskId) -> Result<Vec<Membership>, AppError> {
        let mut memberships: Vec<Membership> = self
            .query_entities(KeyQuery::table(DynamoDbKeys::task_pk(task_id), sk::MEMBER))
            .await?;
        memberships.sort_by(|a, b| a.joined_at.cmp(&b.joined_at));
        Ok(memberships)
    }

    async fn get_invitation(
        &self,
        invitation_id: &InvitationId,
    ) -> Result<Option<Invitation>, AppError> {
        self.find_one(DynamoDbKeys::invitation_index(invitation_id))
            .await
    }

    async fn list_task_invitations(&self, task_id: &TaskId) -> Result<Vec<Invitation>, AppError> {
        self.query_entities(KeyQuery::table(
            DynamoDbKeys::task_pk(task_id),
            sk::INVITATION,
        ))
        .await
    }

    async fn list_invitations_for_recipient(
        &self,
        recipient: &UserId,
    ) -> Result<Vec<Invitation>, AppError> {
        self.query_entities(
            KeyQuery::gsi1(DynamoDbKeys::invitee_index(recipient), sk::INVITATION).newest_first(),
        )
        .await
    }

    async fn has_pending_invitation(
        &self,
        task_id: &TaskId,
        recipient: &UserId,
    ) -> Result<bool, AppError> {
        Ok(self
            .get_item(&DynamoDbKeys::for_pending_invite(task_id, recipient))
            .await?
            .is_some())
    }

    async fn get_subtask(&self, subtask_id: &SubtaskId) -> Result<Option<Subtask>, AppError> {
        self.find_one(DynamoDbKeys::subtask_index(subtask_id)).await
    }

    async fn list_subtasks(&self, task_id: &TaskId) -> Result<Vec<Subtask>, AppError> {
        self.query_entities(KeyQuery::table(DynamoDbKeys::task_pk(task_id), sk::SUBTASK))
            .await
    }

    async fn list_threads(&self, task_id: &TaskId) -> Result<Vec<ChatThread>, AppError> {
        self.query_entities(KeyQuery::table(DynamoDbKeys::task_pk(task_id), sk::THREAD))
            .await
    }

    async fn list_comments(
        &self,
        task_id: &TaskId,
        thread_id: Option<&ThreadId>,
    ) -> Result<Vec<Comment>, AppError> {
        let comments: Vec<Comment> = self
            .query_entities(KeyQuery::table(DynamoDbKeys::task_pk(task_id), sk::COMMENT))
            .await?;
        Ok(comments
            .into_iter()
            .filter(|c| thread_id.is_none() || c.thread_id.as_ref() == thread_id)
            .collect())
    }

    async fn list_events(&self, task_id: &TaskId) -> Result<Vec<BoardEvent>, AppError> {
        self.query_entities(KeyQuery::table(DynamoDbKeys::task_pk(task_id), sk::EVENT))
            .await
    }

    async fn get_challenge(
        &self,
        user_id: &UserId,
    ) -> Result<Option<TwoFactorChallenge>, AppError> {
        self.get_item(&DynamoDbKeys::for_challenge(user_id))
            .await?
            .map(|item| item.decode())
            .transpose()
    }

    async fn find_challenge_by_ticket(
        &self,
        ticket: &str,
    ) -> Result<Option<TwoFactorChallenge>, AppError> {
        self.find_one(DynamoDbKeys::ticket_index(ticket)).await
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), AppError> {
        if batch.is_empty() {
            return Ok(());
        }
        let (items, owners) = self.transact_items(batch.ops())?;
        if items.len() > MAX_BATCH_ITEMS {
            return Err(AppError::InvalidRequest(format!(
                "Too many writes in one transaction: {}",
                items.len()
            )));
        }

        let deleted_tasks: Vec<TaskId> = batch
            .ops()
            .iter()
            .filter_map(|op| match op {
                WriteOp::DeleteTask { task_id, .. } => Some(task_id.clone()),
                _ => None,
            })
            .collect();

        trace_store_operation(self.db.table_name(), "commit", async {
            let result = self
                .db
                .client()
                .transact_write_items()
                .set_transact_items(Some(items))
                .send()
                .await;

            if let Err(err) = result {
                if let Some(TransactWriteItemsError::TransactionCanceledException(cancelled)) =
                    err.as_service_error()
                {
                    return Err(Self::cancellation_error(
                        batch.ops(),
                        &owners,
                        cancelled.cancellation_reasons(),
                    ));
                }
                return Err(self.db.convert_error(err));
            }
            Ok(())
        })
        .await?;

        for task_id in &deleted_tasks {
            self.purge_task_items(task_id).await?;
        }
        debug!("コミット完了: 操作数={}", batch.len());
        Ok(())
    }
}
