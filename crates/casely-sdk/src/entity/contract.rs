//! 审阅合同实体
//!
//! 服务端合同行的业务数据在 `detail`（审阅系统原始详情）与 `extra`（本地扩展，
//! 目前只有 labels）中；这里按宽松规则映射，缺失字段取默认值。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{EntityId, RawRow, SyncEntity, Timestamp};
use crate::error::{CaselySDKError, Result};
use crate::sync::EntityKind;
use crate::utils::time::{normalize_date, parse_review_time};

/// 审阅历史中「검토완료」动作，标记某个审阅人已完成审阅
const REVIEW_DONE_ACTION: &str = "검토완료";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContractStatus {
    Open,
    Closed,
}

/// 源数据刷新策略：Block 时服务端轮询不再覆盖该合同
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum RefreshPolicy {
    #[default]
    Allow,
    Block,
}

impl RefreshPolicy {
    pub fn as_i64(self) -> i64 {
        match self {
            Self::Allow => 0,
            Self::Block => 100,
        }
    }
}

impl TryFrom<i64> for RefreshPolicy {
    type Error = String;

    fn try_from(value: i64) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Allow),
            100 => Ok(Self::Block),
            other => Err(format!("未知 refresh_policy: {}", other)),
        }
    }
}

impl From<RefreshPolicy> for i64 {
    fn from(policy: RefreshPolicy) -> Self {
        policy.as_i64()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Person {
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub department: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Reviewer {
    #[serde(flatten)]
    pub person: Person,
    /// ISO 8601（不带时区），未完成审阅时为 None
    pub approved_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    pub id: EntityId,
    pub status: ContractStatus,
    pub title: String,
    pub description: String,
    pub fetched_at: Timestamp,
    pub updated_at: Timestamp,
    pub deleted_at: Option<Timestamp>,
    pub refresh_policy: RefreshPolicy,
    pub creators: Vec<Person>,
    pub reviewers: Vec<Reviewer>,
    pub viewcode: String,
    /// YYYY-MM-DD
    pub requested_date: Option<String>,
    /// YYYY-MM-DD
    pub effective_date: Option<String>,
    pub labels: Vec<EntityId>,
    /// 服务端原始行
    pub source: Value,
}

impl Contract {
    pub fn has_label(&self, label_id: EntityId) -> bool {
        self.labels.contains(&label_id)
    }
}

fn str_field(obj: &Value, key: &str) -> Option<String> {
    obj.get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

fn person_from(value: &Value, name_key: &str, email_key: &str, dept_key: &str) -> Person {
    Person {
        name: str_field(value, name_key).unwrap_or_default(),
        email: str_field(value, email_key),
        department: str_field(value, dept_key),
    }
}

fn reviewers_from(detail: &Value) -> Vec<Reviewer> {
    let history = detail
        .get("contractHistory")
        .and_then(|v| v.as_array())
        .map(|v| v.as_slice())
        .unwrap_or(&[]);

    detail
        .get("reviewers")
        .and_then(|v| v.as_array())
        .map(|rows| {
            rows.iter()
                .map(|row| {
                    let person = person_from(row, "name", "email", "department");
                    let approved_at = history
                        .iter()
                        .find(|h| {
                            h.get("actionText").and_then(|v| v.as_str()) == Some(REVIEW_DONE_ACTION)
                                && h.get("creator").and_then(|v| v.as_str()) == Some(person.name.as_str())
                        })
                        .and_then(|h| h.get("createTime").and_then(|v| v.as_str()))
                        .and_then(parse_review_time);
                    Reviewer {
                        person,
                        approved_at,
                    }
                })
                .collect()
        })
        .unwrap_or_default()
}

impl SyncEntity for Contract {
    const KIND: EntityKind = EntityKind::Contract;

    fn id(&self) -> EntityId {
        self.id
    }

    fn updated_at(&self) -> Timestamp {
        self.updated_at
    }

    fn deleted_at(&self) -> Option<Timestamp> {
        self.deleted_at
    }

    fn from_row(row: &RawRow) -> Result<Self> {
        let detail = row
            .field("detail")
            .filter(|v| v.is_object())
            .ok_or_else(|| {
                CaselySDKError::InvalidData(format!("合同 {} 缺少 detail 对象", row.id))
            })?;

        let status = if str_field(detail, "replyDate").is_some() {
            ContractStatus::Closed
        } else {
            ContractStatus::Open
        };

        let creators = detail
            .get("creatorList")
            .and_then(|v| v.as_array())
            .map(|rows| {
                rows.iter()
                    .map(|c| person_from(c, "creator", "creatorEmail", "creatorDepartment"))
                    .collect()
            })
            .unwrap_or_default();

        let refresh_policy = row
            .field("refresh_policy")
            .and_then(|v| v.as_i64())
            .and_then(|v| RefreshPolicy::try_from(v).ok())
            .unwrap_or_default();

        let labels = row
            .field("extra")
            .and_then(|extra| extra.get("labels"))
            .and_then(|v| v.as_array())
            .map(|ids| ids.iter().filter_map(|v| v.as_u64()).collect())
            .unwrap_or_default();

        Ok(Contract {
            id: row.id,
            status,
            title: str_field(detail, "name").unwrap_or_default(),
            description: str_field(detail, "description").unwrap_or_default(),
            fetched_at: row
                .field("source_fetched_at")
                .and_then(|v| v.as_i64())
                .unwrap_or(0),
            updated_at: row.updated_at,
            deleted_at: row.deleted_at,
            refresh_policy,
            creators,
            reviewers: reviewers_from(detail),
            viewcode: str_field(detail, "viewcode").unwrap_or_else(|| format!("vc-{}", row.id)),
            requested_date: str_field(detail, "reviewRequestDate")
                .or_else(|| str_field(detail, "createDate"))
                .map(|d| normalize_date(&d)),
            effective_date: str_field(detail, "enforcementDate").map(|d| normalize_date(&d)),
            labels,
            source: row.to_value(),
        })
    }
}
