//! 同步实体类型 - 每类实体独立游标、独立拉取

use std::str::FromStr;

/// 同步实体类型（与服务端 `/api/{path}` 一一对应）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Contract,
    Label,
}

impl EntityKind {
    pub const ALL: [EntityKind; 2] = [EntityKind::Contract, EntityKind::Label];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Contract => "contract",
            Self::Label => "label",
        }
    }

    /// REST 集合路径
    pub fn path(self) -> &'static str {
        match self {
            Self::Contract => "contracts",
            Self::Label => "labels",
        }
    }

    /// 拉取时是否需要服务端返回已删除行。标签接口总是返回 tombstone。
    pub fn requires_allow_deleted(self) -> bool {
        matches!(self, Self::Contract)
    }
}

impl FromStr for EntityKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "contract" | "contracts" => Ok(Self::Contract),
            "label" | "labels" => Ok(Self::Label),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
