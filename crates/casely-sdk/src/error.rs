use thiserror::Error;

#[derive(Debug, Error)]
pub enum CaselySDKError {
    #[error("SQLite error: {0}")]
    SqliteError(#[from] rusqlite::Error),
    #[error("JSON error: {0}")]
    JsonError(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("KV store error: {0}")]
    KvStore(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("IO error: {0}")]
    IO(String),
    #[error("Database error: {0}")]
    Database(String),
    #[error("Migration error: {0}")]
    Migration(String),
    /// 网络层失败（连接、超时、响应体读取）
    #[error("Transport error: {0}")]
    Transport(String),
    /// 服务端返回非 2xx
    #[error("Remote error [{status}]: {message}")]
    Remote { status: u16, message: String },
    #[error("Config error: {0}")]
    Config(String),
    #[error("Invalid data: {0}")]
    InvalidData(String),
    #[error("Not initialized: {0}")]
    NotInitialized(String),
    #[error("Other error: {0}")]
    Other(String),
}

impl From<serde_json::Error> for CaselySDKError {
    fn from(error: serde_json::Error) -> Self {
        CaselySDKError::JsonError(error.to_string())
    }
}

impl From<std::io::Error> for CaselySDKError {
    fn from(error: std::io::Error) -> Self {
        CaselySDKError::IO(error.to_string())
    }
}

impl CaselySDKError {
    /// 远端 HTTP 状态码（仅 Remote 错误）
    pub fn remote_status(&self) -> Option<u16> {
        match self {
            CaselySDKError::Remote { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// 是否为远端/网络错误（拉取失败、乐观更新回滚都由它触发）
    pub fn is_remote_error(&self) -> bool {
        matches!(
            self,
            CaselySDKError::Remote { .. } | CaselySDKError::Transport(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CaselySDKError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_display() {
        let err = CaselySDKError::Remote {
            status: 503,
            message: "busy".to_string(),
        };
        assert_eq!(err.to_string(), "Remote error [503]: busy");
        assert_eq!(err.remote_status(), Some(503));
        assert!(err.is_remote_error());
    }

    #[test]
    fn test_from_conversions() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: CaselySDKError = json_err.into();
        assert!(matches!(err, CaselySDKError::JsonError(_)));

        let io_err = std::io::Error::new(std::io::ErrorKind::Other, "disk");
        let err: CaselySDKError = io_err.into();
        assert!(matches!(err, CaselySDKError::IO(_)));
        assert!(!err.is_remote_error());
    }
}
