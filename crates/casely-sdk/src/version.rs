//! SDK 版本与运行时元信息
//!
//! - **SDK Version** → Cargo.toml
//! - **Snapshot DB Version** → migrations 文件（文件即版本，由 refinery 管理）
//! - **Runtime Metadata** → 本模块

/// SDK semver，来自 Cargo.toml
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// git commit（由 vergen 在 build.rs 中生成；非 git 构建时为 "unknown"）
pub const GIT_SHA: &str = match option_env!("VERGEN_GIT_SHA") {
    Some(sha) => sha,
    None => "unknown",
};

/// build time（由 vergen 在 build.rs 中生成）
pub const BUILD_TIME: &str = match option_env!("VERGEN_BUILD_TIMESTAMP") {
    Some(ts) => ts,
    None => "unknown",
};

/// 快照库支持的最高 migration 版本，由 build.rs 扫描 migrations/ 生成。
/// 打开快照库时若 DB 版本高于此值则拒绝使用。
pub const SDK_DB_VERSION: i64 = parse_db_version(env!("SDK_DB_VERSION"));

/// 编译期解析版本号字符串
const fn parse_db_version(s: &str) -> i64 {
    let b = s.as_bytes();
    let mut v = 0i64;
    let mut i = 0usize;
    while i < b.len() {
        if b[i] >= b'0' && b[i] <= b'9' {
            v = v * 10 + (b[i] - b'0') as i64;
        }
        i += 1;
    }
    v
}

/// 单行版本描述，用于启动日志
pub fn version_line() -> String {
    format!(
        "casely-sdk {} (git {}, built {}, db v{})",
        SDK_VERSION, GIT_SHA, BUILD_TIME, SDK_DB_VERSION
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_db_version() {
        assert_eq!(parse_db_version("0"), 0);
        assert_eq!(parse_db_version("12"), 12);
        assert_eq!(parse_db_version(""), 0);
    }

    #[test]
    fn test_db_version_matches_migrations() {
        assert!(SDK_DB_VERSION >= 1);
        assert!(version_line().contains(SDK_VERSION));
    }
}
