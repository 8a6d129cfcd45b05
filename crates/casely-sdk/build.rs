//! 编译期元信息：vergen 生成 GIT_SHA / BUILD_TIMESTAMP，
//! 并扫描 migrations/ 下 V{version}__*.sql 得到快照库的 SDK_DB_VERSION。

use std::env;
use std::fs;
use std::path::Path;
use vergen::EmitBuilder;

/// 解析 refinery 文件名 `V{version}__{name}.sql` 中的版本号
fn migration_version(file_name: &str) -> Option<i64> {
    let rest = file_name.strip_prefix('V')?.strip_suffix(".sql")?;
    rest.split("__").next()?.parse::<i64>().ok()
}

fn main() {
    // 非 git 工作区时 vergen 只会给出警告，version.rs 对缺失值有兜底
    let _ = EmitBuilder::builder()
        .build_timestamp()
        .git_sha(true)
        .emit();

    let manifest_dir = env::var("CARGO_MANIFEST_DIR").unwrap_or_else(|_| ".".to_string());
    let migrations_dir = Path::new(&manifest_dir).join("migrations");

    let max_version = fs::read_dir(&migrations_dir)
        .map(|entries| {
            entries
                .flatten()
                .filter_map(|entry| entry.file_name().to_str().and_then(migration_version))
                .max()
                .unwrap_or(0)
        })
        .unwrap_or(0);

    println!("cargo:rustc-env=SDK_DB_VERSION={}", max_version);
    println!("cargo:rerun-if-changed=migrations/");
}
