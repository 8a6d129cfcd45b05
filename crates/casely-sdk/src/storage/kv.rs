//! KV 存储模块 - 基于 sled 的偏好设置存储
//!
//! 只保存少量需要跨重启保留的设置（例如是否自动应用增量），
//! 值统一用 serde_json 编码。

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sled::{Db, Tree};

use crate::error::{CaselySDKError, Result};

/// 偏好设置所在的 Tree
const PREFERENCES_TREE: &str = "preferences";

/// 偏好设置键
pub mod keys {
    /// 拉取增量后是否自动应用到基础缓存
    pub const AUTO_APPLY_CHANGES: &str = "pref:auto_apply_changes";
}

/// KV 存储组件
#[derive(Debug, Clone)]
pub struct KvStore {
    path: PathBuf,
    db: Db,
    tree: Tree,
}

impl KvStore {
    /// 打开 `base_path/kv` 下的 sled 数据库
    pub async fn new(base_path: &Path) -> Result<Self> {
        let kv_path = base_path.join("kv");

        tokio::fs::create_dir_all(&kv_path)
            .await
            .map_err(|e| CaselySDKError::IO(format!("创建 KV 存储目录失败: {}", e)))?;

        // 上一个实例可能刚释放文件锁，重试几次带退避
        const MAX_OPEN_RETRIES: u32 = 5;
        const RETRY_DELAY_MS: u64 = 200;
        let mut attempt = 0;
        let db = loop {
            match sled::open(&kv_path) {
                Ok(db) => break db,
                Err(e) => {
                    let msg = e.to_string();
                    let is_lock = msg.contains("could not acquire lock")
                        || msg.contains("Resource temporarily unavailable")
                        || msg.contains("WouldBlock");
                    attempt += 1;
                    if !is_lock || attempt >= MAX_OPEN_RETRIES {
                        return Err(CaselySDKError::KvStore(format!(
                            "打开 sled 数据库失败: {}",
                            msg
                        )));
                    }
                    let delay_ms = RETRY_DELAY_MS * (1 << (attempt - 1));
                    tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
                }
            }
        };

        let tree = db
            .open_tree(PREFERENCES_TREE)
            .map_err(|e| CaselySDKError::KvStore(format!("打开偏好设置 Tree 失败: {}", e)))?;

        tracing::debug!("KV 存储已打开: {}", kv_path.display());

        Ok(Self {
            path: kv_path,
            db,
            tree,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 设置键值对
    pub async fn set<K, V>(&self, key: K, value: &V) -> Result<()>
    where
        K: AsRef<[u8]>,
        V: Serialize,
    {
        let value_bytes = serde_json::to_vec(value)
            .map_err(|e| CaselySDKError::Serialization(format!("序列化值失败: {}", e)))?;

        self.tree
            .insert(key, value_bytes)
            .map_err(|e| CaselySDKError::KvStore(format!("设置键值对失败: {}", e)))?;

        Ok(())
    }

    /// 获取键值对
    pub async fn get<K, V>(&self, key: K) -> Result<Option<V>>
    where
        K: AsRef<[u8]>,
        V: for<'de> Deserialize<'de>,
    {
        let result = self
            .tree
            .get(key)
            .map_err(|e| CaselySDKError::KvStore(format!("获取键值对失败: {}", e)))?;

        match result {
            Some(value_bytes) => {
                let value = serde_json::from_slice(&value_bytes)
                    .map_err(|e| CaselySDKError::Serialization(format!("反序列化值失败: {}", e)))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// 删除键值对
    pub async fn delete<K>(&self, key: K) -> Result<bool>
    where
        K: AsRef<[u8]>,
    {
        let removed = self
            .tree
            .remove(key)
            .map_err(|e| CaselySDKError::KvStore(format!("删除键值对失败: {}", e)))?;
        Ok(removed.is_some())
    }

    /// 检查键是否存在
    pub async fn exists<K>(&self, key: K) -> Result<bool>
    where
        K: AsRef<[u8]>,
    {
        self.tree
            .contains_key(key)
            .map_err(|e| CaselySDKError::KvStore(format!("检查键存在失败: {}", e)))
    }

    /// 获取指定前缀的所有键值对
    pub async fn scan_prefix<V>(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, V)>>
    where
        V: for<'de> Deserialize<'de>,
    {
        let mut results = Vec::new();
        for item in self.tree.scan_prefix(prefix) {
            let (key, value_bytes) =
                item.map_err(|e| CaselySDKError::KvStore(format!("扫描前缀失败: {}", e)))?;
            let value = serde_json::from_slice(&value_bytes)
                .map_err(|e| CaselySDKError::Serialization(format!("反序列化值失败: {}", e)))?;
            results.push((key.to_vec(), value));
        }
        Ok(results)
    }

    /// 刷盘
    pub async fn flush(&self) -> Result<()> {
        self.db
            .flush_async()
            .await
            .map_err(|e| CaselySDKError::KvStore(format!("刷新 KV 存储失败: {}", e)))?;
        Ok(())
    }
}
