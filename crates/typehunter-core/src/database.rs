//! 默认签名数据库定位与校验
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::DetectError;

/// libmagic 约定的数据库路径环境变量
pub const MAGIC_ENV: &str = "MAGIC";

/// 常见安装位置（按优先级）
pub const INSTALLED_DATABASES: &[&str] = &[
    "/usr/share/file/magic.mgc",
    "/usr/share/misc/magic.mgc",
    "/usr/lib/file/magic.mgc",
    "/usr/local/share/misc/magic.mgc",
    "/opt/homebrew/share/misc/magic.mgc",
];

/// 默认数据库定位器：环境变量优先，其次是常见安装位置
#[derive(Debug, Clone)]
pub struct DatabaseLocator {
    env_value: Option<PathBuf>,
    candidates: Vec<PathBuf>,
}

impl Default for DatabaseLocator {
    fn default() -> Self {
        Self {
            env_value: std::env::var_os(MAGIC_ENV)
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            candidates: INSTALLED_DATABASES.iter().map(PathBuf::from).collect(),
        }
    }
}

impl DatabaseLocator {
    /// 使用自定义候选列表（不读取环境变量）
    pub fn with_candidates<I, P>(candidates: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            env_value: None,
            candidates: candidates.into_iter().map(Into::into).collect(),
        }
    }

    /// 解析默认数据库路径。
    /// - 环境变量给出的路径直接采用（即便不可读，也只告警，真正的失败留到首次检测）；
    /// - 否则取第一个存在的安装位置；
    /// - 都没有时返回 None，交由引擎使用内置默认库。
    pub fn resolve(&self) -> Option<PathBuf> {
        if let Some(p) = &self.env_value {
            warn_if_unreadable(p);
            return Some(p.clone());
        }
        let found = self.candidates.iter().find(|p| p.is_file()).cloned();
        match &found {
            Some(p) => {
                debug!(db = %p.display(), "resolved default signature database");
                warn_if_unreadable(p);
            }
            None => debug!("no installed signature database found; using engine default"),
        }
        found
    }
}

fn warn_if_unreadable(path: &Path) {
    if let Err(e) = validate_database(path) {
        warn!(db = %path.display(), error = %e, "default signature database is unreadable");
    }
}

/// 加载前的文件系统校验：存在、不是目录、可读。
/// 与 libmagic 一致，路径可以是以分隔符（unix 上为 `:`）连接的多个数据库，逐个校验。
pub(crate) fn validate_database(path: &Path) -> Result<(), DetectError> {
    let mut checked = 0usize;
    for part in std::env::split_paths(path.as_os_str()) {
        if part.as_os_str().is_empty() {
            continue;
        }
        validate_one(&part).map_err(|e| match e {
            DetectError::DatabaseLoadError { message, .. } => {
                DetectError::database(Some(path), format!("{}: {message}", part.display()))
            }
            other => other,
        })?;
        checked += 1;
    }
    if checked == 0 {
        return Err(DetectError::database(Some(path), "empty database path"));
    }
    Ok(())
}

fn validate_one(path: &Path) -> Result<(), DetectError> {
    let md = fs::metadata(path)
        .map_err(|e| DetectError::database(Some(path), format!("cannot stat database: {e}")))?;
    if md.is_dir() {
        return Err(DetectError::database(Some(path), "database path is a directory"));
    }
    fs::File::open(path)
        .map_err(|e| DetectError::database(Some(path), format!("database is not readable: {e}")))?;
    Ok(())
}
