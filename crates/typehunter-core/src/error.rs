//! 错误类型（对外暴露）
use std::path::{Path, PathBuf};

/// 检测失败的分类。引擎原始错误码/错误串在出错现场即被归入其中一种，不会原样外泄。
#[derive(Debug, thiserror::Error)]
pub enum DetectError {
    /// 会话已显式关闭；只能新建会话
    #[error("detection session is closed")]
    SessionClosed,

    /// 数据库缺失、不可读或格式错误；修正路径后可重试
    #[error("failed to load signature database {}: {message}", display_db(.path))]
    DatabaseLoadError {
        /// None 表示使用引擎内置的默认数据库
        path: Option<PathBuf>,
        message: String,
    },

    /// 检测目标不存在或不可读
    #[error("target not found: {}", .path.display())]
    TargetNotFound { path: PathBuf },

    /// 其他引擎内部错误（打开失败、数据库条目损坏、读取中途 I/O 错误等）
    #[error("detection engine error: {message}")]
    EngineError { message: String },
}

impl DetectError {
    pub(crate) fn database(path: Option<&Path>, message: impl Into<String>) -> Self {
        DetectError::DatabaseLoadError {
            path: path.map(Path::to_path_buf),
            message: message.into(),
        }
    }

    pub(crate) fn engine(message: impl Into<String>) -> Self {
        DetectError::EngineError { message: message.into() }
    }
}

fn display_db(path: &Option<PathBuf>) -> String {
    match path {
        Some(p) => p.display().to_string(),
        None => "<engine default>".to_string(),
    }
}

/// 引擎调用失败时的原始信息：错误码 + 错误描述。
/// 由后端在失败调用之后、句柄仍有效时立即读取。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineFault {
    /// 引擎记录的 errno（0 表示未知）
    pub errno: i32,
    pub message: String,
}

impl EngineFault {
    pub fn new(errno: i32, message: impl Into<String>) -> Self {
        Self { errno, message: message.into() }
    }

    /// 目标文件缺失或无权读取
    pub fn is_missing_target(&self) -> bool {
        self.errno == libc::ENOENT || self.errno == libc::EACCES || self.errno == libc::ENOTDIR
    }
}

impl std::fmt::Display for EngineFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.errno != 0 {
            write!(f, "{} (errno {})", self.message, self.errno)
        } else {
            f.write_str(&self.message)
        }
    }
}

/// 无法识别的模式名或参数名
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown {kind} name: {name}")]
pub struct UnknownName {
    pub kind: &'static str,
    pub name: String,
}

impl UnknownName {
    pub(crate) fn mode(name: &str) -> Self {
        Self { kind: "mode flag", name: name.to_string() }
    }

    pub(crate) fn param(name: &str) -> Self {
        Self { kind: "engine parameter", name: name.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_error_names_engine_default() {
        let e = DetectError::database(None, "could not find any valid magic files");
        assert_eq!(
            e.to_string(),
            "failed to load signature database <engine default>: could not find any valid magic files"
        );
    }

    #[test]
    fn missing_target_errnos() {
        assert!(EngineFault::new(libc::ENOENT, "x").is_missing_target());
        assert!(!EngineFault::new(0, "x").is_missing_target());
        assert_eq!(EngineFault::new(0, "bad magic").to_string(), "bad magic");
    }
}
