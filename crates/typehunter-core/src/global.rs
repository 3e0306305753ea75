//! 进程级默认会话与一次性检测入口
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use once_cell::sync::Lazy;

use crate::database::DatabaseLocator;
use crate::engine::Backend;
use crate::error::DetectError;
use crate::magic::LibMagic;
use crate::options::{ModeFlags, SessionOptions};
use crate::session::DetectionSession;
use crate::types::Target;

/// 进程启动后首次使用时解析一次；不可读时只告警
static DEFAULT_DATABASE: Lazy<Option<PathBuf>> = Lazy::new(|| DatabaseLocator::default().resolve());

static DEFAULT_SESSION: Lazy<DefaultSession<LibMagic>> =
    Lazy::new(|| DefaultSession::new(LibMagic, default_database().map(Path::to_path_buf)));

static ENGINE_VERSION: Lazy<String> =
    Lazy::new(|| LibMagic.version().unwrap_or_else(|| "unavailable".to_string()));

/// 解析得到的默认数据库路径；None 表示使用引擎内置默认库
pub fn default_database() -> Option<&'static Path> {
    Lazy::force(&DEFAULT_DATABASE).as_deref()
}

/// 引擎版本（如 "5.45"），引擎不可用时为 "unavailable"
pub fn engine_version() -> &'static str {
    ENGINE_VERSION.as_str()
}

/// 使用进程级默认会话做一次检测。
/// `options` 只对本次调用生效，不会改变默认会话的配置。
pub fn check(target: impl Into<Target>, options: &SessionOptions) -> Result<String, DetectError> {
    DEFAULT_SESSION.check(target, options)
}

/// 默认会话门面：共享一个会话（及其句柄），带覆盖项的调用改用临时会话
pub struct DefaultSession<B: Backend + Clone = LibMagic> {
    backend: B,
    default_db: Option<PathBuf>,
    shared: Mutex<DetectionSession<B>>,
}

impl<B: Backend + Clone> DefaultSession<B> {
    pub fn new(backend: B, default_db: Option<PathBuf>) -> Self {
        let shared = DetectionSession::with_backend(
            backend.clone(),
            Target::Buffer(Vec::new()),
            default_db.clone(),
            SessionOptions::default(),
        );
        Self {
            backend,
            default_db,
            shared: Mutex::new(shared),
        }
    }

    pub fn default_db(&self) -> Option<&Path> {
        self.default_db.as_deref()
    }

    pub fn check(&self, target: impl Into<Target>, options: &SessionOptions) -> Result<String, DetectError> {
        let target = target.into();
        if self.matches_defaults(options) {
            let mut shared = self.shared.lock().unwrap_or_else(PoisonError::into_inner);
            return match &target {
                Target::Path(p) => shared.detect_path(p),
                Target::Buffer(b) => shared.detect_buffer(b),
            };
        }

        let mut transient = DetectionSession::with_backend(
            self.backend.clone(),
            target,
            self.default_db.clone(),
            options.clone(),
        );
        let out = transient.detect();
        transient.close();
        out
    }

    /// 覆盖项与默认配置等价时可直接复用共享句柄
    fn matches_defaults(&self, options: &SessionOptions) -> bool {
        let db_ok = match options.db.as_deref() {
            None => true,
            Some(p) if p.as_os_str().is_empty() => true,
            Some(p) => Some(p) == self.default_db(),
        };
        let mode_ok = options.mode.map_or(true, |m| m == ModeFlags::DEFAULT);
        db_ok && mode_ok && options.params.is_empty()
    }

    #[cfg(test)]
    fn shared_mode(&self) -> ModeFlags {
        self.shared.lock().unwrap().mode()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::ScriptedBackend;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn engine_version_is_never_empty() {
        assert!(!engine_version().is_empty());
    }

    #[test]
    fn overrides_do_not_leak_between_calls() {
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("a.rb");
        fs::write(&script, "puts 1\n").unwrap();
        let backend = ScriptedBackend::default()
            .answer(dir.path(), "inode/directory")
            .answer(&script, "text/x-ruby");
        let facade = DefaultSession::new(backend.clone(), None);

        let none = SessionOptions::default();
        assert_eq!(facade.check(dir.path(), &none).unwrap(), "inode/directory; charset=binary");
        assert_eq!(
            facade
                .check(dir.path(), &SessionOptions::default().with_mode(ModeFlags::RAW))
                .unwrap(),
            "inode/directory"
        );
        assert_eq!(facade.shared_mode(), ModeFlags::DEFAULT);
        assert_eq!(facade.check(&script, &none).unwrap(), "text/x-ruby; charset=binary");
        assert_eq!(
            facade
                .check(dir.path(), &SessionOptions::default().with_mode(ModeFlags::MIME_ENCODING))
                .unwrap(),
            "binary"
        );

        // 共享句柄只打开一次；每个临时会话打开后即释放
        assert_eq!(backend.opened(), 3);
        assert_eq!(backend.dropped(), 2);
    }

    #[test]
    fn bad_override_database_does_not_poison_defaults() {
        let dir = TempDir::new().unwrap();
        let backend = ScriptedBackend::default().answer(dir.path(), "inode/directory");
        let facade = DefaultSession::new(backend, None);

        let bad = SessionOptions::default().with_db(dir.path().join("invalid.mgc"));
        assert!(matches!(
            facade.check(dir.path(), &bad),
            Err(DetectError::DatabaseLoadError { .. })
        ));
        assert_eq!(
            facade.check(dir.path(), &SessionOptions::default()).unwrap(),
            "inode/directory; charset=binary"
        );
    }

    #[test]
    fn missing_target_is_reported() {
        let dir = TempDir::new().unwrap();
        let facade = DefaultSession::new(ScriptedBackend::default(), None);
        let missing = dir.path().join("nope.mp3");
        assert!(matches!(
            facade.check(missing.as_path(), &SessionOptions::default()),
            Err(DetectError::TargetNotFound { .. })
        ));
    }

    #[test]
    fn buffers_go_through_shared_session() {
        let facade = DefaultSession::new(ScriptedBackend::default(), None);
        assert_eq!(
            facade
                .check(b"%PDF-1.3\r\n".as_slice(), &SessionOptions::default())
                .unwrap(),
            "application/pdf; charset=binary"
        );
    }
}
