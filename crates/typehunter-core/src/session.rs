//! 检测会话：持有零或一个引擎句柄，负责懒加载、参数变更后的失效与关闭
//!
//! 状态机：
//! - Unopened --detect 成功打开--> Open；打开/加载失败则保持 Unopened（可重试）
//! - Open --修改 target/db/mode--> Unopened（句柄立即释放）
//! - Unopened/Open --close--> Closed（终态，重复 close 为空操作）
use std::fmt;
use std::fs;
use std::mem;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::database::validate_database;
use crate::engine::{Backend, EngineHandle};
use crate::error::DetectError;
use crate::magic::LibMagic;
use crate::options::{EngineParam, ModeFlags, SessionOptions};
use crate::types::Target;

enum State<H> {
    Unopened,
    Open(H),
    Closed,
}

/// 检测会话。单一所有者使用；不同会话之间互不影响。
pub struct DetectionSession<B: Backend = LibMagic> {
    backend: B,
    target: Target,
    default_db: Option<PathBuf>,
    db: Option<PathBuf>,
    mode: ModeFlags,
    params: Vec<(EngineParam, usize)>,
    state: State<B::Handle>,
}

impl DetectionSession<LibMagic> {
    /// 以 libmagic 与进程级默认数据库创建会话（不会立即打开引擎）
    pub fn new(target: impl Into<Target>) -> Self {
        Self::with_options(target, SessionOptions::default())
    }

    pub fn with_options(target: impl Into<Target>, options: SessionOptions) -> Self {
        let default_db = crate::global::default_database().map(Path::to_path_buf);
        Self::with_backend(LibMagic, target, default_db, options)
    }
}

impl<B: Backend> DetectionSession<B> {
    /// 注入引擎与默认数据库路径；`default_db` 为 None 表示使用引擎内置默认库
    pub fn with_backend(
        backend: B,
        target: impl Into<Target>,
        default_db: Option<PathBuf>,
        options: SessionOptions,
    ) -> Self {
        let mut session = Self {
            backend,
            target: target.into(),
            default_db,
            db: non_empty(options.db),
            mode: options.mode.unwrap_or_default(),
            params: Vec::new(),
            state: State::Unopened,
        };
        for (p, v) in options.params {
            session.record_param(p, v);
        }
        session
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    /// 实际生效的数据库路径（覆盖项优先，其次默认路径）
    pub fn database(&self) -> Option<&Path> {
        self.db.as_deref().or(self.default_db.as_deref())
    }

    pub fn mode(&self) -> ModeFlags {
        self.mode
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, State::Closed)
    }

    /// 当前是否持有已加载的句柄
    pub fn is_loaded(&self) -> bool {
        matches!(self.state, State::Open(_))
    }

    pub fn set_target(&mut self, target: impl Into<Target>) {
        self.target = target.into();
        self.invalidate("target changed");
    }

    /// 设置数据库路径；None 或空路径恢复为默认路径
    pub fn set_database(&mut self, db: Option<PathBuf>) {
        self.db = non_empty(db);
        self.invalidate("database changed");
    }

    pub fn set_mode(&mut self, mode: ModeFlags) {
        self.mode = mode;
        self.invalidate("mode changed");
    }

    /// 释放句柄并标记关闭；重复调用无副作用
    pub fn close(&mut self) {
        if let State::Open(handle) = mem::replace(&mut self.state, State::Closed) {
            drop(handle);
            debug!("closed detection engine");
        }
    }

    /// 检测当前目标，返回引擎给出的原始描述串
    pub fn detect(&mut self) -> Result<String, DetectError> {
        self.ensure_open()?;
        let follow = self.follows_symlinks();
        match &mut self.state {
            State::Open(handle) => query_target(handle, &self.target, follow),
            _ => Err(DetectError::SessionClosed),
        }
    }

    /// 一次性检测给定路径，不修改会话的目标，也不使句柄失效
    pub fn detect_path(&mut self, path: &Path) -> Result<String, DetectError> {
        let follow = self.follows_symlinks();
        query_path(self.handle()?, path, follow)
    }

    /// 一次性检测内存缓冲，不修改会话的目标
    pub fn detect_buffer(&mut self, bytes: &[u8]) -> Result<String, DetectError> {
        query_buffer(self.handle()?, bytes)
    }

    /// 设置数据库路径并立即加载
    pub fn load(&mut self, db: impl Into<PathBuf>) -> Result<(), DetectError> {
        self.set_database(Some(db.into()));
        self.ensure_open()
    }

    /// 读取引擎参数（必要时先打开句柄）
    pub fn get_param(&mut self, param: EngineParam) -> Result<usize, DetectError> {
        self.handle()?
            .get_param(param)
            .map_err(|f| DetectError::engine(format!("cannot read {param}: {f}")))
    }

    /// 设置引擎参数：引擎接受后才记录为覆盖项（重新加载后仍然生效）。
    /// 尚未持有句柄时用一个未加载的临时句柄校验取值。
    pub fn set_param(&mut self, param: EngineParam, value: usize) -> Result<(), DetectError> {
        let applied = match &mut self.state {
            State::Closed => return Err(DetectError::SessionClosed),
            State::Open(handle) => handle.set_param(param, value),
            State::Unopened => self
                .backend
                .open(self.mode)
                .map_err(|f| DetectError::engine(format!("cannot open engine: {f}")))?
                .set_param(param, value),
        };
        applied.map_err(|f| DetectError::engine(format!("cannot set {param}: {f}")))?;
        self.record_param(param, value);
        Ok(())
    }

    /// 校验数据库文件（None 表示会话当前的数据库），使用临时句柄，不影响会话状态
    pub fn check_database(&self, db: Option<&Path>) -> Result<(), DetectError> {
        let db = db.or(self.database());
        let mut scratch = self.scratch_handle(db)?;
        scratch
            .check(db)
            .map_err(|f| DetectError::database(db, f.to_string()))
    }

    /// 以可读格式把数据库条目输出到标准输出
    pub fn list_database(&self) -> Result<(), DetectError> {
        let db = self.database();
        let mut scratch = self.scratch_handle(db)?;
        scratch
            .list(db)
            .map_err(|f| DetectError::engine(format!("cannot list database: {f}")))
    }

    fn scratch_handle(&self, db: Option<&Path>) -> Result<B::Handle, DetectError> {
        if self.is_closed() {
            return Err(DetectError::SessionClosed);
        }
        if let Some(p) = db {
            validate_database(p)?;
        }
        self.backend
            .open(self.mode)
            .map_err(|f| DetectError::engine(format!("cannot open engine: {f}")))
    }

    fn record_param(&mut self, param: EngineParam, value: usize) {
        match self.params.iter_mut().find(|(p, _)| *p == param) {
            Some(slot) => slot.1 = value,
            None => self.params.push((param, value)),
        }
    }

    fn invalidate(&mut self, reason: &str) {
        if let State::Open(_) = self.state {
            // 赋值即释放旧句柄；已关闭的会话保持关闭
            self.state = State::Unopened;
            debug!(reason, "discarded detection engine");
        }
    }

    fn ensure_open(&mut self) -> Result<(), DetectError> {
        match self.state {
            State::Closed => Err(DetectError::SessionClosed),
            State::Open(_) => Ok(()),
            State::Unopened => {
                let handle = self.open_handle()?;
                self.state = State::Open(handle);
                Ok(())
            }
        }
    }

    fn handle(&mut self) -> Result<&mut B::Handle, DetectError> {
        self.ensure_open()?;
        match &mut self.state {
            State::Open(handle) => Ok(handle),
            _ => Err(DetectError::SessionClosed),
        }
    }

    /// 分配句柄并加载数据库；任何一步失败，句柄随即释放，会话保持 Unopened。
    /// 引擎拒绝的参数覆盖项会被丢弃，下次打开不再重放。
    fn open_handle(&mut self) -> Result<B::Handle, DetectError> {
        let db = self.database().map(Path::to_path_buf);
        let db = db.as_deref();
        if let Some(p) = db {
            validate_database(p)?;
        }
        let mut handle = self
            .backend
            .open(self.mode)
            .map_err(|f| DetectError::engine(format!("cannot open engine: {f}")))?;
        handle
            .load(db)
            .map_err(|f| DetectError::database(db, f.to_string()))?;
        for (param, value) in self.params.clone() {
            if let Err(f) = handle.set_param(param, value) {
                self.params.retain(|(p, _)| *p != param);
                warn!(%param, value, error = %f, "dropped rejected engine parameter");
                return Err(DetectError::engine(format!("cannot set {param}: {f}")));
            }
        }
        debug!(db = ?db, mode = %self.mode, "opened detection engine");
        Ok(handle)
    }

    fn follows_symlinks(&self) -> bool {
        self.mode.contains(ModeFlags::SYMLINK)
    }
}

impl<B: Backend> fmt::Debug for DetectionSession<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            State::Unopened => "unopened",
            State::Open(_) => "open",
            State::Closed => "closed",
        };
        f.debug_struct("DetectionSession")
            .field("target", &self.target)
            .field("db", &self.database())
            .field("mode", &self.mode)
            .field("state", &state)
            .finish()
    }
}

fn non_empty(db: Option<PathBuf>) -> Option<PathBuf> {
    db.filter(|p| !p.as_os_str().is_empty())
}

fn query_target<H: EngineHandle>(
    handle: &mut H,
    target: &Target,
    follow: bool,
) -> Result<String, DetectError> {
    match target {
        Target::Path(p) => query_path(handle, p, follow),
        Target::Buffer(bytes) => query_buffer(handle, bytes),
    }
}

/// 先在文件系统层确认目标存在且可读，再交给引擎。
/// 不跟随符号链接时只检查链接本身，悬空链接交由引擎描述。
fn query_path<H: EngineHandle>(handle: &mut H, path: &Path, follow: bool) -> Result<String, DetectError> {
    let not_found = || DetectError::TargetNotFound { path: path.to_path_buf() };
    let md = if follow { fs::metadata(path) } else { fs::symlink_metadata(path) };
    let md = md.map_err(|_| not_found())?;
    if md.is_file() {
        fs::File::open(path).map_err(|_| not_found())?;
    }
    handle.query_file(path).map_err(|f| {
        if f.is_missing_target() {
            not_found()
        } else {
            DetectError::engine(f.to_string())
        }
    })
}

fn query_buffer<H: EngineHandle>(handle: &mut H, bytes: &[u8]) -> Result<String, DetectError> {
    handle
        .query_buffer(bytes)
        .map_err(|f| DetectError::engine(f.to_string()))
}
