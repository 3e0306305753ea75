//! 检测引擎边界（模块）
//!
//! 签名匹配本身由外部引擎完成（生产环境为 libmagic），这里只约定它的能力面：
//! - `Backend`：引擎工厂，负责分配句柄、报告版本；
//! - `EngineHandle`：一个句柄 = 一份已加载的数据库 + 一组模式位。
//!
//! 句柄的释放交给 `Drop`，因此同一句柄不可能被关闭两次。
use std::path::Path;

use crate::error::EngineFault;
use crate::options::{EngineParam, ModeFlags};

/// 引擎工厂
pub trait Backend {
    type Handle: EngineHandle;

    /// 按模式位分配一个新句柄（尚未加载数据库）
    fn open(&self, mode: ModeFlags) -> Result<Self::Handle, EngineFault>;

    /// 引擎版本串，如 "5.45"；引擎不可用时为 None
    fn version(&self) -> Option<String>;
}

/// 单个引擎句柄。所有调用都需要 `&mut self`：句柄内部读缓冲不可重入。
pub trait EngineHandle: Send {
    /// 加载数据库；`None` 表示使用引擎内置默认数据库
    fn load(&mut self, db: Option<&Path>) -> Result<(), EngineFault>;

    fn query_file(&mut self, path: &Path) -> Result<String, EngineFault>;

    fn query_buffer(&mut self, bytes: &[u8]) -> Result<String, EngineFault>;

    /// 校验一个（源格式）数据库文件
    fn check(&mut self, db: Option<&Path>) -> Result<(), EngineFault>;

    /// 将数据库条目以可读格式输出到标准输出
    fn list(&mut self, db: Option<&Path>) -> Result<(), EngineFault>;

    fn get_param(&mut self, param: EngineParam) -> Result<usize, EngineFault>;

    fn set_param(&mut self, param: EngineParam, value: usize) -> Result<(), EngineFault>;
}
