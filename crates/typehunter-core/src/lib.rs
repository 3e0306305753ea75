//! 文件类型检测核心库
//!
//! 设计要点：
//! - 签名匹配交给外部引擎（libmagic，运行期装载），本库只负责会话生命周期。
//! - 会话懒加载数据库；修改目标、数据库或模式后立即释放旧句柄，下次检测重新加载。
//! - `close()` 幂等，关闭后任何检测都返回 `SessionClosed`，不会隐式重开。
//! - 引擎错误在出错现场归类为 `DetectError`，原始错误串不会直接外泄。
//! - 进程级默认会话（`check`）供一次性调用，覆盖项不会在调用之间泄漏。

mod options;
mod types;
mod error;
mod engine;
mod magic;
mod database;
mod session;
mod global;
mod config;
mod scan;

pub use options::{EngineParam, ModeFlags, ScanOptions, ScanStats, SessionOptions};
pub use types::{DetectionRecord, Target};
pub use error::{DetectError, EngineFault, UnknownName};
pub use engine::{Backend, EngineHandle};
pub use magic::{is_available as libmagic_available, LibMagic, MagicCookie, LIBMAGIC_ENV};
pub use database::{DatabaseLocator, INSTALLED_DATABASES, MAGIC_ENV};
pub use session::DetectionSession;
pub use global::{check, default_database, engine_version, DefaultSession};
pub use config::{load_config, parse_config, DetectConfig};
pub use scan::{scan_and_write, scan_and_write_with};
