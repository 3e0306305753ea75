//! libmagic 后端（运行期 dlopen 装载，无需编译期链接 libmagic）
//!
//! - 共享库只装载一次，函数指针存放于进程级缓存，进程结束前不卸载；
//! - 每个 `MagicCookie` 独占一个 `magic_t`，在 `Drop` 时调用 `magic_close`；
//! - 任一调用失败后立即读取 `magic_error`/`magic_errno`，打包为 `EngineFault`。
use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::path::Path;
use std::ptr::{self, NonNull};

use once_cell::sync::Lazy;
use tracing::debug;

use crate::engine::{Backend, EngineHandle};
use crate::error::EngineFault;
use crate::options::{EngineParam, ModeFlags};

/// 指定 libmagic 共享库路径的环境变量
pub const LIBMAGIC_ENV: &str = "TYPEHUNTER_LIBMAGIC";

/// 依次尝试的库名
const LIBRARY_CANDIDATES: &[&str] = &[
    "libmagic.so.1",
    "libmagic.so",
    "libmagic.1.dylib",
    "libmagic.dylib",
    "/opt/homebrew/lib/libmagic.dylib",
    "/usr/local/lib/libmagic.dylib",
];

type MagicT = *mut c_void;

/// libmagic 导出函数表
struct Api {
    open: unsafe extern "C" fn(c_int) -> MagicT,
    close: unsafe extern "C" fn(MagicT),
    error: unsafe extern "C" fn(MagicT) -> *const c_char,
    errno: unsafe extern "C" fn(MagicT) -> c_int,
    load: unsafe extern "C" fn(MagicT, *const c_char) -> c_int,
    check: unsafe extern "C" fn(MagicT, *const c_char) -> c_int,
    list: unsafe extern "C" fn(MagicT, *const c_char) -> c_int,
    file: unsafe extern "C" fn(MagicT, *const c_char) -> *const c_char,
    buffer: unsafe extern "C" fn(MagicT, *const c_void, usize) -> *const c_char,
    getparam: unsafe extern "C" fn(MagicT, c_int, *mut c_void) -> c_int,
    setparam: unsafe extern "C" fn(MagicT, c_int, *const c_void) -> c_int,
    version: unsafe extern "C" fn() -> c_int,
}

static API: Lazy<Result<Api, String>> = Lazy::new(load_api);

#[cfg(unix)]
fn load_api() -> Result<Api, String> {
    let mut candidates: Vec<String> = Vec::new();
    if let Ok(custom) = std::env::var(LIBMAGIC_ENV) {
        candidates.push(custom);
    }
    candidates.extend(LIBRARY_CANDIDATES.iter().map(|s| s.to_string()));

    let mut last_err = String::from("no candidate library names");
    for name in &candidates {
        let cname = match CString::new(name.as_str()) {
            Ok(c) => c,
            Err(_) => continue,
        };
        // SAFETY: dlopen 接收以 NUL 结尾的库名；返回的句柄在进程生命周期内保持有效
        let lib = unsafe { libc::dlopen(cname.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL) };
        if lib.is_null() {
            last_err = dl_error();
            continue;
        }
        match unsafe { resolve_api(lib) } {
            Ok(api) => {
                debug!(library = %name, "loaded libmagic");
                return Ok(api);
            }
            Err(e) => {
                last_err = e;
                unsafe { libc::dlclose(lib) };
            }
        }
    }
    Err(format!("libmagic is unavailable: {last_err}"))
}

#[cfg(not(unix))]
fn load_api() -> Result<Api, String> {
    Err("libmagic is unavailable: runtime loading is only supported on unix".to_string())
}

#[cfg(unix)]
fn dl_error() -> String {
    // SAFETY: dlerror 返回线程局部的错误串或 NULL
    let msg = unsafe { libc::dlerror() };
    if msg.is_null() {
        "unknown dlopen error".to_string()
    } else {
        unsafe { CStr::from_ptr(msg) }.to_string_lossy().into_owned()
    }
}

/// 按名称解析全部符号；任何一个缺失即视为库不可用
#[cfg(unix)]
unsafe fn resolve_api(lib: *mut c_void) -> Result<Api, String> {
    macro_rules! sym {
        ($name:literal) => {{
            let p = libc::dlsym(lib, concat!($name, "\0").as_ptr() as *const c_char);
            if p.is_null() {
                return Err(format!("missing symbol {}", $name));
            }
            std::mem::transmute::<*mut c_void, _>(p)
        }};
    }

    Ok(Api {
        open: sym!("magic_open"),
        close: sym!("magic_close"),
        error: sym!("magic_error"),
        errno: sym!("magic_errno"),
        load: sym!("magic_load"),
        check: sym!("magic_check"),
        list: sym!("magic_list"),
        file: sym!("magic_file"),
        buffer: sym!("magic_buffer"),
        getparam: sym!("magic_getparam"),
        setparam: sym!("magic_setparam"),
        version: sym!("magic_version"),
    })
}

fn api() -> Result<&'static Api, EngineFault> {
    Lazy::force(&API)
        .as_ref()
        .map_err(|e| EngineFault::new(0, e.clone()))
}

/// 判断当前进程能否装载 libmagic
pub fn is_available() -> bool {
    Lazy::force(&API).is_ok()
}

#[cfg(unix)]
fn path_cstring(path: &Path) -> Result<CString, EngineFault> {
    use std::os::unix::ffi::OsStrExt;
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| EngineFault::new(libc::EINVAL, format!("path contains a NUL byte: {}", path.display())))
}

#[cfg(not(unix))]
fn path_cstring(path: &Path) -> Result<CString, EngineFault> {
    let s = path
        .to_str()
        .ok_or_else(|| EngineFault::new(libc::EINVAL, format!("path is not valid UTF-8: {}", path.display())))?;
    CString::new(s)
        .map_err(|_| EngineFault::new(libc::EINVAL, format!("path contains a NUL byte: {}", path.display())))
}

/// libmagic 引擎工厂。本身不持有资源，可随意复制。
#[derive(Debug, Clone, Copy, Default)]
pub struct LibMagic;

impl Backend for LibMagic {
    type Handle = MagicCookie;

    fn open(&self, mode: ModeFlags) -> Result<MagicCookie, EngineFault> {
        let api = api()?;
        // SAFETY: magic_open 只读取标志位；失败时返回 NULL 并设置 errno
        let raw = unsafe { (api.open)(mode.bits() as c_int) };
        match NonNull::new(raw) {
            Some(cookie) => Ok(MagicCookie { api, cookie }),
            None => {
                let err = std::io::Error::last_os_error();
                Err(EngineFault::new(
                    err.raw_os_error().unwrap_or(0),
                    format!("magic_open failed: {err}"),
                ))
            }
        }
    }

    fn version(&self) -> Option<String> {
        let api = api().ok()?;
        // SAFETY: magic_version 无参数、无副作用
        let v = unsafe { (api.version)() };
        Some(format!("{}.{:02}", v / 100, v % 100))
    }
}

/// 一个 libmagic 句柄（`magic_t`）
pub struct MagicCookie {
    api: &'static Api,
    cookie: NonNull<c_void>,
}

// SAFETY: magic_t 只要不被并发使用即可跨线程移动；`EngineHandle` 的方法均要求 `&mut self`
unsafe impl Send for MagicCookie {}

impl MagicCookie {
    fn raw(&self) -> MagicT {
        self.cookie.as_ptr()
    }

    /// 读取本句柄上最近一次失败的错误信息（必须紧跟在失败调用之后）
    fn fault(&self, call: &str) -> EngineFault {
        // SAFETY: 句柄有效；返回的字符串归句柄所有，这里立即复制
        let (errno, msg) = unsafe {
            let errno = (self.api.errno)(self.raw());
            let msg = (self.api.error)(self.raw());
            let msg = if msg.is_null() {
                format!("{call} failed")
            } else {
                CStr::from_ptr(msg).to_string_lossy().into_owned()
            };
            (errno, msg)
        };
        EngineFault::new(errno, msg)
    }

    fn db_arg(db: Option<&Path>) -> Result<Option<CString>, EngineFault> {
        db.map(path_cstring).transpose()
    }

    fn status(&self, rc: c_int, call: &str) -> Result<(), EngineFault> {
        if rc == 0 {
            Ok(())
        } else {
            Err(self.fault(call))
        }
    }

    fn descriptor(&self, ptr: *const c_char, call: &str) -> Result<String, EngineFault> {
        if ptr.is_null() {
            return Err(self.fault(call));
        }
        // SAFETY: 非空结果指向句柄内部缓冲，下一次调用前有效
        Ok(unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned())
    }
}

impl EngineHandle for MagicCookie {
    fn load(&mut self, db: Option<&Path>) -> Result<(), EngineFault> {
        let db = Self::db_arg(db)?;
        let ptr = db.as_ref().map_or(ptr::null(), |c| c.as_ptr());
        let rc = unsafe { (self.api.load)(self.raw(), ptr) };
        self.status(rc, "magic_load")
    }

    fn query_file(&mut self, path: &Path) -> Result<String, EngineFault> {
        let cpath = path_cstring(path)?;
        let out = unsafe { (self.api.file)(self.raw(), cpath.as_ptr()) };
        self.descriptor(out, "magic_file")
    }

    fn query_buffer(&mut self, bytes: &[u8]) -> Result<String, EngineFault> {
        let out = unsafe { (self.api.buffer)(self.raw(), bytes.as_ptr() as *const c_void, bytes.len()) };
        self.descriptor(out, "magic_buffer")
    }

    fn check(&mut self, db: Option<&Path>) -> Result<(), EngineFault> {
        let db = Self::db_arg(db)?;
        let ptr = db.as_ref().map_or(ptr::null(), |c| c.as_ptr());
        let rc = unsafe { (self.api.check)(self.raw(), ptr) };
        self.status(rc, "magic_check")
    }

    fn list(&mut self, db: Option<&Path>) -> Result<(), EngineFault> {
        let db = Self::db_arg(db)?;
        let ptr = db.as_ref().map_or(ptr::null(), |c| c.as_ptr());
        let rc = unsafe { (self.api.list)(self.raw(), ptr) };
        self.status(rc, "magic_list")
    }

    fn get_param(&mut self, param: EngineParam) -> Result<usize, EngineFault> {
        let mut value: usize = 0;
        let rc = unsafe {
            (self.api.getparam)(self.raw(), param.code(), &mut value as *mut usize as *mut c_void)
        };
        self.status(rc, "magic_getparam")?;
        Ok(value)
    }

    fn set_param(&mut self, param: EngineParam, value: usize) -> Result<(), EngineFault> {
        let rc = unsafe {
            (self.api.setparam)(self.raw(), param.code(), &value as *const usize as *const c_void)
        };
        self.status(rc, "magic_setparam")
    }
}

impl Drop for MagicCookie {
    fn drop(&mut self) {
        // SAFETY: 句柄由 magic_open 分配且只在此处释放一次
        unsafe { (self.api.close)(self.raw()) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_dotted_when_available() {
        match LibMagic.version() {
            Some(v) => {
                let (major, minor) = v.split_once('.').expect("dotted version");
                assert!(major.parse::<u32>().is_ok());
                assert_eq!(minor.len(), 2);
            }
            None => assert!(!is_available()),
        }
    }

    #[test]
    fn open_reports_fault_when_unavailable() {
        if is_available() {
            return;
        }
        let err = LibMagic.open(ModeFlags::DEFAULT).err().expect("open must fail");
        assert!(err.message.contains("libmagic is unavailable"));
    }
}
