//! 检测模式、引擎参数与各类选项（模块）
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::UnknownName;

/// 检测模式位集合（与 libmagic 的 `MAGIC_*` 标志位一一对应）
/// - 默认值为 `MIME | CHECK | SYMLINK`（数值 1106），即“类型 + 字符集”
/// - `RAW` 输出原始描述（如 "directory"），`MIME_ENCODING` 只输出编码（如 "binary"）
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModeFlags(u32);

impl ModeFlags {
    pub const NONE: Self = Self(0x0000000);
    pub const DEBUG: Self = Self(0x0000001);
    pub const SYMLINK: Self = Self(0x0000002);
    pub const COMPRESS: Self = Self(0x0000004);
    pub const DEVICES: Self = Self(0x0000008);
    pub const MIME_TYPE: Self = Self(0x0000010);
    pub const CONTINUE: Self = Self(0x0000020);
    pub const CHECK: Self = Self(0x0000040);
    pub const PRESERVE_ATIME: Self = Self(0x0000080);
    pub const RAW: Self = Self(0x0000100);
    pub const ERROR: Self = Self(0x0000200);
    pub const MIME_ENCODING: Self = Self(0x0000400);
    pub const MIME: Self = Self(0x0000410);
    pub const APPLE: Self = Self(0x0000800);
    pub const EXTENSION: Self = Self(0x1000000);
    pub const COMPRESS_TRANSP: Self = Self(0x2000000);
    pub const NO_CHECK_COMPRESS: Self = Self(0x0001000);
    pub const NO_CHECK_TAR: Self = Self(0x0002000);
    pub const NO_CHECK_SOFT: Self = Self(0x0004000);
    pub const NO_CHECK_APPTYPE: Self = Self(0x0008000);
    pub const NO_CHECK_ELF: Self = Self(0x0010000);
    pub const NO_CHECK_TEXT: Self = Self(0x0020000);
    pub const NO_CHECK_CDF: Self = Self(0x0040000);
    pub const NO_CHECK_CSV: Self = Self(0x0080000);
    pub const NO_CHECK_TOKENS: Self = Self(0x0100000);
    pub const NO_CHECK_ENCODING: Self = Self(0x0200000);
    pub const NO_CHECK_JSON: Self = Self(0x0400000);

    /// 未显式指定时使用的模式：MIME 类型 + 字符集，并检查数据库、跟随符号链接
    pub const DEFAULT: Self = Self(Self::MIME.0 | Self::CHECK.0 | Self::SYMLINK.0);

    /// 名称表（对应 `MAGIC_*` 常量，去掉前缀、小写）
    pub const NAMED: &'static [(&'static str, ModeFlags)] = &[
        ("none", Self::NONE),
        ("debug", Self::DEBUG),
        ("symlink", Self::SYMLINK),
        ("compress", Self::COMPRESS),
        ("devices", Self::DEVICES),
        ("mime_type", Self::MIME_TYPE),
        ("mime_encoding", Self::MIME_ENCODING),
        ("mime", Self::MIME),
        ("continue", Self::CONTINUE),
        ("check", Self::CHECK),
        ("preserve_atime", Self::PRESERVE_ATIME),
        ("raw", Self::RAW),
        ("error", Self::ERROR),
        ("apple", Self::APPLE),
        ("extension", Self::EXTENSION),
        ("compress_transp", Self::COMPRESS_TRANSP),
        ("no_check_apptype", Self::NO_CHECK_APPTYPE),
        ("no_check_cdf", Self::NO_CHECK_CDF),
        ("no_check_compress", Self::NO_CHECK_COMPRESS),
        ("no_check_elf", Self::NO_CHECK_ELF),
        ("no_check_encoding", Self::NO_CHECK_ENCODING),
        ("no_check_soft", Self::NO_CHECK_SOFT),
        ("no_check_tar", Self::NO_CHECK_TAR),
        ("no_check_text", Self::NO_CHECK_TEXT),
        ("no_check_tokens", Self::NO_CHECK_TOKENS),
        ("no_check_json", Self::NO_CHECK_JSON),
        ("no_check_csv", Self::NO_CHECK_CSV),
    ];

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// 按名称查找单个标志（大小写不敏感，可带 `MAGIC_` 前缀，`-` 等价于 `_`）
    pub fn from_name(name: &str) -> Option<Self> {
        let norm = normalize_name(name, "magic_");
        Self::NAMED.iter().find(|(n, _)| *n == norm).map(|(_, f)| *f)
    }

    /// 由多个名称组合出模式位
    pub fn from_names<I, S>(names: I) -> Result<Self, UnknownName>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut out = Self::NONE;
        for n in names {
            let n = n.as_ref();
            out |= Self::from_name(n).ok_or_else(|| UnknownName::mode(n))?;
        }
        Ok(out)
    }

    /// 分解为单比特标志的名称（复合标志如 `mime` 不参与分解）
    pub fn names(self) -> Vec<&'static str> {
        Self::NAMED
            .iter()
            .filter(|(_, f)| f.0.count_ones() == 1 && self.contains(*f))
            .map(|(n, _)| *n)
            .collect()
    }
}

impl Default for ModeFlags {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl BitOr for ModeFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for ModeFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for ModeFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = self.names();
        if names.is_empty() {
            write!(f, "none")
        } else {
            write!(f, "{}", names.join("|"))
        }
    }
}

impl fmt::Debug for ModeFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ModeFlags({:#x}: {})", self.0, self)
    }
}

/// 解析形如 `raw`、`mime|check`、`MAGIC_MIME_ENCODING` 或纯数字的模式串
impl FromStr for ModeFlags {
    type Err = UnknownName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(bits) = s.parse::<u32>() {
            return Ok(Self(bits));
        }
        Self::from_names(s.split(['|', ',']).map(str::trim).filter(|p| !p.is_empty()))
    }
}

/// 引擎参数（对应 libmagic 的 `MAGIC_PARAM_*`），用于调整各类上限
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EngineParam {
    IndirMax,
    NameMax,
    ElfPhnumMax,
    ElfShnumMax,
    ElfNotesMax,
    RegexMax,
    BytesMax,
}

impl EngineParam {
    /// 名称表（对应 `MAGIC_PARAM_*`，去掉前缀、小写）
    pub const ALL: [(&'static str, EngineParam); 7] = [
        ("indir_max", EngineParam::IndirMax),
        ("name_max", EngineParam::NameMax),
        ("elf_phnum_max", EngineParam::ElfPhnumMax),
        ("elf_shnum_max", EngineParam::ElfShnumMax),
        ("elf_notes_max", EngineParam::ElfNotesMax),
        ("regex_max", EngineParam::RegexMax),
        ("bytes_max", EngineParam::BytesMax),
    ];

    /// libmagic 中的参数编号
    pub const fn code(self) -> i32 {
        match self {
            EngineParam::IndirMax => 0,
            EngineParam::NameMax => 1,
            EngineParam::ElfPhnumMax => 2,
            EngineParam::ElfShnumMax => 3,
            EngineParam::ElfNotesMax => 4,
            EngineParam::RegexMax => 5,
            EngineParam::BytesMax => 6,
        }
    }

    pub fn name(self) -> &'static str {
        Self::ALL
            .iter()
            .find(|(_, p)| *p == self)
            .map(|(n, _)| *n)
            .unwrap_or("unknown")
    }
}

impl fmt::Display for EngineParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EngineParam {
    type Err = UnknownName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let norm = normalize_name(s, "magic_param_");
        Self::ALL
            .iter()
            .find(|(n, _)| *n == norm)
            .map(|(_, p)| *p)
            .ok_or_else(|| UnknownName::param(s))
    }
}

fn normalize_name(name: &str, prefix: &str) -> String {
    let lower = name.trim().to_ascii_lowercase().replace('-', "_");
    match lower.strip_prefix(prefix) {
        Some(rest) => rest.to_string(),
        None => lower,
    }
}

/// 会话选项（构造会话或一次性检测时的覆盖项）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionOptions {
    /// 数据库路径；为空则使用默认安装路径
    pub db: Option<PathBuf>,
    /// 检测模式；为空则使用 `ModeFlags::DEFAULT`
    pub mode: Option<ModeFlags>,
    /// 引擎参数覆盖，每次打开句柄后依次应用
    pub params: Vec<(EngineParam, usize)>,
}

impl SessionOptions {
    pub fn with_db(mut self, db: impl Into<PathBuf>) -> Self {
        self.db = Some(db.into());
        self
    }

    pub fn with_mode(mut self, mode: ModeFlags) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_param(mut self, param: EngineParam, value: usize) -> Self {
        self.params.push((param, value));
        self
    }

    /// 没有任何覆盖项
    pub fn is_empty(&self) -> bool {
        self.db.is_none() && self.mode.is_none() && self.params.is_empty()
    }
}

/// 批量扫描选项
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// 最大文件大小（字节）；超过则跳过
    pub max_file_size: Option<u64>,
    /// 线程数：None 表示自动（等于 CPU 核数）；Some(1) 走串行
    pub threads: Option<usize>,
    /// 只输出描述匹配该正则的结果（如 `^text/`）
    pub only: Option<String>,
    /// 目录遍历深度；None 表示不限
    pub max_depth: Option<usize>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            max_file_size: None,
            threads: None,
            only: None,
            max_depth: None,
        }
    }
}

/// 扫描统计信息（便于 CLI 打印）
#[derive(Debug, Default, Clone)]
pub struct ScanStats {
    pub files_scanned: usize,
    pub failures: usize,
    pub outputs_written: usize,
}
