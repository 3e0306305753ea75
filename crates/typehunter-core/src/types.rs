//! 公共类型（对外暴露）
use serde::Serialize;
use std::path::{Path, PathBuf};

/// 检测目标：文件系统路径或内存缓冲
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Path(PathBuf),
    Buffer(Vec<u8>),
}

impl Target {
    pub fn as_path(&self) -> Option<&Path> {
        match self {
            Target::Path(p) => Some(p),
            Target::Buffer(_) => None,
        }
    }
}

impl From<PathBuf> for Target {
    fn from(p: PathBuf) -> Self {
        Target::Path(p)
    }
}

impl From<&Path> for Target {
    fn from(p: &Path) -> Self {
        Target::Path(p.to_path_buf())
    }
}

impl From<&PathBuf> for Target {
    fn from(p: &PathBuf) -> Self {
        Target::Path(p.clone())
    }
}

impl From<&str> for Target {
    fn from(p: &str) -> Self {
        Target::Path(PathBuf::from(p))
    }
}

impl From<String> for Target {
    fn from(p: String) -> Self {
        Target::Path(PathBuf::from(p))
    }
}

impl From<Vec<u8>> for Target {
    fn from(b: Vec<u8>) -> Self {
        Target::Buffer(b)
    }
}

impl From<&[u8]> for Target {
    fn from(b: &[u8]) -> Self {
        Target::Buffer(b.to_vec())
    }
}

/// 输出项结构（批量扫描 JSON 数组的单个元素）
#[derive(Debug, Clone, Serialize)]
pub struct DetectionRecord<'a> {
    pub path: &'a str,
    pub descriptor: &'a str,
}
