//! 检测配置文件加载（TOML）
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::options::{EngineParam, ModeFlags, SessionOptions};

/// 模式既可写成字符串（"raw|check"），也可写成名称数组或数值
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ModeEntry {
    Bits(u32),
    Text(String),
    Names(Vec<String>),
}

/// 顶层配置文件结构
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DetectConfig {
    #[serde(default)]
    db: Option<PathBuf>,
    #[serde(default)]
    mode: Option<ModeEntry>,
    /// 参数名 -> 数值（如 bytes_max = 1048576）
    #[serde(default)]
    params: BTreeMap<String, usize>,
}

impl DetectConfig {
    /// 归一化为会话选项；未知的模式名/参数名视为错误
    pub fn to_options(&self) -> Result<SessionOptions> {
        let mode = match &self.mode {
            None => None,
            Some(ModeEntry::Bits(b)) => Some(ModeFlags::from_bits(*b)),
            Some(ModeEntry::Text(s)) => Some(s.parse::<ModeFlags>()?),
            Some(ModeEntry::Names(names)) => Some(ModeFlags::from_names(names)?),
        };
        let mut params = Vec::new();
        for (name, value) in &self.params {
            let p: EngineParam = name.parse()?;
            params.push((p, *value));
        }
        Ok(SessionOptions { db: self.db.clone(), mode, params })
    }
}

/// 解析 TOML 文本
pub fn parse_config(txt: &str) -> Result<DetectConfig> {
    toml::from_str(txt).map_err(|e| anyhow!("invalid detection config: {e}"))
}

/// 从 TOML 配置文件加载；相对的 db 路径按配置文件所在目录解析
pub fn load_config(path: &Path) -> Result<DetectConfig> {
    let txt = std::fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    let mut cfg = parse_config(&txt).with_context(|| format!("parse config {}", path.display()))?;
    if let (Some(db), Some(base)) = (&cfg.db, path.parent()) {
        if db.is_relative() && !db.as_os_str().is_empty() {
            cfg.db = Some(base.join(db));
        }
    }
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_mode_spellings() {
        let a = parse_config("mode = \"raw|check\"").unwrap().to_options().unwrap();
        assert_eq!(a.mode, Some(ModeFlags::RAW | ModeFlags::CHECK));

        let b = parse_config("mode = [\"mime\", \"symlink\"]").unwrap().to_options().unwrap();
        assert_eq!(b.mode, Some(ModeFlags::MIME | ModeFlags::SYMLINK));

        let c = parse_config("mode = 256").unwrap().to_options().unwrap();
        assert_eq!(c.mode, Some(ModeFlags::RAW));
    }

    #[test]
    fn empty_config_means_defaults() {
        let opts = parse_config("").unwrap().to_options().unwrap();
        assert!(opts.is_empty());
    }

    #[test]
    fn params_are_named() {
        let opts = parse_config("[params]\nbytes_max = 1048576\nname_max = 60\n")
            .unwrap()
            .to_options()
            .unwrap();
        assert_eq!(
            opts.params,
            vec![(EngineParam::BytesMax, 1_048_576), (EngineParam::NameMax, 60)]
        );
    }

    #[test]
    fn unknown_names_are_errors() {
        assert!(parse_config("mode = \"sparkly\"").unwrap().to_options().is_err());
        assert!(parse_config("[params]\nwidth = 3\n").unwrap().to_options().is_err());
        assert!(parse_config("colour = \"red\"").is_err());
    }

    #[test]
    fn relative_db_is_resolved_against_config_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("typehunter.toml");
        std::fs::write(&path, "db = \"magic.mgc\"\n").unwrap();
        let opts = load_config(&path).unwrap().to_options().unwrap();
        assert_eq!(opts.db, Some(dir.path().join("magic.mgc")));
    }
}
