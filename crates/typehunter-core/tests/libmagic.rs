//! 针对真实 libmagic 的集成测试；当前环境无法装载 libmagic 时跳过

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use typehunter_core::{
    check, engine_version, libmagic_available, DetectError, DetectionSession, EngineParam, ModeFlags,
    SessionOptions,
};

const RUBY_SCRIPT: &str = "#!/usr/bin/env ruby\n# frozen_string_literal: true\n\nputs 'hello'\n";

/// 引擎可用且默认数据库可加载时返回 true
fn engine_ready() -> bool {
    if !libmagic_available() {
        eprintln!("skipping: libmagic could not be loaded");
        return false;
    }
    let mut probe = DetectionSession::new(Path::new("."));
    match probe.detect() {
        Ok(_) => true,
        Err(e) => {
            eprintln!("skipping: default database unusable: {e}");
            false
        }
    }
}

fn ruby_fixture() -> (TempDir, PathBuf) {
    let dir = TempDir::new().unwrap();
    let script = dir.path().join("hello.rb");
    fs::write(&script, RUBY_SCRIPT).unwrap();
    (dir, script)
}

fn missing_path(dir: &Path) -> PathBuf {
    dir.join("invalidFileName-0.mp3")
}

#[test]
fn engine_version_is_a_string() {
    let v = engine_version();
    assert!(!v.is_empty());
    if libmagic_available() {
        assert!(v.contains('.'), "unexpected version {v}");
    }
}

#[test]
fn one_shot_check_on_directory() {
    if !engine_ready() {
        return;
    }
    let dir = TempDir::new().unwrap();
    assert_eq!(
        check(dir.path(), &SessionOptions::default()).unwrap(),
        "inode/directory; charset=binary"
    );
}

#[test]
fn one_shot_check_on_ruby_script() {
    if !engine_ready() {
        return;
    }
    let (_dir, script) = ruby_fixture();
    let desc = check(script.as_path(), &SessionOptions::default()).unwrap();
    assert!(desc.contains("ruby"), "unexpected descriptor {desc}");
    assert!(desc.ends_with("charset=us-ascii"), "unexpected descriptor {desc}");
}

#[test]
fn one_shot_overrides_do_not_stick() {
    if !engine_ready() {
        return;
    }
    let dir = TempDir::new().unwrap();
    let raw = SessionOptions::default().with_mode(ModeFlags::RAW);
    assert_eq!(check(dir.path(), &raw).unwrap(), "directory");
    assert_eq!(
        check(dir.path(), &SessionOptions::default()).unwrap(),
        "inode/directory; charset=binary"
    );
}

#[test]
fn multiple_sessions_open_and_close_independently() {
    if !engine_ready() {
        return;
    }
    let (dir, script) = ruby_fixture();
    let mut a = DetectionSession::new(dir.path());
    let mut b = DetectionSession::new(script.as_path());

    assert_eq!(a.detect().unwrap(), "inode/directory; charset=binary");
    assert!(b.detect().unwrap().ends_with("charset=us-ascii"));

    a.close();
    assert!(a.is_closed());
    assert!(!b.is_closed());
    assert!(b.detect().is_ok());

    b.close();
    assert!(b.is_closed());
    b.close();
    assert!(b.is_closed());
    assert!(matches!(b.detect(), Err(DetectError::SessionClosed)));
}

#[test]
fn target_can_change_on_the_fly() {
    if !engine_ready() {
        return;
    }
    let dir = TempDir::new().unwrap();
    let mut s = DetectionSession::new(missing_path(dir.path()));
    s.set_target(dir.path());
    assert_eq!(s.detect().unwrap(), "inode/directory; charset=binary");
    s.close();
}

#[test]
fn database_can_change_on_the_fly() {
    if !engine_ready() {
        return;
    }
    let dir = TempDir::new().unwrap();
    let mut s = DetectionSession::with_options(
        dir.path(),
        SessionOptions::default().with_db(dir.path().join("invalidFileName-0.mgc")),
    );
    assert!(matches!(s.detect(), Err(DetectError::DatabaseLoadError { .. })));
    s.set_database(None);
    assert_eq!(s.detect().unwrap(), "inode/directory; charset=binary");
    s.close();
}

#[test]
fn modes_can_change_on_the_fly() {
    if !engine_ready() {
        return;
    }
    let (dir, script) = ruby_fixture();
    let mut s = DetectionSession::new(dir.path());
    assert_eq!(s.detect().unwrap(), "inode/directory; charset=binary");

    s.set_mode(ModeFlags::RAW);
    assert_eq!(s.detect().unwrap(), "directory");

    s.set_target(script.as_path());
    s.set_mode(ModeFlags::RAW);
    let raw = s.detect().unwrap();
    assert!(raw.starts_with("Ruby script"), "unexpected descriptor {raw}");
    assert!(!raw.contains("charset"));

    s.set_target(dir.path());
    s.set_mode(ModeFlags::MIME_ENCODING);
    assert_eq!(s.detect().unwrap(), "binary");

    s.close();
}

#[test]
fn invalid_filename_is_target_not_found() {
    if !engine_ready() {
        return;
    }
    let dir = TempDir::new().unwrap();
    let mut s = DetectionSession::new(dir.path());
    s.detect().unwrap();
    s.set_target(missing_path(dir.path()));
    assert!(matches!(s.detect(), Err(DetectError::TargetNotFound { .. })));
    s.close();
}

#[test]
fn buffers_and_params() {
    if !engine_ready() {
        return;
    }
    let dir = TempDir::new().unwrap();
    let mut s = DetectionSession::new(dir.path());
    let pdf = s.detect_buffer(b"%PDF-1.3\r\n").unwrap();
    assert!(pdf.starts_with("application/pdf"), "unexpected descriptor {pdf}");

    s.set_param(EngineParam::NameMax, 101).unwrap();
    assert_eq!(s.get_param(EngineParam::NameMax).unwrap(), 101);
    s.set_mode(ModeFlags::RAW);
    assert_eq!(s.get_param(EngineParam::NameMax).unwrap(), 101);
    s.close();
}
