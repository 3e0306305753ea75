//! 批量检测主流程与并行调度
use anyhow::{Context, Result};
use regex::Regex;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::engine::Backend;
use crate::error::DetectError;
use crate::magic::LibMagic;
use crate::options::{ScanOptions, ScanStats, SessionOptions};
use crate::session::DetectionSession;
use crate::types::{DetectionRecord, Target};

/// 单个文件的检测结果
enum Outcome {
    Detected(String),
    Skipped,
    Failed(DetectError),
}

/// 遍历目录、逐个检测文件类型，并将结果以 JSON 数组流式写入 `out`
/// 稳定性保证：文件按路径排序，输出顺序与线程数无关
pub fn scan_and_write(
    input_dir: &Path,
    out: &mut dyn Write,
    opts: &ScanOptions,
    session: &SessionOptions,
) -> Result<ScanStats> {
    let default_db = crate::global::default_database().map(Path::to_path_buf);
    scan_and_write_with(LibMagic, default_db, input_dir, out, opts, session)
}

/// 同 `scan_and_write`，但注入引擎与默认数据库
pub fn scan_and_write_with<B>(
    backend: B,
    default_db: Option<PathBuf>,
    input_dir: &Path,
    out: &mut dyn Write,
    opts: &ScanOptions,
    session: &SessionOptions,
) -> Result<ScanStats>
where
    B: Backend + Clone + Send + Sync,
{
    let only = match &opts.only {
        Some(pat) => Some(Regex::new(pat).with_context(|| format!("invalid descriptor filter {pat:?}"))?),
        None => None,
    };

    let mut walker = WalkDir::new(input_dir).min_depth(1).follow_links(false);
    if let Some(depth) = opts.max_depth {
        walker = walker.max_depth(depth);
    }
    let mut files: Vec<PathBuf> = vec![];
    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                debug!(error = %e, "skipping unreadable entry");
                continue;
            }
        };
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    // 按路径排序，确保输出顺序稳定
    files.sort();

    let new_session = || {
        DetectionSession::with_backend(
            backend.clone(),
            Target::Buffer(Vec::new()),
            default_db.clone(),
            session.clone(),
        )
    };

    let threads = opts.threads.unwrap_or_else(num_cpus::get);
    let mut writer = RecordWriter::new(out, only.as_ref());
    writer.begin()?;

    if threads > 1 && files.len() > 1 {
        scan_parallel(&files, opts.max_file_size, threads, new_session, &mut writer)?;
    } else {
        let mut s = new_session();
        for path in &files {
            let outcome = detect_one(&mut s, path, opts.max_file_size);
            writer.push(path, outcome)?;
        }
        s.close();
    }

    writer.finish()
}

/// 并行调度：
/// - 池内启动 `threads` 个工作者，各自持有一个会话（句柄从不共享），从共享游标领取文件
/// - 单线程 Writer 按 idx 重排并流式写 JSON，保证稳定顺序
fn scan_parallel<B, F>(
    files: &[PathBuf],
    max_file_size: Option<u64>,
    threads: usize,
    new_session: F,
    writer: &mut RecordWriter<'_>,
) -> Result<()>
where
    B: Backend + Send,
    F: Fn() -> DetectionSession<B> + Sync,
{
    use crossbeam_channel as channel;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build()
        .context("build rayon pool")?;

    let (tx, rx) = channel::bounded::<(usize, Outcome)>(256);
    let cursor = AtomicUsize::new(0);

    std::thread::scope(|scope| -> Result<()> {
        let worker = scope.spawn(|| {
            let new_session = &new_session;
            let cursor = &cursor;
            pool.scope(|s| {
                for _ in 0..threads {
                    let tx = tx.clone();
                    s.spawn(move |_| {
                        let mut session = new_session();
                        loop {
                            let idx = cursor.fetch_add(1, Ordering::Relaxed);
                            let Some(path) = files.get(idx) else { break };
                            let outcome = detect_one(&mut session, path, max_file_size);
                            // Receiver 已丢弃说明写出端中止
                            if tx.send((idx, outcome)).is_err() {
                                break;
                            }
                        }
                        session.close();
                    });
                }
            });
            // 结束后 Sender 全部被丢弃，Receiver 将收到关闭信号
            drop(tx);
        });

        let mut next_idx: usize = 0;
        let mut buffer: BTreeMap<usize, Outcome> = BTreeMap::new();
        let mut result = Ok(());
        while let Ok((idx, outcome)) = rx.recv() {
            buffer.insert(idx, outcome);
            while let Some(outcome) = buffer.remove(&next_idx) {
                if let Err(e) = writer.push(&files[next_idx], outcome) {
                    result = Err(e);
                    break;
                }
                next_idx += 1;
            }
            if result.is_err() {
                break;
            }
        }
        // 提前退出时丢弃 Receiver，阻塞中的发送方会立即返回
        drop(rx);
        let _ = worker.join();
        result
    })
}

fn detect_one<B: Backend>(session: &mut DetectionSession<B>, path: &Path, max_file_size: Option<u64>) -> Outcome {
    if let Some(max) = max_file_size {
        if let Ok(md) = std::fs::metadata(path) {
            if md.len() > max {
                return Outcome::Skipped;
            }
        }
    }
    match session.detect_path(path) {
        Ok(desc) => Outcome::Detected(desc),
        Err(e) => Outcome::Failed(e),
    }
}

/// JSON 数组写出器：负责过滤、统计，以及区分致命错误
struct RecordWriter<'a> {
    out: &'a mut dyn Write,
    only: Option<&'a Regex>,
    first: bool,
    stats: ScanStats,
}

impl<'a> RecordWriter<'a> {
    fn new(out: &'a mut dyn Write, only: Option<&'a Regex>) -> Self {
        Self { out, only, first: true, stats: ScanStats::default() }
    }

    fn begin(&mut self) -> Result<()> {
        write!(self.out, "[")?;
        Ok(())
    }

    fn push(&mut self, path: &Path, outcome: Outcome) -> Result<()> {
        match outcome {
            Outcome::Skipped => Ok(()),
            Outcome::Failed(e @ (DetectError::DatabaseLoadError { .. } | DetectError::SessionClosed)) => {
                // 数据库不可用时每个文件都会失败，直接中止
                Err(e).context("detection aborted")
            }
            Outcome::Failed(e) => {
                warn!(path = %path.display(), error = %e, "detection failed");
                self.stats.failures += 1;
                Ok(())
            }
            Outcome::Detected(desc) => {
                self.stats.files_scanned += 1;
                if let Some(re) = self.only {
                    if !re.is_match(&desc) {
                        return Ok(());
                    }
                }
                let path_str = path.display().to_string();
                let item = DetectionRecord { path: &path_str, descriptor: &desc };
                if !self.first {
                    write!(self.out, ",")?;
                } else {
                    self.first = false;
                }
                serde_json::to_writer(&mut *self.out, &item)?;
                self.stats.outputs_written += 1;
                Ok(())
            }
        }
    }

    fn finish(self) -> Result<ScanStats> {
        write!(self.out, "]")?;
        Ok(self.stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::ScriptedBackend;
    use std::fs;
    use tempfile::TempDir;

    fn corpus() -> (TempDir, ScriptedBackend) {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("nested");
        fs::create_dir(&nested).unwrap();
        let a = dir.path().join("a.rb");
        let b = dir.path().join("b.txt");
        let c = nested.join("c.pdf");
        fs::write(&a, "puts 1\n").unwrap();
        fs::write(&b, "hello\n").unwrap();
        fs::write(&c, vec![b'%'; 64]).unwrap();
        let backend = ScriptedBackend::default()
            .answer(&a, "text/x-ruby")
            .answer(&b, "text/plain")
            .answer(&c, "application/pdf");
        (dir, backend)
    }

    fn run(dir: &Path, backend: ScriptedBackend, opts: &ScanOptions) -> (serde_json::Value, ScanStats) {
        let mut out = Vec::new();
        let stats = scan_and_write_with(backend, None, dir, &mut out, opts, &SessionOptions::default()).unwrap();
        (serde_json::from_slice(&out).unwrap(), stats)
    }

    #[test]
    fn serial_and_parallel_agree() {
        let (dir, backend) = corpus();
        let serial = ScanOptions { threads: Some(1), ..Default::default() };
        let parallel = ScanOptions { threads: Some(4), ..Default::default() };
        let (a, sa) = run(dir.path(), backend.clone(), &serial);
        let (b, sb) = run(dir.path(), backend, &parallel);
        assert_eq!(a, b);
        assert_eq!(sa.files_scanned, 3);
        assert_eq!(sb.outputs_written, 3);

        let descs: Vec<&str> = a.as_array().unwrap().iter().map(|v| v["descriptor"].as_str().unwrap()).collect();
        assert_eq!(
            descs,
            vec!["text/x-ruby; charset=binary", "text/plain; charset=binary", "application/pdf; charset=binary"]
        );
    }

    #[test]
    fn filter_size_and_depth() {
        let (dir, backend) = corpus();
        let opts = ScanOptions { threads: Some(1), only: Some("^text/".into()), ..Default::default() };
        let (v, stats) = run(dir.path(), backend.clone(), &opts);
        assert_eq!(v.as_array().unwrap().len(), 2);
        assert_eq!(stats.files_scanned, 3);

        let opts = ScanOptions { threads: Some(1), max_file_size: Some(10), ..Default::default() };
        let (_, stats) = run(dir.path(), backend.clone(), &opts);
        assert_eq!(stats.files_scanned, 2);

        let opts = ScanOptions { threads: Some(1), max_depth: Some(1), ..Default::default() };
        let (_, stats) = run(dir.path(), backend, &opts);
        assert_eq!(stats.files_scanned, 2);
    }

    #[test]
    fn each_worker_keeps_one_session() {
        let dir = TempDir::new().unwrap();
        let mut backend = ScriptedBackend::default();
        for i in 0..64 {
            let path = dir.path().join(format!("f{i:02}.txt"));
            fs::write(&path, b"x").unwrap();
            backend = backend.answer(path, "text/plain");
        }
        let (v, stats) = run(dir.path(), backend.clone(), &ScanOptions { threads: Some(2), ..Default::default() });
        assert_eq!(v.as_array().unwrap().len(), 64);
        assert_eq!(stats.files_scanned, 64);
        assert!(backend.opened() <= 2, "opened {} sessions", backend.opened());
        assert_eq!(backend.opened(), backend.dropped());
    }

    #[test]
    fn per_file_failures_are_counted() {
        let (dir, backend) = corpus();
        fs::write(dir.path().join("unknown.bin"), b"\x00").unwrap();
        let (v, stats) = run(dir.path(), backend, &ScanOptions { threads: Some(2), ..Default::default() });
        assert_eq!(stats.failures, 1);
        assert_eq!(v.as_array().unwrap().len(), 3);
    }

    #[test]
    fn missing_database_aborts() {
        let (dir, backend) = corpus();
        let session = SessionOptions::default().with_db(dir.path().join("missing.mgc"));
        let mut out = Vec::new();
        let res = scan_and_write_with(
            backend,
            None,
            dir.path(),
            &mut out,
            &ScanOptions { threads: Some(1), ..Default::default() },
            &session,
        );
        assert!(res.is_err());
    }

    #[test]
    fn invalid_filter_is_rejected() {
        let (dir, backend) = corpus();
        let mut out = Vec::new();
        let opts = ScanOptions { only: Some("(".into()), ..Default::default() };
        assert!(scan_and_write_with(backend, None, dir.path(), &mut out, &opts, &SessionOptions::default()).is_err());
    }
}
