use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{error, info};
use typehunter_core::{
    check, default_database, engine_version, libmagic_available, load_config, scan_and_write,
    DetectionSession, EngineParam, ModeFlags, ScanOptions, SessionOptions,
};

/// 命令行入口（基于 clap）
#[derive(Parser, Debug)]
#[command(name = "typehunter", version, about = "基于签名数据库的文件类型检测")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// 各子命令共用的检测参数
#[derive(clap::Args, Debug)]
struct DetectArgs {
    /// 签名数据库路径，默认使用安装位置或 $MAGIC
    #[arg(long)]
    db: Option<PathBuf>,

    /// 检测模式，如 raw、mime-encoding、mime|check
    #[arg(long)]
    mode: Option<ModeFlags>,

    /// 配置文件路径（TOML）；命令行参数优先
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 检测若干文件并逐行输出 "路径: 描述"
    Check {
        /// 待检测的文件或目录
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        #[command(flatten)]
        detect: DetectArgs,
    },
    /// 遍历目录并生成 JSON 结果
    Scan {
        /// 输入目录
        #[arg(long)]
        input: PathBuf,

        /// 输出文件（JSON 数组）
        #[arg(long, default_value = "./result.json")]
        output: PathBuf,

        /// 线程数（"auto"=CPU 核心数）
        #[arg(long, default_value = "auto")]
        threads: String,

        /// 最大检测文件大小（单位字节）
        #[arg(long)]
        max_file_size: Option<u64>,

        /// 只输出描述匹配该正则的结果，如 "^text/"
        #[arg(long)]
        only: Option<String>,

        /// 目录遍历深度
        #[arg(long)]
        max_depth: Option<usize>,

        #[command(flatten)]
        detect: DetectArgs,
    },
    /// 列出可用的检测模式与引擎参数
    Modes,
    /// 显示引擎版本与默认数据库
    Info {
        /// 同时读取当前默认会话下的引擎参数
        #[arg(long)]
        params: bool,
    },
}

fn main() -> Result<()> {
    // 初始化日志（支持通过 RUST_LOG 控制等级，例如 info、debug）
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Check { paths, detect } => {
            let opts = session_options(&detect)?;
            let mut failed = 0usize;
            for path in &paths {
                match check(path.as_path(), &opts) {
                    Ok(desc) => println!("{}: {}", path.display(), desc),
                    Err(e) => {
                        error!(path = %path.display(), error = %e, "detection failed");
                        failed += 1;
                    }
                }
            }
            if failed > 0 {
                bail!("{failed} of {} detections failed", paths.len());
            }
        }
        Commands::Scan { input, output, threads, max_file_size, only, max_depth, detect } => {
            info!(?input, ?output, "starting scan");
            let session = session_options(&detect)?;

            // 以缓冲方式打开输出文件，按 JSON 数组流式写入
            let mut out = BufWriter::new(File::create(&output).context("create output file")?);
            let opts = ScanOptions { max_file_size, threads: parse_threads(&threads), only, max_depth };
            let stats = scan_and_write(&input, &mut out, &opts, &session).context("scan and write failed")?;
            out.flush().context("flush output file")?;

            info!(
                files_scanned = stats.files_scanned,
                failures = stats.failures,
                outputs_written = stats.outputs_written,
                "scan finished"
            );
        }
        Commands::Modes => {
            println!("modes:");
            for (name, flag) in ModeFlags::NAMED {
                println!("  {:<20} {:#09x}", name, flag.bits());
            }
            println!("params:");
            for (name, param) in EngineParam::ALL {
                println!("  {:<20} {}", name, param.code());
            }
        }
        Commands::Info { params } => {
            println!("engine version: {}", engine_version());
            println!("libmagic loaded: {}", libmagic_available());
            match default_database() {
                Some(db) => println!("default database: {}", db.display()),
                None => println!("default database: <engine default>"),
            }
            if params {
                print_params()?;
            }
        }
    }

    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, FmtSubscriber};
    // 支持通过环境变量 RUST_LOG 控制日志等级，如：RUST_LOG=debug
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// 合并配置文件与命令行参数（命令行优先）
fn session_options(args: &DetectArgs) -> Result<SessionOptions> {
    let mut opts = match &args.config {
        Some(path) => load_config(path)?.to_options()?,
        None => SessionOptions::default(),
    };
    if let Some(db) = &args.db {
        opts.db = Some(db.clone());
    }
    if let Some(mode) = args.mode {
        opts.mode = Some(mode);
    }
    Ok(opts)
}

fn print_params() -> Result<()> {
    let mut session = DetectionSession::new(Path::new("."));
    for (name, param) in EngineParam::ALL {
        let value = session.get_param(param).context("read engine parameter")?;
        println!("  {name:<20} {value}");
    }
    session.close();
    Ok(())
}

/// 解析线程参数
fn parse_threads(s: &str) -> Option<usize> {
    if s.eq_ignore_ascii_case("auto") { return None; }
    match s.parse::<usize>() {
        Ok(n) if n >= 1 => Some(n),
        _ => None,
    }
}
