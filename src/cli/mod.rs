use std::io::{self, IsTerminal, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use crate::aggregate::aggregate;
use crate::core::{Diagnostic, ExitCodePolicy};
use crate::engine::Engine;
use crate::exit::{ExitCode, ExitError};
use crate::ui::UiConfig;

#[derive(Debug, Parser)]
#[command(
    name = "scanharness",
    version,
    about = "外部のセキュリティ監査ツールを実行し、所見をカテゴリ別・重大度別に集計する"
)]
pub struct Cli {
    #[arg(long, global = true)]
    pub json: bool,
    #[arg(long = "no-color", global = true)]
    pub no_color: bool,
    #[arg(long, global = true)]
    pub verbose: bool,
    #[arg(long, global = true)]
    pub quiet: bool,
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// ツールを実行して所見を集計する
    Scan(ScanArgs),
    /// 取得済みの出力を解析して集計する
    Parse(ParseArgs),
    Completion(CompletionArgs),
    Config(ConfigArgs),
}

#[derive(Debug, Args)]
pub struct ScanArgs {
    #[arg(long)]
    pub namespace: String,
    #[arg(long)]
    pub tool: String,
    /// 秒数（既定: 設定の scan.timeout_secs）
    #[arg(long)]
    pub timeout: Option<u64>,
    #[arg(long = "env", value_name = "KEY=VALUE")]
    pub env: Vec<String>,
    #[arg(long)]
    pub workdir: Option<PathBuf>,
    #[arg(long)]
    pub namespace_flag: Option<String>,
    #[arg(long)]
    pub fail_on_nonzero: bool,
    /// ツールに渡す追加引数（`--` の後に指定）
    #[arg(last = true)]
    pub args: Vec<String>,
}

#[derive(Debug, Args)]
pub struct ParseArgs {
    /// 省略時は標準入力
    pub file: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct CompletionArgs {
    pub shell: String,
}

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[arg(long)]
    pub show: bool,
}

#[derive(Debug, Serialize)]
struct ParseSummary<'a> {
    categories: &'a std::collections::BTreeMap<String, u64>,
    severities: &'a std::collections::BTreeMap<String, u64>,
    count: u64,
    skipped: &'a [Diagnostic],
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let stdout_is_tty = io::stdout().is_terminal();
    let stderr_is_tty = io::stderr().is_terminal();

    let home_dir = crate::config::home_dir();
    let env_config_path = std::env::var_os("SCANHARNESS_CONFIG").map(PathBuf::from);
    let cfg = crate::config::load(
        cli.config.as_deref().or(env_config_path.as_deref()),
        home_dir.as_deref(),
    )
    .map_err(crate::exit::invalid_args_err)?;

    let ui_cfg = UiConfig {
        color: stdout_is_tty && cfg.ui.color && !cli.no_color,
        quiet: cli.quiet,
        verbose: cli.verbose,
    };

    match cli.command {
        Commands::Scan(args) => {
            let mut req = cfg.scan_request(&args.namespace, &args.tool).args(args.args);
            if let Some(timeout) = args.timeout {
                if timeout == 0 {
                    return Err(crate::exit::invalid_args(
                        "scan: --timeout は 1 以上を指定してください",
                    ));
                }
                req.timeout = Duration::from_secs(timeout);
            }
            for pair in &args.env {
                let (key, value) = parse_env_pair(pair)?;
                req = req.env(key, value);
            }
            if let Some(dir) = args.workdir {
                req = req.working_dir(dir);
            }
            if let Some(flag) = args.namespace_flag {
                req = req.namespace_flag(flag);
            }
            if args.fail_on_nonzero {
                req = req.exit_policy(ExitCodePolicy::FailOnNonZero);
            }

            let engine = Engine::system().with_parser(cfg.parser.clone());

            let pb = if stderr_is_tty && !cli.quiet && !cli.json {
                let pb = indicatif::ProgressBar::new_spinner();
                pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
                pb.set_message(format!("スキャン中 {} ({})", req.namespace, req.tool));
                pb.enable_steady_tick(Duration::from_millis(120));
                Some(pb)
            } else {
                None
            };
            let result = engine.scan(&req);
            if let Some(pb) = pb {
                pb.finish_and_clear();
            }
            let result = result.map_err(crate::exit::scan_err)?;

            if cli.json {
                write_json(&result)?;
            } else {
                crate::ui::print_scan_result(&result, &ui_cfg);
            }
        }
        Commands::Parse(args) => {
            let raw = read_input(args.file.as_deref()).map_err(crate::exit::invalid_args_err)?;
            let parsed = crate::parser::parse_with(&raw, &cfg.parser)
                .map_err(|e| anyhow::Error::from(ExitError::new(ExitCode::ScanFailed, e.into())))?;
            let agg = aggregate(&parsed.findings);

            if cli.json {
                write_json(&ParseSummary {
                    categories: &agg.categories,
                    severities: &agg.severities,
                    count: agg.total(),
                    skipped: &parsed.diagnostics,
                })?;
            } else {
                crate::ui::print_counts(
                    &agg.categories,
                    &agg.severities,
                    &parsed.diagnostics,
                    &ui_cfg,
                );
            }
        }
        Commands::Completion(args) => {
            let shell = parse_shell(&args.shell)?;
            let mut cmd = Cli::command();
            let mut out = std::io::stdout().lock();
            clap_complete::generate(shell, &mut cmd, "scanharness", &mut out);
        }
        Commands::Config(args) => {
            if args.show {
                if cli.json {
                    write_json(&cfg)?;
                } else {
                    println!("{}", toml::to_string_pretty(&cfg)?);
                }
            } else if !ui_cfg.quiet {
                eprintln!("config: `scanharness config --show` を使用してください");
            }
        }
    }

    Ok(())
}

fn init_tracing(verbose: bool, quiet: bool) {
    let level = if verbose {
        "debug"
    } else if quiet {
        "error"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}

fn read_input(path: Option<&Path>) -> Result<String> {
    match path {
        Some(path) if path != Path::new("-") => std::fs::read_to_string(path)
            .with_context(|| format!("入力ファイルの読み取りに失敗しました: {}", path.display())),
        _ => {
            let mut s = String::new();
            io::stdin()
                .lock()
                .read_to_string(&mut s)
                .context("標準入力の読み取りに失敗しました")?;
            Ok(s)
        }
    }
}

fn parse_env_pair(s: &str) -> Result<(String, String)> {
    match s.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(crate::exit::invalid_args(format!(
            "scan: --env は KEY=VALUE 形式で指定してください: {s}"
        ))),
    }
}

fn write_json<T: Serialize>(value: &T) -> Result<()> {
    use std::io::Write;

    let buf = serde_json::to_vec_pretty(value)?;

    let mut stdout = std::io::stdout().lock();
    match stdout.write_all(&buf) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::BrokenPipe => return Ok(()),
        Err(err) => return Err(err.into()),
    }
    match stdout.write_all(b"\n") {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
        Err(err) => Err(err.into()),
    }
}

fn parse_shell(s: &str) -> Result<clap_complete::Shell> {
    let s = s.trim().to_ascii_lowercase();
    match s.as_str() {
        "bash" => Ok(clap_complete::Shell::Bash),
        "zsh" => Ok(clap_complete::Shell::Zsh),
        "fish" => Ok(clap_complete::Shell::Fish),
        other => Err(crate::exit::invalid_args(format!(
            "未対応のシェルです: {other}（bash|zsh|fish を指定してください）"
        ))),
    }
}
