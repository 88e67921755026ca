use anyhow::Error;
use std::collections::BTreeMap;
use std::io::{self, Write};
use unicode_width::UnicodeWidthChar;

use crate::core::{Diagnostic, ScanResult};

const MAX_SKIPPED_ROWS: usize = 10;

#[derive(Debug, Clone)]
pub struct UiConfig {
    pub color: bool,
    pub quiet: bool,
    pub verbose: bool,
}

pub fn eprintln_error(err: &Error) {
    let mut stderr = io::stderr().lock();
    let top = err.to_string();
    let _ = writeln!(stderr, "エラー:");
    let _ = writeln!(stderr, "  {top}");

    let mut last = top;
    let mut header = false;
    for cause in err.chain().skip(1) {
        let msg = cause.to_string();
        if msg == last {
            continue;
        }
        if !header {
            let _ = writeln!(stderr, "原因:");
            header = true;
        }
        let _ = writeln!(stderr, "  - {msg}");
        last = msg;
    }

    let _ = writeln!(stderr, "次に:");
    let _ = writeln!(
        stderr,
        "  - 詳細を見るには `--verbose` を付けて再実行してください"
    );
    let _ = writeln!(
        stderr,
        "  - 利用可能なコマンド/オプションは `scanharness --help` を参照してください"
    );
}

pub fn print_scan_result(result: &ScanResult, cfg: &UiConfig) {
    if cfg.quiet {
        return;
    }

    let mut out = io::stdout().lock();
    let _ = writeln!(
        out,
        "概要: 所見={}件  終了コード={}  所要時間={:.1}s",
        result.count,
        result.exit_code,
        result.duration_ms as f64 / 1000.0
    );
    write_summary(&mut out, &result.categories, &result.severities, cfg);
    write_skipped(&mut out, &result.skipped, cfg);
}

pub fn print_counts(
    categories: &BTreeMap<String, u64>,
    severities: &BTreeMap<String, u64>,
    skipped: &[Diagnostic],
    cfg: &UiConfig,
) {
    if cfg.quiet {
        return;
    }

    let mut out = io::stdout().lock();
    let total: u64 = categories.values().sum();
    let _ = writeln!(out, "概要: 所見={total}件");
    write_summary(&mut out, categories, severities, cfg);
    write_skipped(&mut out, skipped, cfg);
}

fn write_summary(
    out: &mut dyn Write,
    categories: &BTreeMap<String, u64>,
    severities: &BTreeMap<String, u64>,
    cfg: &UiConfig,
) {
    if categories.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "所見はありません。");
        return;
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "カテゴリ別:");
    let mut rows: Vec<(&String, &u64)> = categories.iter().collect();
    rows.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
    write_count_table(
        out,
        "カテゴリ",
        rows.into_iter().map(|(k, v)| (k.clone(), *v)).collect(),
    );

    let _ = writeln!(out);
    let _ = writeln!(out, "重大度別:");
    let mut rows: Vec<(&String, &u64)> = severities.iter().collect();
    rows.sort_by(|a, b| severity_rank(a.0).cmp(&severity_rank(b.0)).then_with(|| a.0.cmp(b.0)));
    write_count_table(
        out,
        "重大度",
        rows.into_iter()
            .map(|(k, v)| (format_severity(k, cfg.color), *v))
            .collect(),
    );
}

fn write_skipped(out: &mut dyn Write, skipped: &[Diagnostic], cfg: &UiConfig) {
    if skipped.is_empty() {
        return;
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "スキップしたレコード: {}件", skipped.len());
    let rows = if cfg.verbose {
        skipped.len()
    } else {
        skipped.len().min(MAX_SKIPPED_ROWS)
    };
    for d in skipped.iter().take(rows) {
        let _ = writeln!(out, "- {}行目: {}", d.line, d.reason);
        if cfg.verbose && !d.excerpt.is_empty() {
            let _ = writeln!(out, "  {}", d.excerpt);
        }
    }
    if rows < skipped.len() {
        let _ = writeln!(
            out,
            "  （残り{}件は `--verbose` で表示）",
            skipped.len() - rows
        );
    }
}

fn write_count_table(out: &mut dyn Write, label: &str, rows: Vec<(String, u64)>) {
    let label_count = "件数";

    let label_w = rows
        .iter()
        .map(|(k, _)| visible_width_ansi(k))
        .max()
        .unwrap_or(0)
        .max(visible_width_ansi(label));
    let count_w = rows
        .iter()
        .map(|(_, n)| n.to_string().len())
        .max()
        .unwrap_or(0)
        .max(visible_width_ansi(label_count));

    let _ = writeln!(
        out,
        "{}  {}",
        pad_end_display(label, label_w),
        pad_start_display(label_count, count_w)
    );
    let _ = writeln!(out, "{}  {}", "-".repeat(label_w), "-".repeat(count_w));
    for (k, n) in rows {
        let _ = writeln!(
            out,
            "{}  {}",
            pad_end_display(&k, label_w),
            pad_start_display(&n.to_string(), count_w)
        );
    }
}

fn severity_rank(label: &str) -> u8 {
    match label {
        "critical" => 0,
        "high" => 1,
        "medium" => 2,
        "low" => 3,
        "informational" => 4,
        _ => 5,
    }
}

fn format_severity(label: &str, color: bool) -> String {
    if !color {
        return label.to_string();
    }

    let code = match label {
        "critical" => "35",
        "high" => "31",
        "medium" => "33",
        "low" => "32",
        _ => "90",
    };
    format!("\x1b[{code}m{label}\x1b[0m")
}

fn pad_end_display(s: &str, width: usize) -> String {
    let w = visible_width_ansi(s);
    if w >= width {
        return s.to_string();
    }
    format!("{s}{}", " ".repeat(width - w))
}

fn pad_start_display(s: &str, width: usize) -> String {
    let w = visible_width_ansi(s);
    if w >= width {
        return s.to_string();
    }
    format!("{}{}", " ".repeat(width - w), s)
}

fn visible_width_ansi(s: &str) -> usize {
    let mut width: usize = 0;
    let mut chars = s.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '\x1b' && chars.peek() == Some(&'[') {
            let _ = chars.next();
            for ch2 in chars.by_ref() {
                if ch2 == 'm' {
                    break;
                }
            }
            continue;
        }
        width = width.saturating_add(UnicodeWidthChar::width(ch).unwrap_or(0));
    }
    width
}
