use std::{
    collections::BTreeSet,
    fs,
    io::{self, BufRead, Write},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate, NaiveTime};
use clap::{Args, Parser, Subcommand};
use notetimer::core::{ButtonLabels, LogRow, LogStyle, TimerBlock, TimerConfig, TimerError, TimerId};
use notetimer::locate::{find_log_table, find_timer_block, find_timer_blocks};
use notetimer::mutate::{recompute_total, sum_durations};
use notetimer::registry::TimerRegistry;
use notetimer::session::{append_log_row, log_session, persist_identifier};
use notetimer::stopwatch::{ElapsedParts, FinishedSession, RefreshHandle};
use notetimer::storage::{FsNoteStore, JsonSettingsStore, NoteStore, SettingsStore};
use notetimer::table::format_marker;

#[derive(Debug, Parser)]
#[command(
    name = "notetimer",
    about = "Stopwatches for markdown notes, logged into embedded tables",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    /// Settings JSON path; defaults apply when omitted or missing.
    #[arg(long, global = true)]
    settings: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List the timer blocks and log tables found in notes.
    Blocks(BlocksArgs),

    /// Append a log row to a note's timer table.
    Log(LogArgs),

    /// Recompute the running totals of interval log tables.
    Total(TotalArgs),

    /// Ensure a timer block carries a persisted identifier.
    Stamp(StampArgs),

    /// Drive a block's stopwatch interactively.
    Run(RunArgs),
}

#[derive(Debug, Args)]
struct BlocksArgs {
    /// Markdown notes or directories containing notes to scan.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Emit JSON instead of a human-readable list.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct LogArgs {
    /// The note holding the timer block.
    note: PathBuf,
    /// Duration cell value, e.g. 00:05:32 (dated) or 0.500 (interval).
    #[arg(long)]
    duration: String,
    /// Row date (YYYY-MM-DD). Defaults to today.
    #[arg(long)]
    date: Option<NaiveDate>,
    /// Zero-based index of the timer block inside the note.
    #[arg(long, default_value_t = 0)]
    block: usize,
}

#[derive(Debug, Args)]
struct TotalArgs {
    /// Markdown notes or directories containing notes to refresh.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
}

#[derive(Debug, Args)]
struct StampArgs {
    /// The note holding the timer block.
    note: PathBuf,
    /// Zero-based index of the timer block inside the note.
    #[arg(long, default_value_t = 0)]
    block: usize,
}

#[derive(Debug, Args)]
struct RunArgs {
    /// The note holding the timer block.
    note: PathBuf,
    /// Zero-based index of the timer block inside the note.
    #[arg(long, default_value_t = 0)]
    block: usize,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = cli.verbose;
    let config = load_config(cli.settings.as_deref(), verbose)?;
    match cli.command {
        Commands::Blocks(args) => handle_blocks(args, &config, verbose),
        Commands::Log(args) => handle_log(args, &config, verbose),
        Commands::Total(args) => handle_total(args, verbose),
        Commands::Stamp(args) => handle_stamp(args, verbose),
        Commands::Run(args) => handle_run(args, &config, verbose),
    }
}

fn load_config(path: Option<&Path>, verbose: bool) -> Result<TimerConfig> {
    match path {
        Some(path) => {
            if verbose {
                eprintln!("Loading settings from {:?}", path);
            }
            JsonSettingsStore::new(path).load_config()
        }
        None => Ok(TimerConfig::default()),
    }
}

#[derive(Debug, serde::Serialize)]
struct BlockReport {
    path: String,
    block: usize,
    fence_start: usize,
    fence_end: usize,
    uid: Option<String>,
    auto_log: bool,
    log_style: LogStyle,
    rows: Option<usize>,
    total: Option<f64>,
}

fn handle_blocks(args: BlocksArgs, config: &TimerConfig, verbose: bool) -> Result<()> {
    let BlocksArgs { inputs, json } = args;
    let expanded = expand_inputs(&inputs, verbose)?;
    if expanded.is_empty() {
        anyhow::bail!("no markdown notes found in the provided inputs");
    }

    let store = FsNoteStore;
    let mut reports = Vec::new();
    for path in expanded {
        if verbose {
            eprintln!("Scanning {:?}", path);
        }
        let text = store.read_note(&path)?;
        let mut from = 0;
        let mut index = 0;
        loop {
            match find_timer_block(&text, from) {
                Ok(Some(block)) => {
                    let table = match find_log_table(&text, block.fence.end) {
                        Ok(table) => table,
                        Err(err) => {
                            eprintln!("warning: {:?}: {}", path, err);
                            None
                        }
                    };
                    reports.push(report_for(&path, index, &block, table.as_ref(), config));
                    from = block.fence.end;
                    index += 1;
                }
                Ok(None) => break,
                Err(TimerError::UnterminatedBlock(start)) => {
                    eprintln!(
                        "warning: {:?}: timer block at offset {} never closes; it reads to the end of the note and logging is disabled",
                        path, start
                    );
                    break;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else if reports.is_empty() {
        eprintln!("No timer blocks found in the provided inputs.");
    } else {
        for report in &reports {
            let uid = report.uid.as_deref().unwrap_or("-");
            let rows = report
                .rows
                .map(|n| n.to_string())
                .unwrap_or_else(|| "no table".to_string());
            let total = report
                .total
                .map(|t| format!(", total {:.3}", t))
                .unwrap_or_default();
            println!(
                "{} #{}: bytes {}..{}, style {}, auto-log {}, uid {}, rows {}{}",
                report.path,
                report.block,
                report.fence_start,
                report.fence_end,
                style_name(report.log_style),
                report.auto_log,
                uid,
                rows,
                total
            );
        }
    }
    Ok(())
}

fn report_for(
    path: &Path,
    index: usize,
    block: &TimerBlock,
    table: Option<&notetimer::core::LogTable>,
    config: &TimerConfig,
) -> BlockReport {
    let effective = config.merged(&block.options);
    BlockReport {
        path: path.display().to_string(),
        block: index,
        fence_start: block.fence.start,
        fence_end: block.fence.end,
        uid: block.options.timer_uid.clone(),
        auto_log: effective.auto_log,
        log_style: effective.log_style,
        rows: table.map(|t| t.rows.len()),
        total: table
            .filter(|t| t.total_line.is_some())
            .map(|t| sum_durations(&t.rows)),
    }
}

fn style_name(style: LogStyle) -> &'static str {
    match style {
        LogStyle::Dated => "dated",
        LogStyle::Interval => "interval",
    }
}

fn handle_log(args: LogArgs, config: &TimerConfig, verbose: bool) -> Result<()> {
    let LogArgs {
        note,
        duration,
        date,
        block,
    } = args;

    let store = FsNoteStore;
    let text = store.read_note(&note)?;
    let blocks = find_timer_blocks(&text)?;
    let target = blocks
        .get(block)
        .with_context(|| format!("{:?} has no timer block #{}", note, block))?;
    let effective = config.merged(&target.options);

    let stamp = match date {
        Some(date) => date.and_time(NaiveTime::MIN),
        None => Local::now().naive_local(),
    };
    let marker = format_marker(stamp, &effective.date_format, effective.date_linking);
    let row = match effective.log_style {
        LogStyle::Dated => LogRow {
            start: marker,
            stop: None,
            duration,
        },
        LogStyle::Interval => LogRow {
            start: marker.clone(),
            stop: Some(marker),
            duration,
        },
    };

    if verbose {
        eprintln!("Appending to {:?}", note);
    }
    let outcome = append_log_row(&store, &note, target, &effective, &row)?;
    if outcome.created_table {
        println!("Created a new log table in {:?}", note);
    }
    println!("Logged {}", outcome.row);
    if let Some(total) = outcome.total {
        println!("Total Time: {total:.3}");
    }
    Ok(())
}

fn handle_total(args: TotalArgs, verbose: bool) -> Result<()> {
    let TotalArgs { inputs } = args;
    let expanded = expand_inputs(&inputs, verbose)?;
    if expanded.is_empty() {
        anyhow::bail!("no markdown notes found in the provided inputs");
    }

    let store = FsNoteStore;
    for path in expanded {
        if verbose {
            eprintln!("Refreshing totals in {:?}", path);
        }
        let text = store.read_note(&path)?;
        let (updated, totals) = recompute_note_totals(&text)?;
        if updated != text {
            store.write_note(&path, &updated)?;
        }
        if totals.is_empty() {
            println!("{}: no interval tables", path.display());
        } else {
            for (index, total) in totals.iter().enumerate() {
                println!("{} #{}: Total Time: {:.3}", path.display(), index, total);
            }
        }
    }
    Ok(())
}

/// Refreshes every block's interval total in one note, re-locating after
/// each rewrite because a changed total line shifts later offsets.
fn recompute_note_totals(text: &str) -> Result<(String, Vec<f64>)> {
    let mut current = text.to_string();
    let mut totals = Vec::new();
    let mut index = 0;
    loop {
        let blocks = find_timer_blocks(&current)?;
        let Some(block) = blocks.get(index) else {
            break;
        };
        if let Some(table) = find_log_table(&current, block.fence.end)? {
            if table.total_line.is_some() {
                totals.push(sum_durations(&table.rows));
                current = recompute_total(&current, &table);
            }
        }
        index += 1;
    }
    Ok((current, totals))
}

fn handle_stamp(args: StampArgs, verbose: bool) -> Result<()> {
    let StampArgs { note, block } = args;
    let store = FsNoteStore;
    let text = store.read_note(&note)?;
    let blocks = find_timer_blocks(&text)?;
    let target = blocks
        .get(block)
        .with_context(|| format!("{:?} has no timer block #{}", note, block))?;

    if let Some(uid) = &target.options.timer_uid {
        println!("Block #{block} already carries identifier {uid}");
        return Ok(());
    }

    let minted = TimerId::new();
    persist_identifier(&store, &note, target, &minted.to_string())?;
    if verbose {
        eprintln!("Stamped {:?}", note);
    }
    println!("Stamped identifier {minted} into block #{block}");
    Ok(())
}

fn handle_run(args: RunArgs, config: &TimerConfig, verbose: bool) -> Result<()> {
    let RunArgs { note, block } = args;
    let store = FsNoteStore;
    let mut registry = TimerRegistry::new();

    let text = store.read_note(&note)?;
    let blocks = find_timer_blocks(&text)?;
    let mut target = blocks
        .get(block)
        .with_context(|| format!("{:?} has no timer block #{}", note, block))?
        .clone();
    let effective = config.merged(&target.options);

    let attached = registry.get_or_create(target.options.timer_uid.as_deref());
    if let Some(minted) = attached.minted {
        persist_identifier(&store, &note, &target, &minted.to_string())?;
        if verbose {
            eprintln!("Stamped identifier {} into {:?}", minted, note);
        }
        // Reload so table offsets account for the stamped body.
        let text = store.read_note(&note)?;
        target = find_timer_blocks(&text)?
            .into_iter()
            .nth(block)
            .context("timer block vanished after stamping")?;
    }
    let watch = attached.stopwatch;

    let reset_help = if effective.show_reset_button {
        format!("reset [{}], ", button_label("reset", &effective))
    } else {
        String::new()
    };
    let help = format!(
        "commands: start [{}], stop [{}], {}log, quit",
        button_label("start", &effective),
        button_label("stop", &effective),
        reset_help
    );
    println!("{help}");

    let stdin = io::stdin();
    print_prompt()?;
    for line in stdin.lock().lines() {
        let line = line.context("reading stdin")?;
        let cmd = line.trim();

        if cmd.eq_ignore_ascii_case("quit") || cmd.eq_ignore_ascii_case("q") {
            break;
        } else if is_cmd(cmd, "start", &effective.start_button_text) {
            if watch.borrow_mut().start() {
                let since = watch.borrow().running_since().unwrap_or_else(Instant::now);
                watch
                    .borrow_mut()
                    .attach_refresh(spawn_ticker(since, effective.ms_display));
                println!("started");
            } else {
                println!("already running");
            }
        } else if is_cmd(cmd, "stop", &effective.stop_button_text) {
            let finished = watch.borrow_mut().stop();
            match finished {
                Some(finished) => {
                    println!(
                        "stopped at {}",
                        ElapsedParts::from_duration(finished.elapsed).clock(effective.ms_display)
                    );
                    if effective.auto_log {
                        let outcome = log_session(&store, &note, &target, &effective, &finished)?;
                        println!("logged {}", outcome.row);
                        if let Some(total) = outcome.total {
                            println!("Total Time: {total:.3}");
                        }
                    }
                }
                None => println!("not running"),
            }
        } else if is_cmd(cmd, "reset", &effective.reset_button_text) {
            if effective.show_reset_button {
                watch
                    .borrow_mut()
                    .reset(effective.continue_running_on_reset);
                println!("reset");
            } else {
                println!("reset is disabled for this block");
            }
        } else if cmd.eq_ignore_ascii_case("log") {
            // Log what the display shows right now, without stopping.
            let (started, elapsed) = {
                let watch = watch.borrow();
                (watch.started_at(), watch.elapsed())
            };
            let stopped = Local::now().naive_local();
            let finished = FinishedSession {
                started: started.unwrap_or(stopped),
                stopped,
                elapsed,
            };
            let outcome = log_session(&store, &note, &target, &effective, &finished)?;
            println!("logged {}", outcome.row);
            if let Some(total) = outcome.total {
                println!("Total Time: {total:.3}");
            }
        } else if !cmd.is_empty() {
            println!("{help}");
        }
        print_prompt()?;
    }
    Ok(())
}

fn is_cmd(input: &str, canonical: &str, label: &str) -> bool {
    input.eq_ignore_ascii_case(canonical) || input.eq_ignore_ascii_case(label)
}

fn print_prompt() -> Result<()> {
    print!("timer> ");
    io::stdout().flush().context("flushing prompt")
}

fn button_label(kind: &str, config: &TimerConfig) -> String {
    match config.button_labels {
        ButtonLabels::Icons => match kind {
            "start" => "▶",
            "stop" => "⏸",
            "reset" => "🔄",
            _ => kind,
        }
        .to_string(),
        ButtonLabels::Text => match kind {
            "start" => config.start_button_text.clone(),
            "stop" => config.stop_button_text.clone(),
            "reset" => config.reset_button_text.clone(),
            _ => kind.to_string(),
        },
    }
}

/* ------------------------------ Ticker ------------------------------ */

/// Thread-backed display refresh; cancelling joins the thread so at most
/// one ticker redraws at a time.
struct ThreadTicker {
    stop: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl RefreshHandle for ThreadTicker {
    fn cancel(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

fn spawn_ticker(started: Instant, ms: bool) -> Box<dyn RefreshHandle> {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    let period = if ms {
        Duration::from_millis(50)
    } else {
        Duration::from_secs(1)
    };
    let thread = thread::spawn(move || {
        while !flag.load(Ordering::Relaxed) {
            let clock = ElapsedParts::from_duration(started.elapsed()).clock(ms);
            print!("\r{clock} ");
            let _ = io::stdout().flush();
            thread::sleep(period);
        }
    });
    Box::new(ThreadTicker {
        stop,
        thread: Some(thread),
    })
}

/* ------------------------------ Inputs ------------------------------ */

fn expand_inputs(paths: &[PathBuf], verbose: bool) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut visited = BTreeSet::new();
    for path in paths {
        let canonical =
            fs::canonicalize(path).with_context(|| format!("resolving path {:?}", path))?;
        let meta = fs::metadata(&canonical)
            .with_context(|| format!("reading metadata for {:?}", canonical))?;
        if meta.is_dir() {
            if verbose {
                eprintln!("Scanning directory {:?}", canonical);
            }
            for file in collect_md_files(&canonical)? {
                if visited.insert(file.clone()) {
                    out.push(file);
                }
            }
        } else if meta.is_file() {
            if is_markdown(&canonical) {
                if visited.insert(canonical.clone()) {
                    out.push(canonical);
                }
            } else {
                anyhow::bail!("{:?} is not a markdown note", canonical);
            }
        }
    }
    Ok(out)
}

fn collect_md_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    visit_dir(dir, &mut out)?;
    out.sort();
    out.dedup();
    Ok(out)
}

fn visit_dir(path: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(path).with_context(|| format!("reading directory {:?}", path))? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_symlink() {
            continue;
        }
        let entry_path = entry.path();
        if file_type.is_dir() {
            visit_dir(&entry_path, out)?;
        } else if is_markdown(&entry_path) {
            out.push(entry_path);
        }
    }
    Ok(())
}

fn is_markdown(path: &Path) -> bool {
    path.extension().map(|ext| ext == "md").unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn expand_inputs_collects_markdown_recursively() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let sub = tmp.path().join("daily");
        fs::create_dir_all(&sub).expect("mkdir");
        fs::write(tmp.path().join("a.md"), "# a").expect("write a");
        fs::write(tmp.path().join("b.txt"), "not a note").expect("write b");
        fs::write(sub.join("c.md"), "# c").expect("write c");

        let found =
            expand_inputs(&[tmp.path().to_path_buf()], false).expect("inputs should expand");
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|p| is_markdown(p)));
    }

    #[test]
    fn expand_inputs_rejects_a_non_markdown_file() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let other = tmp.path().join("note.txt");
        fs::write(&other, "plain").expect("write");

        let err = expand_inputs(&[other], false).expect_err("txt input should be rejected");
        assert!(err.to_string().contains("not a markdown note"));
    }

    #[test]
    fn log_command_appends_a_row_end_to_end() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let note = tmp.path().join("note.md");
        fs::write(&note, "```timer\n```\n").expect("seed note");

        let args = LogArgs {
            note: note.clone(),
            duration: "00:00:10".to_string(),
            date: NaiveDate::from_ymd_opt(2024, 1, 1),
            block: 0,
        };
        handle_log(args, &TimerConfig::default(), false).expect("log should succeed");

        let text = fs::read_to_string(&note).expect("read note");
        assert!(text.contains("###### Timer Log"));
        assert!(text.contains("| 2024-01-01 | 00:00:10 |  |"));
    }

    #[test]
    fn stamp_command_persists_an_identifier_once() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let note = tmp.path().join("note.md");
        fs::write(&note, "```timer\nlog: true\n```\n").expect("seed note");

        handle_stamp(
            StampArgs {
                note: note.clone(),
                block: 0,
            },
            false,
        )
        .expect("first stamp should succeed");
        let stamped = fs::read_to_string(&note).expect("read note");
        assert!(stamped.contains("_timerUID: "));

        handle_stamp(
            StampArgs {
                note: note.clone(),
                block: 0,
            },
            false,
        )
        .expect("second stamp should be a no-op");
        let unchanged = fs::read_to_string(&note).expect("read note again");
        assert_eq!(stamped, unchanged);
    }

    #[test]
    fn totals_are_recomputed_per_note() {
        let text = "```timer\nlogStyle: interval\n```\n###### Timer Log\nTotal Time: 0.000\n| Start | Stop | Duration | Comments |\n| ----- | ---- | -------- | ------- |\n| a | b | 1.000 |  |\n| a | b | abc |  |\n| a | b | 2.500 |  |\n";
        let (updated, totals) = recompute_note_totals(text).expect("totals should recompute");
        assert_eq!(totals, vec![3.5]);
        assert!(updated.contains("Total Time: 3.500"));
    }

    #[test]
    fn total_command_rewrites_the_note_in_place() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let note = tmp.path().join("note.md");
        fs::write(
            &note,
            "```timer\n```\n###### Timer Log\nTotal Time: 9.000\n| Start | Stop | Duration | Comments |\n| ----- | ---- | -------- | ------- |\n| a | b | 0.250 |  |\n",
        )
        .expect("seed note");

        handle_total(
            TotalArgs {
                inputs: vec![note.clone()],
            },
            false,
        )
        .expect("total should succeed");
        let text = fs::read_to_string(&note).expect("read note");
        assert!(text.contains("Total Time: 0.250"));
    }
}
