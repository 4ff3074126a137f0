use std::{
    fmt::Write as _,
    fs,
    io::{self, Read},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use todo_dwim::annotation::parse_annotations;
use todo_dwim::config::Preferences;
use todo_dwim::core::{Annotation, Annotations, Marker, Style};
use todo_dwim::cycle::{CycleOutcome, cycle_block_detailed};
use todo_dwim::host::{CommandReport, FileHost, MemoryHost, run_cycle_command};
use todo_dwim::marker::extract_marker;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "todo-dwim",
    about = "Cycle TODO markers on outline blocks, rescheduling recurring tasks",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Advance each block to its next marker (one file per block, `-` for stdin).
    Cycle(CycleArgs),

    /// Show the marker, annotations, and next state of each block.
    Inspect(InspectArgs),
}

#[derive(Debug, Args)]
struct PreferenceArgs {
    /// JSON preferences file with `preferredTodo` and `skipActiveState`.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Marker style; overrides the preferences file.
    #[arg(long, value_enum)]
    style: Option<StyleArg>,
    /// Skip DOING/NOW when cycling forward.
    #[arg(long, conflicts_with = "no_skip_active_state")]
    skip_active_state: bool,
    /// Stop at DOING/NOW even if the preferences file skips them.
    #[arg(long)]
    no_skip_active_state: bool,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum StyleArg {
    Todo,
    Later,
}

impl From<StyleArg> for Style {
    fn from(arg: StyleArg) -> Self {
        match arg {
            StyleArg::Todo => Style::Todo,
            StyleArg::Later => Style::Later,
        }
    }
}

impl PreferenceArgs {
    fn resolve(&self) -> Result<Preferences> {
        let base = match &self.config {
            Some(path) => Preferences::load(path)?,
            None => Preferences::default(),
        };
        Ok(base.with_overrides(self.style.map(Style::from), self.skip_override()))
    }

    fn skip_override(&self) -> Option<bool> {
        match (self.skip_active_state, self.no_skip_active_state) {
            (true, _) => Some(true),
            (false, true) => Some(false),
            (false, false) => None,
        }
    }
}

#[derive(Debug, Args)]
struct CycleArgs {
    /// Block files to cycle, or a single `-` to read the edited block from stdin.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    #[command(flatten)]
    prefs: PreferenceArgs,
    /// Number of times to cycle.
    #[arg(long, default_value_t = 1)]
    times: usize,
    /// Overwrite the files instead of printing to stdout.
    #[arg(long)]
    in_place: bool,
}

#[derive(Debug, Args)]
struct InspectArgs {
    /// Block files to inspect, or `-` for stdin.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    #[command(flatten)]
    prefs: PreferenceArgs,
    /// Emit JSON instead of a human-readable summary.
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match cli.command {
        Commands::Cycle(args) => handle_cycle(args),
        Commands::Inspect(args) => handle_inspect(args),
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn handle_cycle(args: CycleArgs) -> Result<()> {
    let CycleArgs {
        inputs,
        prefs,
        times,
        in_place,
    } = args;
    let prefs = prefs.resolve()?;

    if is_stdin(&inputs) {
        if in_place {
            anyhow::bail!("--in-place cannot be used when reading from stdin");
        }
        let content = read_stdin()?;
        let mut host = MemoryHost::new();
        let id = host.insert(content);
        host.start_editing(id, None);
        for _ in 0..times {
            run_cycle_command(&mut host, &prefs)?;
        }
        let text = host.content(id).unwrap_or_default();
        print!("{text}");
        if !text.ends_with('\n') {
            println!();
        }
        return Ok(());
    }

    if inputs.iter().any(|p| p == Path::new("-")) {
        anyhow::bail!("`-` (stdin) cannot be combined with file inputs");
    }

    let mut host = FileHost::open(&inputs, in_place)?;
    for _ in 0..times {
        let report = run_cycle_command(&mut host, &prefs)?;
        report_failures(&report, &host);
    }

    if !in_place {
        let many = inputs.len() > 1;
        for (idx, block) in host.blocks().enumerate() {
            if many {
                if idx > 0 {
                    println!();
                }
                println!("== {} ==", block.path.display());
            }
            print!("{}", block.content);
            if !block.content.ends_with('\n') {
                println!();
            }
        }
    }
    Ok(())
}

fn report_failures(report: &CommandReport, host: &FileHost) {
    for (id, msg) in &report.failed {
        let name = host
            .path_of(*id)
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| id.to_string());
        eprintln!("warning: could not save {name}: {msg}");
    }
}

#[derive(Debug, Serialize)]
struct Inspection {
    path: String,
    marker: Option<Marker>,
    annotations: Annotations,
    next: CycleOutcome,
}

fn handle_inspect(args: InspectArgs) -> Result<()> {
    let InspectArgs {
        inputs,
        prefs,
        json,
    } = args;
    let prefs = prefs.resolve()?;

    let mut inspections = Vec::new();
    for input in &inputs {
        let content = if input == Path::new("-") {
            read_stdin()?
        } else {
            fs::read_to_string(input).with_context(|| format!("reading {:?}", input))?
        };
        inspections.push(inspect(input.display().to_string(), &content, &prefs));
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&inspections)?);
    } else {
        for (idx, inspection) in inspections.iter().enumerate() {
            if idx > 0 {
                println!();
            }
            print!("{}", render_inspection(inspection));
        }
    }
    Ok(())
}

fn inspect(path: String, content: &str, prefs: &Preferences) -> Inspection {
    Inspection {
        path,
        marker: extract_marker(content),
        annotations: parse_annotations(content),
        next: cycle_block_detailed(content, prefs),
    }
}

fn render_inspection(inspection: &Inspection) -> String {
    fn marker_name(m: Option<Marker>) -> &'static str {
        m.map(Marker::as_str).unwrap_or("(none)")
    }
    fn render_annotation(a: &Annotation) -> String {
        let mut s = format!("{} {}", a.date.format("%Y-%m-%d"), a.day_of_week);
        if let Some(time) = a.time {
            let _ = write!(s, " {}", time.format("%H:%M"));
        }
        if let Some(repeat) = a.repeat {
            let _ = write!(s, " {repeat}");
        }
        s
    }

    let mut out = String::new();
    let _ = writeln!(out, "== {} ==", inspection.path);
    let _ = writeln!(out, "marker: {}", marker_name(inspection.marker));
    for a in inspection.annotations.iter() {
        let _ = writeln!(out, "{}: {}", a.kind.keyword(), render_annotation(a));
    }
    let _ = write!(out, "next: {}", marker_name(inspection.next.to));
    for r in &inspection.next.reschedules {
        let _ = write!(out, " ({} -> {})", r.kind.keyword(), r.to);
    }
    out.push('\n');
    out
}

fn is_stdin(inputs: &[PathBuf]) -> bool {
    matches!(inputs, [only] if only == Path::new("-"))
}

fn read_stdin() -> Result<String> {
    let mut buf = String::new();
    io::stdin()
        .read_to_string(&mut buf)
        .context("reading block from stdin")?;
    Ok(buf)
}
