//! quill - command-line host for the Quill scripting language
//!
//! Usage:
//!   quill run script.qs            # Run a script file
//!   quill eval "1 + 2"             # Evaluate source text and print the result
//!   quill check script.qs --print  # Parse only, optionally pretty-printing
//!   quill repl                     # Interactive session
//!   quill completions bash         # Shell completion script
//!
//! Set `RUST_LOG=quill=debug` to see module resolution and cache decisions.

mod session;

use clap::{CommandFactory, Parser as ClapParser, Subcommand};
use clap_complete::{Shell, generate};
use quill::{
    EngineConfig, FileSystemResolver, Process, ScriptCache, ScriptSystem, State, StepMode,
};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use session::{Reply, Session};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process;
use tracing::debug;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

#[derive(ClapParser)]
#[command(name = "quill")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Quill scripting language - run scripts or start a REPL", long_about = None)]
struct Cli {
    /// Engine configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Do not read or write the compiled-script cache
    #[arg(long, global = true)]
    no_cache: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a script file
    Run {
        /// Script to run
        file: PathBuf,

        /// Hand control back after every top-level loop iteration and log it
        #[arg(long)]
        step: bool,

        /// Print the value of the final expression
        #[arg(short, long)]
        print_result: bool,
    },

    /// Evaluate source text and print its result
    Eval {
        /// Source text, e.g. "len('quill') * 2"
        source: String,
    },

    /// Check a script for syntax errors without running it
    Check {
        /// Script to check
        file: PathBuf,

        /// Print the parsed script in normalized form
        #[arg(long)]
        print: bool,
    },

    /// Start an interactive session
    Repl,

    /// Generate shell completion scripts
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() {
    let cli = Cli::parse();
    init_logging();

    if let Commands::Completions { shell } = cli.command {
        run_completions(shell);
        return;
    }

    let config = match &cli.config {
        Some(path) => EngineConfig::load(path).unwrap_or_else(|e| {
            eprintln!("Error: {}", e.describe());
            process::exit(1);
        }),
        None => EngineConfig::default(),
    };
    let system = build_system(config, cli.no_cache);

    match cli.command {
        Commands::Run {
            file,
            step,
            print_result,
        } => run_file(&system, &file, step, print_result),
        Commands::Eval { source } => run_eval(&system, &source),
        Commands::Check { file, print } => run_check(&system, &file, print),
        Commands::Repl => run_repl(&system),
        Commands::Completions { .. } => {}
    }
}

fn init_logging() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::ERROR.into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn build_system(config: EngineConfig, no_cache: bool) -> ScriptSystem {
    let cache = if no_cache {
        None
    } else {
        ScriptCache::from_config(&config)
    };
    if let Some(cache) = &cache {
        debug!(dir = %cache.dir().display(), "using compiled-script cache");
    }
    let system = ScriptSystem::new(config, FileSystemResolver::new());
    system.set_cache(cache);
    system
}

fn run_completions(shell: Shell) {
    let mut cmd = Cli::command();
    generate(shell, &mut cmd, "quill", &mut io::stdout());
}

fn read_source(file: &Path) -> String {
    fs::read_to_string(file).unwrap_or_else(|e| {
        eprintln!("Error: cannot read '{}': {}", file.display(), e);
        process::exit(1);
    })
}

fn run_file(system: &ScriptSystem, file: &Path, step: bool, print_result: bool) {
    let path = file.to_string_lossy();
    let source = read_source(file);
    let script = system.parse_source(&source, &path).unwrap_or_else(|e| {
        eprintln!("{}: {}", path, e.describe());
        process::exit(1);
    });

    let mut running = Process::new(system);
    if step {
        running.set_step_mode(StepMode::PerIteration);
    }
    if let Err(e) = running.run(&script) {
        eprintln!("{}: {}", path, e.describe());
        process::exit(1);
    }

    let mut steps = 0usize;
    loop {
        match running.execute() {
            Ok(State::Suspended) => {
                steps += 1;
                debug!(steps, "process suspended");
            }
            Ok(_) => break,
            Err(failure) => {
                eprintln!("{}: {}", path, failure);
                if !failure.statement.is_empty() {
                    eprintln!("    {}", failure.statement);
                }
                process::exit(1);
            }
        }
    }
    if step {
        eprintln!("[{} steps]", steps);
    }
    if print_result && !running.result().is_none() {
        println!("{}", running.result().repr());
    }
}

fn run_eval(system: &ScriptSystem, source: &str) {
    let script = system
        .parse_source(source, session::SOURCE_NAME)
        .unwrap_or_else(|e| {
            eprintln!("{}", e.describe());
            process::exit(1);
        });
    match Process::new(system).evaluate(&script) {
        Ok(value) if value.is_none() => {}
        Ok(value) => println!("{}", value.repr()),
        Err(failure) => {
            eprintln!("{}", failure);
            process::exit(1);
        }
    }
}

fn run_check(system: &ScriptSystem, file: &Path, print: bool) {
    let path = file.to_string_lossy();
    let source = read_source(file);
    match system.parse_source(&source, &path) {
        Ok(script) if print => print!("{}", script),
        Ok(_) => println!("{}: ok", path),
        Err(e) => {
            eprintln!("{}: {}", path, e.describe());
            process::exit(1);
        }
    }
}

fn history_file() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".quill_history"))
}

fn run_repl(system: &ScriptSystem) {
    let mut rl = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(e) => {
            eprintln!("Error initializing readline: {}", e);
            process::exit(1);
        }
    };

    let history = history_file();
    if let Some(ref path) = history {
        let _ = rl.load_history(path);
    }

    println!("Quill {} REPL. Type :help for commands, :quit to exit.", env!("CARGO_PKG_VERSION"));

    let mut session = Session::new(system);
    loop {
        let prompt = if session.is_continuing() { "....> " } else { "quill> " };
        match rl.readline(prompt) {
            Ok(line) => {
                if !line.trim().is_empty() {
                    let _ = rl.add_history_entry(line.as_str());
                }
                match session.submit(&line) {
                    Reply::More | Reply::Value(None) => {}
                    Reply::Value(Some(text)) | Reply::Message(text) => println!("{}", text),
                    Reply::Failed(message) => eprintln!("{}", message),
                    Reply::Quit => {
                        println!("Goodbye!");
                        break;
                    }
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
            }
            Err(ReadlineError::Eof) => {
                println!("Goodbye!");
                break;
            }
            Err(e) => {
                eprintln!("Error: {}", e);
                break;
            }
        }
    }

    if let Some(ref path) = history {
        let _ = rl.save_history(path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_with_global_flags() {
        let cli = Cli::try_parse_from(["quill", "run", "game.qs", "--step", "--no-cache"]).unwrap();
        assert!(cli.no_cache);
        match cli.command {
            Commands::Run { file, step, print_result } => {
                assert_eq!(file, PathBuf::from("game.qs"));
                assert!(step);
                assert!(!print_result);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_system_uses_configured_cache() {
        let temp = TempDir::new().unwrap();
        let config = EngineConfig {
            cache_dir: Some(temp.path().to_path_buf()),
            ..EngineConfig::default()
        };
        let system = build_system(config, false);
        let script = system.parse_source("a = 1 + 2\na", "t.qs").unwrap();
        assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 1);

        let result = Process::new(&system).evaluate(&script).unwrap();
        assert_eq!(result.as_number().unwrap(), 3.0);
    }

    #[test]
    fn test_no_cache_writes_nothing() {
        let temp = TempDir::new().unwrap();
        let config = EngineConfig {
            cache_dir: Some(temp.path().to_path_buf()),
            ..EngineConfig::default()
        };
        let system = build_system(config, true);
        system.parse_source("x = 1", "t.qs").unwrap();
        assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 0);
    }
}
