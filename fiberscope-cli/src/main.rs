//! fiberscope CLI - コマンドラインインターフェース
//!
//! 停止中のプロセスのファイバーを調べるREPL

use anyhow::Result;
use clap::{Parser, Subcommand};
use fiberscope_core::{
    backtrace, AllPolicy, BeginReport, Command, Debugger, Frame, FrameOutcome, Session,
    SessionConfig, DEFAULT_MAX_FRAMES, HELP,
};
use fiberscope_fiber::{FiberRecord, RegisterContext, RegisterLayout, RuntimeProfile, PROFILES};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::path::PathBuf;
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// fiberscope - fiber runtime inspector
#[derive(Parser)]
#[command(name = "fiberscope")]
#[command(version)]
#[command(about = "Inspect suspended fibers of a paused process", long_about = None)]
struct Cli {
    /// Log level used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Attach to an existing process
    Attach {
        /// Path to the executable binary
        binary: PathBuf,

        /// Process ID to attach to
        #[arg(short, long)]
        pid: i32,

        /// Runtime naming profile (see 'profiles')
        #[arg(long, default_value = "melon")]
        profile: String,

        /// What 'all' does when one fiber fails
        #[arg(long, default_value = "skip", value_parser = ["skip", "abort"])]
        all_policy: String,

        /// Maximum backtrace depth
        #[arg(long, default_value_t = DEFAULT_MAX_FRAMES)]
        max_frames: usize,
    },

    /// List the built-in runtime profiles
    Profiles,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        CliCommand::Profiles => {
            for profile in PROFILES {
                println!("{:<10} {}", profile.name, profile.description);
            }
            Ok(())
        }
        CliCommand::Attach {
            binary,
            pid,
            profile,
            all_policy,
            max_frames,
        } => {
            let config = session_config(&profile, &all_policy)?;
            let mut repl = init_repl(binary, pid, config, max_frames)?;
            repl.run()
        }
    }
}

fn session_config(profile: &str, all_policy: &str) -> Result<SessionConfig> {
    let profile = RuntimeProfile::by_name(profile).ok_or_else(|| {
        let names: Vec<_> = PROFILES.iter().map(|p| p.name).collect();
        anyhow::anyhow!("Unknown profile '{}' (available: {})", profile, names.join(", "))
    })?;
    let registers = RegisterLayout::host().ok_or_else(|| {
        anyhow::anyhow!(
            "No register layout for architecture {}",
            std::env::consts::ARCH
        )
    })?;

    Ok(SessionConfig {
        profile,
        registers,
        all_policy: all_policy.parse::<AllPolicy>()?,
    })
}

/// デバッガを初期化してプロセスにアタッチする
fn init_repl(
    binary: PathBuf,
    pid: i32,
    config: SessionConfig,
    max_frames: usize,
) -> Result<Repl> {
    println!("Loading binary: {}", binary.display());
    println!("Attaching to process: {}", pid);

    let debugger = Debugger::attach(pid, &binary)?;
    println!("Attached to process {} (profile: {})", pid, config.profile.name);
    println!();

    Ok(Repl {
        debugger,
        session: Session::new(config),
        max_frames,
    })
}

enum Flow {
    Continue,
    Quit,
}

struct Repl {
    debugger: Debugger,
    session: Session,
    max_frames: usize,
}

impl Repl {
    /// REPLループを実行する
    fn run(&mut self) -> Result<()> {
        println!("Type 'help' for available commands, 'quit' to exit.");
        println!();

        let mut rl = DefaultEditor::new()?;

        loop {
            match rl.readline("(fiberscope) ") {
                Ok(line) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }

                    rl.add_history_entry(line)?;

                    match self.handle_command(line) {
                        Ok(Flow::Quit) => break,
                        Ok(Flow::Continue) => {}
                        Err(e) => eprintln!("Error: {}", e),
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    println!("CTRL-C");
                    break;
                }
                Err(ReadlineError::Eof) => {
                    println!("CTRL-D");
                    break;
                }
                Err(err) => {
                    eprintln!("Error: {:?}", err);
                    break;
                }
            }
        }

        self.shutdown();
        Ok(())
    }

    /// デタッチ前にレジスタを戻す
    fn shutdown(&mut self) {
        if self.session.is_active() {
            match self.session.end(&mut self.debugger) {
                Ok(()) => println!("Exit fiber mode"),
                Err(e) => {
                    warn!("failed to restore registers before detaching: {}", e);
                    eprintln!("Error: registers could not be restored: {}", e);
                }
            }
        }
        println!("Detaching from process {}", self.debugger.pid());
    }

    fn handle_command(&mut self, line: &str) -> Result<Flow> {
        let Some(command) = Command::parse(line)? else {
            return Ok(Flow::Continue);
        };

        match command {
            Command::CountAll => {
                let count = self.session.count_all(&self.debugger)?;
                println!("Live fibers: {}", count);
            }
            Command::Begin(requested) => {
                let report = self.session.begin(&self.debugger, requested)?;
                print_begin(&report);
            }
            Command::List => self.handle_list()?,
            Command::Frame(index) => {
                let context = self.session.select_frame(&mut self.debugger, index)?;
                println!("Switched to fiber #{}", index);
                println!("#0  {}", self.debugger.describe_address(context.pc));
            }
            Command::All => self.handle_all()?,
            Command::Meta(index) => self.handle_meta(index)?,
            Command::Regs(index) => {
                let context = self.session.registers_of(&self.debugger, index)?;
                print_registers(&context);
            }
            Command::RegRestore => {
                self.session.restore_registers(&mut self.debugger)?;
                println!("OK");
            }
            Command::End => {
                self.session.end(&mut self.debugger)?;
                println!("Exit fiber mode");
            }
            Command::Backtrace(max) => {
                let registers = self.session.config().registers;
                let frames = backtrace(
                    &self.debugger,
                    registers,
                    max.unwrap_or(self.max_frames),
                )?;
                print_frames(&self.debugger, &frames);
            }
            Command::Help => println!("{}", HELP),
            Command::Quit => return Ok(Flow::Quit),
        }

        Ok(Flow::Continue)
    }

    fn handle_list(&self) -> Result<()> {
        let fibers = self.session.list()?;
        println!(
            "{:<6} {:<20} {:<40} {:<9} total:{}",
            "id",
            "tid",
            "function",
            "has stack",
            fibers.len()
        );
        for (i, fiber) in fibers.iter().enumerate() {
            println!(
                "#{:<5} {:<20} {:<40} {}",
                i,
                fiber.thread_id,
                self.entry_name(fiber),
                if fiber.has_stack() { "yes" } else { "no" }
            );
        }
        Ok(())
    }

    fn handle_all(&mut self) -> Result<()> {
        let max_frames = self.max_frames;
        let registers = self.session.config().registers;

        let report = self
            .session
            .all_frames(&mut self.debugger, |debugger, index, _, _| {
                let frames = backtrace(debugger, registers, max_frames)?;
                println!("Fiber {}:", index);
                print_frames(debugger, &frames);
                Ok(())
            })?;

        for (index, outcome) in &report.outcomes {
            match outcome {
                FrameOutcome::Visited => {}
                FrameOutcome::NoStack => println!("Fiber {}: this fiber has no stack", index),
                FrameOutcome::Failed(e) => println!("Fiber {}: Error: {}", index, e),
            }
        }
        if report.aborted {
            println!("Stopped after the first failure (policy: abort)");
        }
        Ok(())
    }

    fn handle_meta(&self, index: usize) -> Result<()> {
        let fiber = self.session.describe(index)?;
        println!("index:           {}", index);
        println!("control block:   0x{:x}", fiber.address);
        println!(
            "location:        group {} block {} slot {}",
            fiber.location.group, fiber.location.block, fiber.location.slot
        );
        println!("tid:             {} (0x{:x})", fiber.thread_id, fiber.thread_id);
        println!("generation:      {}", fiber.generation());
        println!(
            "version counter: 0x{:x} = {}",
            fiber.version_counter_address, fiber.version
        );
        println!("stack kind:      {}", fiber.stack_kind);
        println!("stack:           0x{:x}", fiber.stack_handle);
        println!("entry:           {}", self.entry_name(fiber));
        Ok(())
    }

    /// エントリ関数の表示名
    fn entry_name(&self, fiber: &FiberRecord) -> String {
        let info = self.debugger.describe_address(fiber.entry_function);
        match info.symbol {
            Some(symbol) => format!("0x{:x} <{}>", fiber.entry_function, symbol),
            None => format!("0x{:x}", fiber.entry_function),
        }
    }
}

fn print_begin(report: &BeginReport) {
    if report.clamped {
        if let Some(requested) = report.requested {
            println!(
                "requested fibers {} more than active, will display {} fibers",
                requested, report.cap
            );
        }
    }
    println!(
        "Active fibers: {}, will display {} fibers",
        report.live, report.scanned
    );
    println!("Enter fiber mode, do not resume the process before 'end'");
}

fn print_registers(context: &RegisterContext) {
    for (name, value) in context.entries() {
        println!("{}: 0x{:x}", name, value);
    }
}

fn print_frames(debugger: &Debugger, frames: &[Frame]) {
    for frame in frames {
        // 戻りアドレスは呼び出し命令の次を指すので1つ戻して引く
        let lookup = if frame.index == 0 {
            frame.pc
        } else {
            frame.pc.wrapping_sub(1)
        };
        let mut info = debugger.describe_address(lookup);
        info.address = frame.pc;
        println!("#{:<3} {}", frame.index, info);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_config() {
        let config = session_config("bthread", "abort").unwrap();
        assert_eq!(config.profile.name, "bthread");
        assert_eq!(config.all_policy, AllPolicy::Abort);
        assert!(session_config("unknown", "skip").is_err());
    }

    #[test]
    fn test_cli_parses_attach() {
        let cli = Cli::try_parse_from([
            "fiberscope",
            "attach",
            "--pid",
            "42",
            "/bin/server",
            "--all-policy",
            "abort",
        ])
        .unwrap();
        match cli.command {
            CliCommand::Attach {
                pid,
                all_policy,
                max_frames,
                ..
            } => {
                assert_eq!(pid, 42);
                assert_eq!(all_policy, "abort");
                assert_eq!(max_frames, DEFAULT_MAX_FRAMES);
            }
            CliCommand::Profiles => panic!("expected attach"),
        }
        assert_eq!(cli.log_level, "warn");
    }

    #[test]
    fn test_cli_rejects_unknown_policy() {
        assert!(Cli::try_parse_from([
            "fiberscope",
            "attach",
            "--pid",
            "1",
            "/bin/x",
            "--all-policy",
            "retry"
        ])
        .is_err());
    }
}
