use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use colored::Colorize;

use snx::output::{format_trace_header, format_trace_row};
use snx::{compile_program, Simulator, DEFAULT_MEM_SIZE, DEFAULT_REG_COUNT};

/// Simulate execution of SN/X assembly programs.
#[derive(Parser)]
#[command(name = "snx", version, after_help = EPILOG)]
struct Args {
    /// Path to an SN/X assembly source file (.s)
    #[arg(value_name = "PATH")]
    path: PathBuf,

    /// Data memory size in words
    #[arg(long, default_value_t = DEFAULT_MEM_SIZE)]
    mem_size: u32,

    /// Register file size
    #[arg(long, default_value_t = DEFAULT_REG_COUNT)]
    reg_count: u16,

    /// Skip the control-flow and dataflow checks
    #[arg(long)]
    no_static_checks: bool,
}

const EPILOG: &str = "\
Examples:
  snx sample.s
  snx ./demos/fib.s
  snx ~/snx-programs/demo.s --mem-size 64
";

fn main() -> ExitCode {
    let args = Args::parse();

    let source = match fs::read_to_string(&args.path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("snx: error: cannot read {}: {err}", args.path.display());
            return ExitCode::from(2);
        }
    };

    eprintln!(
        "{:>12} target {}",
        "Assembling".green().bold(),
        args.path.display()
    );
    let checks = !args.no_static_checks;
    let result = match compile_program(&source, args.reg_count, args.mem_size, checks) {
        Ok(result) => result,
        // Bad configuration is a usage error
        Err(report) => {
            eprintln!("{report:?}");
            return ExitCode::from(2);
        }
    };
    for report in result.reports() {
        eprintln!("{report:?}");
    }
    if result.has_errors() {
        eprintln!("{:>12} with errors", "Finished".red().bold());
        return ExitCode::from(1);
    }

    let mut sim = match Simulator::from_compile_result(&result) {
        Ok(sim) => sim,
        Err(report) => {
            eprintln!("{report:?}");
            return ExitCode::from(1);
        }
    };

    eprintln!("{:>12} binary", "Running".green().bold());
    println!("{}", format_trace_header(args.reg_count));
    sim.set_trace(|record| {
        println!("{}", format_trace_row(record));
        Ok(())
    });
    match sim.run() {
        Ok(()) => {
            eprintln!(
                "{:>12} target {}",
                "Completed".green().bold(),
                args.path.display()
            );
            ExitCode::SUCCESS
        }
        Err(report) => {
            eprintln!("{report:?}");
            ExitCode::from(2)
        }
    }
}
