use std::process::ExitCode;

use clap::{Parser, Subcommand};
use wasmjit::{Engine, JitCompiler, Module, Val};

#[derive(Parser)]
#[command(name = "wasmjit", about = "Baseline x86-64 JIT for a wasm subset")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compile a module and invoke its exported `main`. The process
    /// exit code is main's return value.
    Run {
        /// Path to a .wasm (or .wat) file.
        file: String,
    },
    /// Print the parsed module and the recorded program per function.
    Inspect {
        /// Path to a .wasm (or .wat) file.
        file: String,
    },
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    let result = match cli.command {
        Command::Run { file } => run(&file),
        Command::Inspect { file } => inspect(&file),
    };
    match result {
        Ok(code) => code,
        Err(err) => {
            eprintln!("wasmjit: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn load(path: &str) -> anyhow::Result<Module> {
    let engine = Engine::default();
    let module = if path.ends_with(".wat") {
        let text = std::fs::read_to_string(path)?;
        Module::new(&engine, &text)?
    } else {
        let bytes = std::fs::read(path)?;
        Module::from_bytes(&engine, &bytes)?
    };
    Ok(module)
}

fn run(path: &str) -> anyhow::Result<ExitCode> {
    let module = load(path)?;
    let compiled = JitCompiler::new(&module).compile()?;
    let result = compiled.call("main", &[])?;
    let code = match result {
        Some(Val::I32(v)) => v,
        Some(Val::I64(v)) => v as i32,
        None => 0,
    };
    Ok(ExitCode::from(code as u8))
}

fn inspect(path: &str) -> anyhow::Result<ExitCode> {
    let module = load(path)?;
    print!("{}", module.dump());
    println!();
    print!("{}", JitCompiler::new(&module).render()?);
    Ok(ExitCode::SUCCESS)
}
