//! Quill command line entry point.

use clap::Parser;
use quill_asm::{read_module_header, MODULE_MAGIC};
use quill_driver::{
    available_frontends, compile_module, detect_frontend_kind, frontend_for, CompilationConfig,
    FrontendKind, MathType, OutputMode,
};
use quill_ir::Module;
use std::fs;
use std::io::Write as _;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(
    name = "quill",
    version,
    about = "Offline OpenCL kernel compiler for the 16-lane QPU"
)]
struct Cli {
    /// Input file: LLVM-IR bitcode, SPIR-V, or an already compiled module
    /// when only --kernel-info is wanted
    input: PathBuf,

    /// Output file; stdout when omitted
    #[arg(short = 'o', long = "output")]
    output: Option<PathBuf>,

    /// Emit comma-separated hex word pairs instead of the raw binary
    #[arg(long)]
    hex: bool,

    /// Emit the raw binary module (the default)
    #[arg(long)]
    bin: bool,

    /// Emit human-readable assembler
    #[arg(long)]
    asm: bool,

    /// Force the LLVM-IR front-end
    #[arg(long)]
    llvm: bool,

    /// Force the SPIR-V front-end
    #[arg(long)]
    spirv: bool,

    /// Dump the kernel-info records as JSON
    #[arg(long = "kernel-info")]
    kernel_info: bool,

    /// Run the external output verifier after compilation
    #[arg(long)]
    verify: bool,

    /// Floating-point math mode
    #[arg(long, default_value = "strict", value_parser = ["strict", "fast", "full"])]
    math: String,
}

fn output_mode(cli: &Cli) -> OutputMode {
    if cli.hex {
        OutputMode::Hex
    } else if cli.asm {
        OutputMode::Assembler
    } else {
        OutputMode::Binary
    }
}

fn math_type(cli: &Cli) -> MathType {
    match cli.math.as_str() {
        "fast" => MathType::Fast,
        "full" => MathType::Full,
        _ => MathType::Strict,
    }
}

fn is_compiled_module(input: &[u8]) -> bool {
    input.len() >= 8
        && input[..4] == MODULE_MAGIC.to_le_bytes()
        && input[4..8] == MODULE_MAGIC.to_le_bytes()
}

fn run(cli: &Cli) -> Result<(), String> {
    let input = fs::read(&cli.input)
        .map_err(|err| format!("could not read '{}': {}", cli.input.display(), err))?;

    // an already compiled module: just dump its records
    if cli.kernel_info && is_compiled_module(&input) {
        let header = read_module_header(&input).map_err(|err| err.to_string())?;
        let json = serde_json::to_string_pretty(&header).map_err(|err| err.to_string())?;
        println!("{}", json);
        return Ok(());
    }

    let kind = if cli.llvm {
        FrontendKind::Llvm
    } else if cli.spirv {
        FrontendKind::SpirV
    } else {
        detect_frontend_kind(&input).unwrap_or(FrontendKind::Auto)
    };
    let Some(frontend) = frontend_for(kind) else {
        let names: Vec<&str> = available_frontends()
            .iter()
            .map(|frontend| frontend.name())
            .collect();
        let listing = if names.is_empty() {
            "(none)".to_string()
        } else {
            names.join(", ")
        };
        return Err(format!(
            "no front-end available for this input; front-ends in this build: {}",
            listing
        ));
    };

    let mut module = Module::default();
    frontend
        .parse(&input, &mut module)
        .map_err(|err| err.to_string())?;

    let config = CompilationConfig {
        math_type: math_type(cli),
        output_mode: output_mode(cli),
        frontend: kind,
        verify_output: cli.verify,
        parallel: true,
    };
    let mut buffer = Vec::new();
    let summary =
        compile_module(&mut module, &config, &mut buffer).map_err(|err| err.to_string())?;
    for diag in &summary.diagnostics {
        eprintln!("warning: {}", diag.message);
    }

    match &cli.output {
        Some(path) => fs::write(path, &buffer)
            .map_err(|err| format!("could not write '{}': {}", path.display(), err))?,
        None => std::io::stdout()
            .write_all(&buffer)
            .map_err(|err| err.to_string())?,
    }
    if cli.kernel_info {
        let json =
            serde_json::to_string_pretty(&summary.kernels).map_err(|err| err.to_string())?;
        println!("{}", json);
    }
    if cli.verify {
        eprintln!("warning: the external output verifier is not bundled with this build");
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("Error: {}", message);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args.iter().copied()).expect("arguments should parse")
    }

    #[test]
    fn output_mode_flags() {
        assert_eq!(output_mode(&parse(&["quill", "in.bc"])), OutputMode::Binary);
        assert_eq!(
            output_mode(&parse(&["quill", "--hex", "in.bc"])),
            OutputMode::Hex
        );
        assert_eq!(
            output_mode(&parse(&["quill", "--asm", "in.bc"])),
            OutputMode::Assembler
        );
    }

    #[test]
    fn math_mode_parsing() {
        assert_eq!(math_type(&parse(&["quill", "in.bc"])), MathType::Strict);
        assert_eq!(
            math_type(&parse(&["quill", "--math", "fast", "in.bc"])),
            MathType::Fast
        );
        assert!(Cli::try_parse_from(["quill", "--math", "bogus", "in.bc"]).is_err());
    }

    #[test]
    fn compiled_module_detection() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&MODULE_MAGIC.to_le_bytes());
        bytes.extend_from_slice(&MODULE_MAGIC.to_le_bytes());
        assert!(is_compiled_module(&bytes));
        assert!(!is_compiled_module(b"BC\xC0\xDE"));
    }

    #[test]
    fn missing_frontend_is_reported() {
        let dir = std::env::temp_dir().join(format!(
            "quill_cli_test_{}_{}",
            std::process::id(),
            line!()
        ));
        std::fs::create_dir_all(&dir).expect("temp dir should be created");
        let input = dir.join("kernel.bc");
        std::fs::write(&input, b"BC\xC0\xDErest").expect("input should be written");
        let cli = parse(&["quill", input.to_str().unwrap()]);
        let err = run(&cli).unwrap_err();
        assert!(err.contains("no front-end available"));
        std::fs::remove_dir_all(&dir).ok();
    }
}
