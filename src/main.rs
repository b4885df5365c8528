//! Punto de entrada ("driver").
//!
//! Este módulo orquesta las diferentes fases del proceso de
//! compilación y expone una CLI.

use anyhow::{self, bail, Context};
use clap::{crate_version, value_parser, Arg, ArgAction, Command};
use sysyc::{
    error::Diagnostics,
    lex::Lexer,
    link::{LinkOptions, Linker, Platform},
    parse, source,
    target::{self, Config, EmitOptions},
};

use std::{
    fs::{self, File},
    io::{self, Write},
    process,
    str::FromStr,
};

fn main() -> anyhow::Result<()> {
    env_logger::init();

    // Parsing de CLI
    let args = Command::new("SysY compiler")
        .version(crate_version!())
        .arg(
            Arg::new("input")
                .required(true)
                .value_name("SOURCE")
                .help("SysY source file"),
        )
        .arg(
            Arg::new("target")
                .short('t')
                .long("target")
                .value_name("PLATFORM")
                .default_value("linux")
                .value_parser(["linux", "elf"])
                .help("Target platform"),
        )
        .arg(
            Arg::new("asm")
                .short('S')
                .action(ArgAction::SetTrue)
                .help("Generate assembly instead of linking"),
        )
        .arg(
            Arg::new("emit-ir")
                .long("emit-ir")
                .action(ArgAction::SetTrue)
                .help("Print the intermediate representation instead of assembly"),
        )
        .arg(
            Arg::new("annotate")
                .long("annotate")
                .action(ArgAction::SetTrue)
                .help("Annotate assembly with the intermediate representation"),
        )
        .arg(
            Arg::new("registers")
                .long("registers")
                .value_name("N")
                .default_value("12")
                .value_parser(value_parser!(u8).range(1..=12))
                .help("Number of registers available for allocation"),
        )
        .arg(
            Arg::new("strip")
                .short('s')
                .action(ArgAction::SetTrue)
                .help("Strip executables"),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .value_name("FILE")
                .default_value("a.out")
                .help("Output file ('-' along with -S or --emit-ir for stdout)"),
        )
        .get_matches();

    // Se extraen argumentos necesarios
    let flag = |name: &str| args.get_one::<bool>(name).copied().unwrap_or(false);
    let input = args
        .get_one::<String>("input")
        .context("No input file")?;

    let output = args
        .get_one::<String>("output")
        .map(String::as_str)
        .unwrap_or("a.out");

    let platform = args
        .get_one::<String>("target")
        .map(String::as_str)
        .unwrap_or("linux");

    let platform = match Platform::from_str(platform) {
        Ok(platform) => platform,
        Err(()) => bail!("Unsupported target: {}", platform),
    };

    let registers = args.get_one::<u8>("registers").copied().unwrap_or(12);

    let mut options = EmitOptions::START_STUB;
    if flag("annotate") {
        options |= EmitOptions::ANNOTATE;
    }

    let config = Config {
        registers: registers as usize,
        options,
    };

    // Front end
    let text = fs::read_to_string(input).with_context(|| format!("Failed to read: {}", input))?;
    let (start, stream) = source::consume_str(&text, input);

    let tokens = match Lexer::new(start.clone(), stream).try_exhaustive() {
        Ok(tokens) => tokens,
        Err(errors) => report(Diagnostics::from(errors).kind("A")),
    };

    let ast = match parse::parse(tokens.iter(), start) {
        Ok(ast) => ast,
        Err(error) => report(Diagnostics::from(error).kind("B")),
    };

    if let Err(errors) = ast.check() {
        report(Diagnostics::from(errors));
    }

    let module = match ast.lower() {
        Ok(module) => module,
        Err(error) => bail!("Line {}: {}", error.line(), error.val()),
    };

    if flag("emit-ir") {
        return write_to(output, |writer| write!(writer, "{}", module));
    }

    match (flag("asm"), output) {
        (true, path) => write_to(path, |mut writer| target::emit(&module, &config, &mut writer)),

        // Salida a stdout con enlazado
        (false, "-") => bail!("Refusing to write executable to stdout"),

        // Salida a archivo con enlazado
        (false, path) => {
            let mut options = LinkOptions::empty();
            if flag("strip") {
                options |= LinkOptions::STRIP;
            }

            let mut linker = Linker::spawn(platform, &path, options).context("Failed to link")?;
            target::emit(&module, &config, linker.stdin())
                .context("Failed to emit assembly to assembler")?;

            linker
                .finish()
                .with_context(|| format!("Failed to generate executable: {}", path))
        }
    }
}

/// Escribe a un archivo o a stdout si la ruta es `-`.
fn write_to<F>(path: &str, write: F) -> anyhow::Result<()>
where
    F: FnOnce(&mut dyn Write) -> io::Result<()>,
{
    if path == "-" {
        let stdout = io::stdout();
        let mut stdout = stdout.lock();
        write(&mut stdout).context("Failed to emit to stdout")
    } else {
        let mut file =
            File::create(path).with_context(|| format!("Failed to open for writing: {}", path))?;

        write(&mut file).with_context(|| format!("Failed to emit to file: {}", path))
    }
}

/// Reporta errores de compilación y termina el proceso.
fn report(diagnostics: Diagnostics) -> ! {
    eprint!("{}", diagnostics);
    process::exit(1)
}
