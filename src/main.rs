use std::io::{self, BufRead, IsTerminal, Read, Write};

use anyhow::{Result, anyhow};
use clap::Parser;
use yakulingo_core::{BackendKind, Config, TranslationService};

#[derive(Parser, Debug)]
#[command(
    name = "yakulingo",
    version,
    about = "Translate Japanese/English business text with a local LLM or Copilot"
)]
struct Cli {
    /// Output language (en or jp). Detected from the input when omitted.
    #[arg(short = 'l', long = "lang")]
    lang: Option<String>,

    /// English style: standard, concise or minimal
    #[arg(short = 's', long = "style")]
    style: Option<String>,

    /// Show standard, concise and minimal options for Japanese input
    #[arg(short = 'c', long = "compare-styles")]
    compare_styles: bool,

    /// Plain-text file (.txt/.md) to translate
    #[arg(short = 'f', long = "file")]
    file: Option<String>,

    /// Reference file (glossary CSV, text, markdown); repeatable
    #[arg(short = 'R', long = "reference")]
    reference: Vec<String>,

    /// Backend to use (local or copilot); overrides settings
    #[arg(short = 'b', long = "backend")]
    backend: Option<String>,

    /// Read extra settings from a local TOML file
    #[arg(short = 'r', long = "read-settings")]
    read_settings: Option<String>,

    /// Print the typed result as JSON
    #[arg(long = "json")]
    json: bool,

    /// Enable verbose logging
    #[arg(long = "verbose")]
    verbose: bool,

    /// Interactive mode
    #[arg(short = 'i', long = "interactive")]
    interactive: bool,
}

impl Cli {
    fn config(&self) -> Config {
        Config {
            file: self.file.clone(),
            lang: self.lang.clone(),
            style: self.style.clone(),
            compare_styles: self.compare_styles,
            references: self.reference.clone(),
            backend: self.backend.clone(),
            settings_path: self.read_settings.clone(),
            json: self.json,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    yakulingo_core::logging::init(cli.verbose)?;
    if cli.interactive {
        return run_interactive(cli).await;
    }

    let input = if cli.file.is_some() {
        None
    } else {
        if io::stdin().is_terminal() {
            return Err(anyhow!("pipe text to stdin, or pass --file / --interactive"));
        }
        let mut buffer = String::new();
        io::stdin()
            .read_to_string(&mut buffer)
            .map_err(|err| anyhow!("stdin must be UTF-8 text: {}", err))?;
        Some(buffer)
    };

    let output = yakulingo_core::run(cli.config(), input).await?;
    println!("{}", output);
    Ok(())
}

async fn run_interactive(cli: Cli) -> Result<()> {
    let mut config = cli.config();
    config.file = None;
    let settings =
        yakulingo_core::settings::load_settings(config.settings_path.as_deref().map(std::path::Path::new))?;
    let backend = config
        .backend
        .as_deref()
        .map(|value| {
            BackendKind::parse(value)
                .ok_or_else(|| anyhow!("invalid backend '{}' (expected local or copilot)", value))
        })
        .transpose()?;
    let service = yakulingo_core::build_service(&settings, backend);

    println!("Interactive mode. Use /quit or /exit to finish.");
    println!("Type /help to see available commands.");

    let mut line = String::new();
    let stdin = io::stdin();
    let mut stdin_lock = stdin.lock();
    loop {
        line.clear();
        print!("> ");
        io::stdout().flush()?;
        if stdin_lock.read_line(&mut line)? == 0 {
            break;
        }
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input.starts_with('/') {
            match handle_interactive_command(input, &mut config, &service).await {
                Ok(true) => break,
                Ok(false) => {}
                Err(err) => eprintln!("{:#}", err),
            }
            continue;
        }

        match yakulingo_core::run_with_service(&service, &config, Some(input.to_string())).await {
            Ok(output) => println!("{}", output),
            Err(err) => eprintln!("{:#}", err),
        }
    }
    Ok(())
}

async fn handle_interactive_command(
    input: &str,
    config: &mut Config,
    service: &TranslationService,
) -> Result<bool> {
    let trimmed = input.trim();
    if matches!(trimmed, "/quit" | "/exit") {
        return Ok(true);
    }
    if trimmed == "/help" {
        print_interactive_help();
        return Ok(false);
    }
    if trimmed == "/clear-cache" {
        service.clear_cache();
        println!("caches cleared");
        return Ok(false);
    }
    if let Some(arg) = trimmed.strip_prefix("/file") {
        let value = arg.trim();
        if value.is_empty() {
            return Err(anyhow!("/file needs a path"));
        }
        let mut file_config = config.clone();
        file_config.file = Some(value.to_string());
        match yakulingo_core::run_with_service(service, &file_config, None).await {
            Ok(output) => println!("{}", output),
            Err(err) => eprintln!("{:#}", err),
        }
        return Ok(false);
    }
    if let Some(arg) = trimmed.strip_prefix("/lang") {
        set_optional("lang", arg, &mut config.lang);
        return Ok(false);
    }
    if let Some(arg) = trimmed.strip_prefix("/style") {
        set_optional("style", arg, &mut config.style);
        return Ok(false);
    }
    if let Some(arg) = trimmed.strip_prefix("/compare") {
        config.compare_styles = parse_toggle(arg, config.compare_styles)?;
        println!("compare-styles: {}", config.compare_styles);
        return Ok(false);
    }
    if let Some(arg) = trimmed.strip_prefix("/json") {
        config.json = parse_toggle(arg, config.json)?;
        println!("json: {}", config.json);
        return Ok(false);
    }
    if let Some(arg) = trimmed.strip_prefix("/reference") {
        let value = arg.trim();
        if value.is_empty() {
            println!("references: {}", config.references.join(", "));
        } else if value == "clear" {
            config.references.clear();
            println!("references cleared");
        } else {
            config.references.push(value.to_string());
            println!("reference added: {}", value);
        }
        return Ok(false);
    }

    eprintln!("unknown command: {}", trimmed);
    Ok(false)
}

fn set_optional(name: &str, arg: &str, slot: &mut Option<String>) {
    let value = arg.trim();
    if value.is_empty() {
        println!("{}: {}", name, slot.as_deref().unwrap_or("(auto)"));
    } else if value == "auto" {
        *slot = None;
        println!("{} set to auto", name);
    } else {
        *slot = Some(value.to_string());
        println!("{} set to {}", name, value);
    }
}

fn parse_toggle(arg: &str, current: bool) -> Result<bool> {
    let value = arg.trim();
    if value.is_empty() {
        return Ok(!current);
    }
    match value.to_lowercase().as_str() {
        "on" | "true" | "1" => Ok(true),
        "off" | "false" | "0" => Ok(false),
        _ => Err(anyhow!("expected on/off/true/false/1/0")),
    }
}

fn print_interactive_help() {
    println!("Commands:");
    println!("  /quit, /exit                 Exit interactive mode");
    println!("  /lang <en|jp|auto>           Set output language (or show current)");
    println!("  /style <name|auto>           Set English style (or show current)");
    println!("  /compare [on|off]            Toggle 3-style comparison");
    println!("  /json [on|off]               Toggle JSON output");
    println!("  /reference <path|clear>      Add a reference file");
    println!("  /file <path>                 Translate a .txt/.md file");
    println!("  /clear-cache                 Drop translation and prompt caches");
}
