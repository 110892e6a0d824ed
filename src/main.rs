use std::io::{IsTerminal, Read};
use std::path::PathBuf;

use anyhow::Context;
use clap::{CommandFactory, Parser};
use serde::Serialize;

use breton_translator::config::{init_default_config, Settings};
use breton_translator::logging::init_logging;
use breton_translator::textutil::strip_line_ending;
use breton_translator::{AssistMode, TranslationResult, Translator};

#[derive(Parser, Debug)]
#[command(name = "breton-translator")]
#[command(about = "French to Breton translation with retrieval-augmented prompts", long_about = None)]
struct Args {
    /// Generate the default config file, then exit
    #[arg(long)]
    init_config: bool,

    /// Directory to write the config file (default: current directory)
    #[arg(long, value_name = "DIR")]
    init_config_dir: Option<PathBuf>,

    /// Overwrite an existing config file when used with --init-config
    #[arg(long)]
    force: bool,

    /// French text to translate (default: read from stdin)
    #[arg(value_name = "TEXT")]
    text: Option<String>,

    /// Generation backend: nllb, helsinki or llama
    #[arg(short, long, default_value = "nllb")]
    backend: String,

    /// Prompt mode: default, few-shot or rag
    #[arg(short, long, default_value = "default")]
    mode: AssistMode,

    /// Number of examples to retrieve for few-shot / rag
    #[arg(short, default_value_t = 3, allow_negative_numbers = true)]
    k: i64,

    /// Config file path (default: search for breton-translator.toml upwards)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print the result as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
struct JsonOutput<'a> {
    original_text: &'a str,
    backend: &'a str,
    mode: AssistMode,
    #[serde(flatten)]
    result: &'a TranslationResult,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.init_config {
        let dir = args
            .init_config_dir
            .clone()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
        let cfg_path = init_default_config(&dir, args.force).context("init default config")?;
        eprintln!("Wrote config: {}", cfg_path.display());
        return Ok(());
    }

    let text = match args.text.clone() {
        Some(t) => t,
        None if std::io::stdin().is_terminal() => {
            let mut cmd = Args::command();
            cmd.print_help().context("print help")?;
            eprintln!(
                "\n\nUSAGE:\n  breton-translator \"Bonjour\" --backend nllb --mode rag -k 3\n  echo \"Bonjour\" | breton-translator --json\n"
            );
            return Ok(());
        }
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("read text from stdin")?;
            strip_line_ending(&buf).to_string()
        }
    };

    if text.trim().is_empty() {
        println!("Please enter text to translate.");
        return Ok(());
    }

    let settings = Settings::load(args.config.clone()).context("load config")?;
    init_logging(&settings.logging)?;
    for warning in &settings.warnings {
        tracing::warn!("{warning}");
    }
    tracing::info!(config = %settings.config_path.display(), "configuration loaded");

    let translator = Translator::from_settings(&settings)?;
    if !translator.context().retrieval_ready() {
        tracing::warn!("retrieval features (rag, few-shot) are disabled for this run");
    }

    let result = translator.translate(&text, &args.backend, args.mode, args.k);

    if args.json {
        let out = JsonOutput {
            original_text: &text,
            backend: &args.backend,
            mode: args.mode,
            result: &result,
        };
        println!(
            "{}",
            serde_json::to_string_pretty(&out).context("serialize result")?
        );
    } else {
        println!("Original text:\n{text}\n");
        println!("Prompt sent:\n{}\n", result.prompt_sent);
        println!("Translation:\n{}", result.output_text);
    }
    Ok(())
}
