use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use log::info;
use serde::Serialize;

use crate::commands::{App, Correction};
use crate::config::GradingConfig;
use crate::image::encode_png;
use crate::pipeline::Grader;
use crate::storage::{self, DEFAULT_KEY_FILE};

/// Align, read and score photographed answer sheets
#[derive(Parser)]
#[command(name = "quikgrade")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Where the answer key is loaded from and saved to
    #[arg(long, global = true, default_value = DEFAULT_KEY_FILE)]
    pub key_file: PathBuf,

    /// JSON file overriding the default sheet layout and thresholds
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Report service status and the size of the answer key
    Health,
    /// Show or replace the answer key
    Key {
        #[command(subcommand)]
        action: KeyAction,
    },
    /// Grade one photographed sheet
    Grade {
        image: PathBuf,
        /// Number of questions to score, defaults to the key length
        #[arg(short = 'n', long)]
        questions: Option<usize>,
        /// Write per-question results as CSV
        #[arg(long)]
        csv: Option<PathBuf>,
        /// Write an annotated PNG of the aligned sheet
        #[arg(long)]
        preview: Option<PathBuf>,
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Grade many sheets in parallel
    GradeBatch {
        #[arg(required = true)]
        images: Vec<PathBuf>,
        #[arg(short = 'n', long)]
        questions: Option<usize>,
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
}

#[derive(Subcommand)]
pub enum KeyAction {
    Show,
    /// Replace the whole key, e.g. `key set B C A D`
    Set {
        #[arg(required = true)]
        answers: Vec<String>,
    },
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, value)?;
    writeln!(stdout)?;
    Ok(())
}

pub fn run() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => storage::load_config(path)
            .with_context(|| format!("reading config from {}", path.display()))?,
        None => GradingConfig::default(),
    };
    let grader = Grader::new(config)?;

    let timeout = match &cli.command {
        Commands::Grade { timeout_ms, .. } | Commands::GradeBatch { timeout_ms, .. } => {
            timeout_ms.map(Duration::from_millis)
        }
        _ => None,
    };
    let app = App::open(cli.key_file, grader, timeout);

    match cli.command {
        Commands::Health => print_json(&app.health()),
        Commands::Key { action: KeyAction::Show } => print_json(&app.get_answer_key()),
        Commands::Key {
            action: KeyAction::Set { answers },
        } => print_json(&app.set_answer_key(&answers)?),
        Commands::Grade {
            image,
            questions,
            csv,
            preview,
            ..
        } => {
            let bytes = std::fs::read(&image)
                .with_context(|| format!("reading {}", image.display()))?;
            let outcome = app.grade(&bytes, questions)?;

            if let Some(path) = preview {
                std::fs::write(&path, encode_png(&outcome.preview()?)?)
                    .with_context(|| format!("writing preview to {}", path.display()))?;
                info!("Preview written to {}", path.display());
            }
            if let Some(path) = csv {
                storage::export_to_csv(&outcome.report, &path)?;
                info!("Results written to {}", path.display());
            }
            print_json(&Correction::from_outcome(&outcome, None))
        }
        Commands::GradeBatch {
            images, questions, ..
        } => print_json(&app.correct_batch(&images, questions)),
    }
}

#[cfg(test)]
mod unit_tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_grade() {
        let cli = Cli::try_parse_from([
            "quikgrade",
            "grade",
            "sheet.jpg",
            "-n",
            "5",
            "--csv",
            "out.csv",
            "--key-file",
            "keys.json",
        ])
        .unwrap();
        assert_eq!(cli.key_file, PathBuf::from("keys.json"));
        assert!(matches!(
            cli.command,
            Commands::Grade {
                questions: Some(5),
                csv: Some(_),
                preview: None,
                timeout_ms: None,
                ..
            }
        ));
    }

    #[test]
    fn test_parse_key_set() {
        let cli = Cli::try_parse_from(["quikgrade", "key", "set", "B", "C", "A"]).unwrap();
        assert_eq!(cli.key_file, PathBuf::from(DEFAULT_KEY_FILE));
        match cli.command {
            Commands::Key {
                action: KeyAction::Set { answers },
            } => assert_eq!(answers, ["B", "C", "A"]),
            _ => panic!("expected key set"),
        }
        assert!(Cli::try_parse_from(["quikgrade", "key", "set"]).is_err());
        assert!(Cli::try_parse_from(["quikgrade", "grade-batch"]).is_err());
    }
}
