//! CLI tool for turning exported chat transcripts into fine-tuning data.
//!
//! Reads `[DD.MM.YYYY, HH:MM:SS] Sender: text` exports, moderates them with the
//! OpenAI moderation endpoint and writes OpenAI-style chat JSONL, one
//! conversation (or one user/assistant pair) per line.

use std::path::PathBuf;
use std::process::ExitCode;

use chrono::Duration;
use clap::{ArgGroup, Parser};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use chat_sft_core::{
    default_output_path, discover_chat_files, process_all_files, process_chat_file,
    write_batch_output, write_jsonl_output, BatchResult, ChatSftError, FailurePolicy, FileFailure,
    OpenAiModerator, OpenAiModeratorConfig, PipelineConfig, PipelineSummary, TimestampOrder,
    DEFAULT_GAP_HOURS, DEFAULT_MAX_CHARS, DEFAULT_THRESHOLD,
};

/// Convert chat exports into fine-tuning conversations.
#[derive(Parser, Debug)]
#[command(name = "chat-sft")]
#[command(author, version, about, long_about = None)]
#[command(group(ArgGroup::new("source").required(true).args(["input", "dir"])))]
struct Args {
    /// Input chat export
    input: Option<PathBuf>,

    /// System prompt placed at the start of every conversation
    #[arg(short = 's', long)]
    sys_prompt: String,

    /// Name of the assistant in the chat (matched case-insensitively)
    #[arg(short = 'n', long)]
    name: String,

    /// Moderation threshold; messages scoring at or above it are dropped
    #[arg(short = 't', long, default_value_t = DEFAULT_THRESHOLD)]
    threshold: f64,

    /// OpenAI API key for moderation
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Maximum characters of message content per conversation
    #[arg(short = 'm', long, default_value_t = DEFAULT_MAX_CHARS)]
    max_chars: usize,

    /// Emit one record per user/assistant pair instead of whole conversations
    #[arg(short = 'p', long)]
    pairs: bool,

    /// Output file (single input) or output directory (with --dir).
    /// Defaults to the input with a .jsonl extension, or <dir>/output
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,

    /// Process every .txt file in this directory
    #[arg(short = 'd', long)]
    dir: Option<PathBuf>,

    /// Skip moderation entirely
    #[arg(long)]
    no_mod: bool,

    /// Merge all outputs into one file (appends to --output for a single input)
    #[arg(long)]
    merge: bool,

    /// Silence in minutes after which a new conversation starts
    #[arg(long, default_value_t = DEFAULT_GAP_HOURS * 60)]
    gap_minutes: i64,

    /// Fail a file whose timestamps go backwards instead of clamping them
    #[arg(long)]
    reject_out_of_order: bool,

    /// Keep messages whose moderation request failed instead of failing the file
    #[arg(long)]
    fail_open: bool,

    /// Moderation model to request
    #[arg(long)]
    moderation_model: Option<String>,

    /// Moderation request timeout in seconds
    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,
}

impl Args {
    fn pipeline_config(&self) -> Result<PipelineConfig, ChatSftError> {
        let gap = Duration::try_minutes(self.gap_minutes).ok_or_else(|| {
            ChatSftError::InvalidConfig(format!("--gap-minutes {} is out of range", self.gap_minutes))
        })?;
        let mut config = PipelineConfig::new(self.sys_prompt.clone(), self.name.clone(), gap);
        config.threshold = self.threshold;
        config.max_chars = self.max_chars;
        config.pairs = self.pairs;
        config.moderate_enabled = !self.no_mod;
        if self.reject_out_of_order {
            config.timestamp_order = TimestampOrder::Reject;
        }
        if self.fail_open {
            config.on_moderation_error = FailurePolicy::FailOpen;
        }
        Ok(config)
    }

    fn moderator(&self) -> Result<Option<OpenAiModerator>, Box<dyn std::error::Error>> {
        if self.no_mod {
            return Ok(None);
        }
        let api_key = self
            .api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| {
                ChatSftError::InvalidConfig(
                    "an OpenAI API key is required for moderation (set OPENAI_API_KEY or pass --api-key); use --no-mod to skip moderation".to_string(),
                )
            })?;
        let moderator = OpenAiModerator::new(OpenAiModeratorConfig {
            api_key,
            model: self.moderation_model.clone(),
            timeout: std::time::Duration::from_secs(self.timeout_secs),
            ..Default::default()
        })?;
        Ok(Some(moderator))
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,reqwest=warn,hyper=warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    init_tracing();

    let args = Args::parse();
    let config = args.pipeline_config()?;
    config.validate()?;
    let moderator = args.moderator()?;

    let (batch, written, write_failures) = if let Some(dir) = &args.dir {
        if !dir.is_dir() {
            return Err(ChatSftError::InvalidConfig(format!(
                "directory does not exist: {}",
                dir.display()
            ))
            .into());
        }
        let files = discover_chat_files(dir);
        if files.is_empty() {
            return Err(ChatSftError::NoInputFiles(dir.clone()).into());
        }
        info!("Processing {} chat exports from {}", files.len(), dir.display());

        let batch = process_all_files(&files, &config, moderator.as_ref());
        let output_dir = args.output.clone().unwrap_or_else(|| dir.join("output"));
        let (written, write_failures) = write_batch_output(&batch.results, &output_dir, args.merge);
        (batch, written, write_failures)
    } else {
        let input = args
            .input
            .clone()
            .ok_or("either an input file or --dir is required")?;
        let mut batch = BatchResult::default();
        let mut written = Vec::new();
        let mut write_failures = Vec::new();

        match process_chat_file(&input, &config, moderator.as_ref()) {
            Ok(result) => {
                let output = args.output.clone().unwrap_or_else(|| default_output_path(&input));
                match write_jsonl_output(&result.records, &output, args.merge) {
                    Ok(_) => written.push(output),
                    Err(error) => write_failures.push(FileFailure {
                        path: input.clone(),
                        error,
                    }),
                }
                batch.results.push(result);
            }
            Err(error) => {
                error!("Error processing {}: {}", input.display(), error);
                batch.failures.push(FileFailure { path: input, error });
            }
        }
        (batch, written, write_failures)
    };

    let summary = PipelineSummary::from_batch(&batch);

    println!("\n[summary]");
    println!("  Files processed: {}", summary.files_processed);
    println!("  Files failed: {}", summary.files_failed + write_failures.len());
    println!("  Raw messages: {}", summary.raw_messages);
    println!("  Malformed lines skipped: {}", summary.skipped_lines);
    println!("  Messages removed by moderation: {}", summary.moderated_out);
    println!("  Conversations: {}", summary.conversations);
    println!("  Records written: {}", summary.records);
    println!("  Total characters: {}", summary.total_chars);
    for path in &written {
        println!("  Output: {:?}", path);
    }
    for failure in batch.failures.iter().chain(write_failures.iter()) {
        println!("  Failed: {}", failure);
    }

    if batch.failures.is_empty() && write_failures.is_empty() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Args {
        let mut argv = vec!["chat-sft", "chat.txt", "-s", "You are Bot.", "-n", "Bot", "--no-mod"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_gap_minutes_out_of_range_is_config_error() {
        let args = parse(&["--gap-minutes", "9223372036854775807"]);
        assert!(matches!(args.pipeline_config(), Err(ChatSftError::InvalidConfig(_))));
    }

    #[test]
    fn test_pipeline_config_from_flags() {
        let args = parse(&["--gap-minutes", "90", "--reject-out-of-order", "--fail-open", "-p"]);
        let config = args.pipeline_config().unwrap();
        assert_eq!(config.gap_threshold, Duration::minutes(90));
        assert_eq!(config.timestamp_order, TimestampOrder::Reject);
        assert_eq!(config.on_moderation_error, FailurePolicy::FailOpen);
        assert!(config.pairs);
        assert!(!config.moderate_enabled);
    }
}
