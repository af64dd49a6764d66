//! Pipeline for processing chat exports into fine-tuning records.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::Duration;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{error, info, info_span, warn};
use walkdir::WalkDir;

use crate::anonymize::anonymize;
use crate::assembler::{AssemblerConfig, AssemblyStats, ConversationAssembler, TimestampOrder};
use crate::error::{ChatSftError, FileFailure, Result};
use crate::message::{ChatMessage, Conversation, PairedConversation, Role};
use crate::moderation::{moderate_messages, FailurePolicy, ModerationPolicy};
use crate::pairing::pair_all;
use crate::tokenizer::parse_chat_text;
use crate::Moderator;
use crate::{DEFAULT_MAX_CHARS, DEFAULT_THRESHOLD};

/// File name used for merged directory output.
pub const MERGED_OUTPUT_NAME: &str = "output.jsonl";

/// Configuration for the pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub system_prompt: String,
    pub assistant_name: String,
    pub threshold: f64,
    pub max_chars: usize,
    pub pairs: bool,
    pub moderate_enabled: bool,
    pub gap_threshold: Duration,
    pub timestamp_order: TimestampOrder,
    pub on_moderation_error: FailurePolicy,
}

impl PipelineConfig {
    pub fn new(
        system_prompt: impl Into<String>,
        assistant_name: impl Into<String>,
        gap_threshold: Duration,
    ) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            assistant_name: assistant_name.into(),
            threshold: DEFAULT_THRESHOLD,
            max_chars: DEFAULT_MAX_CHARS,
            pairs: false,
            moderate_enabled: true,
            gap_threshold,
            timestamp_order: TimestampOrder::default(),
            on_moderation_error: FailurePolicy::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.system_prompt.trim().is_empty() {
            return Err(ChatSftError::InvalidConfig("system prompt is required".to_string()));
        }
        if self.assistant_name.trim().is_empty() {
            return Err(ChatSftError::InvalidConfig("assistant name is required".to_string()));
        }
        self.moderation_policy()?;
        self.assembler_config().validate()
    }

    pub fn assembler_config(&self) -> AssemblerConfig {
        AssemblerConfig {
            system_prompt: self.system_prompt.clone(),
            max_chars: self.max_chars,
            gap_threshold: self.gap_threshold,
            timestamp_order: self.timestamp_order,
        }
    }

    pub fn moderation_policy(&self) -> Result<ModerationPolicy> {
        ModerationPolicy::new(self.threshold, self.on_moderation_error)
    }
}

/// A message in the fine-tuning record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SftMessage {
    pub role: Role,
    pub content: String,
    /// Assistant turns are marked as training targets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<u8>,
}

impl SftMessage {
    fn system(prompt: &str) -> Self {
        Self {
            role: Role::System,
            content: prompt.to_string(),
            weight: None,
        }
    }
}

impl From<&ChatMessage> for SftMessage {
    fn from(msg: &ChatMessage) -> Self {
        Self {
            role: msg.role,
            content: msg.content.clone(),
            weight: (msg.role == Role::Assistant).then_some(1),
        }
    }
}

/// One JSONL line: the system prompt followed by the conversation turns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SftRecord {
    pub messages: Vec<SftMessage>,
}

impl From<&Conversation> for SftRecord {
    fn from(conv: &Conversation) -> Self {
        let mut messages = Vec::with_capacity(conv.messages.len() + 1);
        messages.push(SftMessage::system(&conv.system_prompt));
        messages.extend(conv.messages.iter().map(SftMessage::from));
        Self { messages }
    }
}

impl From<&PairedConversation> for SftRecord {
    fn from(pair: &PairedConversation) -> Self {
        Self {
            messages: vec![
                SftMessage::system(&pair.system_prompt),
                SftMessage::from(&pair.user_message),
                SftMessage::from(&pair.assistant_message),
            ],
        }
    }
}

/// Per-file counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileStats {
    pub raw_messages: usize,
    pub skipped_lines: usize,
    pub moderated_out: usize,
    /// Messages kept without a verdict because moderation failed open.
    pub unchecked: usize,
    pub assembly: AssemblyStats,
    pub conversations: usize,
    pub records: usize,
    pub total_chars: usize,
}

/// Result of processing a single chat export.
#[derive(Debug, Clone)]
pub struct FileResult {
    pub source_path: PathBuf,
    pub records: Vec<SftRecord>,
    pub stats: FileStats,
}

/// Result of processing a batch of exports. Failed files never abort the batch.
#[derive(Debug, Default)]
pub struct BatchResult {
    pub results: Vec<FileResult>,
    pub failures: Vec<FileFailure>,
}

/// Totals over a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineSummary {
    pub files_processed: usize,
    pub files_failed: usize,
    pub raw_messages: usize,
    pub skipped_lines: usize,
    pub moderated_out: usize,
    pub conversations: usize,
    pub records: usize,
    pub total_chars: usize,
}

impl PipelineSummary {
    pub fn from_batch(batch: &BatchResult) -> Self {
        let mut summary = Self {
            files_failed: batch.failures.len(),
            ..Default::default()
        };
        for result in &batch.results {
            let stats = &result.stats;
            summary.files_processed += 1;
            summary.raw_messages += stats.raw_messages;
            summary.skipped_lines += stats.skipped_lines;
            summary.moderated_out += stats.moderated_out;
            summary.conversations += stats.conversations;
            summary.records += stats.records;
            summary.total_chars += stats.total_chars;
        }
        summary
    }
}

/// Discover chat exports (`*.txt`) directly inside `dir`, sorted by path.
pub fn discover_chat_files(dir: &Path) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.path().extension().map_or(false, |ext| ext == "txt"))
        .map(|e| e.path().to_path_buf())
        .collect();
    paths.sort();
    paths
}

/// Run the full pipeline on the text of one export.
///
/// `moderator` must be present when `config.moderate_enabled` is set.
pub fn process_chat_text<M>(
    text: &str,
    config: &PipelineConfig,
    moderator: Option<&M>,
) -> Result<(Vec<SftRecord>, FileStats)>
where
    M: Moderator + Sync + ?Sized,
{
    let mut stats = FileStats::default();

    let parsed = parse_chat_text(text);
    stats.raw_messages = parsed.messages.len();
    stats.skipped_lines = parsed.skipped.len();
    info!(
        "Parsed {} messages ({} malformed lines skipped)",
        stats.raw_messages, stats.skipped_lines
    );

    let messages = anonymize(&parsed.messages, &config.assistant_name);

    let messages = if config.moderate_enabled {
        let moderator = moderator.ok_or_else(|| {
            ChatSftError::InvalidConfig("moderation is enabled but no moderator was provided".to_string())
        })?;
        let outcome = moderate_messages(messages, moderator, &config.moderation_policy()?)?;
        stats.moderated_out = outcome.dropped;
        stats.unchecked = outcome.unchecked;
        outcome.kept
    } else {
        messages
    };

    let assembler = ConversationAssembler::new(config.assembler_config())?;
    let assembly = assembler.assemble(&messages)?;
    stats.assembly = assembly.stats;
    stats.conversations = assembly.conversations.len();
    stats.total_chars = assembly.conversations.iter().map(Conversation::char_count).sum();

    let records: Vec<SftRecord> = if config.pairs {
        pair_all(&assembly.conversations).iter().map(SftRecord::from).collect()
    } else {
        assembly.conversations.iter().map(SftRecord::from).collect()
    };
    stats.records = records.len();

    if records.is_empty() {
        info!("No well-formed conversations produced");
    } else {
        info!(
            "Assembled {} conversations into {} records ({} chars)",
            stats.conversations, stats.records, stats.total_chars
        );
    }

    Ok((records, stats))
}

/// Process a single chat export file.
pub fn process_chat_file<M>(
    path: &Path,
    config: &PipelineConfig,
    moderator: Option<&M>,
) -> Result<FileResult>
where
    M: Moderator + Sync + ?Sized,
{
    let span = info_span!("file", path = %path.display());
    let _guard = span.enter();

    let text = std::fs::read_to_string(path).map_err(|e| ChatSftError::io(path, e))?;
    let (records, stats) = process_chat_text(&text, config, moderator)?;
    Ok(FileResult {
        source_path: path.to_path_buf(),
        records,
        stats,
    })
}

/// Process many exports in parallel, one assembler per file.
///
/// Results keep the order of `paths`. A failing file is logged and collected
/// in [`BatchResult::failures`]; the other files still run.
pub fn process_all_files<M>(
    paths: &[PathBuf],
    config: &PipelineConfig,
    moderator: Option<&M>,
) -> BatchResult
where
    M: Moderator + Sync + ?Sized,
{
    let total_files = paths.len();
    let processed_count = AtomicUsize::new(0);

    let outcomes: Vec<std::result::Result<FileResult, FileFailure>> = paths
        .par_iter()
        .map(|path| {
            let result = process_chat_file(path, config, moderator);
            let count = processed_count.fetch_add(1, Ordering::Relaxed) + 1;
            info!("Processed {}/{} files", count, total_files);
            result.map_err(|error| {
                error!("Error processing {}: {}", path.display(), error);
                FileFailure {
                    path: path.clone(),
                    error,
                }
            })
        })
        .collect();

    let mut batch = BatchResult::default();
    for outcome in outcomes {
        match outcome {
            Ok(result) => batch.results.push(result),
            Err(failure) => batch.failures.push(failure),
        }
    }

    if !batch.failures.is_empty() {
        warn!("{} of {} files failed to process", batch.failures.len(), total_files);
    }
    batch
}

/// Write records as JSONL, one object per line. Returns the number of lines written.
///
/// With `append` the file is extended instead of replaced. Parent directories
/// are created. Zero records still produce a (possibly empty) file.
pub fn write_jsonl_output(records: &[SftRecord], path: &Path, append: bool) -> Result<usize> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| ChatSftError::io(parent, e))?;
    }

    let file = if append {
        OpenOptions::new().create(true).append(true).open(path)
    } else {
        File::create(path)
    };
    let mut out = BufWriter::new(file.map_err(|e| ChatSftError::io(path, e))?);

    for record in records {
        let json_line = serde_json::to_string(record)?;
        writeln!(out, "{}", json_line).map_err(|e| ChatSftError::io(path, e))?;
    }
    out.flush().map_err(|e| ChatSftError::io(path, e))?;

    info!(
        "{} {} records to {}",
        if append { "Appended" } else { "Wrote" },
        records.len(),
        path.display()
    );
    Ok(records.len())
}

/// Default output path for a single export: same location, `.jsonl` extension.
pub fn default_output_path(input: &Path) -> PathBuf {
    input.with_extension("jsonl")
}

/// Write batch results into `output_dir`: one `<stem>.jsonl` per input, or a
/// single [`MERGED_OUTPUT_NAME`] in input order when `merge` is set.
///
/// Returns the written paths and any write failures.
pub fn write_batch_output(
    results: &[FileResult],
    output_dir: &Path,
    merge: bool,
) -> (Vec<PathBuf>, Vec<FileFailure>) {
    let mut written = Vec::new();
    let mut failures = Vec::new();

    if merge {
        let path = output_dir.join(MERGED_OUTPUT_NAME);
        let records: Vec<SftRecord> = results
            .iter()
            .flat_map(|r| r.records.iter().cloned())
            .collect();
        match write_jsonl_output(&records, &path, false) {
            Ok(_) => written.push(path),
            Err(error) => failures.push(FileFailure { path, error }),
        }
        return (written, failures);
    }

    for result in results {
        let name = result
            .source_path
            .file_stem()
            .map(|stem| Path::new(stem).with_extension("jsonl"))
            .unwrap_or_else(|| PathBuf::from(MERGED_OUTPUT_NAME));
        let path = output_dir.join(name);
        match write_jsonl_output(&result.records, &path, false) {
            Ok(_) => written.push(path),
            Err(error) => {
                error!("Error writing {}: {}", path.display(), error);
                failures.push(FileFailure {
                    path: result.source_path.clone(),
                    error,
                })
            }
        }
    }
    (written, failures)
}
