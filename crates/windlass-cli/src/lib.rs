use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use windlass_context::{
    ChatMlTemplate, ChatRequest, ContextError, ContextPipeline, ContextSizer, HeuristicTokenizer,
    MeasurementOracle, MessageSelector, RequestId, SelectionConfig, SelectionResult, SizingConfig,
    Tokenizer, WindowSize, WordTokenizer,
};
use windlass_protocol::ModelInfo;

pub fn crate_name() -> &'static str {
    "windlass-cli"
}

#[derive(Debug, Clone, Parser)]
#[command(
    name = "windlass",
    version,
    about = "Inspect context window sizing and message truncation",
    long_about = "Windlass computes the context window a chat request needs and shows which messages survive truncation"
)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        env = "WINDLASS_CONFIG",
        help = "JSON file with `sizing` and `selection` sections"
    )]
    pub config: Option<PathBuf>,
    #[arg(long, global = true, help = "Emit logs as JSON")]
    pub json: bool,
    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Format of the command output"
    )]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Commands {
    #[command(about = "Compute the context window for a request")]
    Size {
        #[arg(help = "Chat request JSON file, or a raw prompt file with --raw")]
        request: PathBuf,
        #[arg(long, help = "Treat the file as an already templated prompt")]
        raw: bool,
        #[arg(
            long,
            default_value_t = windlass_context::UNSPECIFIED_RESPONSE,
            allow_negative_numbers = true,
            help = "Requested response length for --raw prompts"
        )]
        num_predict: i64,
        #[command(flatten)]
        model: ModelArgs,
        #[command(flatten)]
        tokenizer: TokenizerArgs,
    },
    #[command(about = "Size the window and select the messages that fit")]
    Select {
        #[arg(help = "Chat request JSON file")]
        request: PathBuf,
        #[arg(long, help = "Use this window instead of computing one")]
        window: Option<usize>,
        #[arg(long, help = "Print the rendered prompt")]
        show_prompt: bool,
        #[command(flatten)]
        model: ModelArgs,
        #[command(flatten)]
        tokenizer: TokenizerArgs,
    },
}

#[derive(Debug, Clone, Args)]
pub struct ModelArgs {
    #[arg(long = "model", default_value = "default", help = "Model name")]
    pub name: String,
    #[arg(long, default_value_t = 8192, help = "Model context limit in tokens")]
    pub max_ctx: usize,
    #[arg(long, help = "The model has a vision projector loaded")]
    pub vision: bool,
    #[arg(long = "family", help = "Model family, repeatable (e.g. mllama)")]
    pub families: Vec<String>,
}

impl ModelArgs {
    pub fn to_model_info(&self) -> ModelInfo {
        let mut model = ModelInfo::new(self.name.clone(), self.max_ctx);
        if self.vision {
            model = model.with_image_projector();
        }
        for family in &self.families {
            model = model.with_family(family.clone());
        }
        model
    }
}

#[derive(Debug, Clone, Args)]
pub struct TokenizerArgs {
    #[arg(long, value_enum, default_value_t = TokenizerKind::Word, help = "Tokenizer used for measuring")]
    pub tokenizer: TokenizerKind,
    #[arg(long, help = "tokenizer.json for --tokenizer hf")]
    pub tokenizer_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TokenizerKind {
    Word,
    Heuristic,
    Hf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("json decode error in {path}: {source}")]
    Decode {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("json encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Context(#[from] ContextError),
}

/// Contents of a `--config` file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub sizing: SizingConfig,
    pub selection: SelectionConfig,
}

impl CliConfig {
    /// Reads the file when given, otherwise sizing comes from `WINDLASS_*`
    /// environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, CliError> {
        let config = match path {
            Some(path) => read_json::<Self>(path)?,
            None => Self {
                sizing: SizingConfig::from_env()?,
                selection: SelectionConfig::default(),
            },
        };
        config.sizing.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Serialize)]
struct SelectOutput<'a> {
    window: WindowSize,
    report: &'a windlass_context::SelectionReport,
    messages: &'a [windlass_protocol::Message],
    #[serde(skip_serializing_if = "Option::is_none")]
    prompt: Option<&'a str>,
}

pub async fn run(cli: Cli, cancel: CancellationToken) -> Result<String, CliError> {
    let config = CliConfig::load(cli.config.as_deref())?;
    let request_id = RequestId::new();

    match cli.command {
        Commands::Size {
            request,
            raw,
            num_predict,
            model,
            tokenizer,
        } => {
            let model = model.to_model_info();
            let tokenizer = build_tokenizer(&tokenizer)?;
            let sizer = ContextSizer::new(config.sizing)?;

            let window = if raw {
                let prompt = read_text(&request)?;
                let oracle = MeasurementOracle::new(&ChatMlTemplate, tokenizer.as_ref())
                    .with_cancellation(cancel);
                sizer
                    .size_prompt(request_id, &oracle, &prompt, num_predict, model.max_ctx, None)
                    .await?
            } else {
                let chat: ChatRequest = read_json(&request)?;
                let oracle = MeasurementOracle::new(&ChatMlTemplate, tokenizer.as_ref())
                    .with_tools(&chat.tools)
                    .with_think(chat.think)
                    .with_model(&model, &config.selection)
                    .with_cancellation(cancel);
                sizer
                    .size_messages(
                        request_id,
                        &oracle,
                        &chat.messages,
                        chat.num_predict,
                        model.max_ctx,
                        chat.num_ctx,
                    )
                    .await?
            };

            match cli.format {
                OutputFormat::Json => Ok(serde_json::to_string_pretty(&window)?),
                OutputFormat::Text => Ok(format_window(&window)),
            }
        }
        Commands::Select {
            request,
            window,
            show_prompt,
            model,
            tokenizer,
        } => {
            let model = model.to_model_info();
            let tokenizer = build_tokenizer(&tokenizer)?;
            let chat: ChatRequest = read_json(&request)?;

            let (window, selection) = match window {
                Some(tokens) => {
                    let oracle = MeasurementOracle::new(&ChatMlTemplate, tokenizer.as_ref())
                        .with_tools(&chat.tools)
                        .with_think(chat.think)
                        .with_model(&model, &config.selection)
                        .with_cancellation(cancel);
                    let selection = MessageSelector::default()
                        .select(request_id, &chat.messages, tokens, &oracle)
                        .await?;
                    let window = WindowSize {
                        tokens,
                        budget_exceeded: false,
                    };
                    (window, selection)
                }
                None => {
                    let prepared = ContextPipeline::new(&model, &ChatMlTemplate, tokenizer.as_ref())
                        .with_sizing(config.sizing)?
                        .with_selection(config.selection)
                        .prepare(request_id, &chat, cancel)
                        .await?;
                    (prepared.window, prepared.selection)
                }
            };

            match cli.format {
                OutputFormat::Json => Ok(serde_json::to_string_pretty(&SelectOutput {
                    window,
                    report: &selection.report,
                    messages: &selection.messages,
                    prompt: show_prompt.then_some(selection.prompt.as_str()),
                })?),
                OutputFormat::Text => Ok(format_selection(&window, &selection, show_prompt)),
            }
        }
    }
}

fn build_tokenizer(args: &TokenizerArgs) -> Result<Box<dyn Tokenizer>, CliError> {
    match args.tokenizer {
        TokenizerKind::Word => Ok(Box::new(WordTokenizer)),
        TokenizerKind::Heuristic => Ok(Box::new(HeuristicTokenizer::default())),
        TokenizerKind::Hf => hf_tokenizer(args.tokenizer_file.as_deref()),
    }
}

#[cfg(feature = "token-counting")]
fn hf_tokenizer(path: Option<&Path>) -> Result<Box<dyn Tokenizer>, CliError> {
    let path = path.ok_or_else(|| {
        CliError::InvalidArgument("--tokenizer hf requires --tokenizer-file".to_string())
    })?;
    Ok(Box::new(windlass_context::HfTokenizer::from_file(path)?))
}

#[cfg(not(feature = "token-counting"))]
fn hf_tokenizer(_path: Option<&Path>) -> Result<Box<dyn Tokenizer>, CliError> {
    Err(CliError::InvalidArgument(
        "hf tokenizer support requires the `token-counting` feature".to_string(),
    ))
}

fn read_text(path: &Path) -> Result<String, CliError> {
    std::fs::read_to_string(path).map_err(|source| CliError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, CliError> {
    let text = read_text(path)?;
    serde_json::from_str(&text).map_err(|source| CliError::Decode {
        path: path.to_path_buf(),
        source,
    })
}

fn format_window(window: &WindowSize) -> String {
    let mut output = format!("window: {} tokens", window.tokens);
    if window.budget_exceeded {
        output.push_str(" (prompt reaches model limit)");
    }
    output
}

fn format_selection(window: &WindowSize, selection: &SelectionResult, show_prompt: bool) -> String {
    let report = &selection.report;
    let mut output = format_window(window);
    output.push('\n');
    output.push_str(&report.to_log_string());
    output.push('\n');
    output.push_str(&format!(
        "intermediates kept: {}/{}, skip marker: {}, truncated: {}\n",
        report.intermediates_kept, report.intermediates_total, report.skip_marker, report.truncated
    ));
    if report.budget_exceeded {
        output.push_str("warning: selection exceeds the window\n");
    }
    for (i, message) in selection.messages.iter().enumerate() {
        output.push_str(&format!(
            "{:>3}. [{}] {}\n",
            i + 1,
            message.role,
            message.content.chars().take(80).collect::<String>()
        ));
    }
    if show_prompt {
        output.push('\n');
        output.push_str(&selection.prompt);
    }
    output
}

#[cfg(test)]
mod tests {
    use super::{run, Cli, CliConfig, CliError, Commands, OutputFormat, TokenizerKind};
    use clap::Parser;
    use std::path::PathBuf;
    use tokio_util::sync::CancellationToken;
    use windlass_context::CallerWindowPolicy;

    fn write_temp(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("windlass-{}-{name}", uuid::Uuid::new_v4()));
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn long_chat() -> String {
        let mut messages = vec![
            serde_json::json!({"role": "system", "content": "Be brief."}),
            serde_json::json!({"role": "user", "content": "Opening question."}),
        ];
        for i in 0..300 {
            messages.push(serde_json::json!({
                "role": "assistant",
                "content": format!("reply {i} padded with several more words")
            }));
            messages.push(serde_json::json!({"role": "user", "content": format!("next {i}")}));
        }
        serde_json::json!({ "messages": messages }).to_string()
    }

    #[test]
    fn cli_parses_select_command() {
        let cli = Cli::parse_from([
            "windlass",
            "select",
            "chat.json",
            "--max-ctx",
            "4096",
            "--family",
            "mllama",
            "--vision",
            "--tokenizer",
            "heuristic",
            "--show-prompt",
        ]);
        match cli.command {
            Commands::Select {
                request,
                window,
                show_prompt,
                model,
                tokenizer,
            } => {
                assert_eq!(request, PathBuf::from("chat.json"));
                assert_eq!(window, None);
                assert!(show_prompt);
                assert_eq!(tokenizer.tokenizer, TokenizerKind::Heuristic);
                let info = model.to_model_info();
                assert_eq!(info.max_ctx, 4096);
                assert_eq!(info.max_images_per_message(), Some(1));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn cli_parses_negative_num_predict() {
        let cli = Cli::parse_from(["windlass", "size", "p.txt", "--raw", "--num-predict", "-1"]);
        match cli.command {
            Commands::Size { raw, num_predict, .. } => {
                assert!(raw);
                assert_eq!(num_predict, -1);
            }
            other => panic!("unexpected command: {other:?}"),
        }
        assert_eq!(cli.format, OutputFormat::Text);
    }

    #[test]
    fn config_file_sections_default_independently() {
        let path = write_temp(
            "config.json",
            r#"{"sizing": {"quantum": 512, "caller_window": "upper-bound"}}"#,
        );
        let config = CliConfig::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.sizing.quantum, 512);
        assert_eq!(config.sizing.default_floor, 1024);
        assert_eq!(config.sizing.caller_window, CallerWindowPolicy::UpperBound);
        assert_eq!(config.selection.image_tokens, 768);
    }

    #[test]
    fn config_file_rejects_zero_quantum() {
        let path = write_temp("bad.json", r#"{"sizing": {"quantum": 0}}"#);
        let err = CliConfig::load(Some(&path)).unwrap_err();
        std::fs::remove_file(&path).ok();

        assert!(matches!(err, CliError::Context(_)));
    }

    #[tokio::test]
    async fn size_reports_window_for_chat_file() {
        let path = write_temp(
            "chat.json",
            r#"{"messages": [{"role": "user", "content": "Hi"}], "num_predict": 512}"#,
        );
        let cli = Cli::parse_from(["windlass", "size", path.to_str().unwrap()]);
        let output = run(cli, CancellationToken::new()).await.unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(output, "window: 1024 tokens");
    }

    #[tokio::test]
    async fn select_truncates_long_chat() {
        let path = write_temp("long.json", &long_chat());
        let cli = Cli::parse_from([
            "windlass",
            "--format",
            "json",
            "select",
            path.to_str().unwrap(),
            "--max-ctx",
            "2048",
        ]);
        let output = run(cli, CancellationToken::new()).await.unwrap();
        std::fs::remove_file(&path).ok();

        let value: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(value["window"]["tokens"], 2048);
        assert_eq!(value["report"]["truncated"], true);
        assert_eq!(value["messages"][0]["content"], "Be brief.");
        assert_eq!(value["messages"][1]["content"], "Opening question.");
        assert!(value.get("prompt").is_none());
    }

    #[tokio::test]
    async fn select_with_explicit_window_skips_sizing() {
        let path = write_temp("fixed.json", &long_chat());
        let cli = Cli::parse_from([
            "windlass",
            "select",
            path.to_str().unwrap(),
            "--window",
            "256",
        ]);
        let output = run(cli, CancellationToken::new()).await.unwrap();
        std::fs::remove_file(&path).ok();

        assert!(output.starts_with("window: 256 tokens\n"));
        assert!(output.contains("skip marker: true"));
    }

    #[tokio::test]
    async fn missing_request_file_is_read_error() {
        let cli = Cli::parse_from(["windlass", "size", "/nonexistent/windlass/chat.json"]);
        let err = run(cli, CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, CliError::Read { .. }));
    }

    #[cfg(not(feature = "token-counting"))]
    #[tokio::test]
    async fn hf_tokenizer_needs_feature() {
        let path = write_temp("hf.json", r#"{"messages": []}"#);
        let cli = Cli::parse_from(["windlass", "size", path.to_str().unwrap(), "--tokenizer", "hf"]);
        let err = run(cli, CancellationToken::new()).await.unwrap_err();
        std::fs::remove_file(&path).ok();

        assert!(matches!(err, CliError::InvalidArgument(_)));
    }
}
