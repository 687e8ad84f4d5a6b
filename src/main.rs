use std::collections::HashMap;
use std::path::PathBuf;

use clap::Parser;
use nano_serve::logging::{init_logging, LogFormat};
use nano_serve::{
    ByteTokenizer, EngineConfig, GenerationConfig, GenerationRequest, HfTokenizer, LLMEngine,
    Model, PagedKvModel, RequestStreamOutput, SampleResult, Tokenizer,
};

#[derive(Parser, Debug)]
#[command(name = "nano-serve")]
#[command(about = "Simulate continuous batching over a paged KV model")]
struct Args {
    /// Engine config JSON file (defaults are used when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// tokenizer.json used to render outputs (byte-level when omitted)
    #[arg(short, long)]
    tokenizer: Option<PathBuf>,

    /// Number of requests to submit
    #[arg(short, long, default_value = "8")]
    num_requests: usize,

    /// Prompt length in tokens
    #[arg(long, default_value = "32")]
    prompt_len: usize,

    /// Maximum tokens to generate per request
    #[arg(long, default_value = "64")]
    max_tokens: usize,

    /// Override the number of KV blocks per model
    #[arg(long)]
    num_blocks: Option<usize>,

    /// Override the KV block size
    #[arg(long)]
    block_size: Option<usize>,

    /// Number of model replicas
    #[arg(long, default_value = "1")]
    replicas: usize,

    /// Log format: human or json
    #[arg(long)]
    log_format: Option<LogFormat>,
}

/// Deterministic stand-in for sampling: lowercase letters hashed from the
/// context, so a replayed context continues identically.
fn simulated_next_token(context: &[u32]) -> SampleResult {
    let hash = context
        .iter()
        .fold(17u32, |h, &t| h.wrapping_mul(31).wrapping_add(t));
    SampleResult::new(u32::from(b'a') + hash % 26, -1.0)
}

fn run(args: Args) -> nano_serve::Result<()> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::from_json_file(path)?,
        None => EngineConfig::default(),
    };
    if let Some(num_blocks) = args.num_blocks {
        config.num_blocks = num_blocks;
    }
    if let Some(block_size) = args.block_size {
        config.block_size = block_size;
    }

    let tokenizer: Box<dyn Tokenizer> = match &args.tokenizer {
        Some(path) => Box::new(HfTokenizer::from_file(path)?),
        None => Box::new(ByteTokenizer::default()),
    };

    let models: Vec<Box<dyn Model>> = (0..args.replicas.max(1))
        .map(|i| {
            Box::new(PagedKvModel::new(
                format!("replica-{i}"),
                config.num_blocks,
                config.block_size,
                Box::new(simulated_next_token),
            )) as Box<dyn Model>
        })
        .collect();

    let mut engine = LLMEngine::new(models, tokenizer, config)?;
    for i in 0..args.num_requests {
        let prompt = (0..args.prompt_len)
            .map(|p| u32::from(b'A') + ((i + p) % 26) as u32)
            .collect();
        let generation_config = GenerationConfig::default()
            .max_tokens(args.max_tokens)
            .ignore_eos(true);
        engine.add_request(GenerationRequest::from_tokens(prompt).generation_config(generation_config))?;
    }

    let mut generated: HashMap<String, Vec<u32>> = HashMap::new();
    let mut steps = 0usize;
    let mut preemptions = 0usize;
    let mut sink = |outputs: Vec<RequestStreamOutput>| {
        for output in outputs {
            if let Some(reason) = output.finish_reason {
                tracing::info!(request_id = %output.request_id, reason = reason.as_str(), "request finished");
            }
            generated
                .entry(output.request_id)
                .or_default()
                .extend(output.delta_token_ids);
        }
    };

    while engine.has_pending_requests() {
        let step = engine.step(&mut sink)?;
        steps += 1;
        preemptions += step.preempted.len();
        tracing::debug!(
            step = steps,
            kind = ?step.kind,
            scheduled = step.scheduled.len(),
            finished = step.finished.len(),
            "step done"
        );
    }

    let mut ids: Vec<_> = generated.keys().cloned().collect();
    ids.sort();
    for id in ids {
        let text = engine.tokenizer().decode(&generated[&id])?;
        println!("{id}: {text}");
    }
    println!("steps: {steps}, preemptions: {preemptions}");
    println!("{}", engine.stats().as_json()?);
    Ok(())
}

fn main() {
    let args = Args::parse();
    if let Err(e) = init_logging(args.log_format) {
        eprintln!("failed to initialize logging: {e}");
    }

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "nano-serve starting");
    if let Err(e) = run(args) {
        tracing::error!(error = %e, fatal = e.is_fatal(), "simulation failed");
        std::process::exit(1);
    }
}
