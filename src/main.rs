//! shardllm-root: loads a model file, bootstraps every worker over TCP,
//! then drives the forward-pass pipeline to generate tokens for a prompt.

use anyhow::{Context, Result};
use clap::Parser;
use shardllm_brain::bootstrap;
use shardllm_brain::sampler::{Sampler, SamplerConfig};
use shardllm_brain::scheduler::TaskLoop;
use shardllm_brain::spec::FloatType;
use shardllm_brain::tasks::{self, root, TransformerContext};
use shardllm_brain::tokenizer::BpeTokenizer;
use shardllm_core::config::FloatKind;
use std::fs::File;
use std::io::{BufReader, Write};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "shardllm-root")]
#[command(about = "Distributed tensor-parallel inference engine — root node")]
#[command(version)]
struct Args {
    /// Path to the model weights file.
    #[arg(long)]
    model_path: PathBuf,

    /// Path to the tokenizer file.
    #[arg(long)]
    tokenizer_path: PathBuf,

    /// OS threads driving the per-node compute pool.
    #[arg(long, default_value_t = 4)]
    n_threads: usize,

    /// Total slices in the tensor-parallel topology (root counts as one).
    #[arg(long, default_value_t = 1)]
    n_slices: usize,

    /// `host:port` of a worker, repeatable; must supply `n_slices - 1`.
    #[arg(long = "worker")]
    workers: Vec<String>,

    /// Weight element encoding: F32, F16, Q4_0 or Q8_0.
    #[arg(long, default_value = "Q4_0")]
    weights_dtype: String,

    /// Activation buffer element encoding: F32, F16, Q4_0 or Q8_0.
    #[arg(long, default_value = "Q8_0")]
    buffer_dtype: String,

    /// Sampling temperature; 0 selects greedy argmax decoding.
    #[arg(long, default_value_t = 0.0)]
    temperature: f32,

    /// Top-p (nucleus) sampling mass; >= 1 disables nucleus pruning.
    #[arg(long, default_value_t = 0.9)]
    top_p: f32,

    /// Number of tokens to generate.
    #[arg(long, default_value_t = 256)]
    steps: usize,

    /// The prompt to continue from.
    #[arg(long, default_value = "")]
    prompt: String,

    /// Optional system prompt prepended ahead of `prompt`.
    #[arg(long)]
    system_prompt: Option<String>,
}

fn parse_dtype(s: &str) -> Result<FloatKind> {
    match s.to_ascii_uppercase().as_str() {
        "F32" => Ok(FloatKind::F32),
        "F16" => Ok(FloatKind::F16),
        "Q4_0" => Ok(FloatKind::Q4_0),
        "Q8_0" => Ok(FloatKind::Q8_0),
        other => anyhow::bail!("unrecognized dtype {other:?}, expected F32, F16, Q4_0 or Q8_0"),
    }
}

/// Mirror the reference tokenizer's printable-piece filter: a single raw
/// byte that isn't printable or whitespace is dropped rather than garbling
/// the terminal.
fn print_piece(piece: &[u8]) {
    if piece.is_empty() {
        return;
    }
    if piece.len() == 1 {
        let b = piece[0];
        let printable = b.is_ascii_graphic() || b.is_ascii_whitespace();
        if !printable {
            return;
        }
    }
    std::io::stdout().write_all(piece).ok();
    std::io::stdout().flush().ok();
}

fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    if args.workers.len() != args.n_slices - 1 {
        anyhow::bail!("expected {} --worker endpoints for n_slices={}, got {}", args.n_slices - 1, args.n_slices, args.workers.len());
    }

    let weights_float_type = FloatType::from_config(parse_dtype(&args.weights_dtype)?);
    let buffer_float_type = FloatType::from_config(parse_dtype(&args.buffer_dtype)?);

    tracing::info!(model = %args.model_path.display(), n_slices = args.n_slices, "bootstrapping");
    let bootstrap::RootBootstrap { spec, transformer, pool } =
        bootstrap::load_root_from_file(&args.model_path, weights_float_type, buffer_float_type, args.n_slices, &args.workers)
            .context("failed to bootstrap root node")?;

    let tokenizer_file = File::open(&args.tokenizer_path).context("failed to open tokenizer file")?;
    let tokenizer = BpeTokenizer::load(&mut BufReader::new(tokenizer_file), spec.vocab_size as i32).context("failed to load tokenizer")?;

    let sampler = Sampler::new(spec.vocab_size as usize, SamplerConfig { temperature: args.temperature, top_p: args.top_p });

    let mut full_prompt = String::new();
    if let Some(system_prompt) = &args.system_prompt {
        full_prompt.push_str(system_prompt);
    }
    full_prompt.push_str(&args.prompt);
    let prompt_tokens = tokenizer.encode(&full_prompt, true, false);
    anyhow::ensure!(!prompt_tokens.is_empty(), "prompt encoded to zero tokens");

    let n_threads = args.n_threads;
    let n_workers = args.workers.len();

    let ctx = TransformerContext::new(spec, transformer, Some(pool));
    let task_loop = TaskLoop::new(n_threads, root::build(), ctx);

    let mut token = prompt_tokens[0] as u32;
    let mut prev_token = token;
    let mut pos = 0usize;

    tracing::info!(steps = args.steps, prompt_tokens = prompt_tokens.len(), "generation starting");

    while pos < args.steps {
        {
            let mut st = task_loop.ctx().state.lock().expect("node state mutex poisoned");
            if let Some(pool) = st.peers.as_mut() {
                for i in 0..n_workers {
                    pool.write(i, &[1u8])?;
                }
            }
            st.token = token;
            st.transformer.pos = pos;
            tasks::embed_token(&mut st).context("failed to embed token")?;
        }

        task_loop.run();

        let next = if pos + 1 < prompt_tokens.len() {
            // Teacher forcing: still inside the prompt, the next input
            // token is fixed regardless of what the model predicts.
            prompt_tokens[pos + 1] as u32
        } else {
            let mut st = task_loop.ctx().state.lock().expect("node state mutex poisoned");
            let mut logits = std::mem::take(&mut st.transformer.logits);
            let sampled = sampler.sample(&mut logits) as u32;
            st.transformer.logits = logits;
            sampled
        };

        let piece = tokenizer.decode(prev_token as i32, token as i32)?;
        print_piece(&piece);

        pos += 1;
        prev_token = token;
        token = next;

        if token as i32 == tokenizer.eos_id {
            break;
        }
    }
    println!();

    {
        let mut st = task_loop.ctx().state.lock().expect("node state mutex poisoned");
        if let Some(pool) = st.peers.as_mut() {
            for i in 0..n_workers {
                pool.write(i, &[0u8]).ok();
            }
        }
    }

    tracing::info!(generated = pos, "generation finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_dtypes() {
        assert_eq!(parse_dtype("f32").unwrap(), FloatKind::F32);
        assert_eq!(parse_dtype("Q4_0").unwrap(), FloatKind::Q4_0);
        assert!(parse_dtype("bogus").is_err());
    }

    #[test]
    fn args_default_topology_is_single_node() {
        let args = Args::parse_from(["shardllm-root", "--model-path", "m.bin", "--tokenizer-path", "t.bin"]);
        assert_eq!(args.n_slices, 1);
        assert!(args.workers.is_empty());
    }
}
