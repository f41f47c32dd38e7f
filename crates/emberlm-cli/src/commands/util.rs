use std::fmt::Write as _;
use std::path::Path;

use anyhow::{Context, Result};
use colored::Colorize;
use emberlm::{DecodeState, GenerationConfig, GenerationStats};

use emberlm_cli::GenerateArgs;

/// Reads a JSON generation config, or the defaults when no path is given.
pub fn load_config(path: Option<&Path>) -> Result<GenerationConfig> {
    match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config '{}'", path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("Failed to parse config '{}'", path.display()))
        }
        None => Ok(GenerationConfig::default()),
    }
}

/// Command-line flags override whatever the config file said.
pub fn apply_overrides(config: &mut GenerationConfig, args: &GenerateArgs) {
    if let Some(steps) = args.max_steps {
        config.max_steps = steps;
    }
    if let Some(temperature) = args.temperature {
        config.temperature = temperature;
    }
    if args.seed.is_some() {
        config.seed = args.seed;
    }
}

pub fn render_token(text: &str, color: bool) -> String {
    if color {
        text.red().to_string()
    } else {
        text.to_string()
    }
}

/// Layer 0 scaled scores (`<-`) and softmax weights (`->`) over `[0, pos]`.
pub fn format_attention(state: &DecodeState, pos: usize) -> Result<String> {
    let mut out = String::from("\nSoftmax\n <- ");
    for v in state.attn_scores.row(0).iter().take(pos + 1) {
        write!(out, "{v:5.4}, ")?;
    }
    out.push_str("\n -> ");
    for v in state.attn_weights.row(0).iter().take(pos + 1) {
        write!(out, "{v:5.4}, ")?;
    }
    out.push('\n');
    Ok(out)
}

pub fn format_report(stats: &GenerationStats) -> String {
    format!(
        "Time : {:.6}[s]\nSpeed: {:.3}[tok/s]",
        stats.elapsed.as_secs_f64(),
        stats.tokens_per_second()
    )
}
