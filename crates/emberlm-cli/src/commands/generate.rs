use std::io::{self, Write};

use anyhow::{Context, Result};
use emberlm::{
    AcceleratorBackend, AcceleratorConfig, BackendKind, ExecutionBackend, Generator, LocalBackend,
    ModelDims, Vocab, Weights,
};

use emberlm_cli::GenerateArgs;

use super::util::{apply_overrides, format_attention, format_report, load_config, render_token};

pub async fn run(args: GenerateArgs) -> Result<()> {
    let dims = ModelDims::STORIES_15M;

    // 1. Resolve the run config
    let mut config = load_config(args.config.as_deref())?;
    apply_overrides(&mut config, &args);

    println!("Hyper Parameters\n{dims}");

    // 2. Load model and vocabulary
    let (embeddings, weights) = Weights::load(&args.weights, &dims)
        .with_context(|| format!("Failed to load weights '{}'", args.weights.display()))?;
    let vocab = Vocab::load(&args.vocab, dims.vocab)
        .with_context(|| format!("Failed to load vocabulary '{}'", args.vocab.display()))?;

    // 3. Backend, fixed for the whole run
    let backend: Box<dyn ExecutionBackend> = match args.backend {
        BackendKind::Local => Box::new(LocalBackend::new()),
        BackendKind::Accelerator => {
            let accel_config = AcceleratorConfig {
                low_power: args.low_power,
                adapter_name: args.adapter.clone(),
                force_fallback_adapter: args.fallback_adapter,
            };
            let backend = AcceleratorBackend::new(&accel_config, &dims).await?;
            eprintln!("Using accelerator '{}'", backend.adapter_name());
            Box::new(backend)
        }
    };
    log::info!("backend: {}", backend.name());

    if let Some(dir) = &args.dump_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create dump directory '{}'", dir.display()))?;
    }

    // `--color` wins over NO_COLOR / CLICOLOR.
    if args.color {
        colored::control::set_override(true);
    }

    // 4. Token loop
    let mut generator = Generator::new(&weights, &embeddings, backend.as_ref())?;
    let mut stdout = io::stdout();
    let stats = generator.generate(&config, |step| {
        if args.print_softmax {
            print!("{}", format_attention(step.state, step.pos)?);
        }
        let text = vocab.token(step.token)?;
        print!("{}", render_token(&text, args.color));
        stdout.flush()?;

        if let Some(dir) = &args.dump_dir {
            step.state.dump(dir, &format!("{}_", step.pos))?;
        }
        Ok(())
    })?;
    println!();

    // 5. Report
    println!("{}", format_report(&stats));
    Ok(())
}
