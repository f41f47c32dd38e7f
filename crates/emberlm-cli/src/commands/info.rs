use std::path::Path;

use anyhow::{anyhow, Context, Result};
use emberlm::{AcceleratorConfig, AcceleratorContext, ModelDims, Vocab};

pub async fn run(weights: Option<&Path>, vocab: Option<&Path>, accelerator: bool) -> Result<()> {
    let dims = ModelDims::STORIES_15M;
    dims.validate()?;

    println!("Hyper Parameters\n{dims}");
    println!("  head_dim  : {}", dims.head_dim());
    println!("  weights   : {} bytes expected", dims.weight_file_bytes());

    if let Some(path) = weights {
        let actual = std::fs::metadata(path)
            .with_context(|| format!("Failed to stat '{}'", path.display()))?
            .len();
        let expected = dims.weight_file_bytes() as u64;
        if actual != expected {
            return Err(anyhow!(
                "'{}' is {} bytes, expected {}",
                path.display(),
                actual,
                expected
            ));
        }
        println!("Weight file '{}' matches.", path.display());
    }

    if let Some(path) = vocab {
        let vocab = Vocab::load(path, dims.vocab)?;
        println!("Vocabulary '{}': {} tokens.", path.display(), vocab.len());
    }

    if accelerator {
        let context = AcceleratorContext::new(&AcceleratorConfig::default()).await?;
        let info = &context.adapter_info;
        println!("Accelerator");
        println!("  name      : {}", info.name);
        println!("  type      : {:?}", info.device_type);
        println!("  backend   : {:?}", info.backend);
        println!(
            "  max_binding: {:.2}MB",
            context.max_binding_bytes() as f64 / 1_048_576.0
        );
    }
    Ok(())
}
