use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use burn::tensor::{Int, Tensor, backend::Backend};
use clap::Parser;
use log::info;

use lfqgpt::{
    backend::{AutoBackend, get_device, print_backend_info},
    config::GptConfig,
    embedding::CODEBOOK_TENSOR,
    engine::{Engine, SampleConfig},
    gpt::GptModel,
};

/// Sample class-conditional code sequences from a GPT checkpoint.
#[derive(Parser, Debug)]
#[command(name = "lfqgpt", version, about)]
struct Args {
    /// Checkpoint directory holding config.json and model.mpk
    #[arg(long)]
    checkpoint: Option<PathBuf>,

    /// Config JSON for a freshly initialized model (ignored with --checkpoint)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Safetensors file with a pretrained codebook for the token table
    #[arg(long)]
    codebook: Option<PathBuf>,

    /// Class label to condition on; repeat for a batch
    #[arg(long = "class", default_values_t = vec![0usize])]
    classes: Vec<usize>,

    #[arg(long, default_value_t = 16)]
    steps: usize,

    #[arg(long, default_value_t = 1.0)]
    temperature: f64,

    #[arg(long, default_value_t = 1.0)]
    cfg_scale: f64,

    #[arg(long)]
    top_k: Option<usize>,

    #[arg(long)]
    top_p: Option<f64>,

    /// Pick the most probable code instead of sampling
    #[arg(long)]
    greedy: bool,

    #[arg(long, default_value_t = 0)]
    seed: u64,
}

fn demo_config() -> GptConfig {
    GptConfig {
        vocab_size: 1024,
        block_size: 64,
        n_layer: 2,
        n_head: 4,
        n_embd: 64,
        num_classes: 10,
        ..GptConfig::default()
    }
}

fn load_model(
    args: &Args,
    device: &<AutoBackend as Backend>::Device,
) -> Result<GptModel<AutoBackend>> {
    if let Some(dir) = &args.checkpoint {
        let (model, _) = GptModel::<AutoBackend>::load_checkpoint(dir, device)?;
        return Ok(model);
    }

    let cfg = match &args.config {
        Some(path) => GptConfig::from_json_file(path)?,
        None => {
            info!("No config given, using a small randomly initialized model");
            demo_config()
        }
    };

    let model: GptModel<AutoBackend> = match &args.codebook {
        Some(path) => GptModel::from_codebook_file(&cfg, path, CODEBOOK_TENSOR, device)
            .with_context(|| format!("Failed to load codebook from {:?}", path))?,
        None => GptModel::new(&cfg, device)?,
    };
    Ok(model)
}

fn main() -> Result<()> {
    lfqgpt::init();
    let args = Args::parse();

    print_backend_info();
    let device = get_device();

    let model = load_model(&args, &device)?;
    if let Some(&bad) = args.classes.iter().find(|&&c| c >= model.null_class()) {
        bail!(
            "class {} out of range, model has {} classes",
            bad,
            model.null_class()
        );
    }

    // At least one filter must be active; default to the full nucleus.
    let top_p = match (args.top_k, args.top_p) {
        (None, None) => Some(1.0),
        (_, p) => p,
    };
    let sample_cfg = SampleConfig {
        steps: args.steps,
        temperature: args.temperature,
        guidance_scale: args.cfg_scale,
        top_k: args.top_k,
        top_p,
        sample_logits: !args.greedy,
        seed: args.seed,
    };

    let labels: Vec<i64> = args.classes.iter().map(|&c| c as i64).collect();
    let labels = Tensor::<AutoBackend, 1, Int>::from_ints(labels.as_slice(), &device);

    let engine = Engine::new(model, device);
    let codes = engine.generate(labels, None, &sample_cfg)?;

    let [batch, steps] = codes.dims();
    let ids: Vec<i64> = codes
        .to_data()
        .convert::<i64>()
        .to_vec()
        .map_err(|e| anyhow::anyhow!("{:?}", e))?;
    for (i, class) in args.classes.iter().enumerate().take(batch) {
        println!("class {:>4}: {:?}", class, &ids[i * steps..(i + 1) * steps]);
    }
    Ok(())
}
