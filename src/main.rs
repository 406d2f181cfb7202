use std::fs;
use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use gif::{Encoder, Frame, Repeat};
use rand::Rng;
use tch::{nn::ModuleT, Device, Kind, Tensor};
use tqdm::tqdm;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use dcgan_resnet::{Discriminator, Generator, NetworkConfig, ParameterStore};

const RESULTS_DIR: &str = "results";

#[derive(Parser, Debug)]
#[command(version, about = "Residual DCGAN via Rust.", long_about = None)]
struct Args {
    /// Network configuration (JSON). Defaults to the built-in 64x64 network.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Weight file to load into both networks.
    #[arg(short, long)]
    weights: Option<PathBuf>,
    /// Seed for latent sampling and initialization.
    #[arg(long)]
    seed: Option<u64>,
    #[arg(short, long, default_value = "info")]
    verbosity: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build both networks, log their shapes and run one forward pass.
    Summary {
        #[arg(long, default_value_t = 4)]
        batch_size: i64,
        /// Save the (initialized or loaded) weights here.
        #[arg(long)]
        save: Option<PathBuf>,
    },
    /// Write generated images to the results directory.
    Generate {
        #[arg(short, long, default_value_t = 16)]
        num: usize,
    },
    /// Write an animated interpolation between two latents.
    Morphing {
        #[arg(short, long, default_value_t = 100)]
        frames: usize,
    },
    /// Write the default configuration.
    Init {
        #[arg(short, long, default_value = "config.json")]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    let level = match args.verbosity.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).with_target(false).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Command::Init { output } = &args.command {
        if output.exists() {
            bail!("{} already exists", output.display());
        }
        NetworkConfig::default().save_json(output)?;
        info!("Wrote default configuration to {}", output.display());
        return Ok(());
    }

    let config = match &args.config {
        Some(path) => NetworkConfig::from_json(path)?,
        None => NetworkConfig::default(),
    };
    config.validate()?;

    let seed = args.seed.unwrap_or_else(|| rand::thread_rng().gen());
    tch::manual_seed(seed as i64);

    let mut store = ParameterStore::new(Device::cuda_if_available());
    info!("Use Device: {:?}, seed: {seed}", store.device());
    let generator = Generator::new(&store, &config, false)?;
    let discriminator = Discriminator::new(&store, &config, false)?;

    match &args.weights {
        Some(path) if path.is_file() => {
            store.load(path)?;
            info!("Loaded: {}", path.display());
        }
        Some(path) => warn!("Weight file {} not found, using fresh initialization", path.display()),
        None => {}
    }

    match args.command {
        Command::Summary { batch_size, save } => {
            summary(&store, &generator, &discriminator, &config, batch_size)?;
            if let Some(path) = save {
                store.save(&path)?;
                info!("Saved: {}", path.display());
            }
        }
        Command::Generate { num } => {
            generate(&generator, &config, num, store.device())?;
            info!("Generated!");
        }
        Command::Morphing { frames } => {
            morphing(&generator, &config, frames, store.device())?;
            info!("Generated morphing.gif");
        }
        Command::Init { .. } => {}
    }

    Ok(())
}

fn summary(
    store: &ParameterStore,
    generator: &Generator,
    discriminator: &Discriminator,
    config: &NetworkConfig,
    batch_size: i64,
) -> Result<()> {
    info!(
        "Image Size: {}x{}, Latent: {}, Filters: {}, Variant: {:?}, Layout: {:?}",
        config.image_size.height,
        config.image_size.width,
        config.latent_dim,
        config.base_filters,
        config.variant()?,
        config.channel_layout
    );
    info!("--- generator ---");
    for shape in generator.shapes() {
        info!("{shape}");
    }
    info!("--- discriminator ---");
    for shape in discriminator.shapes() {
        info!("{shape}");
    }
    info!("Parameters: {} tensors, {} values", store.len(), store.parameter_count());

    let latent = Tensor::randn([batch_size, generator.latent_dim()], (Kind::Float, store.device()));
    let images = tch::no_grad(|| generator.generate(&latent, false))?;
    let scores = tch::no_grad(|| discriminator.score(&images, false))?;
    info!("Images: {:?}, Scores: {:?}", images.size(), scores.size());
    Ok(())
}

/// `[-1, 1]` images in the configured layout -> `[0, 255]` CHW, one per batch entry.
fn to_pixels(images: &Tensor, config: &NetworkConfig) -> Tensor {
    let images = config.channel_layout.to_nchw(images);
    ((images + 1.0) * 127.5).clamp(0.0, 255.0)
}

fn results_dir() -> Result<PathBuf> {
    let path = Path::new(RESULTS_DIR);
    if !path.is_dir() {
        fs::create_dir(path)?;
    }
    Ok(path.to_path_buf())
}

fn generate(generator: &Generator, config: &NetworkConfig, num: usize, device: Device) -> Result<()> {
    let dir = results_dir()?;
    for i in tqdm(0..num) {
        let image = tch::no_grad(|| generator.generate_random(1, device));
        let image = to_pixels(&image, config).squeeze_dim(0).to_kind(Kind::Uint8).to_device(Device::Cpu);
        tch::vision::image::save(&image, dir.join(format!("generate-{}.png", i + 1)))?;
    }
    Ok(())
}

fn morphing(generator: &Generator, config: &NetworkConfig, frames: usize, device: Device) -> Result<()> {
    if frames < 2 {
        bail!("morphing needs at least two frames");
    }
    let height = u16::try_from(config.image_size.height)?;
    let width = u16::try_from(config.image_size.width)?;
    let seed_one = Tensor::randn([1, generator.latent_dim()], (Kind::Float, device));
    let seed_two = Tensor::randn([1, generator.latent_dim()], (Kind::Float, device));

    let mut image = File::create(results_dir()?.join("morphing.gif"))?;
    let mut encoder = Encoder::new(&mut image, width, height, &[])?;
    encoder.set_repeat(Repeat::Infinite)?;

    let len = 3 * height as usize * width as usize;
    for i in tqdm(0..frames) {
        let l = i as f64 / (frames - 1) as f64;
        let latent = (1.0 - l) * &seed_one + l * &seed_two;
        let image = tch::no_grad(|| generator.forward_t(&latent, false));
        let image = to_pixels(&image, config)
            .squeeze_dim(0)
            .permute([1, 2, 0])
            .contiguous()
            .to_kind(Kind::Uint8)
            .to_device(Device::Cpu);
        let mut data = vec![0u8; len];
        image.copy_data(&mut data, len);
        let frame = Frame::from_rgb(width, height, &data);
        encoder.write_frame(&frame)?;
    }
    Ok(())
}
