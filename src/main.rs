#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use candle_core::utils;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{info, warn};

use llm_bridge::{
    BridgeConfig, ChannelSink, GenAiBridge, ModelConfig, PreferredBackend, SessionConfig,
    SinkEvent,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Local GGUF model file
    #[arg(short, long)]
    model: Option<PathBuf>,

    /// Tokenizer file (defaults to tokenizer.json next to the model)
    #[arg(long)]
    tokenizer: Option<PathBuf>,

    /// Configuration file path
    #[arg(short, long, default_value = "bridge.yaml")]
    config: PathBuf,

    /// Maximum number of tokens (prompt plus response) per session
    #[arg(short = 'n', long, default_value_t = 1024)]
    max_tokens: usize,

    /// Preferred backend: cpu, gpu, gpu_float16, gpu_mixed, gpu_full, tpu
    #[arg(long)]
    backend: Option<PreferredBackend>,

    /// Supported LoRA ranks, comma separated
    #[arg(long, value_delimiter = ',')]
    lora_ranks: Vec<u32>,

    /// LoRA adapter to apply to the session
    #[arg(long)]
    lora: Option<PathBuf>,

    /// The temperature used to generate samples
    #[arg(long)]
    temperature: Option<f32>,

    /// Nucleus sampling probability cutoff
    #[arg(long)]
    top_p: Option<f32>,

    /// Only sample among the top K samples
    #[arg(long)]
    top_k: Option<usize>,

    /// The seed to use when generating random samples
    #[arg(long)]
    seed: Option<u64>,

    /// The initial prompt
    #[arg(long)]
    prompt: Option<String>,

    /// Stream fragments as they are generated
    #[arg(long)]
    stream: bool,

    /// Interactive mode
    #[arg(long)]
    interactive: bool,

    /// Print the embedding of this text and exit
    #[arg(long)]
    embed: Option<String>,

    /// Enable tracing (generates a trace-timestamp.json file)
    #[arg(long)]
    tracing: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use tracing_chrome::ChromeLayerBuilder;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let args = Args::parse();

    // Setup tracing
    let (chrome_layer, _guard) = if args.tracing {
        let (layer, guard) = ChromeLayerBuilder::new().build();
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(chrome_layer)
        .init();

    info!(
        avx = utils::with_avx(),
        neon = utils::with_neon(),
        simd128 = utils::with_simd128(),
        f16c = utils::with_f16c(),
        "System features"
    );

    let config = if args.config.exists() {
        BridgeConfig::load_from_file(&args.config)?
    } else {
        warn!(path = %args.config.display(), "Config file not found, using defaults");
        BridgeConfig::default()
    };
    let bridge = Arc::new(GenAiBridge::from_config(&config));

    if let Some(text) = args.embed {
        let vector = bridge.embed_text(text).await?;
        println!("{}", serde_json::to_string(&vector)?);
        bridge.shutdown().await?;
        return Ok(());
    }

    let model_path = args.model.ok_or_else(|| {
        anyhow::anyhow!("Model path is required. Use --model <path> or --embed <text>")
    })?;

    let mut model_config = ModelConfig::new(model_path, args.max_tokens);
    model_config.tokenizer_path = args.tokenizer;
    if !args.lora_ranks.is_empty() {
        model_config = model_config.with_lora_ranks(args.lora_ranks);
    }
    if let Some(backend) = args.backend {
        model_config = model_config.with_backend(backend);
    }
    bridge.create_model(model_config).await?;

    // Setup parameters with config defaults
    let defaults = &config.session_defaults;
    let session_config = SessionConfig {
        temperature: args.temperature.unwrap_or(defaults.temperature),
        random_seed: args.seed.unwrap_or(defaults.random_seed),
        top_k: args.top_k.unwrap_or(defaults.top_k),
        top_p: args.top_p.or(defaults.top_p),
        lora_path: args.lora.or_else(|| defaults.lora_path.clone()),
    };
    bridge.create_session(session_config.clone()).await?;

    let (sink, mut events) = ChannelSink::new();
    bridge.register_sink(Arc::new(sink));

    let result = if args.interactive {
        run_interactive_mode(&bridge, &mut events, &session_config, args.stream).await
    } else {
        match args.prompt {
            Some(prompt) => run_single_inference(&bridge, &mut events, &prompt, args.stream).await,
            None => Err(anyhow::anyhow!("Prompt is required for non-interactive mode")),
        }
    };

    bridge.unregister_sink();
    bridge.shutdown().await?;
    result
}

async fn run_single_inference(
    bridge: &GenAiBridge,
    events: &mut UnboundedReceiver<SinkEvent>,
    prompt: &str,
    stream: bool,
) -> anyhow::Result<()> {
    bridge.add_query_chunk(prompt.to_string()).await?;

    if !stream {
        let text = bridge.generate_response().await?;
        println!("{}", text);
        return Ok(());
    }

    bridge.generate_response_async().await?;
    let mut stdout = std::io::stdout();
    while let Some(event) = events.recv().await {
        match event {
            SinkEvent::Message(message) => {
                write!(stdout, "{}", message.partial_result)?;
                stdout.flush()?;
            }
            SinkEvent::EndOfStream => {
                writeln!(stdout)?;
                return Ok(());
            }
            SinkEvent::Error(payload) => {
                writeln!(stdout)?;
                return Err(anyhow::anyhow!("{}: {}", payload.code, payload.message));
            }
        }
    }
    Err(anyhow::anyhow!("Event stream closed before generation finished"))
}

async fn run_interactive_mode(
    bridge: &GenAiBridge,
    events: &mut UnboundedReceiver<SinkEvent>,
    session_config: &SessionConfig,
    stream: bool,
) -> anyhow::Result<()> {
    println!("Interactive mode. Type 'quit' to exit, '/reset' to start a new session.");

    loop {
        print!("\n> ");
        std::io::stdout().flush()?;

        let mut input = String::new();
        if std::io::stdin().read_line(&mut input)? == 0 {
            break;
        }
        let input = input.trim();

        if input == "quit" || input == "exit" {
            break;
        }

        if input.is_empty() {
            continue;
        }

        if input == "/reset" {
            bridge.create_session(session_config.clone()).await?;
            println!("Session reset.");
            continue;
        }

        if let Err(e) = run_single_inference(bridge, events, input, stream).await {
            eprintln!("Error: {}", e);
        }
    }

    Ok(())
}
