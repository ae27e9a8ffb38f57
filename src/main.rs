mod config;
mod embeddings;
mod error;
mod logging;
mod normalize;
mod pipeline;
mod protocol;
mod server;

use std::sync::Arc;

use anyhow::Context;

use crate::config::Settings;
use crate::pipeline::Orchestrator;

fn main() {
    if let Err(e) = real_main() {
        // Keep stderr noisy for bug reports; logs also go to file.
        eprintln!("[VQA backend] fatal error: {e:?}");
        log::error!("Fatal error: {:?}", e);
        std::process::exit(1);
    }
}

fn real_main() -> anyhow::Result<()> {
    // Special modes: answer and exit before touching logs or models.
    let args: Vec<String> = std::env::args().collect();
    if args.len() >= 2 && args[1] == "--version" {
        println!("vqa_backend {}", config::APP_VERSION);
        return Ok(());
    }
    if args.len() >= 2 && args[1] == "--normalize" {
        let text = read_arg_value(&args, "--normalize");
        println!("{}", normalize::normalize(text.as_deref()));
        return Ok(());
    }

    let settings = Settings::from_env()?;
    logging::init_logging(&settings.log_spec)?;
    log::info!("Settings: {:?}", settings);

    let embedder = embeddings::load_modalities(&settings).context("failed to load models")?;
    let orchestrator = Arc::new(Orchestrator::new(embedder));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    runtime.block_on(server::serve(settings.bind_addr, settings.max_upload_bytes, orchestrator))
}

fn read_arg_value(args: &[String], key: &str) -> Option<String> {
    args.iter()
        .position(|a| a == key)
        .and_then(|i| args.get(i + 1))
        .cloned()
}
