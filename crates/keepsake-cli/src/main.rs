//! `keepsake-cli` – Keepsake command line interface
//!
//! This binary hosts the companion's memory system. It:
//!
//! 1. Loads `~/.keepsake/config.toml`, writing the defaults on first run.
//! 2. Picks the semantic backend: Ollama embeddings when the server has the
//!    configured model, local hashing embeddings otherwise.
//! 3. Starts the consolidation scheduler on a tokio runtime.
//! 4. Drops the user into an **interactive REPL** (`/say`, `/recall`,
//!    `/stats`, `/help`, …).
//! 5. Stops the scheduler on `/quit`, end of input or **Ctrl-C**.

mod config;
mod repl;

use colored::Colorize;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info, warn};

use keepsake_memory::semantic_index::{HashingEmbedder, SemanticIndex};
use keepsake_memory::system::open_semantic_index;
use keepsake_memory::{MemoryConfig, MemorySystem};
use keepsake_runtime::{ConsolidationScheduler, OllamaEmbedder};

use crate::config::{Config, SemanticBackend};

fn main() {
    let _telemetry = keepsake_runtime::init_tracing("keepsake");

    print_banner();

    // ── Shared shutdown flag ──────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();

    if let Err(e) = ctrlc::set_handler(move || {
        if shutdown_clone.swap(true, Ordering::SeqCst) {
            // Second Ctrl-C: every write is already committed.
            std::process::exit(130);
        }
        println!();
        println!(
            "{}",
            "⚠  Ctrl-C received – press Enter to finish, Ctrl-C again to force exit.".yellow().bold()
        );
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; graceful shutdown on Ctrl-C will not be available");
    }

    let cfg = load_or_init_config();
    let memory_cfg = cfg.memory_config();

    // ── Memory system ─────────────────────────────────────────────────────
    let index = build_semantic_index(&cfg, &memory_cfg);
    let memory = match MemorySystem::open(&memory_cfg, index) {
        Ok(m) => Arc::new(m),
        Err(e) => {
            error!(error = %e, "failed to open memory system");
            println!("{}: {}", "Cannot open memory".red().bold(), e);
            std::process::exit(1);
        }
    };
    println!(
        "  Memory at {} ({} semantic index)",
        memory_cfg.memory_dir().display().to_string().bold(),
        if memory.has_semantic_index() { "with".green() } else { "without".yellow() }
    );

    // ── Scheduler ─────────────────────────────────────────────────────────
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            println!("{}: {}", "Cannot start runtime".red().bold(), e);
            std::process::exit(1);
        }
    };
    let scheduler = {
        let _guard = runtime.enter();
        ConsolidationScheduler::new(Arc::clone(&memory), cfg.scheduler_config()).spawn()
    };

    println!();
    println!("  Type {} for a list of commands.\n", "/help".bold().cyan());

    // ── Interactive REPL ──────────────────────────────────────────────────
    repl::run(&memory, scheduler.subscribe(), shutdown);

    runtime.block_on(scheduler.shutdown());
    info!("keepsake stopped");
}

/// Load the config, or save and return the defaults when none exists.
fn load_or_init_config() -> Config {
    match config::load() {
        Ok(Some(cfg)) => {
            println!("  Config loaded from {}", config::config_path().display().to_string().bold());
            cfg
        }
        Ok(None) => {
            let mut cfg = Config::default();
            match config::save(&cfg) {
                Ok(()) => println!(
                    "  {} Default config written to {}",
                    "✓".green().bold(),
                    config::config_path().display().to_string().bold()
                ),
                Err(e) => println!("{}: {}", "Error saving config".red(), e),
            }
            config::apply_env_overrides(&mut cfg);
            cfg
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            let mut cfg = Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    }
}

fn build_semantic_index(cfg: &Config, memory_cfg: &MemoryConfig) -> Option<Arc<dyn SemanticIndex>> {
    match cfg.semantic {
        SemanticBackend::Off => None,
        SemanticBackend::Hashing => open_semantic_index(memory_cfg, Box::new(HashingEmbedder::default())),
        SemanticBackend::Ollama => {
            let embedder = OllamaEmbedder::new(cfg.ollama_url.clone(), cfg.embedding_model.clone());
            print!("  Probing Ollama at {} … ", cfg.ollama_url.dimmed());
            std::io::stdout().flush().ok();
            if embedder.is_available() {
                println!("{} (model {})", "online".green(), embedder.model().bold());
                open_semantic_index(memory_cfg, Box::new(embedder))
            } else {
                println!("{}", "offline".yellow());
                println!(
                    "  {}  Run `{}` for model embeddings; using local hashing.",
                    "Embedding model not available.".dimmed(),
                    format!("ollama pull {}", cfg.embedding_model).bold()
                );
                open_semantic_index(memory_cfg, Box::new(HashingEmbedder::default()))
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("  {} {}", "Keepsake".bold().cyan(), format!("v{}", env!("CARGO_PKG_VERSION")).dimmed());
    println!("  Long-term memory for a companion bot");
    println!();
}
