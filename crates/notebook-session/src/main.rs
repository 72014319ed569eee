use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use log::info;
use serde::Serialize;

use notebook_session::settings::{
    load_settings, save_settings, settings_path, DEFAULT_NOTEBOOK_PROVIDER,
};
use notebook_session::{
    CellType, FileContentManager, KernelSpecs, NotebookManager, NotebookModel, NotebookOptions,
    Session, SessionError, SessionManager, SessionOptions,
};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show the kernel, provider and cells a notebook resolves to
    Info {
        /// Path to the notebook file
        path: PathBuf,
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Rewrite a notebook in canonical form
    Normalize {
        /// Path to the notebook file
        path: PathBuf,
        /// Write here instead of in place
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Print the effective engine settings
    Settings {
        /// Also write them to the settings file, filling in defaults
        #[arg(long)]
        write: bool,
    },
}

/// Stands in for a backend when only the document is needed. It advertises
/// no kernels and cannot start sessions.
struct OfflineSessionManager;

#[async_trait]
impl SessionManager for OfflineSessionManager {
    fn is_ready(&self) -> bool {
        true
    }

    async fn ready(&self) -> Result<()> {
        Ok(())
    }

    fn specs(&self) -> Option<KernelSpecs> {
        None
    }

    async fn start_new(&self, _options: SessionOptions) -> Result<Arc<dyn Session>, SessionError> {
        Err(SessionError::Backend(anyhow::anyhow!(
            "No kernel backend is available offline"
        )))
    }

    async fn shutdown(&self, _session_id: &str) -> Result<()> {
        Ok(())
    }
}

#[derive(Serialize)]
struct NotebookSummary {
    path: PathBuf,
    provider: String,
    kernel: Option<String>,
    language: String,
    code_cells: usize,
    markdown_cells: usize,
    trusted: bool,
}

async fn open_model(path: &std::path::Path) -> Result<Arc<NotebookModel>> {
    let settings = load_settings();
    let manager = NotebookManager::new(DEFAULT_NOTEBOOK_PROVIDER, Arc::new(OfflineSessionManager))
        .with_content_manager(Arc::new(FileContentManager));
    let options =
        NotebookOptions::from_settings(path.to_string_lossy(), vec![manager], &settings);
    let model = NotebookModel::new(options)?;
    model.request_model_load(false).await?;
    Ok(model)
}

async fn info_command(path: PathBuf, json: bool) -> Result<()> {
    let model = open_model(&path).await?;
    let cells = model.cells();
    let count = |t: CellType| cells.iter().filter(|c| c.cell_type() == t).count();
    let summary = NotebookSummary {
        provider: model.provider_id(),
        kernel: model.default_kernel().map(|k| k.display_name),
        language: model.language(),
        code_cells: count(CellType::Code),
        markdown_cells: count(CellType::Markdown),
        trusted: model.trusted_mode(),
        path,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("Notebook:  {}", summary.path.display());
        println!("Provider:  {}", summary.provider);
        println!("Kernel:    {}", summary.kernel.as_deref().unwrap_or("-"));
        println!("Language:  {}", summary.language);
        println!(
            "Cells:     {} code, {} markdown",
            summary.code_cells, summary.markdown_cells
        );
        println!("Trusted:   {}", summary.trusted);
    }
    Ok(())
}

async fn normalize_command(path: PathBuf, output: Option<PathBuf>) -> Result<()> {
    let model = open_model(&path).await?;
    if model.in_error_state() {
        bail!("Could not load {}", path.display());
    }
    match output {
        Some(output) => {
            FileContentManager::store(&output, &model.to_json()).await?;
            info!("Wrote {}", output.display());
        }
        None => model.save_model().await?,
    }
    Ok(())
}

fn settings_command(write: bool) -> Result<()> {
    let settings = load_settings();
    if write {
        save_settings(&settings)?;
        info!("Wrote {}", settings_path().display());
    }
    println!("{}", serde_json::to_string_pretty(&settings)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    match cli.command {
        Commands::Info { path, json } => info_command(path, json).await,
        Commands::Normalize { path, output } => normalize_command(path, output).await,
        Commands::Settings { write } => settings_command(write),
    }
}
