use std::path::PathBuf;

use anyhow::Context;
use flexi_logger::{Cleanup, Criterion, Duplicate, FileSpec, Logger, Naming};

use crate::config;

pub fn init_logging(log_spec: &str) -> anyhow::Result<()> {
    let log_dir = log_dir()?;

    // File gets everything at `log_spec`; stderr only warnings and errors so the
    // console stays readable under request load.
    Logger::try_with_str(log_spec)
        .with_context(|| format!("invalid log spec '{log_spec}'"))?
        .log_to_file(FileSpec::default().directory(log_dir).basename(config::logging::LOG_FILE_NAME))
        .rotate(
            Criterion::Size(config::logging::LOG_ROTATE_SIZE_BYTES),
            Naming::Numbers,
            Cleanup::KeepLogFiles(config::logging::LOG_ROTATE_KEEP_FILES),
        )
        .duplicate_to_stderr(Duplicate::Warn)
        .format(flexi_logger::detailed_format)
        .start()
        .context("failed to start logger")?;

    log::info!("{}", "=".repeat(60));
    log::info!("VQA backend starting");
    log::info!("Version: {}", config::APP_VERSION);
    log::info!("Platform: {}", std::env::consts::OS);
    log::info!("{}", "=".repeat(60));

    Ok(())
}

fn log_dir() -> anyhow::Result<PathBuf> {
    let home = config::home_dir().context("cannot determine home directory for logs")?;
    let dir = home.join(config::logging::LOG_DIR_REL);
    std::fs::create_dir_all(&dir).with_context(|| format!("failed creating log dir {}", dir.display()))?;
    Ok(dir)
}
