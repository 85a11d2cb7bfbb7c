use anyhow::{Context, Result};

use super::{apply_request_args, connect, run_task, Settings};
use crate::cli::DownloadArgs;
use crate::utils::ColoredOutput;

pub fn run(args: DownloadArgs, settings: &Settings) -> Result<()> {
    let mut client_config = settings.client.clone();
    if let Some(dir) = &args.output_dir {
        client_config.download_dir = dir.clone();
    }
    let (client, target) = connect(client_config, settings.http.clone(), &args.request)?;

    let task = apply_request_args(client.download(&target), &args.request)?
        .build()
        .context("Invalid request")?;
    run_task(&task, args.request.timeout)?;

    let response = task.response();
    if let Some(status) = response.status().filter(|s| !s.is_success()) {
        tracing::warn!(status = status.as_u16(), "Server answered with an error status");
    }
    let file = response.file().context("Server returned no file")?;
    println!("{} {}", ColoredOutput::success("Saved"), file.display());
    Ok(())
}
