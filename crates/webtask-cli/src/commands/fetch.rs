use std::io::Write;

use anyhow::{Context, Result};
use webtask::Response;

use super::{apply_request_args, connect, parse_method, run_task, Settings};
use crate::cli::FetchArgs;
use crate::utils::ColoredOutput;

pub fn run(args: FetchArgs, settings: &Settings) -> Result<()> {
    let method = parse_method(&args.method)?;
    let (client, target) = connect(settings.client.clone(), settings.http.clone(), &args.request)?;

    let mut builder = apply_request_args(client.request(method, &target), &args.request)?;
    let body = match (&args.data, &args.data_file) {
        (Some(data), _) => Some(data.clone().into_bytes()),
        (None, Some(path)) => Some(
            std::fs::read(path).with_context(|| format!("Failed to read body from '{}'", path.display()))?,
        ),
        (None, None) => None,
    };
    if let Some(body) = body {
        builder = builder.body(body);
        if args.json {
            builder = builder.header("Content-Type", "application/json");
        }
    }

    let task = builder.build().context("Invalid request")?;
    run_task(&task, args.request.timeout)?;

    let response = task.response();
    let mut stdout = std::io::stdout().lock();
    if args.include {
        write_head(&mut stdout, &response)?;
    }
    stdout.write_all(&render_body(&response, args.pretty))?;
    stdout.flush()?;
    Ok(())
}

fn write_head(out: &mut impl Write, response: &Response) -> Result<()> {
    let Some(meta) = &response.meta else {
        return Ok(());
    };
    let status = meta.status.to_string();
    let line = if meta.status.is_success() {
        ColoredOutput::success(&status)
    } else {
        ColoredOutput::error(&status)
    };
    writeln!(out, "{}", line)?;
    for (name, value) in &meta.headers {
        writeln!(
            out,
            "{}: {}",
            ColoredOutput::highlight(name.as_str()),
            ColoredOutput::dim(&String::from_utf8_lossy(value.as_bytes()))
        )?;
    }
    writeln!(out)?;
    Ok(())
}

/// The body as printed: pretty JSON when asked for and parseable, raw bytes
/// otherwise
fn render_body(response: &Response, pretty: bool) -> Vec<u8> {
    if pretty {
        if let Ok(value) = response.json::<serde_json::Value>() {
            if let Ok(mut rendered) = serde_json::to_vec_pretty(&value) {
                rendered.push(b'\n');
                return rendered;
            }
        }
    }
    response.body.to_vec()
}
